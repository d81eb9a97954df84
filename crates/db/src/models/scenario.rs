//! Scenario record model.

use serde::Serialize;
use sqlx::FromRow;
use turbo_core::error::CoreError;
use turbo_core::lifecycle::LifecycleState;
use turbo_core::types::{JobId, Timestamp};
use uuid::Uuid;

/// A row from the `scenarios` table.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ScenarioRow {
    pub request_id: Uuid,
    pub status: String,
    pub message: Option<String>,
    pub input_data: Option<serde_json::Value>,
    pub session_data: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl ScenarioRow {
    pub fn job_id(&self) -> JobId {
        JobId::from_uuid(self.request_id)
    }

    /// Decode the persisted status text.
    pub fn state(&self) -> Result<LifecycleState, CoreError> {
        self.status.parse()
    }
}
