//! Durable scenario records.
//!
//! [`ScenarioStore`] is the only persistence seam the engine uses. The
//! Postgres implementation backs the server; the in-memory one backs tests
//! and local runs without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use turbo_core::lifecycle::LifecycleState;
use turbo_core::types::{JobId, Timestamp};
use turbo_db::models::scenario::ScenarioRow;
use turbo_db::repositories::{ScenarioRepo, StatusUpdate};
use turbo_db::DbPool;

use crate::error::StoreError;

/// Engine-side view of one scenario.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScenarioRecord {
    pub id: JobId,
    pub state: LifecycleState,
    pub message: Option<String>,
    pub input: Option<serde_json::Value>,
    pub session: Option<serde_json::Value>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[async_trait]
pub trait ScenarioStore: Send + Sync {
    /// Insert a new record in `CREATED`.
    async fn create(&self, id: JobId) -> Result<ScenarioRecord, StoreError>;

    /// Move a record to `state`. Refuses transitions the lifecycle table
    /// does not allow with [`StoreError::InvalidTransition`].
    async fn update_status(
        &self,
        id: JobId,
        state: LifecycleState,
        message: Option<&str>,
    ) -> Result<ScenarioRecord, StoreError>;

    async fn store_input(&self, id: JobId, input: &serde_json::Value) -> Result<(), StoreError>;

    async fn store_session(&self, id: JobId, session: &serde_json::Value)
        -> Result<(), StoreError>;

    async fn find(&self, id: JobId) -> Result<Option<ScenarioRecord>, StoreError>;

    /// Records in a non-terminal state, oldest first.
    async fn find_incomplete(&self) -> Result<Vec<ScenarioRecord>, StoreError>;

    /// Delete a `CANCELLED` record. Returns `false` when the record exists
    /// in any other state.
    async fn discard(&self, id: JobId) -> Result<bool, StoreError>;

    /// Whether the backing storage is reachable.
    async fn ping(&self) -> bool;
}

// ---------------------------------------------------------------------------
// In-memory store
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct MemoryEntry {
    record: ScenarioRecord,
    transitions: Vec<LifecycleState>,
}

/// Process-local store keyed by [`JobId`].
///
/// Also keeps every state each record has passed through, which tests use
/// to assert on the path a job took.
#[derive(Debug, Default)]
pub struct InMemoryScenarioStore {
    entries: RwLock<HashMap<JobId, MemoryEntry>>,
}

impl InMemoryScenarioStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every state the record has held, starting with `CREATED`.
    pub async fn transitions(&self, id: JobId) -> Vec<LifecycleState> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.transitions.clone())
            .unwrap_or_default()
    }

    pub async fn ids(&self) -> Vec<JobId> {
        self.entries.read().await.keys().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

fn touch(record: &mut ScenarioRecord) {
    record.updated_at = record.updated_at.max(chrono::Utc::now());
}

#[async_trait]
impl ScenarioStore for InMemoryScenarioStore {
    async fn create(&self, id: JobId) -> Result<ScenarioRecord, StoreError> {
        let now = chrono::Utc::now();
        let record = ScenarioRecord {
            id,
            state: LifecycleState::Created,
            message: None,
            input: None,
            session: None,
            created_at: now,
            updated_at: now,
        };
        self.entries.write().await.insert(
            id,
            MemoryEntry {
                record: record.clone(),
                transitions: vec![LifecycleState::Created],
            },
        );
        Ok(record)
    }

    async fn update_status(
        &self,
        id: JobId,
        state: LifecycleState,
        message: Option<&str>,
    ) -> Result<ScenarioRecord, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if !entry.record.state.can_transition_to(state) {
            return Err(StoreError::InvalidTransition {
                id,
                from: entry.record.state.to_string(),
                to: state,
            });
        }
        entry.record.state = state;
        if let Some(message) = message {
            entry.record.message = Some(message.to_string());
        }
        touch(&mut entry.record);
        entry.transitions.push(state);
        Ok(entry.record.clone())
    }

    async fn store_input(&self, id: JobId, input: &serde_json::Value) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.record.input = Some(input.clone());
        touch(&mut entry.record);
        Ok(())
    }

    async fn store_session(
        &self,
        id: JobId,
        session: &serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        entry.record.session = Some(session.clone());
        touch(&mut entry.record);
        Ok(())
    }

    async fn find(&self, id: JobId) -> Result<Option<ScenarioRecord>, StoreError> {
        Ok(self.entries.read().await.get(&id).map(|e| e.record.clone()))
    }

    async fn find_incomplete(&self) -> Result<Vec<ScenarioRecord>, StoreError> {
        let mut records: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| !e.record.state.is_terminal())
            .map(|e| e.record.clone())
            .collect();
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    async fn discard(&self, id: JobId) -> Result<bool, StoreError> {
        let mut entries = self.entries.write().await;
        let entry = entries.get(&id).ok_or(StoreError::NotFound(id))?;
        if entry.record.state != LifecycleState::Cancelled {
            return Ok(false);
        }
        entries.remove(&id);
        Ok(true)
    }

    async fn ping(&self) -> bool {
        true
    }
}

// ---------------------------------------------------------------------------
// PostgreSQL store
// ---------------------------------------------------------------------------

/// [`ScenarioStore`] over the `scenarios` table.
#[derive(Debug, Clone)]
pub struct PgScenarioStore {
    pool: DbPool,
}

impl PgScenarioStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

fn from_row(row: ScenarioRow) -> Result<ScenarioRecord, StoreError> {
    let state = row
        .state()
        .map_err(|e| StoreError::Database(sqlx::Error::Decode(Box::new(e))))?;
    Ok(ScenarioRecord {
        id: row.job_id(),
        state,
        message: row.message,
        input: row.input_data,
        session: row.session_data,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

#[async_trait]
impl ScenarioStore for PgScenarioStore {
    async fn create(&self, id: JobId) -> Result<ScenarioRecord, StoreError> {
        from_row(ScenarioRepo::create(&self.pool, id).await?)
    }

    async fn update_status(
        &self,
        id: JobId,
        state: LifecycleState,
        message: Option<&str>,
    ) -> Result<ScenarioRecord, StoreError> {
        match ScenarioRepo::update_status(&self.pool, id, state, message).await? {
            StatusUpdate::Applied(row) => from_row(row),
            StatusUpdate::NotFound => Err(StoreError::NotFound(id)),
            StatusUpdate::Rejected { current } => Err(StoreError::InvalidTransition {
                id,
                from: current,
                to: state,
            }),
        }
    }

    async fn store_input(&self, id: JobId, input: &serde_json::Value) -> Result<(), StoreError> {
        if ScenarioRepo::update_input_data(&self.pool, id, input).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn store_session(
        &self,
        id: JobId,
        session: &serde_json::Value,
    ) -> Result<(), StoreError> {
        if ScenarioRepo::update_session_data(&self.pool, id, session).await? {
            Ok(())
        } else {
            Err(StoreError::NotFound(id))
        }
    }

    async fn find(&self, id: JobId) -> Result<Option<ScenarioRecord>, StoreError> {
        ScenarioRepo::find_by_id(&self.pool, id)
            .await?
            .map(from_row)
            .transpose()
    }

    async fn find_incomplete(&self) -> Result<Vec<ScenarioRecord>, StoreError> {
        ScenarioRepo::find_incomplete(&self.pool)
            .await?
            .into_iter()
            .map(from_row)
            .collect()
    }

    async fn discard(&self, id: JobId) -> Result<bool, StoreError> {
        if ScenarioRepo::delete_cancelled(&self.pool, id).await? {
            return Ok(true);
        }
        match ScenarioRepo::find_by_id(&self.pool, id).await? {
            Some(_) => Ok(false),
            None => Err(StoreError::NotFound(id)),
        }
    }

    async fn ping(&self) -> bool {
        turbo_db::health_check(&self.pool).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn create_starts_in_created() {
        let store = InMemoryScenarioStore::new();
        let id = JobId::new();
        let record = store.create(id).await.unwrap();
        assert_eq!(record.state, LifecycleState::Created);
        assert_eq!(store.transitions(id).await, vec![LifecycleState::Created]);
    }

    #[tokio::test]
    async fn terminal_records_refuse_further_transitions() {
        let store = InMemoryScenarioStore::new();
        let id = JobId::new();
        store.create(id).await.unwrap();
        store
            .update_status(id, LifecycleState::Failed, Some("boom"))
            .await
            .unwrap();

        let err = store
            .update_status(id, LifecycleState::Cancelled, None)
            .await
            .unwrap_err();
        assert_matches!(err, StoreError::InvalidTransition { from, .. } if from == "FAILED");

        let record = store.find(id).await.unwrap().unwrap();
        assert_eq!(record.state, LifecycleState::Failed);
        assert_eq!(record.message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn updated_at_never_decreases() {
        let store = InMemoryScenarioStore::new();
        let id = JobId::new();
        let created = store.create(id).await.unwrap();
        store.store_input(id, &serde_json::json!({})).await.unwrap();
        let updated = store
            .update_status(id, LifecycleState::Validating, None)
            .await
            .unwrap();
        assert!(updated.updated_at >= created.updated_at);
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InMemoryScenarioStore::new();
        let id = JobId::new();
        assert!(store.find(id).await.unwrap().is_none());
        assert_matches!(
            store.update_status(id, LifecycleState::Queued, None).await,
            Err(StoreError::NotFound(_))
        );
        assert_matches!(store.discard(id).await, Err(StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn discard_only_removes_cancelled() {
        let store = InMemoryScenarioStore::new();
        let id = JobId::new();
        store.create(id).await.unwrap();
        assert!(!store.discard(id).await.unwrap());

        store
            .update_status(id, LifecycleState::Cancelled, None)
            .await
            .unwrap();
        assert!(store.discard(id).await.unwrap());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn find_incomplete_skips_terminal() {
        let store = InMemoryScenarioStore::new();
        let live = JobId::new();
        let done = JobId::new();
        store.create(live).await.unwrap();
        store.create(done).await.unwrap();
        // Skipping straight to COMPLETED is refused.
        store
            .update_status(done, LifecycleState::Completed, None)
            .await
            .unwrap_err();
        store
            .update_status(done, LifecycleState::Failed, None)
            .await
            .unwrap();

        let incomplete = store.find_incomplete().await.unwrap();
        assert_eq!(incomplete.len(), 1);
        assert_eq!(incomplete[0].id, live);
    }
}
