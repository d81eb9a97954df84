//! Repository for the `scenarios` table.
//!
//! Status changes go through [`ScenarioRepo::update_status`], which locks the
//! row and checks the lifecycle transition table before writing, so a
//! terminal scenario can never be moved again. `updated_at` never moves
//! backwards even if the database clock does.

use sqlx::PgPool;
use turbo_core::lifecycle::LifecycleState;
use turbo_core::types::JobId;

use crate::models::scenario::ScenarioRow;

/// Column list for `scenarios` queries.
const COLUMNS: &str = "\
    request_id, status, message, input_data, session_data, created_at, updated_at";

/// Outcome of a guarded status write.
#[derive(Debug)]
pub enum StatusUpdate {
    /// The transition was allowed and persisted.
    Applied(ScenarioRow),
    /// No row for that id.
    NotFound,
    /// The stored state does not permit the requested transition.
    Rejected { current: String },
}

/// Provides CRUD operations for scenario records.
pub struct ScenarioRepo;

impl ScenarioRepo {
    /// Insert a fresh record in `CREATED`.
    pub async fn create(pool: &PgPool, id: JobId) -> Result<ScenarioRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO scenarios (request_id, status) VALUES ($1, $2) RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ScenarioRow>(&query)
            .bind(id.as_uuid())
            .bind(LifecycleState::Created.as_str())
            .fetch_one(pool)
            .await
    }

    /// Find a scenario by its request id.
    pub async fn find_by_id(pool: &PgPool, id: JobId) -> Result<Option<ScenarioRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM scenarios WHERE request_id = $1");
        sqlx::query_as::<_, ScenarioRow>(&query)
            .bind(id.as_uuid())
            .fetch_optional(pool)
            .await
    }

    /// Move a scenario to `next`, recording `message` alongside.
    ///
    /// Runs in a transaction holding `SELECT ... FOR UPDATE` on the row so
    /// concurrent writers for the same id are serialised.
    pub async fn update_status(
        pool: &PgPool,
        id: JobId,
        next: LifecycleState,
        message: Option<&str>,
    ) -> Result<StatusUpdate, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let current: Option<(String,)> =
            sqlx::query_as("SELECT status FROM scenarios WHERE request_id = $1 FOR UPDATE")
                .bind(id.as_uuid())
                .fetch_optional(&mut *tx)
                .await?;

        let Some((current,)) = current else {
            return Ok(StatusUpdate::NotFound);
        };

        let allowed = current
            .parse::<LifecycleState>()
            .map(|state| state.can_transition_to(next))
            .unwrap_or(false);
        if !allowed {
            return Ok(StatusUpdate::Rejected { current });
        }

        let query = format!(
            "UPDATE scenarios \
             SET status = $2, message = COALESCE($3, message), \
                 updated_at = GREATEST(updated_at, NOW()) \
             WHERE request_id = $1 \
             RETURNING {COLUMNS}"
        );
        let row = sqlx::query_as::<_, ScenarioRow>(&query)
            .bind(id.as_uuid())
            .bind(next.as_str())
            .bind(message)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(StatusUpdate::Applied(row))
    }

    /// Store the request payload. Returns `false` if no row matched.
    pub async fn update_input_data(
        pool: &PgPool,
        id: JobId,
        input: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE scenarios \
             SET input_data = $2, updated_at = GREATEST(updated_at, NOW()) \
             WHERE request_id = $1",
        )
        .bind(id.as_uuid())
        .bind(input)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Store stage-produced session artifacts. Returns `false` if no row matched.
    pub async fn update_session_data(
        pool: &PgPool,
        id: JobId,
        session: &serde_json::Value,
    ) -> Result<bool, sqlx::Error> {
        let result = sqlx::query(
            "UPDATE scenarios \
             SET session_data = $2, updated_at = GREATEST(updated_at, NOW()) \
             WHERE request_id = $1",
        )
        .bind(id.as_uuid())
        .bind(session)
        .execute(pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// All scenarios not yet in a terminal state, oldest first.
    pub async fn find_incomplete(pool: &PgPool) -> Result<Vec<ScenarioRow>, sqlx::Error> {
        let query = format!(
            "SELECT {COLUMNS} FROM scenarios \
             WHERE status NOT IN ($1, $2, $3) \
             ORDER BY created_at ASC"
        );
        sqlx::query_as::<_, ScenarioRow>(&query)
            .bind(LifecycleState::Completed.as_str())
            .bind(LifecycleState::Failed.as_str())
            .bind(LifecycleState::Cancelled.as_str())
            .fetch_all(pool)
            .await
    }

    /// Delete a scenario, but only if it is `CANCELLED`.
    ///
    /// Returns `true` if a row was deleted.
    pub async fn delete_cancelled(pool: &PgPool, id: JobId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM scenarios WHERE request_id = $1 AND status = $2")
            .bind(id.as_uuid())
            .bind(LifecycleState::Cancelled.as_str())
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
