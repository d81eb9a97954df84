use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use turbo_core::error::CoreError;
use turbo_pipeline::error::{EngineError, StoreError};

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] and [`EngineError`] and adds HTTP-specific variants.
/// Implements [`IntoResponse`] to produce consistent JSON error responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `turbo_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A synchronous failure from the orchestration engine.
    #[error(transparent)]
    Engine(#[from] EngineError),

    /// A database error from sqlx.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            AppError::Core(core) => classify_core_error(core),
            AppError::Engine(engine) => classify_engine_error(engine),
            AppError::Database(err) => classify_sqlx_error(err),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                internal()
            }
        };

        let body = json!({
            "error": message,
            "code": code,
        });

        (status, axum::Json(body)).into_response()
    }
}

fn internal() -> (StatusCode, &'static str, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "An internal error occurred".to_string(),
    )
}

fn classify_core_error(err: &CoreError) -> (StatusCode, &'static str, String) {
    match err {
        CoreError::NotFound { entity, id } => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("{entity} with id {id} not found"),
        ),
        CoreError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
        CoreError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),
        CoreError::Internal(msg) => {
            tracing::error!(error = %msg, "Internal core error");
            internal()
        }
    }
}

/// Saturation (no slot, queue full) maps to 503 so clients can retry later.
fn classify_engine_error(err: &EngineError) -> (StatusCode, &'static str, String) {
    match err {
        EngineError::RejectedAdmission(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            "REJECTED_ADMISSION",
            err.to_string(),
        ),
        EngineError::QueueFull(_) => {
            (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_FULL", err.to_string())
        }
        EngineError::InvalidPayload(msg) => {
            (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone())
        }
        EngineError::NotFound(id) => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Scenario with id {id} not found"),
        ),
        EngineError::NotCancelled { .. } | EngineError::AlreadyAttached(_) => {
            (StatusCode::CONFLICT, "CONFLICT", err.to_string())
        }
        EngineError::Store(StoreError::NotFound(id)) => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            format!("Scenario with id {id} not found"),
        ),
        EngineError::Store(StoreError::InvalidTransition { .. }) => {
            (StatusCode::CONFLICT, "CONFLICT", err.to_string())
        }
        EngineError::Store(StoreError::Database(db)) => classify_sqlx_error(db),
    }
}

/// Classify a sqlx error into an HTTP status, error code, and message.
///
/// `RowNotFound` maps to 404; everything else maps to 500 with a sanitized
/// message.
fn classify_sqlx_error(err: &sqlx::Error) -> (StatusCode, &'static str, String) {
    match err {
        sqlx::Error::RowNotFound => (
            StatusCode::NOT_FOUND,
            "NOT_FOUND",
            "Resource not found".to_string(),
        ),
        other => {
            tracing::error!(error = %other, "Database error");
            internal()
        }
    }
}

#[cfg(test)]
mod tests {
    use turbo_core::lifecycle::LifecycleState;
    use turbo_core::process::JobClass;
    use turbo_core::types::JobId;

    use super::*;

    fn status_of(err: AppError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn saturation_is_service_unavailable() {
        assert_eq!(
            status_of(EngineError::RejectedAdmission(JobClass::Compute).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_of(EngineError::QueueFull(JobClass::Compute).into()),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn discard_of_live_scenario_is_conflict() {
        let err = EngineError::NotCancelled {
            id: JobId::new(),
            state: LifecycleState::Queued,
        };
        assert_eq!(status_of(err.into()), StatusCode::CONFLICT);
    }

    #[test]
    fn payload_and_lookup_errors() {
        assert_eq!(
            status_of(EngineError::InvalidPayload("x".into()).into()),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(EngineError::NotFound("abc".into()).into()),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_of(AppError::Engine(EngineError::Store(StoreError::Database(
                sqlx::Error::PoolTimedOut
            )))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
