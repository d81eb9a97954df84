//! Startup recovery of scenarios left unfinished by a previous process.
//!
//! A record still in a non-terminal state when the server starts belongs to
//! a job that died with the old process. Such records are moved to
//! CANCELLED so clients polling their status see a final answer.

use turbo_pipeline::error::EngineError;
use turbo_pipeline::orchestrator::Orchestrator;

/// Cancel every unfinished scenario this process is not running.
///
/// Must run before the server accepts requests. Returns the number of
/// recovered records.
pub async fn run(orchestrator: &Orchestrator) -> Result<usize, EngineError> {
    let recovered = orchestrator.recover_incomplete().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "Restart recovery: cancelled interrupted scenarios");
    } else {
        tracing::debug!("Restart recovery: nothing to recover");
    }
    Ok(recovered)
}
