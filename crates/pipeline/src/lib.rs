//! Job orchestration engine for long-running simulation requests.
//!
//! Requests enter through the [`Orchestrator`](orchestrator::Orchestrator),
//! are admitted by the [`AdmissionGate`](admission::AdmissionGate) or parked
//! in the [`JobQueue`](queue::JobQueue), and run through the fixed stage
//! sequence by the [`PipelineExecutor`](executor::PipelineExecutor). Each job
//! reports to exactly one progress stream and persists its lifecycle in a
//! [`ScenarioStore`](store::ScenarioStore).

pub mod admission;
pub mod cancellation;
pub mod collaborators;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod progress;
pub mod queue;
pub mod store;
