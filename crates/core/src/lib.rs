//! Domain types for the scenario simulation service.
//!
//! Everything in this crate is pure: no database, no network, no runtime.
//! The engine (`turbo-pipeline`) and the HTTP surface (`turbo-api`) both
//! build on these definitions.

pub mod error;
pub mod job_events;
pub mod lifecycle;
pub mod process;
pub mod request;
pub mod types;
