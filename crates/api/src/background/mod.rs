//! Background and startup tasks.
//!
//! Each submodule provides an async function intended to be awaited at
//! startup or spawned via `tokio::spawn`.

pub mod restart_recovery;
