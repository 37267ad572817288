use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::RunState;

/// State-machine errors callers may want to match on. Everything else is `anyhow`.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run already started: {run_id} ({state})")]
    AlreadyStarted { run_id: String, state: RunState },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition { from: RunState, to: RunState },

    #[error("another run is in progress: {run_id} ({state})")]
    RunInProgress { run_id: String, state: RunState },

    #[error("run {run_id} cannot be resumed from {state}")]
    NotResumable { run_id: String, state: RunState },

    #[error(
        "run {run_id} is held by a live process (pid {pid}, last heartbeat {heartbeat_at}); \
         use --force to take it over"
    )]
    RunLocked {
        run_id: String,
        pid: u32,
        heartbeat_at: DateTime<Utc>,
    },

    #[error("no run found at {}", path.display())]
    NoRun { path: PathBuf },
}
