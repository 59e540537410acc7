use crate::process::ProcessId;
use thiserror::Error;

/// Core error types for process supervision
#[derive(Error, Debug)]
pub enum PmError {
    #[error("process not found")]
    ProcessNotFound,

    #[error("process already started")]
    AlreadyStarted,

    #[error("operation not supported: {0}")]
    NotSupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to spawn {name}: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("signal delivery failed: {0}")]
    Signal(#[from] nix::errno::Errno),

    #[error("reaper stopped before delivering exit status of pid {0}")]
    ReaperGone(ProcessId),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

pub type Result<T, E = PmError> = std::result::Result<T, E>;
