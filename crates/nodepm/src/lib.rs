//! nodepm - node-local process supervisor
//!
//! Runs commands as namespace-isolated containers, plain host children or
//! in-process functions behind one `Process` contract, and streams their
//! output and outcome as `Message`s.

mod manager;

pub use manager::ProcessManager;

// Re-export the building blocks
pub use nodepm_core::*;
pub use nodepm_linux::{
    ExitStatus, ExternalProcess, Namespace, NamespaceSet, PidTable, PipeChannel, StatsSampler,
};
