//! Linux process execution: the pid table, namespace-isolated and plain
//! child processes, their control channels and resource accounting.

mod channel;
mod external;
mod namespace;
mod pid_table;
mod spawn;
mod stats;

pub use channel::PipeChannel;
pub use external::ExternalProcess;
pub use namespace::{Namespace, NamespaceSet};
pub use pid_table::{ExitStatus, PidTable, PidWaiter, SpawnSlot};
pub use stats::StatsSampler;
