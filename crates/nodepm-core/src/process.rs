use crate::error::Result;
use crate::stream::MessageStream;
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;

/// Unique identifier for a process
pub type ProcessId = u32;

/// Operation descriptor handed to the engine by the dispatch layer.
///
/// The argument payload stays undecoded until a process implementation
/// knows which shape it expects.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Command {
    pub fn new(id: impl Into<String>, command: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            command: command.into(),
            arguments,
            tags: Vec::new(),
        }
    }

    /// Decode the argument payload into `T`.
    pub fn decode_arguments<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        T::deserialize(&self.arguments)
    }

    /// Decode the argument payload, falling back to `T::default()` when it is
    /// missing or malformed.
    pub fn decode_arguments_lenient<T: DeserializeOwned + Default>(&self) -> T {
        if self.arguments.is_null() {
            return T::default();
        }

        match self.decode_arguments() {
            Ok(args) => args,
            Err(e) => {
                tracing::warn!("ignoring malformed arguments of command {}: {}", self.id, e);
                T::default()
            }
        }
    }
}

impl std::fmt::Display for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[{}]", self.command, self.id)
    }
}

/// Resource usage snapshot of a running process
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessStats {
    /// CPU usage in percent since the previous sample
    pub cpu: f64,
    /// Resident set size in bytes
    pub rss: u64,
    /// Virtual memory size in bytes
    pub vms: u64,
    /// Swapped out memory in bytes
    pub swap: u64,
}

/// Out-of-band duplex byte stream between the supervisor and a process
pub trait Channel: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Release both directions. Calling it again is a no-op.
    fn close(&self) -> io::Result<()>;

    fn is_closed(&self) -> bool;
}

/// Channel with nothing on the other end: reads hit EOF, writes are refused
#[derive(Debug, Default, Clone, Copy)]
pub struct NullChannel;

impl Channel for NullChannel {
    fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn write(&self, _buf: &[u8]) -> io::Result<usize> {
        Err(io::Error::new(
            io::ErrorKind::NotConnected,
            "channel is not connected",
        ))
    }

    fn close(&self) -> io::Result<()> {
        Ok(())
    }

    fn is_closed(&self) -> bool {
        true
    }
}

/// Uniform contract over every execution model.
///
/// `run` returns as soon as the unit of work is started; the returned stream
/// yields output messages and ends with exactly one terminal message.
#[async_trait]
pub trait Process: Send + Sync {
    /// The command this process was created from
    fn command(&self) -> &Command;

    /// Control channel of the process, inert when there is none
    fn channel(&self) -> Arc<dyn Channel>;

    /// Deliver a signal to the process (and everything it spawned)
    fn signal(&self, signal: Signal) -> Result<()>;

    /// Best-effort resource usage, zeroed when unavailable
    fn stats(&self) -> ProcessStats;

    /// OS process id, `None` until the process has been spawned
    fn pid(&self) -> Option<ProcessId>;

    /// Start the unit of work
    async fn run(&self) -> Result<MessageStream>;
}
