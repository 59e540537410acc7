//! Runs a plain function behind the same `Process` contract as an OS process.

use crate::error::{PmError, Result};
use crate::process::{Channel, Command, NullChannel, Process, ProcessId, ProcessStats};
use crate::stream::{Flags, Level, Message, MessageStream, Meta};
use async_trait::async_trait;
use nix::sys::signal::Signal;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::any::Any;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// What an in-process function gets to see of the command that started it
#[derive(Debug, Clone)]
pub struct Context {
    command: Command,
}

impl Context {
    pub fn new(command: Command) -> Self {
        Self { command }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }

    /// Strictly decode the command arguments.
    pub fn arguments<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        Ok(self.command.decode_arguments()?)
    }
}

type Work = Box<dyn FnOnce(Context) -> anyhow::Result<serde_json::Value> + Send>;

/// Outcome of an in-process function once panics have been folded in
type Outcome = std::result::Result<serde_json::Value, String>;

pub struct InternalProcess {
    command: Command,
    work: Mutex<Option<Work>>,
}

impl InternalProcess {
    pub fn new<F, T>(command: Command, work: F) -> Self
    where
        F: FnOnce(Context) -> anyhow::Result<T> + Send + 'static,
        T: Serialize,
    {
        let work: Work = Box::new(move |ctx| {
            let value = work(ctx)?;
            Ok(serde_json::to_value(value)?)
        });

        Self {
            command,
            work: Mutex::new(Some(work)),
        }
    }

    fn result_message(outcome: Outcome) -> Message {
        match outcome {
            Ok(value) => Message::new(
                Meta::new(Level::ResultJson, Flags::EXIT_SUCCESS),
                value.to_string(),
            ),
            Err(fault) => Message::new(
                Meta::new(Level::ResultJson, Flags::EXIT_ERROR),
                serde_json::Value::String(fault).to_string(),
            ),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}

#[async_trait]
impl Process for InternalProcess {
    fn command(&self) -> &Command {
        &self.command
    }

    fn channel(&self) -> Arc<dyn Channel> {
        Arc::new(NullChannel)
    }

    fn signal(&self, _signal: Signal) -> Result<()> {
        Err(PmError::NotSupported("signal"))
    }

    fn stats(&self) -> ProcessStats {
        ProcessStats::default()
    }

    fn pid(&self) -> Option<ProcessId> {
        None
    }

    async fn run(&self) -> Result<MessageStream> {
        let work = self
            .work
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .ok_or(PmError::AlreadyStarted)?;

        let (tx, rx) = mpsc::channel(1);
        let ctx = Context::new(self.command.clone());
        let command = self.command.clone();

        tokio::spawn(async move {
            let outcome = match tokio::task::spawn_blocking(move || work(ctx)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) if e.is_panic() => Err(panic_message(e.into_panic())),
                Err(e) => Err(e.to_string()),
            };

            if let Err(fault) = &outcome {
                debug!("internal process {} failed: {}", command, fault);
            }

            if tx.send(InternalProcess::result_message(outcome)).await.is_err() {
                debug!("result of {} dropped, stream receiver is gone", command);
            }
        });

        Ok(rx)
    }
}
