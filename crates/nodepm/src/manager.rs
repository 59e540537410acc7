use nodepm_core::{Command, Context, EngineConfig, InternalProcess, PmError, Process, Result};
use nodepm_linux::{ExternalProcess, PidTable};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

/// Entry point of the supervisor. Owns the pid table, and with it the only
/// reaper of this OS process, and hands out processes bound to it.
pub struct ProcessManager {
    config: EngineConfig,
    table: Arc<PidTable>,
}

impl ProcessManager {
    pub fn new(config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PmError::Configuration(format!("Invalid engine config: {e}")))?;

        let table = Arc::new(PidTable::new(&config)?);
        info!(
            "Process manager ready (message buffer {}, reaper idle {}ms)",
            config.message_buffer, config.reaper_idle_ms
        );

        Ok(Self { config, table })
    }

    /// A process in fresh pid, mount, uts and (unless `host_network`)
    /// network namespaces. Arguments decode as `ContainerArgs`.
    pub fn container(&self, command: Command) -> ExternalProcess {
        debug!("New container process for {}", command);
        ExternalProcess::container(self.table.clone(), self.config.clone(), command)
    }

    /// A plain child of this process. Arguments decode as `SystemArgs`.
    pub fn system(&self, command: Command) -> ExternalProcess {
        debug!("New system process for {}", command);
        ExternalProcess::system(self.table.clone(), self.config.clone(), command)
    }

    /// Run `work` on the blocking pool; its JSON-encoded result, error or
    /// panic becomes the single message of the stream.
    pub fn internal<F, T>(&self, command: Command, work: F) -> InternalProcess
    where
        F: FnOnce(Context) -> anyhow::Result<T> + Send + 'static,
        T: Serialize,
    {
        debug!("New internal process for {}", command);
        InternalProcess::new(command, work)
    }

    /// Same as `container`/`system` but type-erased, for callers that keep
    /// heterogeneous processes together.
    pub fn external(&self, command: Command, isolated: bool) -> Box<dyn Process> {
        if isolated {
            Box::new(self.container(command))
        } else {
            Box::new(self.system(command))
        }
    }
}
