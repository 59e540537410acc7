use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Engine-wide tunables shared by every launched process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// How long the reaper parks when there are no children to wait for
    /// (in milliseconds). Each registration wakes it early.
    #[serde(default = "default_reaper_idle_ms")]
    pub reaper_idle_ms: u64,

    /// Capacity of the per-process message channel
    #[serde(default = "default_message_buffer")]
    pub message_buffer: usize,

    /// Stack handed to the cloned child until it calls exec (in bytes)
    #[serde(default = "default_clone_stack_size")]
    pub clone_stack_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            reaper_idle_ms: default_reaper_idle_ms(),
            message_buffer: default_message_buffer(),
            clone_stack_size: default_clone_stack_size(),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration and return errors if invalid
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.reaper_idle_ms == 0 {
            return Err(anyhow::anyhow!("reaper_idle_ms must be greater than zero"));
        }

        if self.reaper_idle_ms > 10_000 {
            return Err(anyhow::anyhow!("reaper_idle_ms should not exceed 10 seconds"));
        }

        if self.message_buffer == 0 {
            return Err(anyhow::anyhow!("message_buffer must be greater than zero"));
        }

        if self.clone_stack_size < 16 * 1024 {
            return Err(anyhow::anyhow!("clone_stack_size must be at least 16KiB"));
        }

        Ok(())
    }

    pub fn reaper_idle(&self) -> Duration {
        Duration::from_millis(self.reaper_idle_ms)
    }
}

/// Arguments of a namespace-isolated process, decoded from a command payload.
///
/// Every field is optional on the wire; a missing executable name only fails
/// once the launcher tries to exec it.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
#[builder(setter(into), default)]
pub struct ContainerArgs {
    /// Executable path, resolved inside the chroot only
    pub name: String,
    #[builder(setter(custom))]
    pub args: Vec<String>,
    pub dir: String,
    pub chroot: String,
    pub host_network: bool,
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    /// Redirect stdout and stderr to this file (append/create)
    pub log: String,
}

impl ContainerArgs {
    pub fn builder() -> ContainerArgsBuilder {
        ContainerArgsBuilder::default()
    }
}

impl ContainerArgsBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

/// Arguments of an ordinary child process sharing the host namespaces
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize, Builder)]
#[serde(default)]
#[builder(setter(into), default)]
pub struct SystemArgs {
    /// Executable name; looked up in PATH when it has no `/`
    pub name: String,
    #[builder(setter(custom))]
    pub args: Vec<String>,
    pub dir: String,
    #[builder(setter(custom))]
    pub env: HashMap<String, String>,
    pub log: String,
}

impl SystemArgs {
    pub fn builder() -> SystemArgsBuilder {
        SystemArgsBuilder::default()
    }
}

impl SystemArgsBuilder {
    pub fn args<S: ToString, I: IntoIterator<Item = S>>(&mut self, iter: I) -> &mut Self {
        let args: Vec<String> = iter.into_iter().map(|s| s.to_string()).collect();
        self.args = Some(args);
        self
    }

    pub fn env<T: ToString>(&mut self, key: T, value: T) -> &mut Self {
        let map = self.env.get_or_insert_with(HashMap::new);
        map.insert(key.to_string(), value.to_string());
        self
    }
}

// Default value functions for serde
fn default_reaper_idle_ms() -> u64 {
    100
}
fn default_message_buffer() -> usize {
    64
}
fn default_clone_stack_size() -> usize {
    256 * 1024
}
