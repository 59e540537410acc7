//! OS-backed processes: namespace-isolated containers and plain children.

use crate::channel::PipeChannel;
use crate::namespace::NamespaceSet;
use crate::pid_table::{ExitStatus, PidTable, PidWaiter};
use crate::spawn::{self, ChildFds, ChildSpec};
use crate::stats::StatsSampler;
use async_trait::async_trait;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{self, Signal};
use nix::unistd::{Pid, pipe2};
use nodepm_core::{
    Channel, Command, ContainerArgs, EngineConfig, Level, Message, MessageStream, NullChannel,
    PmError, Process, ProcessId, ProcessStats, Result, SystemArgs, forward_lines,
};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use tokio::net::unix::pipe;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// What to exec and how to isolate it, derived from the command arguments
#[derive(Debug, Clone)]
struct Launch {
    name: String,
    args: Vec<String>,
    env: Vec<String>,
    dir: String,
    chroot: String,
    log: String,
    namespaces: NamespaceSet,
    /// Look `name` up in PATH (host processes only)
    lookup_path: Option<String>,
}

impl Launch {
    fn container(args: ContainerArgs) -> Self {
        let namespaces = NamespaceSet::for_container(&args);
        Self {
            // never looked up: the name only exists under the chroot
            name: args.name,
            args: args.args,
            env: env_list(&args.env),
            dir: args.dir,
            chroot: args.chroot,
            log: args.log,
            namespaces,
            lookup_path: None,
        }
    }

    fn system(args: SystemArgs) -> Self {
        let mut env: HashMap<String, String> = std::env::vars_os()
            .map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
            .collect();
        env.extend(args.env);
        let path = env.get("PATH").cloned().unwrap_or_default();

        Self {
            name: args.name,
            args: args.args,
            env: env_list(&env),
            dir: args.dir,
            chroot: String::new(),
            log: args.log,
            namespaces: NamespaceSet::host(),
            lookup_path: Some(path),
        }
    }

    fn program(&self) -> std::io::Result<String> {
        match &self.lookup_path {
            Some(path) if !path.is_empty() => spawn::resolve_program(&self.name, Some(path)),
            Some(_) => spawn::resolve_program(&self.name, None),
            None => Ok(self.name.clone()),
        }
    }
}

/// `KEY=VALUE` entries in map order, which is unspecified
fn env_list(env: &HashMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Where the child's stdout and stderr go
enum Output {
    Log(File),
    Capture {
        stdout: (pipe::Receiver, OwnedFd),
        stderr: (pipe::Receiver, OwnedFd),
    },
}

impl Output {
    fn open(log: &str) -> Result<Self> {
        if !log.is_empty() {
            let file = OpenOptions::new().append(true).create(true).open(log)?;
            return Ok(Output::Log(file));
        }

        Ok(Output::Capture {
            stdout: capture_pipe()?,
            stderr: capture_pipe()?,
        })
    }
}

fn capture_pipe() -> Result<(pipe::Receiver, OwnedFd)> {
    let (read, write) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
    let receiver = pipe::Receiver::from_file(File::from(read))?;
    Ok((receiver, write))
}

/// State shared between the process handle and its supervising task
#[derive(Default)]
struct State {
    started: AtomicBool,
    /// Set once the child is reaped; its pid and group may be reused after
    exited: AtomicBool,
    pid: OnceLock<ProcessId>,
    channel: OnceLock<Arc<PipeChannel>>,
    sampler: Mutex<Option<StatsSampler>>,
}

impl State {
    fn release(&self) {
        self.sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// A process created by this engine from an executable on disk.
///
/// Containers get their own pid, mount, uts and (optionally) network
/// namespaces; system processes share the host's. Both become the leader
/// of a new session so a signal reaches everything they spawned.
pub struct ExternalProcess {
    command: Command,
    launch: Launch,
    table: Arc<PidTable>,
    config: EngineConfig,
    state: Arc<State>,
}

impl ExternalProcess {
    /// Malformed arguments are tolerated here and only surface as a spawn
    /// failure when `run` is called.
    pub fn container(table: Arc<PidTable>, config: EngineConfig, command: Command) -> Self {
        let args: ContainerArgs = command.decode_arguments_lenient();
        Self::new(table, config, command, Launch::container(args))
    }

    pub fn system(table: Arc<PidTable>, config: EngineConfig, command: Command) -> Self {
        let args: SystemArgs = command.decode_arguments_lenient();
        Self::new(table, config, command, Launch::system(args))
    }

    fn new(table: Arc<PidTable>, config: EngineConfig, command: Command, launch: Launch) -> Self {
        Self {
            command,
            launch,
            table,
            config,
            state: Arc::new(State::default()),
        }
    }

    pub fn is_isolated(&self) -> bool {
        !self.launch.namespaces.is_empty()
    }

    /// Set up every resource, then create and register the child.
    /// Nothing is spawned if any setup step fails.
    fn start(&self) -> Result<(PidWaiter, Arc<PipeChannel>, Vec<pipe::Receiver>)> {
        let launch = &self.launch;

        let (parent_read, child_write) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
        let (child_read, parent_write) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
        let channel = Arc::new(PipeChannel::new(parent_read, parent_write));

        let output = Output::open(&launch.log)?;
        let stdin = File::open("/dev/null")?;

        let program = launch.program().map_err(|source| PmError::SpawnFailed {
            name: launch.name.clone(),
            source,
        })?;
        let spec = ChildSpec::new(
            &program,
            &launch.args,
            &launch.env,
            &launch.dir,
            &launch.chroot,
            launch.namespaces.clone(),
        )?;

        let (stdout, stderr) = match &output {
            Output::Log(file) => (file.as_fd(), file.as_fd()),
            Output::Capture { stdout, stderr } => (stdout.1.as_fd(), stderr.1.as_fd()),
        };
        let fds = ChildFds {
            stdin: stdin.as_fd(),
            stdout,
            stderr,
            control_read: child_read.as_fd(),
            control_write: child_write.as_fd(),
        };

        let waiter = {
            let slot = self.table.begin_spawn();
            let pid = spawn::spawn(&spec, &fds, self.config.clone_stack_size).map_err(
                |source| PmError::SpawnFailed {
                    name: launch.name.clone(),
                    source,
                },
            )?;
            slot.register(pid)
        };

        // the child owns its copies now; only the parent ends stay open here
        drop(stdin);
        drop(child_read);
        drop(child_write);
        let receivers = match output {
            Output::Log(_) => Vec::new(),
            Output::Capture { stdout, stderr } => vec![stdout.0, stderr.0],
        };

        Ok((waiter, channel, receivers))
    }
}

fn terminal_message(status: Result<ExitStatus>) -> Message {
    match status {
        Ok(status) if status.success() => Message::exit_success(Level::Stdout, ""),
        Ok(status) => Message::exit_error(Some(status.code() as u32), Level::Stderr, ""),
        Err(e) => Message::exit_error(None, Level::Stderr, e.to_string()),
    }
}

#[async_trait]
impl Process for ExternalProcess {
    fn command(&self) -> &Command {
        &self.command
    }

    fn channel(&self) -> Arc<dyn Channel> {
        match self.state.channel.get() {
            Some(channel) => channel.clone() as Arc<dyn Channel>,
            None => Arc::new(NullChannel),
        }
    }

    fn signal(&self, signal: Signal) -> Result<()> {
        let pid = *self.state.pid.get().ok_or(PmError::ProcessNotFound)?;
        if self.state.exited.load(Ordering::SeqCst) {
            return Err(PmError::ProcessNotFound);
        }

        // negative pid: the whole process group led by the child
        match signal::kill(Pid::from_raw(-(pid as i32)), signal) {
            Ok(()) => {
                info!("Sent {} to process group {} ({})", signal, pid, self.command);
                Ok(())
            }
            Err(Errno::ESRCH) => Err(PmError::ProcessNotFound),
            Err(e) => Err(e.into()),
        }
    }

    fn stats(&self) -> ProcessStats {
        match self
            .state
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(sampler) => sampler.sample(),
            None => ProcessStats::default(),
        }
    }

    fn pid(&self) -> Option<ProcessId> {
        self.state.pid.get().copied()
    }

    async fn run(&self) -> Result<MessageStream> {
        if self.state.started.swap(true, Ordering::SeqCst) {
            return Err(PmError::AlreadyStarted);
        }

        let (waiter, channel, receivers) = match self.start() {
            Ok(started) => started,
            Err(e) => {
                self.state.started.store(false, Ordering::SeqCst);
                warn!("Failed to start {}: {}", self.command, e);
                return Err(e);
            }
        };

        let pid = waiter.pid();
        let _ = self.state.pid.set(pid);
        let _ = self.state.channel.set(channel.clone());
        *self
            .state
            .sampler
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(StatsSampler::new(pid));
        info!(
            "Spawned {} {} (PID: {}) with args: {:?}",
            if self.is_isolated() { "container" } else { "process" },
            self.command,
            pid,
            self.launch.args
        );

        let (tx, rx) = mpsc::channel(self.config.message_buffer);
        let levels = [Level::Stdout, Level::Stderr];
        let copies: Vec<JoinHandle<std::io::Result<()>>> = receivers
            .into_iter()
            .zip(levels)
            .map(|(receiver, level)| tokio::spawn(forward_lines(receiver, level, tx.clone())))
            .collect();

        let state = self.state.clone();
        let command = self.command.clone();
        tokio::spawn(async move {
            let status = waiter.wait().await;
            state.exited.store(true, Ordering::SeqCst);

            // output copying must finish before the stream may end
            for copy in copies {
                match copy.await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => warn!("Output copy of {} failed: {}", command, e),
                    Err(e) => warn!("Output copy task of {} aborted: {}", command, e),
                }
            }

            if let Err(e) = channel.close() {
                error!("Failed to close control channel of {}: {}", command, e);
            }
            state.release();

            debug!("Process {} exited with {:?}", command, status);
            if tx.send(terminal_message(status)).await.is_err() {
                debug!("Exit of {} dropped, stream receiver is gone", command);
            }
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pid_table::tests::shared_table;
    use nodepm_core::Flags;
    use serde_json::json;

    fn system(arguments: serde_json::Value) -> ExternalProcess {
        ExternalProcess::system(
            shared_table(),
            EngineConfig::default(),
            Command::new("t", "core.system", arguments),
        )
    }

    async fn collect(mut rx: MessageStream) -> Vec<Message> {
        let mut msgs = Vec::new();
        while let Some(msg) = rx.recv().await {
            msgs.push(msg);
        }
        msgs
    }

    #[test]
    fn test_container_launch_keeps_name() {
        let args = ContainerArgs::builder()
            .name("bin/app")
            .env("A", "1")
            .build()
            .unwrap();
        let launch = Launch::container(args);
        assert_eq!(launch.program().unwrap(), "bin/app");
        assert_eq!(launch.env, vec!["A=1".to_string()]);
        assert!(launch.lookup_path.is_none());
    }

    #[test]
    fn test_system_launch_overlays_env() {
        let args = SystemArgs::builder()
            .name("sh")
            .env("NODEPM_TEST_VAR", "x")
            .build()
            .unwrap();
        let launch = Launch::system(args);
        assert!(launch.env.contains(&"NODEPM_TEST_VAR=x".to_string()));
        assert!(launch.program().unwrap().ends_with("/sh"));
    }

    #[tokio::test]
    async fn test_stdout_lines_then_terminal() {
        let process = system(json!({"name": "sh", "args": ["-c", "echo one; echo two >&2"]}));
        let msgs = collect(process.run().await.unwrap()).await;

        assert_eq!(msgs.len(), 3);
        assert!(msgs.iter().any(|m| m.meta.level() == Level::Stdout && m.message == "one"));
        assert!(msgs.iter().any(|m| m.meta.level() == Level::Stderr && m.message == "two"));

        let last = msgs.last().unwrap();
        assert!(last.meta.is(Flags::EXIT_SUCCESS));
        assert_eq!(last.meta.code(), Some(0));
        assert_eq!(msgs.iter().filter(|m| m.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let process = system(json!({"name": "sh", "args": ["-c", "exit 3"]}));
        let msgs = collect(process.run().await.unwrap()).await;

        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].meta.is(Flags::EXIT_ERROR));
        assert_eq!(msgs[0].meta.code(), Some(3));
        assert_eq!(msgs[0].meta.level(), Level::Stderr);
    }

    #[tokio::test]
    async fn test_signal_before_start() {
        let process = system(json!({"name": "sleep", "args": ["10"]}));
        assert!(matches!(
            process.signal(Signal::SIGTERM),
            Err(PmError::ProcessNotFound)
        ));
        assert_eq!(process.pid(), None);
        assert_eq!(process.stats(), ProcessStats::default());
    }

    #[tokio::test]
    async fn test_signal_terminates_group() {
        let process = system(json!({"name": "sh", "args": ["-c", "sleep 30 & sleep 30"]}));
        let rx = process.run().await.unwrap();
        assert!(process.pid().is_some());

        process.signal(Signal::SIGKILL).unwrap();
        let msgs = collect(rx).await;
        let last = msgs.last().unwrap();
        assert!(last.meta.is(Flags::EXIT_ERROR));
        assert_eq!(last.meta.code(), Some(128 + Signal::SIGKILL as u32));
    }

    #[tokio::test]
    async fn test_missing_binary_fails_run() {
        let process = ExternalProcess::container(
            shared_table(),
            EngineConfig::default(),
            Command::new("t", "corex.create", json!("not an object")),
        );
        let err = process.run().await.unwrap_err();
        assert!(matches!(err, PmError::SpawnFailed { .. }));
        assert_eq!(process.pid(), None);
    }

    #[tokio::test]
    async fn test_log_open_failure_spawns_nothing() {
        let process = system(json!({
            "name": "sh",
            "args": ["-c", "exit 0"],
            "log": "/nonexistent-dir/nodepm/out.log"
        }));
        let err = process.run().await.unwrap_err();
        assert!(matches!(err, PmError::Io(_)));
        assert_eq!(process.pid(), None);
    }

    #[tokio::test]
    async fn test_run_twice_is_refused() {
        let process = system(json!({"name": "true"}));
        let rx = process.run().await.unwrap();
        assert!(matches!(process.run().await, Err(PmError::AlreadyStarted)));
        collect(rx).await;
    }

    #[tokio::test]
    async fn test_control_channel() {
        // the child echoes one line from fd 3 back on fd 4
        let process = system(json!({"name": "sh", "args": ["-c", "read line <&3; echo \"got $line\" >&4"]}));
        assert!(process.channel().is_closed());

        let rx = process.run().await.unwrap();
        let channel = process.channel();
        assert!(!channel.is_closed());
        channel.write(b"hello\n").unwrap();

        let reply = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 64];
            let n = channel.read(&mut buf).unwrap();
            String::from_utf8_lossy(&buf[..n]).into_owned()
        })
        .await
        .unwrap();
        assert_eq!(reply, "got hello\n");

        let msgs = collect(rx).await;
        assert!(msgs.last().unwrap().meta.is(Flags::EXIT_SUCCESS));
        assert!(process.channel().is_closed());
    }

    #[tokio::test]
    async fn test_signal_after_exit_is_refused() {
        let process = system(json!({"name": "sh", "args": ["-c", "echo started; sleep 30"]}));
        let mut rx = process.run().await.unwrap();
        assert_eq!(rx.recv().await.unwrap().message, "started");

        process.signal(Signal::SIGKILL).unwrap();
        let msgs = collect(rx).await;
        assert!(msgs.last().unwrap().is_terminal());

        assert!(process.pid().is_some());
        assert!(matches!(
            process.signal(Signal::SIGTERM),
            Err(PmError::ProcessNotFound)
        ));
    }

    #[tokio::test]
    async fn test_output_goes_to_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("out.log");
        std::fs::write(&log, "existing\n").unwrap();

        let process = system(json!({
            "name": "sh",
            "args": ["-c", "echo out; echo err >&2"],
            "log": log,
        }));
        let msgs = collect(process.run().await.unwrap()).await;

        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].meta.is(Flags::EXIT_SUCCESS));

        let content = std::fs::read_to_string(&log).unwrap();
        assert!(content.starts_with("existing\n"));
        assert!(content.contains("out\n"));
        assert!(content.contains("err\n"));
    }

    #[tokio::test]
    async fn test_container_runs_as_pid_one() {
        let process = ExternalProcess::container(
            shared_table(),
            EngineConfig::default(),
            Command::new(
                "c",
                "corex.create",
                json!({"name": "/bin/sh", "args": ["-c", "echo $$"], "host_network": true}),
            ),
        );
        assert!(process.is_isolated());

        let rx = match process.run().await {
            Ok(rx) => rx,
            // creating namespaces needs CAP_SYS_ADMIN
            Err(PmError::SpawnFailed { source, .. })
                if matches!(
                    source.raw_os_error(),
                    Some(libc::EPERM) | Some(libc::EINVAL) | Some(libc::ENOSPC)
                ) =>
            {
                return;
            }
            Err(e) => panic!("container failed to start: {e}"),
        };

        let msgs = collect(rx).await;
        assert_eq!(msgs[0].message, "1");
        assert!(msgs.last().unwrap().meta.is(Flags::EXIT_SUCCESS));
    }
}
