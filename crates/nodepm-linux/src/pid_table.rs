//! Registry of in-flight children and the single reaper that collects them.
//!
//! The reaper waits for *any* child of this process. A pid is inserted while
//! the table lock taken for its creation is still held. The reaper only peeks
//! at an exited child, then reaps that exact pid under the same lock, so a
//! child that exits immediately is never collected before the table knows
//! about it and a pid is never freed for reuse while its entry is live.

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{Id, WaitPidFlag, WaitStatus, waitid, waitpid};
use nix::unistd::Pid;
use nodepm_core::{EngineConfig, PmError, ProcessId, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

static REAPER_STARTED: AtomicBool = AtomicBool::new(false);

/// How a reaped child terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Exited(i32),
    Signaled(Signal),
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Exited(0))
    }

    /// Exit code as reported to callers; a signal death maps to `128 + signo`.
    pub fn code(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::Signaled(signal) => 128 + *signal as i32,
        }
    }
}

#[derive(Default)]
struct Slots {
    waiters: HashMap<ProcessId, oneshot::Sender<ExitStatus>>,
    /// Bumped on every registration so the reaper can tell whether a child
    /// appeared since it last found none.
    generation: u64,
}

struct Shared {
    slots: Mutex<Slots>,
    wake: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Race-free pid registry. Exactly one may exist per OS process.
pub struct PidTable {
    shared: Arc<Shared>,
}

impl PidTable {
    /// Create the table and start its reaper thread.
    ///
    /// Fails if another table already owns the reaper: two threads waiting on
    /// any child would steal each other's exit statuses.
    pub fn new(config: &EngineConfig) -> Result<Self> {
        if REAPER_STARTED.swap(true, Ordering::SeqCst) {
            return Err(PmError::Configuration(
                "a pid table with a running reaper already exists".to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            slots: Mutex::new(Slots::default()),
            wake: Condvar::new(),
        });

        let reaper = Reaper {
            shared: shared.clone(),
            idle: config.reaper_idle(),
        };

        if let Err(e) = std::thread::Builder::new()
            .name("nodepm-reaper".to_string())
            .spawn(move || reaper.run())
        {
            REAPER_STARTED.store(false, Ordering::SeqCst);
            return Err(e.into());
        }

        info!("Started pid table reaper");
        Ok(Self { shared })
    }

    /// Enter the spawn critical section. The OS-level create must happen
    /// while the returned slot is alive; dropping it unregistered leaves the
    /// table untouched.
    pub fn begin_spawn(&self) -> SpawnSlot<'_> {
        SpawnSlot {
            slots: self.shared.lock(),
            wake: &self.shared.wake,
        }
    }

    /// Whether `pid` is registered and its exit not collected yet
    pub fn is_registered(&self, pid: ProcessId) -> bool {
        self.shared.lock().waiters.contains_key(&pid)
    }
}

/// Holds the table lock between creating a child and registering its pid
pub struct SpawnSlot<'a> {
    slots: MutexGuard<'a, Slots>,
    wake: &'a Condvar,
}

impl SpawnSlot<'_> {
    /// Register a freshly created child and leave the critical section.
    pub fn register(mut self, pid: ProcessId) -> PidWaiter {
        let (tx, rx) = oneshot::channel();
        if self.slots.waiters.insert(pid, tx).is_some() {
            // the kernel cannot hand out a pid that is still an unreaped child
            error!("pid {} was registered while its previous owner was not reaped", pid);
        }
        self.slots.generation += 1;
        self.wake.notify_one();
        debug!("Registered pid {}", pid);

        PidWaiter { pid, rx }
    }
}

/// Single-use handle on the exit status of one registered child
#[derive(Debug)]
pub struct PidWaiter {
    pid: ProcessId,
    rx: oneshot::Receiver<ExitStatus>,
}

impl PidWaiter {
    pub fn pid(&self) -> ProcessId {
        self.pid
    }

    /// Suspend until the reaper has collected this child.
    pub async fn wait(self) -> Result<ExitStatus> {
        let pid = self.pid;
        self.rx.await.map_err(|_| PmError::ReaperGone(pid))
    }
}

struct Reaper {
    shared: Arc<Shared>,
    idle: Duration,
}

impl Reaper {
    fn run(self) {
        loop {
            let seen = self.shared.lock().generation;

            // WNOWAIT leaves the child a zombie: its pid stays taken until
            // `reap` collects it under the table lock
            match waitid(Id::All, WaitPidFlag::WEXITED | WaitPidFlag::WNOWAIT) {
                Ok(status) => match status.pid() {
                    Some(pid) => self.reap(pid),
                    None => debug!("Ignoring wait status {:?}", status),
                },
                Err(Errno::EINTR) => {}
                Err(Errno::ECHILD) => self.park(seen),
                Err(e) => {
                    warn!("waitid failed, retrying: {}", e);
                    std::thread::sleep(self.idle);
                }
            }
        }
    }

    fn reap(&self, pid: Pid) {
        let mut slots = self.shared.lock();

        let status = loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => break ExitStatus::Exited(code),
                Ok(WaitStatus::Signaled(_, signal, _)) => break ExitStatus::Signaled(signal),
                Ok(other) => {
                    debug!("Ignoring wait status {:?}", other);
                    return;
                }
                Err(Errno::EINTR) => {}
                Err(e) => {
                    warn!("waitpid({}) failed: {}", pid, e);
                    return;
                }
            }
        };

        let raw = pid.as_raw() as ProcessId;
        let waiter = slots.waiters.remove(&raw);
        drop(slots);

        match waiter {
            Some(tx) => {
                debug!("Reaped pid {} with {:?}", raw, status);
                if tx.send(status).is_err() {
                    debug!("Waiter of pid {} is gone", raw);
                }
            }
            None => debug!("Reaped unregistered pid {} with {:?}", raw, status),
        }
    }

    /// No children right now: sleep until the next registration or the idle
    /// interval, unless a child was registered since `seen`.
    fn park(&self, seen: u64) {
        let slots = self.shared.lock();
        if slots.generation != seen {
            return;
        }

        let _ = self
            .shared
            .wake
            .wait_timeout(slots, self.idle)
            .unwrap_or_else(PoisonError::into_inner);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// Every test in this binary shares one table: a second reaper would
    /// steal exit statuses.
    pub(crate) fn shared_table() -> Arc<PidTable> {
        static TABLE: OnceLock<Arc<PidTable>> = OnceLock::new();
        TABLE
            .get_or_init(|| Arc::new(PidTable::new(&EngineConfig::default()).unwrap()))
            .clone()
    }

    fn spawn_sh(table: &PidTable, script: &str) -> PidWaiter {
        let slot = table.begin_spawn();
        let child = std::process::Command::new("/bin/sh")
            .args(["-c", script])
            .spawn()
            .unwrap();
        slot.register(child.id())
    }

    #[test]
    fn test_exit_status_codes() {
        assert!(ExitStatus::Exited(0).success());
        assert!(!ExitStatus::Exited(1).success());
        assert_eq!(ExitStatus::Exited(3).code(), 3);
        assert_eq!(ExitStatus::Signaled(Signal::SIGKILL).code(), 137);
        assert!(!ExitStatus::Signaled(Signal::SIGTERM).success());
    }

    #[tokio::test]
    async fn test_wait_collects_exit_code() {
        let table = shared_table();
        let waiter = spawn_sh(&table, "exit 7");
        assert_eq!(waiter.wait().await.unwrap(), ExitStatus::Exited(7));
    }

    #[tokio::test]
    async fn test_instant_exit_is_not_lost() {
        let table = shared_table();
        let slot = table.begin_spawn();
        let child = std::process::Command::new("/bin/true").spawn().unwrap();
        // give the child time to exit while the slot is still held
        std::thread::sleep(Duration::from_millis(50));
        let waiter = slot.register(child.id());

        assert_eq!(waiter.wait().await.unwrap(), ExitStatus::Exited(0));
    }

    #[tokio::test]
    async fn test_signaled_child() {
        let table = shared_table();
        let waiter = spawn_sh(&table, "kill -9 $$");
        assert_eq!(
            waiter.wait().await.unwrap(),
            ExitStatus::Signaled(Signal::SIGKILL)
        );
    }

    #[test]
    fn test_abandoned_slot_releases_lock() {
        let table = shared_table();
        {
            let slot = table.begin_spawn();
            let spawned: std::io::Result<ProcessId> =
                Err(std::io::Error::from(std::io::ErrorKind::NotFound));
            if let Ok(pid) = spawned {
                slot.register(pid);
            }
        }
        // would deadlock if the abandoned slot still held the lock
        drop(table.begin_spawn());
    }

    #[tokio::test]
    async fn test_concurrent_children_reaped_once() {
        let table = shared_table();
        let mut waits = Vec::new();
        for code in 0..32 {
            let waiter = spawn_sh(&table, &format!("exit {code}"));
            waits.push(tokio::spawn(async move { (code, waiter.wait().await) }));
        }

        for wait in waits {
            let (code, status) = wait.await.unwrap();
            assert_eq!(status.unwrap(), ExitStatus::Exited(code));
        }
    }

    #[tokio::test]
    async fn test_entry_dropped_when_reaped() {
        let table = shared_table();
        let waiter = spawn_sh(&table, "sleep 0.2");
        let pid = waiter.pid();
        assert!(table.is_registered(pid));

        assert_eq!(waiter.wait().await.unwrap(), ExitStatus::Exited(0));
        // the status is only sent after the entry is gone
        assert!(!table.is_registered(pid));
    }

    #[tokio::test]
    async fn test_unregistered_child_does_not_disturb_waiters() {
        let table = shared_table();
        let stray = std::process::Command::new("/bin/sh")
            .args(["-c", "exit 9"])
            .spawn()
            .unwrap();
        let waiter = spawn_sh(&table, "sleep 0.1; exit 4");

        assert_eq!(waiter.wait().await.unwrap(), ExitStatus::Exited(4));
        assert!(!table.is_registered(stray.id()));
    }

    #[test]
    fn test_second_table_is_refused() {
        let _table = shared_table();
        assert!(matches!(
            PidTable::new(&EngineConfig::default()),
            Err(PmError::Configuration(_))
        ));
    }
}
