//! clone(2) + execve(2) with namespace flags, a new session and fixed fds.
//!
//! Everything the child needs is prepared in the parent. Between clone and
//! exec the child only issues raw syscalls: the parent is multi-threaded and
//! the allocator may be locked in the child's copy of memory.

use crate::namespace::NamespaceSet;
use nix::fcntl::OFlag;
use nix::sched::clone;
use nix::unistd::{AccessFlags, access, pipe2};
use nodepm_core::ProcessId;
use std::ffi::{CString, c_char, c_int};
use std::fs::File;
use std::io::{self, Read};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::path::Path;
use std::ptr;

/// Lowest descriptor used while shuffling fds into place in the child
const SCRATCH_FD: c_int = 10;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Descriptors installed as 0..=4 in the child
pub(crate) struct ChildFds<'a> {
    pub stdin: BorrowedFd<'a>,
    pub stdout: BorrowedFd<'a>,
    pub stderr: BorrowedFd<'a>,
    /// fd 3: the child reads what the supervisor writes
    pub control_read: BorrowedFd<'a>,
    /// fd 4: the child writes what the supervisor reads
    pub control_write: BorrowedFd<'a>,
}

impl ChildFds<'_> {
    fn raw(&self) -> [RawFd; 5] {
        [
            self.stdin.as_raw_fd(),
            self.stdout.as_raw_fd(),
            self.stderr.as_raw_fd(),
            self.control_read.as_raw_fd(),
            self.control_write.as_raw_fd(),
        ]
    }
}

/// Everything exec needs, as C strings
pub(crate) struct ChildSpec {
    program: CString,
    argv: Vec<CString>,
    envp: Vec<CString>,
    dir: Option<CString>,
    chroot: Option<CString>,
    namespaces: NamespaceSet,
}

impl ChildSpec {
    /// `argv[0]` is `program` as given; the remaining arguments follow.
    pub fn new(
        program: &str,
        args: &[String],
        env: &[String],
        dir: &str,
        chroot: &str,
        namespaces: NamespaceSet,
    ) -> io::Result<Self> {
        let argv = std::iter::once(program)
            .chain(args.iter().map(String::as_str))
            .map(c_string)
            .collect::<io::Result<Vec<_>>>()?;
        let envp = env
            .iter()
            .map(|e| c_string(e))
            .collect::<io::Result<Vec<_>>>()?;

        Ok(Self {
            program: c_string(program)?,
            argv,
            envp,
            dir: non_empty(dir)?,
            chroot: non_empty(chroot)?,
            namespaces,
        })
    }
}

fn c_string(s: &str) -> io::Result<CString> {
    CString::new(s).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn non_empty(s: &str) -> io::Result<Option<CString>> {
    if s.is_empty() {
        Ok(None)
    } else {
        c_string(s).map(Some)
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Resolve a program name against `PATH` the way a shell would.
pub(crate) fn resolve_program(program: &str, path: Option<&str>) -> io::Result<String> {
    if program.is_empty() || program.contains('/') {
        return Ok(program.to_string());
    }

    for entry in path.unwrap_or(DEFAULT_PATH).split(':') {
        let dir = if entry.is_empty() { "." } else { entry };
        let candidate = Path::new(dir).join(program);
        if access(&candidate, AccessFlags::X_OK).is_ok() {
            return Ok(candidate.to_string_lossy().into_owned());
        }
    }

    Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("executable file not found in PATH: {program}"),
    ))
}

/// Create the child. Returns once the child has successfully exec'd, or
/// with the errno of the step that failed in the child.
///
/// A child that fails before exec exits with status 127; the caller must not
/// register it.
pub(crate) fn spawn(spec: &ChildSpec, fds: &ChildFds<'_>, stack_size: usize) -> io::Result<ProcessId> {
    let argv = null_terminated(&spec.argv);
    let envp = null_terminated(&spec.envp);
    let raw_fds = fds.raw();

    let (err_read, err_write) = pipe2(OFlag::O_CLOEXEC)?;
    let err_fd = err_write.as_raw_fd();

    let mut stack = vec![0u8; stack_size];
    let child = Box::new(|| {
        // SAFETY: runs in the freshly cloned child, which only performs
        // async-signal-safe syscalls on memory prepared by the parent.
        unsafe { child_main(spec, &argv, &envp, &raw_fds, err_fd) }
    });

    // SAFETY: without CLONE_VM the child runs on its own copy of `stack`
    // and never returns into the parent's frames: it execs or _exits.
    let pid = unsafe {
        clone(
            child,
            &mut stack,
            spec.namespaces.to_clone_flags(),
            Some(libc::SIGCHLD),
        )
    }?;

    drop(err_write);
    let mut errno = [0u8; 4];
    match File::from(err_read).read_exact(&mut errno) {
        Ok(()) => Err(io::Error::from_raw_os_error(i32::from_ne_bytes(errno))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(pid.as_raw() as ProcessId),
        Err(e) => Err(e),
    }
}

unsafe fn child_main(
    spec: &ChildSpec,
    argv: &[*const c_char],
    envp: &[*const c_char],
    fds: &[RawFd; 5],
    err_fd: RawFd,
) -> isize {
    unsafe {
        // the error pipe may sit on one of the target numbers: move it first
        let err_fd = libc::fcntl(err_fd, libc::F_DUPFD_CLOEXEC, SCRATCH_FD);
        if err_fd < 0 {
            libc::_exit(127);
        }

        if libc::setsid() < 0 {
            fail(err_fd);
        }

        let mut moved = [-1 as c_int; 5];
        for (slot, fd) in moved.iter_mut().zip(fds.iter()) {
            *slot = libc::fcntl(*fd, libc::F_DUPFD_CLOEXEC, SCRATCH_FD);
            if *slot < 0 {
                fail(err_fd);
            }
        }
        for (target, fd) in moved.iter().enumerate() {
            if libc::dup2(*fd, target as c_int) < 0 {
                fail(err_fd);
            }
        }

        if let Some(root) = &spec.chroot {
            if libc::chroot(root.as_ptr()) < 0 {
                fail(err_fd);
            }
            if spec.dir.is_none() && libc::chdir(c"/".as_ptr()) < 0 {
                fail(err_fd);
            }
        }

        if let Some(dir) = &spec.dir {
            if libc::chdir(dir.as_ptr()) < 0 {
                fail(err_fd);
            }
        }

        libc::execve(spec.program.as_ptr(), argv.as_ptr(), envp.as_ptr());
        fail(err_fd)
    }
}

/// Report errno to the parent and terminate the child.
unsafe fn fail(err_fd: c_int) -> ! {
    unsafe {
        let errno = *libc::__errno_location();
        let bytes = errno.to_ne_bytes();
        libc::write(err_fd, bytes.as_ptr().cast(), bytes.len());
        libc::_exit(127)
    }
}
