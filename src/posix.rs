//! Thin wrappers over the libc calls used to create and supervise children.
//!
//! Everything reachable from the forked child (`dup2`, `set_inheritable`,
//! `reset_signals`, `chdir`, `setgid`, `setuid`, `setpgid`, `_exit`) is a
//! direct syscall wrapper that neither allocates nor takes locks.

use std::ffi::{CStr, CString, OsStr};
use std::fs::File;
use std::io::{Error, Result};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::os_common::ExitStatus;

pub use libc::{ECHILD, EINTR};

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

/// Create a pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec.
#[cfg(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) })?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    let (read, write) = unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) };
    set_inheritable(read.as_raw_fd(), false)?;
    set_inheritable(write.as_raw_fd(), false)?;
    Ok((read, write))
}

/// The two sides of a successful `fork()`.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Fork {
    Parent { child_pid: u32 },
    Child,
}

/// Fork the current process.
///
/// # Safety
///
/// In a multi-threaded parent, the `Fork::Child` side may only perform
/// async-signal-safe operations and must end in `exec` or [`_exit`].
pub unsafe fn fork() -> Result<Fork> {
    let pid = check_err(unsafe { libc::fork() })?;
    Ok(if pid == 0 {
        Fork::Child
    } else {
        Fork::Parent {
            child_pid: pid as u32,
        }
    })
}

pub fn os_to_cstring(s: &OsStr) -> Result<CString> {
    // Unix strings are C strings as long as they contain no NUL.
    CString::new(s.as_bytes()).map_err(|_| Error::from_raw_os_error(libc::EINVAL))
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub const WNOHANG: i32 = libc::WNOHANG;

pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, ExitStatus)> {
    let mut status = 0 as libc::c_int;
    let pid = check_err(unsafe {
        libc::waitpid(
            pid as libc::pid_t,
            &mut status as *mut libc::c_int,
            flags as libc::c_int,
        )
    })?;
    Ok((pid as u32, decode_exit_status(status)))
}

pub fn decode_exit_status(status: i32) -> ExitStatus {
    if libc::WIFEXITED(status) {
        ExitStatus::Exited(libc::WEXITSTATUS(status) as u32)
    } else if libc::WIFSIGNALED(status) {
        ExitStatus::Signaled(libc::WTERMSIG(status) as u8)
    } else {
        ExitStatus::Other(status)
    }
}

pub fn set_inheritable(fd: RawFd, inheritable: bool) -> Result<()> {
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    let new = if inheritable {
        old & !libc::FD_CLOEXEC
    } else {
        old | libc::FD_CLOEXEC
    };
    if new != old {
        check_err(unsafe { libc::fcntl(fd, libc::F_SETFD, new) })?;
    }
    Ok(())
}

/// Duplicate `fd` onto the lowest free descriptor not below `min`.  The
/// copy is close-on-exec.
pub fn dup_above(fd: RawFd, min: RawFd) -> Result<OwnedFd> {
    let new = check_err(unsafe { libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, min) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(new) })
}

#[cfg(test)]
pub fn is_inheritable(fd: RawFd) -> Result<bool> {
    let flags = check_err(unsafe { libc::fcntl(fd, libc::F_GETFD) })?;
    Ok(flags & libc::FD_CLOEXEC == 0)
}

pub fn set_nonblocking(f: &File) -> Result<()> {
    let fd = f.as_raw_fd();
    let old = check_err(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    check_err(unsafe { libc::fcntl(fd, libc::F_SETFL, old | libc::O_NONBLOCK) })?;
    Ok(())
}

pub fn dup2(oldfd: RawFd, newfd: RawFd) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

pub fn open(path: &OsStr, flags: i32, mode: u32) -> Result<File> {
    let path = os_to_cstring(path)?;
    let fd = check_err(unsafe {
        libc::open(
            path.as_ptr(),
            flags | libc::O_CLOEXEC,
            mode as libc::c_uint,
        )
    })?;
    Ok(unsafe { File::from_raw_fd(fd) })
}

pub fn chdir(dir: &CStr) -> Result<()> {
    check_err(unsafe { libc::chdir(dir.as_ptr()) })?;
    Ok(())
}

pub fn setuid(uid: u32) -> Result<()> {
    check_err(unsafe { libc::setuid(uid as libc::uid_t) })?;
    Ok(())
}

pub fn setgid(gid: u32) -> Result<()> {
    check_err(unsafe { libc::setgid(gid as libc::gid_t) })?;
    Ok(())
}

pub fn setpgid(pid: u32, pgid: u32) -> Result<()> {
    check_err(unsafe { libc::setpgid(pid as libc::pid_t, pgid as libc::pid_t) })?;
    Ok(())
}

/// Unblock all signals and restore the default SIGPIPE disposition.
///
/// Called in the child after fork.  The Rust runtime ignores SIGPIPE and
/// signal-handling libraries often set a mask; both are inherited across
/// exec, and most Unix programs expect neither.
pub fn reset_signals() -> Result<()> {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        let rc = libc::pthread_sigmask(libc::SIG_SETMASK, set.as_ptr(), ptr::null_mut());
        if rc != 0 {
            // pthread_* functions return the error instead of setting errno
            return Err(Error::from_raw_os_error(rc));
        }
        if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}

#[repr(transparent)]
pub struct PollFd<'a>(libc::pollfd, PhantomData<&'a File>);

impl PollFd<'_> {
    pub fn new(f: Option<&File>, events: i16) -> PollFd<'_> {
        PollFd(
            libc::pollfd {
                fd: f.map(File::as_raw_fd).unwrap_or(-1),
                events,
                revents: 0,
            },
            PhantomData,
        )
    }

    pub fn test(&self, mask: i16) -> bool {
        self.0.revents & mask != 0
    }
}

pub use libc::{POLLERR, POLLHUP, POLLIN, POLLOUT};

pub fn poll(fds: &mut [PollFd<'_>], timeout: Option<Duration>) -> Result<usize> {
    let timeout = timeout
        .map(|t| t.as_millis().min(i32::MAX as u128) as i32)
        .unwrap_or(-1);
    let cnt = check_err(unsafe {
        libc::poll(
            fds.as_mut_ptr() as *mut libc::pollfd,
            fds.len() as libc::nfds_t,
            timeout,
        )
    })?;
    Ok(cnt as usize)
}
