//! Everything `exec` needs, allocated before `fork`.
//!
//! After `fork()` in a multi-threaded program the child may only call
//! async-signal-safe functions, and `malloc` is not one of them: another
//! thread could have held the allocator lock at the moment of the fork.
//! `PrepExec` therefore owns the C argument and environment vectors, the
//! captured `PATH`, and a scratch buffer large enough for the longest
//! candidate executable path, so that [`PrepExec::exec`] only copies bytes
//! and issues syscalls.

use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::io::{Error, Result};
use std::os::unix::ffi::OsStringExt;
use std::ptr;

use crate::posix;

/// Null-terminated array of pointers to C strings, as taken by `execve`.
#[derive(Debug)]
pub(crate) struct CVec {
    // Not read directly, but pointed to by the elements of `ptrs`.
    #[allow(dead_code)]
    strings: Vec<CString>,

    // `strings.len()` pointers into `strings`, followed by a null pointer.
    ptrs: Vec<*const libc::c_char>,
}

impl CVec {
    pub fn new<S: AsRef<OsStr>>(slice: &[S]) -> Result<CVec> {
        let strings = slice
            .iter()
            .map(|s| posix::os_to_cstring(s.as_ref()))
            .collect::<Result<Vec<CString>>>()?;
        let ptrs = strings
            .iter()
            .map(|s| s.as_ptr())
            .chain(std::iter::once(ptr::null()))
            .collect();
        Ok(CVec { strings, ptrs })
    }

    pub fn as_c_vec(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }

    /// Number of strings, not counting the terminating null pointer.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.ptrs.len() - 1
    }
}

/// A prepared `exec` call.
#[derive(Debug)]
pub(crate) struct PrepExec {
    cmd: Vec<u8>,
    argv: CVec,
    envp: Option<CVec>,
    // PATH captured from the parent; `None` when `cmd` contains a slash
    search_path: Option<Vec<u8>>,
    // room for "<longest PATH dir>/<cmd>\0"
    exe: Vec<u8>,
}

impl PrepExec {
    /// Prepare to exec `cmd` with the given argument vector and, if
    /// provided, the given `KEY=VALUE` environment.
    ///
    /// Fails with `EINVAL` if any string contains a NUL byte.
    pub fn new<S: AsRef<OsStr>>(
        cmd: &OsStr,
        args: &[S],
        env_vars: Option<&[OsString]>,
    ) -> Result<PrepExec> {
        PrepExec::with_search_path(cmd, args, env_vars, env::var_os("PATH"))
    }

    pub(crate) fn with_search_path<S: AsRef<OsStr>>(
        cmd: &OsStr,
        args: &[S],
        env_vars: Option<&[OsString]>,
        path: Option<OsString>,
    ) -> Result<PrepExec> {
        let cmd = posix::os_to_cstring(cmd)?.into_bytes();
        let argv = CVec::new(args)?;
        let envp = env_vars.map(CVec::new).transpose()?;

        let search_path = if cmd.contains(&b'/') {
            None
        } else {
            path.map(OsString::into_vec)
        };
        // An empty PATH entry stands for the current directory and is
        // expanded to ".", hence the minimum of one byte.
        let longest_dir = search_path
            .as_deref()
            .and_then(|p| p.split(|&b| b == b':').map(|d| d.len().max(1)).max())
            .unwrap_or(0);
        let exe = vec![0u8; longest_dir + 1 + cmd.len() + 1];

        Ok(PrepExec {
            cmd,
            argv,
            envp,
            search_path,
            exe,
        })
    }

    /// Size of the preallocated executable path buffer.
    #[cfg(test)]
    pub(crate) fn exe_capacity(&self) -> usize {
        self.exe.len()
    }

    /// Replace the current process image.
    ///
    /// Returns only on failure, with the errno of the last attempted
    /// `execve`/`execv`.  Performs no heap allocation, so it is safe to call
    /// in the child between `fork` and `exec`.
    pub fn exec(&mut self) -> i32 {
        let PrepExec {
            cmd,
            argv,
            envp,
            search_path,
            exe,
        } = self;

        let Some(search_path) = search_path.as_deref() else {
            exe[..cmd.len()].copy_from_slice(&cmd[..]);
            exe[cmd.len()] = 0;
            return libc_exec(exe, argv, envp.as_ref());
        };

        // POSIX has execvp, but no variant that both searches PATH and takes
        // an environment, so the search is done here.
        let mut errno = libc::ENOENT;
        for dir in search_path.split(|&b| b == b':') {
            let dir: &[u8] = if dir.is_empty() { b"." } else { dir };
            let mut len = 0;
            for part in [dir, &b"/"[..], &cmd[..]] {
                exe[len..len + part.len()].copy_from_slice(part);
                len += part.len();
            }
            exe[len] = 0;
            errno = libc_exec(exe, argv, envp.as_ref());
        }
        errno
    }
}

fn libc_exec(exe: &[u8], argv: &CVec, envp: Option<&CVec>) -> i32 {
    let exe = exe.as_ptr() as *const libc::c_char;
    unsafe {
        match envp {
            Some(envp) => libc::execve(exe, argv.as_c_vec(), envp.as_c_vec()),
            None => libc::execv(exe, argv.as_c_vec()),
        };
    }
    Error::last_os_error().raw_os_error().unwrap_or(libc::ENOENT)
}
