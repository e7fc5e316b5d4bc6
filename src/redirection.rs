use std::fmt;
use std::fs::File;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::Path;

use crate::popen::Result;
use crate::posix;

/// Permission bits for files created by [`Redirection::write`] and
/// [`Redirection::append`], before the umask is applied.
pub const DEFAULT_MODE: u32 = 0o666;

/// An already-open descriptor to become one of the child's standard streams.
///
/// A `FileDescriptor` either owns its descriptor, in which case dropping it
/// closes the descriptor, or is a non-owning alias of a descriptor owned by
/// someone else.  Moving a `FileDescriptor` moves the ownership with it;
/// cloning one always produces an alias, so a descriptor is closed at most
/// once no matter how many copies of the redirection exist.
pub struct FileDescriptor {
    fd: RawFd,
    owned: bool,
}

impl FileDescriptor {
    /// Create a non-owning alias of `fd`.
    ///
    /// # Safety
    ///
    /// `fd` must remain open, and must not be reused for a different file,
    /// for as long as the alias (or any redirection built from it) is used
    /// to start a process.
    pub unsafe fn borrow_raw(fd: RawFd) -> FileDescriptor {
        FileDescriptor { fd, owned: false }
    }

    /// True if dropping this value closes the descriptor.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Take ownership of the descriptor out of `self`, if `self` owns it.
    pub(crate) fn into_owned_fd(mut self) -> Option<OwnedFd> {
        if !mem::replace(&mut self.owned, false) {
            return None;
        }
        Some(unsafe { OwnedFd::from_raw_fd(self.fd) })
    }
}

impl AsRawFd for FileDescriptor {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl FromRawFd for FileDescriptor {
    /// Take ownership of `fd`.
    unsafe fn from_raw_fd(fd: RawFd) -> FileDescriptor {
        FileDescriptor { fd, owned: true }
    }
}

impl From<OwnedFd> for FileDescriptor {
    fn from(fd: OwnedFd) -> FileDescriptor {
        FileDescriptor {
            fd: fd.into_raw_fd(),
            owned: true,
        }
    }
}

impl From<File> for FileDescriptor {
    fn from(f: File) -> FileDescriptor {
        FileDescriptor::from(OwnedFd::from(f))
    }
}

impl Clone for FileDescriptor {
    /// Returns a non-owning alias of the same descriptor.
    fn clone(&self) -> FileDescriptor {
        FileDescriptor {
            fd: self.fd,
            owned: false,
        }
    }
}

impl Drop for FileDescriptor {
    fn drop(&mut self) {
        if self.owned {
            drop(unsafe { OwnedFd::from_raw_fd(self.fd) });
        }
    }
}

impl fmt::Debug for FileDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileDescriptor")
            .field("fd", &self.fd)
            .field("owned", &self.owned)
            .finish()
    }
}

/// Instruction what to do with a stream in the child process.
///
/// `Redirection` values are used for the `stdin`, `stdout`, and `stderr`
/// fields of [`PopenConfig`](crate::PopenConfig).
#[derive(Debug, Clone, Default)]
pub enum Redirection {
    /// Do nothing with the stream.
    ///
    /// The stream is inherited from the parent.  The corresponding stream
    /// field in `Popen` will be `None`.
    #[default]
    None,

    /// Redirect the stream to a pipe.
    ///
    /// This variant requests that a stream be redirected to a unidirectional
    /// pipe.  One end of the pipe is passed to the child process and
    /// configured as one of its standard streams, and the other end is
    /// available to the parent as the corresponding stream field of `Popen`.
    Pipe,

    /// Merge the stream to the other output stream.
    ///
    /// This variant is only valid when configuring redirection of standard
    /// output and standard error.  Using `Redirection::Merge` for stderr
    /// requests the child's stderr to refer to the same underlying file as
    /// the child's stdout (which may or may not itself be redirected),
    /// equivalent to the `2>&1` operator of the Bourne shell.  Analogously,
    /// using `Redirection::Merge` for stdout is equivalent to `1>&2`.
    ///
    /// Specifying `Redirection::Merge` for stdin, or for both stdout and
    /// stderr, makes `Popen::create` fail with `PopenError::LogicError`.
    Merge,

    /// Redirect the stream to the specified open descriptor.
    ///
    /// This does not create a pipe, it simply spawns the child so that the
    /// specified stream sees that file.  The child reads from or writes to
    /// the descriptor on its own, without any intervention by the parent.
    /// [`Redirection::read`], [`Redirection::write`] and
    /// [`Redirection::append`] open a path for this purpose.
    FileDescriptor(FileDescriptor),
}

impl Redirection {
    /// Open `path` with `open(2)` flags and creation mode, and redirect the
    /// stream to the resulting descriptor.
    pub fn open(path: impl AsRef<Path>, flags: i32, mode: u32) -> Result<Redirection> {
        let file = posix::open(path.as_ref().as_os_str(), flags, mode)?;
        Ok(Redirection::from(file))
    }

    /// Redirect the stream to read from `path`.
    ///
    /// The file is opened immediately, but nothing is read from it.
    pub fn read(path: impl AsRef<Path>) -> Result<Redirection> {
        Redirection::open(path, libc::O_RDONLY, 0)
    }

    /// Redirect the stream to write to `path`, creating it if needed and
    /// truncating it otherwise.
    pub fn write(path: impl AsRef<Path>) -> Result<Redirection> {
        Redirection::open(
            path,
            libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC,
            DEFAULT_MODE,
        )
    }

    /// Redirect the stream to append to `path`, creating it if needed.
    pub fn append(path: impl AsRef<Path>) -> Result<Redirection> {
        Redirection::open(
            path,
            libc::O_WRONLY | libc::O_CREAT | libc::O_APPEND,
            DEFAULT_MODE,
        )
    }
}

impl From<File> for Redirection {
    fn from(f: File) -> Redirection {
        Redirection::FileDescriptor(FileDescriptor::from(f))
    }
}

impl From<FileDescriptor> for Redirection {
    fn from(fd: FileDescriptor) -> Redirection {
        Redirection::FileDescriptor(fd)
    }
}
