//! Spawning and supervision of child processes on POSIX systems.
//!
//! The [`Popen`] type starts a program with `fork` and `exec`, with each of
//! its standard streams inherited, connected to a pipe, merged into the
//! other output stream, or redirected to an open file.  The parent can then
//! poll, wait, or wait with a timeout for the child to finish, obtaining a
//! structured [`ExitStatus`].
//!
//! The [`Exec`] builder offers a more convenient interface for the common
//! cases, such as capturing the output of a command:
//!
//! ```
//! # use posix_popen::*;
//! # fn dummy() -> Result<()> {
//! let out = Exec::cmd("echo").arg("yolo").capture()?.stdout_str();
//! assert_eq!(out, "yolo\n");
//! # Ok(())
//! # }
//! ```
//!
//! Work between `fork` and `exec` never allocates: everything the child
//! needs, down to the buffer used to search `PATH`, is prepared beforehand.
//! Failures in the child, including a failed `exec`, are reported to the
//! parent through an internal pipe and returned from [`Popen::create`].
//!
//! The crate logs through the [`log`] facade and never installs a logger.

#![cfg(unix)]
#![warn(missing_debug_implementations, rust_2018_idioms)]

mod builder;
mod child_state;
mod communicate;
mod os_common;
mod popen;
mod posix;
mod prep_exec;
mod redirection;

#[cfg(test)]
mod tests;

pub use builder::{CaptureData, Exec, InputRedirection, NullFile, OutputRedirection};
pub use child_state::ChildState;
pub use communicate::Communicator;
pub use os_common::ExitStatus;
pub use popen::{make_pipe, Popen, PopenConfig, PopenError, Result};
pub use redirection::{FileDescriptor, Redirection, DEFAULT_MODE};
