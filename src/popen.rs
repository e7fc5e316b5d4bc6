use std::cmp::min;
use std::collections::HashSet;
use std::env;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use thiserror::Error;

use crate::child_state::ChildState;
use crate::communicate::Communicator;
use crate::os_common::{ExitStatus, StandardStream};
use crate::posix::{self, Fork};
use crate::prep_exec::PrepExec;
use crate::redirection::Redirection;

/// Exit code of a child that failed to set itself up or to exec.
const EXEC_FAILED_EXIT_CODE: u8 = 127;

/// Upper bound of the sleep between two `waitpid` attempts in `wait_timeout`.
const MAX_POLL_DELAY: Duration = Duration::from_millis(100);

const LAST_STD_FD: RawFd = 2;

/// Interface to a running subprocess.
///
/// `Popen` is the parent's handle to the child process.  The child's standard
/// streams redirected to [`Redirection::Pipe`] are available as the `stdin`,
/// `stdout` and `stderr` fields.  Use them as any `File`: write to `stdin`,
/// read `stdout` to the end or through a `BufReader`, and close a stream
/// early by `take()`-ing and dropping it.
///
/// The lifecycle of the child is tracked as a [`ChildState`], which is only
/// updated by [`wait`], [`wait_timeout`] and [`poll`].  Those take
/// `&mut self`: a `Popen` shared between threads must be behind a lock.
///
/// When a `Popen` is dropped while its child is running, it closes its ends
/// of the pipes and then waits for the child to exit, unless it was
/// [`detach`]ed.
///
/// [`wait`]: Popen::wait
/// [`wait_timeout`]: Popen::wait_timeout
/// [`poll`]: Popen::poll
/// [`detach`]: Popen::detach
#[derive(Debug)]
pub struct Popen {
    /// If `stdin` was redirected to `Redirection::Pipe`, this is the write
    /// end of that pipe.
    pub stdin: Option<File>,

    /// If `stdout` was redirected to `Redirection::Pipe`, this is the read
    /// end of that pipe.
    pub stdout: Option<File>,

    /// If `stderr` was redirected to `Redirection::Pipe`, this is the read
    /// end of that pipe.
    pub stderr: Option<File>,

    state: ChildState,
    detached: bool,
}

/// Options for [`Popen::create`].
///
/// When constructing `PopenConfig`, always use the `Default` trait, such as:
///
/// ```
/// # use posix_popen::*;
/// # let argv = &["true"];
/// Popen::create(argv, PopenConfig {
///      stdout: Redirection::Pipe,
///      detached: true,
///      // ... other fields you want to override ...
///      ..Default::default()
/// })
/// # .unwrap();
/// ```
///
/// Cloning a config yields non-owning aliases of its
/// `Redirection::FileDescriptor` descriptors.
#[derive(Debug, Clone, Default)]
pub struct PopenConfig {
    /// How to configure the executed program's standard input.
    pub stdin: Redirection,
    /// How to configure the executed program's standard output.
    pub stdout: Redirection,
    /// How to configure the executed program's standard error.
    pub stderr: Redirection,
    /// Whether the `Popen` instance is initially detached.
    pub detached: bool,

    /// Executable to run.
    ///
    /// If provided, this executable will be used to run the program instead
    /// of `argv[0]`.  However, `argv[0]` will still be passed to the
    /// subprocess, which will see that as `argv[0]`.
    pub executable: Option<OsString>,

    /// Environment variables to pass to the subprocess.
    ///
    /// If this is `None`, environment variables are inherited from the
    /// calling process.  Otherwise, the specified variables are used instead.
    ///
    /// Duplicates are eliminated, with the value taken from the variable
    /// appearing later in the vector.
    pub env: Option<Vec<(OsString, OsString)>>,

    /// Initial current working directory of the subprocess.
    ///
    /// `None` means inherit the working directory from the parent.
    pub cwd: Option<OsString>,

    /// Set user ID for the subprocess.
    ///
    /// If specified, calls `setuid()` before execing the child process.
    pub setuid: Option<u32>,

    /// Set group ID for the subprocess.
    ///
    /// If specified, calls `setgid()` before execing the child process.
    pub setgid: Option<u32>,

    /// Make the subprocess the leader of a new process group.
    ///
    /// If true, calls `setpgid(0, 0)` before execing the child process.
    pub setpgid: bool,
}

impl PopenConfig {
    /// Returns the environment of the current process.
    ///
    /// The returned value is in the format accepted by the `env` member of
    /// `PopenConfig`.
    pub fn current_env() -> Vec<(OsString, OsString)> {
        env::vars_os().collect()
    }
}

/// Error in [`Popen`] calls.
#[derive(Debug, Error)]
pub enum PopenError {
    /// An operating system call failed.
    #[error("{0}")]
    IoError(#[from] io::Error),

    /// The API was misused, or the child broke the exec-status protocol.
    #[error("{0}")]
    LogicError(&'static str),
}

impl From<PopenError> for io::Error {
    fn from(err: PopenError) -> io::Error {
        match err {
            PopenError::IoError(err) => err,
            PopenError::LogicError(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
        }
    }
}

/// Result returned by calls in the `posix_popen` crate.
pub type Result<T> = std::result::Result<T, PopenError>;

#[derive(Debug, Eq, PartialEq, Copy, Clone)]
enum MergeKind {
    ErrToOut, // 2>&1
    OutToErr, // 1>&2
    None,
}

/// Descriptors the child installs as its fds 0, 1 and 2.
struct ChildEnds {
    // None leaves the slot as inherited from the parent.
    fds: [Option<RawFd>; 3],
    // Descriptors opened or taken over for the child; the parent closes them
    // by dropping this value once the child is forked.
    #[allow(dead_code)]
    held: Vec<OwnedFd>,
}

/// Requests applied by the child between `fork` and `exec`.
struct ChildOptions {
    cwd: Option<CString>,
    setuid: Option<u32>,
    setgid: Option<u32>,
    setpgid: bool,
}

impl Popen {
    /// Execute an external program in a new process.
    ///
    /// `argv` is a slice containing the program followed by its arguments,
    /// such as `&["ps", "x"]`.  `config` specifies details how to create and
    /// interface to the process.
    ///
    /// For example, this launches the `cargo update` command:
    ///
    /// ```no_run
    /// # use posix_popen::*;
    /// # fn dummy() -> Result<()> {
    /// Popen::create(&["cargo", "update"], PopenConfig::default())?;
    /// # Ok(())
    /// # }
    /// ```
    ///
    /// # Errors
    ///
    /// If the external program cannot be executed for any reason, an error
    /// is returned.  The most typical reason for execution to fail is that
    /// the program is missing on the `PATH`, but other errors are also
    /// possible.  Note that this is distinct from the program running and
    /// then exiting with a failure code - this can be detected by calling
    /// the `wait` method to obtain its exit status.
    ///
    /// An empty `argv`, or `Redirection::Merge` used for stdin or for both
    /// stdout and stderr, fails with `PopenError::LogicError` before any
    /// resource is allocated.
    pub fn create(argv: &[impl AsRef<OsStr>], config: PopenConfig) -> Result<Popen> {
        if argv.is_empty() {
            return Err(PopenError::LogicError("argv must not be empty"));
        }
        let merge = check_redirections(&config.stdin, &config.stdout, &config.stderr)?;
        let mut inst = Popen {
            stdin: None,
            stdout: None,
            stderr: None,
            state: ChildState::Preparing,
            detached: config.detached,
        };
        inst.os_start(argv, config, merge)?;
        Ok(inst)
    }

    fn os_start(
        &mut self,
        argv: &[impl AsRef<OsStr>],
        config: PopenConfig,
        merge: MergeKind,
    ) -> Result<()> {
        let PopenConfig {
            stdin,
            stdout,
            stderr,
            executable,
            env,
            cwd,
            setuid,
            setgid,
            setpgid,
            ..
        } = config;

        let cmd = executable.as_deref().unwrap_or(argv[0].as_ref());
        let child_env = env.as_deref().map(format_env);
        let mut just_exec = PrepExec::new(cmd, argv, child_env.as_deref())?;
        let options = ChildOptions {
            cwd: cwd.as_deref().map(posix::os_to_cstring).transpose()?,
            setuid,
            setgid,
            setpgid,
        };

        // Both ends are close-on-exec, so a successful exec closes the write
        // end and the parent reads EOF.
        let (mut exec_fail_read, mut exec_fail_write) = posix::pipe()?;
        if exec_fail_write.as_raw_fd() <= LAST_STD_FD {
            // Keep it clear of the slots the child redirects.
            let moved = posix::dup_above(exec_fail_write.as_raw_fd(), LAST_STD_FD + 1)?;
            exec_fail_write = File::from(moved);
        }
        let child_ends = self.setup_streams(stdin, stdout, stderr, merge)?;

        match unsafe { posix::fork()? } {
            Fork::Child => {
                drop(exec_fail_read);
                let errno = exec_child(&mut just_exec, &child_ends.fds, &options);
                exec_fail_write.write_all(&errno.to_le_bytes()).ok();
                posix::_exit(EXEC_FAILED_EXIT_CODE);
            }
            Fork::Parent { child_pid } => self.state.start(child_pid),
        }

        // Close the parent's copies of the child's descriptors before
        // blocking on the exec-failure pipe.
        drop(child_ends);
        drop(exec_fail_write);

        self.finish_start(&mut exec_fail_read)?;
        debug!("spawned {:?} as pid {}", argv[0].as_ref(), self.pid().unwrap_or(0));
        Ok(())
    }

    // Wait for the child to exec.  On failure the child is reaped before
    // returning, detached or not.
    fn finish_start(&mut self, exec_fail_read: &mut File) -> Result<()> {
        match read_exec_failure(exec_fail_read) {
            Ok(None) => Ok(()),
            Ok(Some(errno)) => {
                // The child has already called _exit(); reap it right away.
                self.reap_failed_start();
                Err(PopenError::IoError(io::Error::from_raw_os_error(errno)))
            }
            Err(e) => {
                self.reap_failed_start();
                Err(e)
            }
        }
    }

    fn reap_failed_start(&mut self) {
        let pid = self.pid().unwrap_or(0);
        if let Err(e) = self.wait() {
            warn!("failed to reap pid {} after failed start: {}", pid, e);
        }
    }

    // Create the pipes requested by the redirections and return the
    // descriptors to be given to the child process.
    //
    // For Redirection::Pipe, this stores the parent end of the pipe to the
    // appropriate self.std* field, and returns the child end of the pipe.
    fn setup_streams(
        &mut self,
        stdin: Redirection,
        stdout: Redirection,
        stderr: Redirection,
        merge: MergeKind,
    ) -> Result<ChildEnds> {
        let mut ends = ChildEnds {
            fds: [None; 3],
            held: Vec::new(),
        };

        for (which, redirection) in [
            (StandardStream::Input, stdin),
            (StandardStream::Output, stdout),
            (StandardStream::Error, stderr),
        ] {
            let slot = which.slot() as usize;
            match redirection {
                Redirection::Pipe => {
                    let (parent_end, child_end) = prepare_pipe(which == StandardStream::Input)?;
                    ends.fds[slot] = Some(child_end.as_raw_fd());
                    ends.held.push(child_end);
                    *self.parent_end_mut(which) = Some(parent_end);
                }
                Redirection::FileDescriptor(fd) => {
                    ends.fds[slot] = Some(fd.as_raw_fd());
                    ends.held.extend(fd.into_owned_fd());
                }
                // Merge is resolved below, once both output streams are known.
                Redirection::Merge | Redirection::None => (),
            }
        }

        let output = StandardStream::Output.slot();
        let error = StandardStream::Error.slot();
        match merge {
            MergeKind::ErrToOut => {
                ends.fds[error as usize] = Some(ends.fds[output as usize].unwrap_or(output))
            }
            MergeKind::OutToErr => {
                ends.fds[output as usize] = Some(ends.fds[error as usize].unwrap_or(error))
            }
            MergeKind::None => (),
        }

        // With some of the parent's standard descriptors closed, a child end
        // can land on a slot other than its own, where an earlier dup2() in
        // the child would overwrite it.  Move those out of the way.
        for (slot, entry) in ends.fds.iter_mut().enumerate() {
            if let Some(fd) = *entry
                && fd <= LAST_STD_FD
                && fd != slot as RawFd
            {
                let moved = posix::dup_above(fd, LAST_STD_FD + 1)?;
                *entry = Some(moved.as_raw_fd());
                ends.held.push(moved);
            }
        }
        Ok(ends)
    }

    fn parent_end_mut(&mut self, which: StandardStream) -> &mut Option<File> {
        match which {
            StandardStream::Input => &mut self.stdin,
            StandardStream::Output => &mut self.stdout,
            StandardStream::Error => &mut self.stderr,
        }
    }

    /// Mark the process as detached.
    ///
    /// This method has no effect on the OS level, it simply tells `Popen`
    /// not to wait for the subprocess to finish when going out of scope.
    pub fn detach(&mut self) {
        self.detached = true;
    }

    /// Return the PID of the subprocess, if it is known to be still running.
    ///
    /// This does not check whether the child is still running, it only
    /// reflects the state last observed by `create`, `wait`,
    /// `wait_timeout` or `poll`.
    pub fn pid(&self) -> Option<u32> {
        self.state.pid()
    }

    /// Return the exit status of the subprocess, if it is known to have
    /// finished.
    ///
    /// Note that this method won't actually *check* whether the child
    /// process has finished, it only returns the previously available
    /// information.  To check or wait for the process to finish, call
    /// `wait`, `wait_timeout`, or `poll`.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.state.exit_status()
    }

    /// The lifecycle state of the child as last observed.
    pub fn child_state(&self) -> ChildState {
        self.state
    }

    /// Wait for the process to finish and return its exit status.
    ///
    /// If the process has already finished, this will return immediately
    /// with the exit status.  Calling `wait` after that will return the
    /// cached exit status without executing any system calls.
    ///
    /// # Errors
    ///
    /// Returns an `Err` if a system call fails in an unpredicted way.
    /// This should not happen in normal usage.
    pub fn wait(&mut self) -> Result<ExitStatus> {
        loop {
            match self.state {
                ChildState::Finished(status) => return Ok(status),
                ChildState::Running { pid } => self.waitpid(pid, true)?,
                ChildState::Preparing => panic!("wait() on a child that was never started"),
            }
        }
    }

    /// Wait for the process to finish, timing out after the specified
    /// duration.
    ///
    /// This function behaves like `wait()`, except that the caller will be
    /// blocked for roughly no longer than `dur`.  It returns `Ok(None)` if
    /// the timeout is known to have elapsed.
    ///
    /// The timeout is implemented by calling `waitpid(..., WNOHANG)` in a
    /// loop, sleeping between attempts with an interval that starts at 1ms
    /// and doubles up to 100ms.
    pub fn wait_timeout(&mut self, dur: Duration) -> Result<Option<ExitStatus>> {
        let Some(deadline) = Instant::now().checked_add(dur) else {
            return self.wait().map(Some);
        };
        let mut delay = Duration::from_millis(1);

        loop {
            let pid = match self.state {
                ChildState::Finished(status) => return Ok(Some(status)),
                ChildState::Running { pid } => pid,
                ChildState::Preparing => panic!("wait_timeout() on a child that was never started"),
            };
            self.waitpid(pid, false)?;
            if let Some(status) = self.state.exit_status() {
                return Ok(Some(status));
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let sleep = min(delay, deadline - now);
            trace!("pid {} still running, sleeping {:?}", pid, sleep);
            thread::sleep(sleep);
            delay = min(delay * 2, MAX_POLL_DELAY);
        }
    }

    /// Check whether the process is still running, without blocking or
    /// errors.
    ///
    /// This checks whether the process is still running and if it is,
    /// returns `None`, otherwise `Some(exit_status)`.  This method is
    /// guaranteed not to block and is exactly equivalent to
    /// `wait_timeout(Duration::ZERO).unwrap_or(None)`.
    pub fn poll(&mut self) -> Option<ExitStatus> {
        self.wait_timeout(Duration::ZERO).unwrap_or(None)
    }

    fn waitpid(&mut self, pid: u32, block: bool) -> Result<()> {
        match posix::waitpid(pid, if block { 0 } else { posix::WNOHANG }) {
            Ok((pid_out, status)) if pid_out == pid => {
                debug!("pid {} finished with {}", pid, status);
                self.state.finish(status);
            }
            // WNOHANG and the child is still running
            Ok(_) => (),
            Err(e) if e.raw_os_error() == Some(posix::ECHILD) => {
                // Someone else has waited for the child (another thread, a
                // signal handler...).  The PID no longer exists and its exit
                // status cannot be found.
                warn!("pid {} was reaped elsewhere; exit status undetermined", pid);
                self.state.finish(ExitStatus::Undetermined);
            }
            Err(e) if e.raw_os_error() == Some(posix::EINTR) => (),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Prepare to exchange data with the child through its pipes.
    ///
    /// Moves the `stdin`, `stdout` and `stderr` pipe ends into the returned
    /// [`Communicator`], which feeds `input_data` to the child while reading
    /// its output, avoiding the deadlock of a child blocked on a full output
    /// pipe while the parent is blocked writing its input.
    ///
    /// Providing `input_data` requires stdin to be redirected to a pipe.
    pub fn communicate_start(&mut self, input_data: Option<Vec<u8>>) -> Result<Communicator> {
        if input_data.is_some() && self.stdin.is_none() {
            return Err(PopenError::LogicError(
                "cannot provide input to non-redirected stdin",
            ));
        }
        let comm = Communicator::new(
            self.stdin.take(),
            self.stdout.take(),
            self.stderr.take(),
            input_data.unwrap_or_default(),
        )?;
        Ok(comm)
    }

    /// Feed the subprocess with input data and capture its output.
    ///
    /// This writes `input_data` to the child's stdin and closes it, while
    /// simultaneously reading its stdout and stderr until end-of-file.  The
    /// returned pair contains `Some` for each output stream that was
    /// redirected to a pipe.
    ///
    /// This does not wait for the process to exit, only for it to close its
    /// output streams.
    pub fn communicate_bytes(
        &mut self,
        input_data: Option<&[u8]>,
    ) -> Result<(Option<Vec<u8>>, Option<Vec<u8>>)> {
        let (out_piped, err_piped) = (self.stdout.is_some(), self.stderr.is_some());
        let mut comm = self.communicate_start(input_data.map(<[u8]>::to_vec))?;
        let (out, err) = comm.read()?;
        Ok((out_piped.then_some(out), err_piped.then_some(err)))
    }

    /// Feed the subprocess with input data and capture its output as
    /// strings.
    ///
    /// Like `communicate_bytes`, but with strings.  Invalid UTF-8 in the
    /// output is replaced with `U+FFFD`.
    pub fn communicate(
        &mut self,
        input_data: Option<&str>,
    ) -> Result<(Option<String>, Option<String>)> {
        let (out, err) = self.communicate_bytes(input_data.map(str::as_bytes))?;
        let lossy = |v: Vec<u8>| String::from_utf8_lossy(&v).into_owned();
        Ok((out.map(lossy), err.map(lossy)))
    }
}

impl Drop for Popen {
    fn drop(&mut self) {
        // Close our ends of the pipes first, so that a child blocked reading
        // its stdin sees EOF instead of deadlocking with the wait below.
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
        if let ChildState::Running { pid } = self.state
            && !self.detached
            && let Err(e) = self.wait()
        {
            warn!("failed to wait for pid {} on drop: {}", pid, e);
        }
    }
}

/// Create a pipe, returning `(read_end, write_end)`.
///
/// Both ends are close-on-exec.  Pass them to child processes through
/// `Redirection::from(file)`, which makes the end given to each child
/// inheritable, to connect one child's output to another's input.
pub fn make_pipe() -> Result<(File, File)> {
    Ok(posix::pipe()?)
}

fn check_redirections(
    stdin: &Redirection,
    stdout: &Redirection,
    stderr: &Redirection,
) -> Result<MergeKind> {
    if let Redirection::Merge = stdin {
        return Err(PopenError::LogicError(
            "Redirection::Merge not valid for stdin",
        ));
    }
    match (stdout, stderr) {
        (Redirection::Merge, Redirection::Merge) => Err(PopenError::LogicError(
            "Redirection::Merge not valid for both stdout and stderr",
        )),
        (Redirection::Merge, _) => Ok(MergeKind::OutToErr),
        (_, Redirection::Merge) => Ok(MergeKind::ErrToOut),
        _ => Ok(MergeKind::None),
    }
}

// Both ends stay close-on-exec in the parent, so that children forked
// concurrently by other threads never inherit them.  The child end becomes
// inheritable in the child only, when it is installed as fd 0, 1 or 2.
fn prepare_pipe(parent_writes: bool) -> io::Result<(File, OwnedFd)> {
    let (read, write) = posix::pipe()?;
    let (parent_end, child_end) = if parent_writes {
        (write, read)
    } else {
        (read, write)
    };
    Ok((parent_end, OwnedFd::from(child_end)))
}

fn format_env(env: &[(OsString, OsString)]) -> Vec<OsString> {
    // Keep only the last occurrence of each key, in the original order.
    let mut seen = HashSet::<&OsStr>::new();
    let mut formatted: Vec<_> = env
        .iter()
        .rev()
        .filter(|&(k, _)| seen.insert(k))
        .map(|(k, v)| {
            let mut fmt = k.clone();
            fmt.push("=");
            fmt.push(v);
            fmt
        })
        .collect();
    formatted.reverse();
    formatted
}

/// Read the child's exec status: EOF means the exec succeeded, four bytes are
/// the errno of the failure.
fn read_exec_failure(source: &mut File) -> Result<Option<i32>> {
    let mut buf = [0u8; 4];
    let mut total_read = 0;
    while total_read < buf.len() {
        match source.read(&mut buf[total_read..]) {
            Ok(0) => break,
            Ok(n) => total_read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) => return Err(e.into()),
        }
    }
    match total_read {
        0 => Ok(None),
        n if n == buf.len() => Ok(Some(i32::from_le_bytes(buf))),
        _ => Err(PopenError::LogicError(
            "short read from the exec failure pipe",
        )),
    }
}

// Runs in the forked child: must not allocate, and returns only on failure.
fn exec_child(
    just_exec: &mut PrepExec,
    fds: &[Option<RawFd>; 3],
    options: &ChildOptions,
) -> i32 {
    match prepare_child(fds, options) {
        Ok(()) => just_exec.exec(),
        Err(e) => e.raw_os_error().unwrap_or(-1),
    }
}

fn prepare_child(fds: &[Option<RawFd>; 3], options: &ChildOptions) -> io::Result<()> {
    for (slot, &fd) in fds.iter().enumerate() {
        let Some(fd) = fd else {
            continue;
        };
        let slot = slot as RawFd;
        if fd == slot {
            // dup2() clears close-on-exec on its target; without it, clear it here
            posix::set_inheritable(fd, true)?;
        } else {
            posix::dup2(fd, slot)?;
        }
    }
    posix::reset_signals()?;
    if let Some(ref cwd) = options.cwd {
        posix::chdir(cwd)?;
    }
    if let Some(gid) = options.setgid {
        posix::setgid(gid)?;
    }
    if let Some(uid) = options.setuid {
        posix::setuid(uid)?;
    }
    if options.setpgid {
        posix::setpgid(0, 0)?;
    }
    Ok(())
}
