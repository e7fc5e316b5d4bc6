use std::borrow::Cow;
use std::collections::HashMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use crate::communicate::Communicator;
use crate::os_common::ExitStatus;
use crate::popen::{Popen, PopenConfig, PopenError, Result};
use crate::redirection::Redirection;

const SHELL: [&str; 2] = ["sh", "-c"];
const NULL_DEVICE: &str = "/dev/null";

/// Marker value for [`stdin`], [`stdout`], and [`stderr`] methods of
/// [`Exec`], meaning the stream is connected to `/dev/null`.
///
/// The null device is opened when the process is started.
///
/// [`stdin`]: Exec::stdin
/// [`stdout`]: Exec::stdout
/// [`stderr`]: Exec::stderr
#[derive(Debug, Copy, Clone)]
pub struct NullFile;

#[doc(hidden)]
#[derive(Debug, Clone)]
pub enum StreamSpec {
    Redirect(Redirection),
    Null,
    // stdin only: connect a pipe and feed it this data
    Feed(Vec<u8>),
}

impl StreamSpec {
    fn is_unset(&self) -> bool {
        matches!(self, StreamSpec::Redirect(Redirection::None))
    }

    fn is_pipe(&self) -> bool {
        matches!(self, StreamSpec::Redirect(Redirection::Pipe))
    }

    fn resolve(self, output: bool) -> Result<Redirection> {
        match self {
            StreamSpec::Redirect(r) => Ok(r),
            StreamSpec::Null if output => Redirection::write(NULL_DEVICE),
            StreamSpec::Null => Redirection::read(NULL_DEVICE),
            StreamSpec::Feed(_) => Ok(Redirection::Pipe),
        }
    }
}

/// A builder for [`Popen`] instances, providing control and convenience
/// methods.
///
/// `Exec` provides a builder API for [`Popen::create`], and includes
/// convenience methods for capturing the output.
///
/// # Examples
///
/// Execute an external command and wait for it to complete:
///
/// ```no_run
/// # use posix_popen::*;
/// # fn dummy() -> Result<()> {
/// # let dirname = "some_dir";
/// let exit_status = Exec::cmd("umount").arg(dirname).join()?;
/// # Ok(())
/// # }
/// ```
///
/// Execute the command using the shell, like C's `system`:
///
/// ```no_run
/// # use posix_popen::*;
/// # fn dummy() -> Result<()> {
/// Exec::shell("shutdown -h now").join()?;
/// # Ok(())
/// # }
/// ```
///
/// Provide input to the command and read its output:
///
/// ```
/// # use posix_popen::*;
/// # fn dummy() -> Result<()> {
/// let out = Exec::cmd("sort")
///   .stdin("b\nc\na\n")
///   .stdout(Redirection::Pipe)
///   .capture()?
///   .stdout_str();
/// assert!(out == "a\nb\nc\n");
/// # Ok(())
/// # }
/// ```
#[must_use]
#[derive(Clone)]
pub struct Exec {
    command: OsString,
    args: Vec<OsString>,
    time_limit: Option<Duration>,
    config: PopenConfig,
    stdin: StreamSpec,
    stdout: StreamSpec,
    stderr: StreamSpec,
}

impl Exec {
    /// Constructs a new `Exec`, configured to run `command`.
    ///
    /// The command will be run directly in the OS, without an intervening
    /// shell.  To run it through a shell, use [`Exec::shell`] instead.
    ///
    /// By default, the command will be run without arguments, and none of
    /// the standard streams will be modified.
    pub fn cmd(command: impl AsRef<OsStr>) -> Exec {
        Exec {
            command: command.as_ref().to_owned(),
            args: vec![],
            time_limit: None,
            config: PopenConfig::default(),
            stdin: StreamSpec::Redirect(Redirection::None),
            stdout: StreamSpec::Redirect(Redirection::None),
            stderr: StreamSpec::Redirect(Redirection::None),
        }
    }

    /// Constructs a new `Exec`, configured to run `cmdstr` with the system
    /// shell.
    ///
    /// This is equivalent to `Exec::cmd("sh").arg("-c").arg(cmdstr)`.  The
    /// string is not parsed or escaped here.  Do not interpolate untrusted
    /// input into it; use `Exec::cmd("sort").arg(filename)` instead.
    pub fn shell(cmdstr: impl AsRef<OsStr>) -> Exec {
        Exec::cmd(SHELL[0]).args(&SHELL[1..]).arg(cmdstr)
    }

    /// Appends `arg` to argument list.
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Exec {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    /// Extends the argument list with `args`.
    pub fn args(mut self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Exec {
        self.args
            .extend(args.into_iter().map(|x| x.as_ref().to_owned()));
        self
    }

    /// Specifies that the process is initially detached.
    ///
    /// A detached process means that we will not wait for the process to
    /// finish when the object that owns it goes out of scope.
    pub fn detached(mut self) -> Exec {
        self.config.detached = true;
        self
    }

    /// Limit the amount of time `capture()` will spend on the process.
    pub fn time_limit(mut self, time: Duration) -> Exec {
        self.time_limit = Some(time);
        self
    }

    fn env_mut(&mut self) -> &mut Vec<(OsString, OsString)> {
        self.config.env.get_or_insert_with(PopenConfig::current_env)
    }

    /// Clears the environment of the subprocess.
    ///
    /// When this is invoked, the subprocess will not inherit the environment
    /// of this process.
    pub fn env_clear(mut self) -> Exec {
        self.config.env = Some(vec![]);
        self
    }

    /// Sets an environment variable in the child process.
    ///
    /// If the same variable is set more than once, the last value is used.
    ///
    /// Other environment variables are by default inherited from the
    /// current process.  If this is undesirable, call `env_clear` first.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Exec {
        self.env_mut()
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    /// Sets multiple environment variables in the child process.
    pub fn env_extend(
        mut self,
        vars: impl IntoIterator<Item = (impl AsRef<OsStr>, impl AsRef<OsStr>)>,
    ) -> Exec {
        self.env_mut().extend(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned())),
        );
        self
    }

    /// Removes an environment variable from the child process.
    pub fn env_remove(mut self, key: impl AsRef<OsStr>) -> Exec {
        self.env_mut().retain(|(k, _v)| k != key.as_ref());
        self
    }

    /// Specifies the current working directory of the child process.
    ///
    /// If unspecified, the current working directory is inherited from the
    /// parent.
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Exec {
        self.config.cwd = Some(dir.as_ref().as_os_str().to_owned());
        self
    }

    /// Run the child under the given user ID.
    pub fn setuid(mut self, uid: u32) -> Exec {
        self.config.setuid = Some(uid);
        self
    }

    /// Run the child under the given group ID.
    pub fn setgid(mut self, gid: u32) -> Exec {
        self.config.setgid = Some(gid);
        self
    }

    /// Make the child the leader of a new process group.
    pub fn setpgid(mut self) -> Exec {
        self.config.setpgid = true;
        self
    }

    /// Specifies how to set up the standard input of the child process.
    ///
    /// Argument can be:
    ///
    /// * a [`Redirection`];
    /// * a `File`, which is a shorthand for `Redirection::from(file)`;
    /// * [`NullFile`], to read from `/dev/null`;
    /// * a `Vec<u8>` or `&str`, which will set up a `Redirection::Pipe`
    ///   for stdin, making sure that `capture` or `communicate` feeds that
    ///   data into the standard input of the subprocess.
    ///
    /// # Panics
    ///
    /// If stdin was already set to something other than `Redirection::Pipe`
    /// and this sets it again.
    pub fn stdin(mut self, stdin: impl InputRedirection) -> Exec {
        let new = stdin.into_stream_spec();
        if self.stdin.is_unset() {
            self.stdin = new;
        } else if !(self.stdin.is_pipe() && new.is_pipe()) {
            panic!("stdin is already set");
        }
        self
    }

    /// Specifies how to set up the standard output of the child process.
    ///
    /// Argument can be a [`Redirection`], a `File`, or [`NullFile`].
    ///
    /// # Panics
    ///
    /// If stdout was already set to something other than `Redirection::Pipe`
    /// and this sets it again.
    pub fn stdout(mut self, stdout: impl OutputRedirection) -> Exec {
        let new = stdout.into_stream_spec();
        if self.stdout.is_unset() {
            self.stdout = new;
        } else if !(self.stdout.is_pipe() && new.is_pipe()) {
            panic!("stdout is already set");
        }
        self
    }

    /// Specifies how to set up the standard error of the child process.
    ///
    /// Argument can be a [`Redirection`], a `File`, or [`NullFile`].
    ///
    /// # Panics
    ///
    /// If stderr was already set to something other than `Redirection::Pipe`
    /// and this sets it again.
    pub fn stderr(mut self, stderr: impl OutputRedirection) -> Exec {
        let new = stderr.into_stream_spec();
        if self.stderr.is_unset() {
            self.stderr = new;
        } else if !(self.stderr.is_pipe() && new.is_pipe()) {
            panic!("stderr is already set");
        }
        self
    }

    fn check_no_stdin_data(&self, meth: &str) {
        if let StreamSpec::Feed(_) = self.stdin {
            panic!("{} called with input data specified", meth);
        }
    }

    // Resolve the stream specs and start the process, returning the data to
    // be fed to its stdin, if any.
    fn start(self) -> Result<(Popen, Option<Vec<u8>>)> {
        let Exec {
            command,
            mut args,
            mut config,
            stdin,
            stdout,
            stderr,
            ..
        } = self;
        let stdin_data = match stdin {
            StreamSpec::Feed(ref data) => Some(data.clone()),
            _ => None,
        };
        config.stdin = stdin.resolve(false)?;
        config.stdout = stdout.resolve(true)?;
        config.stderr = stderr.resolve(true)?;
        args.insert(0, command);
        let p = Popen::create(&args, config)?;
        Ok((p, stdin_data))
    }

    // Terminators

    /// Starts the process, returning a `Popen` for the running process.
    pub fn popen(self) -> Result<Popen> {
        self.check_no_stdin_data("popen");
        Ok(self.start()?.0)
    }

    /// Starts the process, waits for it to finish, and returns the exit
    /// status.
    ///
    /// This method will wait for as long as necessary for the process to
    /// finish.  If a timeout is needed, use
    /// `<...>.detached().popen()?.wait_timeout(...)` instead.
    pub fn join(self) -> Result<ExitStatus> {
        self.check_no_stdin_data("join");
        self.popen()?.wait()
    }

    /// Starts the process and returns a value implementing the `Read` trait
    /// that reads from the standard output of the child process.
    ///
    /// This will automatically set up `stdout(Redirection::Pipe)`, so it is
    /// not necessary to do that beforehand.
    ///
    /// When the returned value is dropped, it will wait for the process to
    /// finish.  If this is undesirable, use `detached()`.
    pub fn stream_stdout(self) -> Result<impl Read> {
        self.check_no_stdin_data("stream_stdout");
        let mut p = self.stdout(Redirection::Pipe).popen()?;
        let stream = p
            .stdout
            .take()
            .ok_or(PopenError::LogicError("stdout is not piped"))?;
        Ok(StreamAdapter { stream, _popen: p })
    }

    /// Starts the process and returns a value implementing the `Read` trait
    /// that reads from the standard error of the child process.
    ///
    /// This will automatically set up `stderr(Redirection::Pipe)`, so it is
    /// not necessary to do that beforehand.
    pub fn stream_stderr(self) -> Result<impl Read> {
        self.check_no_stdin_data("stream_stderr");
        let mut p = self.stderr(Redirection::Pipe).popen()?;
        let stream = p
            .stderr
            .take()
            .ok_or(PopenError::LogicError("stderr is not piped"))?;
        Ok(StreamAdapter { stream, _popen: p })
    }

    /// Starts the process and returns a value implementing the `Write`
    /// trait that writes to the standard input of the child process.
    ///
    /// This will automatically set up `stdin(Redirection::Pipe)`, so it is
    /// not necessary to do that beforehand.  Dropping the returned value
    /// closes the child's stdin and waits for the process to finish.
    pub fn stream_stdin(self) -> Result<impl Write> {
        self.check_no_stdin_data("stream_stdin");
        let mut p = self.stdin(Redirection::Pipe).popen()?;
        let stream = p
            .stdin
            .take()
            .ok_or(PopenError::LogicError("stdin is not piped"))?;
        Ok(StreamAdapter { stream, _popen: p })
    }

    fn setup_communicate(mut self) -> Result<(Communicator, Popen)> {
        if self.stdout.is_unset() && self.stderr.is_unset() {
            self = self.stdout(Redirection::Pipe);
        }
        let (mut p, stdin_data) = self.start()?;
        let comm = p.communicate_start(stdin_data)?;
        Ok((comm, p))
    }

    /// Starts the process and returns a `Communicator` handle.
    ///
    /// Compared to `capture()`, this offers more choice in how communication
    /// is performed, such as read size limit and timeout.
    ///
    /// Unlike `capture()`, this method doesn't wait for the process to
    /// finish, effectively detaching it.
    pub fn communicate(self) -> Result<Communicator> {
        let comm = self.detached().setup_communicate()?.0;
        Ok(comm)
    }

    /// Starts the process, collects its output, and waits for it to finish.
    ///
    /// If neither stdout nor stderr were redirected, stdout is captured.
    /// With a `time_limit`, both the data exchange and the final wait are
    /// bounded by it, and running out of time is reported as an error of
    /// kind `io::ErrorKind::TimedOut`.  The timed-out process is left
    /// running, detached.
    pub fn capture(self) -> Result<CaptureData> {
        let timeout = self.time_limit;
        let started = Instant::now();
        let (mut comm, mut p) = self.setup_communicate()?;
        if let Some(t) = timeout {
            comm = comm.limit_time(t);
        }

        let (stdout, stderr) = match comm.read() {
            Ok(data) => data,
            Err(e) => {
                if e.kind() == io::ErrorKind::TimedOut {
                    p.detach();
                }
                return Err(e.into());
            }
        };
        let exit_status = match timeout {
            Some(t) => match p.wait_timeout(t.saturating_sub(started.elapsed()))? {
                Some(status) => status,
                None => {
                    p.detach();
                    return Err(io::Error::from(io::ErrorKind::TimedOut).into());
                }
            },
            None => p.wait()?,
        };
        Ok(CaptureData {
            stdout,
            stderr,
            exit_status,
        })
    }

    fn display_escape(s: &str) -> Cow<'_, str> {
        fn nice_char(c: char) -> bool {
            match c {
                '-' | '_' | '.' | ',' | '/' => true,
                c if c.is_ascii_alphanumeric() => true,
                _ => false,
            }
        }
        if !s.chars().all(nice_char) {
            Cow::Owned(format!("'{}'", s.replace('\'', r#"'\''"#)))
        } else {
            Cow::Borrowed(s)
        }
    }

    /// Show Exec as command-line string quoted in the Unix style.
    ///
    /// Environment variables that differ from the current environment are
    /// shown as `KEY=VALUE` prefixes; removed ones as `KEY=`.
    pub fn to_cmdline_lossy(&self) -> String {
        let mut out = String::new();
        if let Some(ref cmd_env) = self.config.env {
            let current: Vec<_> = env::vars_os().collect();
            let current_map: HashMap<_, _> = current.iter().map(|(x, y)| (x, y)).collect();
            for (k, v) in cmd_env {
                if current_map.get(&k) == Some(&v) {
                    continue;
                }
                out.push_str(&Exec::display_escape(&k.to_string_lossy()));
                out.push('=');
                out.push_str(&Exec::display_escape(&v.to_string_lossy()));
                out.push(' ');
            }
            let cmd_env: HashMap<_, _> = cmd_env.iter().map(|(k, v)| (k, v)).collect();
            for (k, _) in &current {
                if !cmd_env.contains_key(k) {
                    out.push_str(&Exec::display_escape(&k.to_string_lossy()));
                    out.push_str("= ");
                }
            }
        }
        out.push_str(&Exec::display_escape(&self.command.to_string_lossy()));
        for arg in &self.args {
            out.push(' ');
            out.push_str(&Exec::display_escape(&arg.to_string_lossy()));
        }
        out
    }
}

impl fmt::Debug for Exec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Exec {{ {} }}", self.to_cmdline_lossy())
    }
}

// One of the child's pipe ends, kept together with the process.  Fields drop
// in order: the pipe is closed before the `Popen` waits for the child.
#[derive(Debug)]
struct StreamAdapter {
    stream: File,
    _popen: Popen,
}

impl Read for StreamAdapter {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }
}

impl Write for StreamAdapter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }
}

/// Data captured by [`Exec::capture`].
#[derive(Debug)]
pub struct CaptureData {
    /// Standard output as bytes.
    pub stdout: Vec<u8>,
    /// Standard error as bytes.
    pub stderr: Vec<u8>,
    /// Exit status.
    pub exit_status: ExitStatus,
}

impl CaptureData {
    /// Returns the standard output as string, converted from bytes using
    /// `String::from_utf8_lossy`.
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// Returns the standard error as string, converted from bytes using
    /// `String::from_utf8_lossy`.
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// True if the exit status of the process is 0.
    pub fn success(&self) -> bool {
        self.exit_status.success()
    }
}

mod sealed {
    pub trait InputRedirectionSealed {}
    pub trait OutputRedirectionSealed {}
}

/// Trait for types that can be used to redirect standard input.
///
/// This is a sealed trait that cannot be implemented outside this crate.
pub trait InputRedirection: sealed::InputRedirectionSealed {
    #[doc(hidden)]
    fn into_stream_spec(self) -> StreamSpec;
}

/// Trait for types that can be used to redirect standard output or standard
/// error.
///
/// This is a sealed trait that cannot be implemented outside this crate.
pub trait OutputRedirection: sealed::OutputRedirectionSealed {
    #[doc(hidden)]
    fn into_stream_spec(self) -> StreamSpec;
}

impl sealed::InputRedirectionSealed for Redirection {}
impl InputRedirection for Redirection {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Redirect(self)
    }
}

impl sealed::InputRedirectionSealed for File {}
impl InputRedirection for File {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Redirect(Redirection::from(self))
    }
}

impl sealed::InputRedirectionSealed for NullFile {}
impl InputRedirection for NullFile {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Null
    }
}

impl sealed::InputRedirectionSealed for Vec<u8> {}
impl InputRedirection for Vec<u8> {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Feed(self)
    }
}

impl sealed::InputRedirectionSealed for &str {}
impl InputRedirection for &str {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Feed(self.as_bytes().to_vec())
    }
}

impl sealed::OutputRedirectionSealed for Redirection {}
impl OutputRedirection for Redirection {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Redirect(self)
    }
}

impl sealed::OutputRedirectionSealed for File {}
impl OutputRedirection for File {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Redirect(Redirection::from(self))
    }
}

impl sealed::OutputRedirectionSealed for NullFile {}
impl OutputRedirection for NullFile {
    fn into_stream_spec(self) -> StreamSpec {
        StreamSpec::Null
    }
}
