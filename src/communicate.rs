use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use crate::posix::{self, PollFd};

const READ_BUF_SIZE: usize = 4096;

/// Send input to a subprocess and capture its output, without deadlock.
///
/// `Communicator` writes the provided input data to the subprocess's stdin
/// (which is then closed), while simultaneously reading its stdout and
/// stderr until end-of-file.  Both directions are multiplexed with `poll()`
/// in the calling thread, so a child that produces output before consuming
/// all of its input cannot deadlock the exchange.
///
/// Create a `Communicator` by calling [`Popen::communicate_start`], then
/// call [`read`] or [`read_string`] to perform the data exchange.
///
/// [`Popen::communicate_start`]: crate::Popen::communicate_start
/// [`read`]: Communicator::read
/// [`read_string`]: Communicator::read_string
#[must_use]
pub struct Communicator {
    stdin: Option<File>,
    stdout: Option<File>,
    stderr: Option<File>,
    input_data: Vec<u8>,
    input_pos: usize,
    size_limit: Option<usize>,
    time_limit: Option<Duration>,
}

impl fmt::Debug for Communicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Communicator")
            .field("input_remaining", &(self.input_data.len() - self.input_pos))
            .field("size_limit", &self.size_limit)
            .field("time_limit", &self.time_limit)
            .finish_non_exhaustive()
    }
}

impl Communicator {
    pub(crate) fn new(
        stdin: Option<File>,
        stdout: Option<File>,
        stderr: Option<File>,
        input_data: Vec<u8>,
    ) -> io::Result<Communicator> {
        // poll() only reports that *some* pipe space is free.  A blocking
        // write larger than that would stall until the child drains the
        // pipe, which it may never do while its own stdout is full.
        if let Some(ref f) = stdin {
            posix::set_nonblocking(f)?;
        }
        Ok(Communicator {
            stdin,
            stdout,
            stderr,
            input_data,
            input_pos: 0,
            size_limit: None,
            time_limit: None,
        })
    }

    /// Limit the amount of data the next `read()` will read from the
    /// subprocess.
    pub fn limit_size(mut self, size: usize) -> Communicator {
        self.size_limit = Some(size);
        self
    }

    /// Limit the amount of time the next `read()` will spend reading from
    /// the subprocess.
    pub fn limit_time(mut self, time: Duration) -> Communicator {
        self.time_limit = Some(time);
        self
    }

    /// Communicate with the subprocess, writing captured data to the
    /// provided writers.
    ///
    /// Data is written to the writers as it arrives, so the caller keeps
    /// partial output even when this returns an error.
    ///
    /// If `limit_time` has been called and the time runs out, an error of
    /// kind `io::ErrorKind::TimedOut` is returned.  Communication may be
    /// resumed by calling `read_to()` again.  If `limit_size` has been
    /// called, reading stops once that many bytes have been captured;
    /// further data remains available to a later call.
    ///
    /// This does not wait for the subprocess to finish, only for it to close
    /// its output streams.
    pub fn read_to(&mut self, mut stdout: impl Write, mut stderr: impl Write) -> io::Result<()> {
        let deadline = self.time_limit.map(|t| Instant::now() + t);
        let mut total_read = 0;

        loop {
            if self.size_limit.is_some_and(|limit| total_read >= limit) {
                break;
            }
            if self.stdin.is_none() && self.stdout.is_none() && self.stderr.is_none() {
                break;
            }
            let (in_ready, out_ready, err_ready) = self.poll_streams(deadline)?;
            if !in_ready && !out_ready && !err_ready {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "timeout"));
            }
            if in_ready {
                self.do_write()?;
            }
            if out_ready {
                total_read += do_read(&mut self.stdout, &mut stdout, self.size_limit, total_read)?;
            }
            if err_ready {
                total_read += do_read(&mut self.stderr, &mut stderr, self.size_limit, total_read)?;
            }
        }
        Ok(())
    }

    /// Communicate with the subprocess, return the contents of its standard
    /// output and error.
    ///
    /// An empty `Vec` means the stream was not redirected to a pipe, or that
    /// no data was produced.
    pub fn read(&mut self) -> io::Result<(Vec<u8>, Vec<u8>)> {
        let mut out = vec![];
        let mut err = vec![];
        self.read_to(&mut out, &mut err)?;
        Ok((out, err))
    }

    /// Like `read()`, but returns strings.  Invalid UTF-8 sequences are
    /// replaced with the `U+FFFD` replacement character.
    pub fn read_string(&mut self) -> io::Result<(String, String)> {
        let (out, err) = self.read()?;
        Ok((from_utf8_lossy(out), from_utf8_lossy(err)))
    }

    fn poll_streams(&self, deadline: Option<Instant>) -> io::Result<(bool, bool, bool)> {
        // With a single output stream and no deadline, the blocking read
        // itself is the wait.  Stdin is non-blocking and always needs poll.
        if self.stdin.is_none() && deadline.is_none() {
            match (&self.stdout, &self.stderr) {
                (Some(_), None) => return Ok((false, true, false)),
                (None, Some(_)) => return Ok((false, false, true)),
                _ => (),
            }
        }

        let mut fds = [
            PollFd::new(self.stdin.as_ref(), posix::POLLOUT),
            PollFd::new(self.stdout.as_ref(), posix::POLLIN),
            PollFd::new(self.stderr.as_ref(), posix::POLLIN),
        ];
        loop {
            let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            match posix::poll(&mut fds, timeout) {
                Ok(_) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        // POLLERR on the stdin pipe means the child closed its end; the
        // next write reports it as BrokenPipe.
        let done = posix::POLLHUP | posix::POLLERR;
        Ok((
            fds[0].test(posix::POLLOUT | done),
            fds[1].test(posix::POLLIN | done),
            fds[2].test(posix::POLLIN | done),
        ))
    }

    fn do_write(&mut self) -> io::Result<()> {
        let Some(ref mut stdin) = self.stdin else {
            return Ok(());
        };
        let pending = &self.input_data[self.input_pos..];
        if pending.is_empty() {
            // close stdin when done writing, so the child receives EOF
            self.stdin = None;
            return Ok(());
        }
        match stdin.write(pending) {
            Ok(n) => self.input_pos += n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => (),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => (),
            Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                // the child is not interested in the rest of its input
                self.input_pos = self.input_data.len();
                self.stdin = None;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

fn do_read(
    source: &mut Option<File>,
    dest: &mut impl Write,
    size_limit: Option<usize>,
    total_read: usize,
) -> io::Result<usize> {
    let Some(f) = source else {
        return Ok(0);
    };
    let mut buf = [0u8; READ_BUF_SIZE];
    let want = match size_limit {
        Some(limit) => buf.len().min(limit.saturating_sub(total_read)),
        None => buf.len(),
    };
    let n = match f.read(&mut buf[..want]) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
        Err(e) => return Err(e),
    };
    if n == 0 {
        // EOF
        *source = None;
    } else {
        dest.write_all(&buf[..n])?;
    }
    Ok(n)
}

/// Like `String::from_utf8_lossy()`, but takes `Vec<u8>` and reuses its
/// storage if possible.
fn from_utf8_lossy(v: Vec<u8>) -> String {
    match String::from_utf8(v) {
        Ok(s) => s,
        Err(e) => String::from_utf8_lossy(e.as_bytes()).into(),
    }
}
