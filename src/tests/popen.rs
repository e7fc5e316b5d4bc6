use tempfile::TempDir;

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::PermissionsExt;
use std::ptr;
use std::time::{Duration, Instant};

use crate::{ChildState, ExitStatus, Popen, PopenConfig, PopenError, Redirection};

const FRUIT: &str = "apple\nbanana\npineapple\nlemon\n";

fn kill(p: &Popen, signal: libc::c_int) {
    let pid = p.pid().unwrap();
    assert_eq!(unsafe { libc::kill(pid as libc::pid_t, signal) }, 0);
}

#[test]
fn good_cmd() {
    let mut p = Popen::create(&["true"], PopenConfig::default()).unwrap();
    assert!(p.wait().unwrap().success());
}

#[test]
fn bad_cmd() {
    let result = Popen::create(&["nosuchcommand"], PopenConfig::default());
    assert!(
        matches!(&result, Err(PopenError::IoError(e)) if e.kind() == io::ErrorKind::NotFound),
        "expected NotFound, got {:?}",
        result
    );
}

#[test]
fn reject_empty_argv() {
    let result = Popen::create(&[""; 0], PopenConfig::default());
    assert!(matches!(result, Err(PopenError::LogicError(_))));
}

#[test]
fn logic_error_maps_to_invalid_input() {
    let err = Popen::create(&[""; 0], PopenConfig::default()).unwrap_err();
    assert_eq!(io::Error::from(err).kind(), io::ErrorKind::InvalidInput);
}

#[test]
fn err_exit() {
    let mut p = Popen::create(&["sh", "-c", "exit 13"], PopenConfig::default()).unwrap();
    assert_eq!(p.wait().unwrap(), ExitStatus::Exited(13));
}

#[test]
fn err_signal() {
    let mut p = Popen::create(&["sleep", "1000"], PopenConfig::default()).unwrap();
    kill(&p, libc::SIGTERM);
    assert_eq!(p.wait().unwrap(), ExitStatus::Signaled(libc::SIGTERM as u8));
}

#[test]
fn state_transitions() {
    let mut p = Popen::create(&["true"], PopenConfig::default()).unwrap();
    let pid = p.pid().unwrap();
    assert_eq!(p.child_state(), ChildState::Running { pid });
    assert_eq!(p.exit_status(), None);
    let status = p.wait().unwrap();
    assert_eq!(p.child_state(), ChildState::Finished(status));
    assert_eq!(p.pid(), None);
    assert_eq!(p.exit_status(), Some(status));
}

#[test]
fn read_from_stdout() {
    let mut p = Popen::create(
        &["echo", "yolo"],
        PopenConfig {
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    let mut line = String::new();
    BufReader::new(p.stdout.take().unwrap())
        .read_line(&mut line)
        .unwrap();
    assert_eq!(line, "yolo\n");
    p.wait().unwrap();
    assert!(p.exit_status().unwrap().success());
}

#[test]
fn filter_through_pipe() {
    let mut p = Popen::create(
        &["grep", "apple"],
        PopenConfig {
            stdin: Redirection::Pipe,
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    p.stdin.take().unwrap().write_all(FRUIT.as_bytes()).unwrap();
    assert_eq!(
        io::read_to_string(p.stdout.take().unwrap()).unwrap(),
        "apple\npineapple\n"
    );
    assert!(p.wait().unwrap().success());
}

#[test]
fn filter_from_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("fruit");
    fs::write(&tmpname, FRUIT).unwrap();
    let mut p = Popen::create(
        &["grep", "apple"],
        PopenConfig {
            stdin: Redirection::read(&tmpname).unwrap(),
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(
        io::read_to_string(p.stdout.take().unwrap()).unwrap(),
        "apple\npineapple\n"
    );
    assert!(p.wait().unwrap().success());
}

#[test]
fn input_from_open_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("input");
    fs::write(&tmpname, "foo").unwrap();
    let mut p = Popen::create(
        &["cat"],
        PopenConfig {
            stdin: Redirection::from(File::open(&tmpname).unwrap()),
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(io::read_to_string(p.stdout.take().unwrap()).unwrap(), "foo");
    assert!(p.wait().unwrap().success());
}

#[test]
fn output_to_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("output");
    let mut p = Popen::create(
        &["printf", "foo"],
        PopenConfig {
            stdout: Redirection::write(&tmpname).unwrap(),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(p.wait().unwrap().success());
    assert_eq!(fs::read_to_string(&tmpname).unwrap(), "foo");
}

#[test]
fn append_to_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("output");
    for word in ["foo", "bar"] {
        let mut p = Popen::create(
            &["printf", word],
            PopenConfig {
                stdout: Redirection::append(&tmpname).unwrap(),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(p.wait().unwrap().success());
    }
    assert_eq!(fs::read_to_string(&tmpname).unwrap(), "foobar");
}

#[test]
fn write_to_subprocess() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("output");
    let mut p = Popen::create(
        &["uniq", "-", tmpname.to_str().unwrap()],
        PopenConfig {
            stdin: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    p.stdin
        .take()
        .unwrap()
        .write_all(b"foo\nfoo\nbar\n")
        .unwrap();
    assert_eq!(p.wait().unwrap(), ExitStatus::Exited(0));
    assert_eq!(fs::read_to_string(tmpname).unwrap(), "foo\nbar\n");
}

#[test]
fn null_byte_in_cmd() {
    let result = Popen::create(&["echo\0foo"], PopenConfig::default());
    assert!(
        matches!(&result, Err(PopenError::IoError(e)) if e.raw_os_error() == Some(libc::EINVAL))
    );
}

#[test]
fn merge_err_to_out_pipe() {
    let mut p = Popen::create(
        &["sh", "-c", "echo foo; echo bar >&2"],
        PopenConfig {
            stdout: Redirection::Pipe,
            stderr: Redirection::Merge,
            ..Default::default()
        },
    )
    .unwrap();
    let (out, err) = p.communicate_bytes(None).unwrap();
    assert_eq!(out.unwrap(), b"foo\nbar\n");
    assert!(err.is_none());
    assert!(p.wait().unwrap().success());
}

#[test]
fn merge_out_to_err_pipe() {
    let mut p = Popen::create(
        &["sh", "-c", "echo foo; echo bar >&2"],
        PopenConfig {
            stdout: Redirection::Merge,
            stderr: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    let (out, err) = p.communicate_bytes(None).unwrap();
    assert!(out.is_none());
    assert_eq!(err.unwrap(), b"foo\nbar\n");
    assert!(p.wait().unwrap().success());
}

#[test]
fn merge_err_to_out_file() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("output");
    let mut p = Popen::create(
        &["sh", "-c", "printf foo; printf bar >&2"],
        PopenConfig {
            stdout: Redirection::write(&tmpname).unwrap(),
            stderr: Redirection::Merge,
            ..Default::default()
        },
    )
    .unwrap();
    assert!(p.wait().unwrap().success());
    assert_eq!(fs::read_to_string(&tmpname).unwrap(), "foobar");
}

#[test]
fn merge_on_stdin_rejected() {
    let result = Popen::create(
        &["true"],
        PopenConfig {
            stdin: Redirection::Merge,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(PopenError::LogicError(_))));
}

#[test]
fn merge_on_stdin_rejected_before_pipes_are_made() {
    // Allocating the stdout pipe first would leave its ends open in the
    // parent; the file must be closed as soon as the config is dropped.
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("output");
    let result = Popen::create(
        &["true"],
        PopenConfig {
            stdin: Redirection::Merge,
            stdout: Redirection::write(&tmpname).unwrap(),
            stderr: Redirection::Pipe,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(PopenError::LogicError(_))));
}

#[test]
fn merge_both_stdout_stderr_rejected() {
    let result = Popen::create(
        &["true"],
        PopenConfig {
            stdout: Redirection::Merge,
            stderr: Redirection::Merge,
            ..Default::default()
        },
    );
    assert!(matches!(result, Err(PopenError::LogicError(_))));
}

#[test]
fn simple_pipe() {
    let mut c1 = Popen::create(
        &["printf", "foo\\nbar\\nbaz\\n"],
        PopenConfig {
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    let mut c2 = Popen::create(
        &["wc", "-l"],
        PopenConfig {
            stdin: Redirection::from(c1.stdout.take().unwrap()),
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    let (wcout, _) = c2.communicate(None).unwrap();
    assert_eq!(wcout.unwrap().trim(), "3");
    assert!(c1.wait().unwrap().success());
    assert!(c2.wait().unwrap().success());
}

#[test]
fn poll_does_not_block() {
    let mut p = Popen::create(&["sleep", "1000"], PopenConfig::default()).unwrap();
    let start = Instant::now();
    assert!(p.poll().is_none());
    assert!(start.elapsed() < Duration::from_millis(500));
    kill(&p, libc::SIGKILL);
    p.wait().unwrap();
    assert!(p.poll().is_some());
}

#[test]
fn poll_finished_process() {
    let mut p = Popen::create(&["true"], PopenConfig::default()).unwrap();
    p.wait().unwrap();
    assert_eq!(p.poll(), Some(ExitStatus::Exited(0)));
    assert_eq!(p.poll(), Some(ExitStatus::Exited(0)));
}

#[test]
fn wait_multiple_times() {
    let mut p = Popen::create(&["sh", "-c", "exit 42"], PopenConfig::default()).unwrap();
    let s1 = p.wait().unwrap();
    let s2 = p.wait().unwrap();
    assert_eq!(s1, ExitStatus::Exited(42));
    assert_eq!(s1, s2);
    assert_eq!(p.exit_status(), Some(s1));
}

#[test]
fn wait_timeout() {
    let mut p = Popen::create(&["sleep", "1"], PopenConfig::default()).unwrap();
    let start = Instant::now();
    let ret = p.wait_timeout(Duration::from_millis(100)).unwrap();
    let elapsed = start.elapsed();
    assert!(ret.is_none());
    assert!(elapsed >= Duration::from_millis(100));
    assert!(elapsed < Duration::from_millis(900), "overslept: {:?}", elapsed);

    let start = Instant::now();
    let ret = p.wait_timeout(Duration::from_secs(10)).unwrap();
    assert_eq!(ret, Some(ExitStatus::Exited(0)));
    // the child had under a second left; add one backoff step and slack
    assert!(start.elapsed() < Duration::from_secs(3));
}

#[test]
fn wait_timeout_on_finished_returns_at_once() {
    let mut p = Popen::create(&["true"], PopenConfig::default()).unwrap();
    p.wait().unwrap();
    let start = Instant::now();
    assert_eq!(
        p.wait_timeout(Duration::from_secs(10)).unwrap(),
        Some(ExitStatus::Exited(0))
    );
    assert!(start.elapsed() < Duration::from_millis(100));
}

#[test]
fn reaped_elsewhere_is_undetermined() {
    let mut p = Popen::create(&["true"], PopenConfig::default()).unwrap();
    let pid = p.pid().unwrap() as libc::pid_t;
    assert_eq!(unsafe { libc::waitpid(pid, ptr::null_mut(), 0) }, pid);
    assert_eq!(p.wait().unwrap(), ExitStatus::Undetermined);
    assert_eq!(p.exit_status(), Some(ExitStatus::Undetermined));
}

#[test]
fn env_add() {
    let mut env = PopenConfig::current_env();
    env.push((OsString::from("SOMEVAR"), OsString::from("foo")));
    let mut p = Popen::create(
        &["sh", "-c", r#"test "$SOMEVAR" = "foo""#],
        PopenConfig {
            env: Some(env),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(p.wait().unwrap().success());
}

#[test]
fn env_dup() {
    let dups = vec![
        (OsString::from("SOMEVAR"), OsString::from("foo")),
        (OsString::from("SOMEVAR"), OsString::from("bar")),
    ];
    let mut p = Popen::create(
        &["sh", "-c", r#"test "$SOMEVAR" = "bar""#],
        PopenConfig {
            env: Some(dups),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(p.wait().unwrap().success());
}

#[test]
fn empty_env() {
    let mut p = Popen::create(
        &["sh", "-c", "echo ${HOME-unset}"],
        PopenConfig {
            stdout: Redirection::Pipe,
            env: Some(vec![]),
            ..Default::default()
        },
    )
    .unwrap();
    let (out, _) = p.communicate(None).unwrap();
    assert_eq!(out.unwrap(), "unset\n");
}

#[test]
fn executable_override() {
    let mut p = Popen::create(
        &["not-a-real-name", "-c", "exit 7"],
        PopenConfig {
            executable: Some("sh".into()),
            ..Default::default()
        },
    )
    .unwrap();
    assert_eq!(p.wait().unwrap(), ExitStatus::Exited(7));
}

#[test]
fn cwd() {
    let tmpdir = TempDir::new().unwrap();
    let mut p = Popen::create(
        &["touch", "here"],
        PopenConfig {
            cwd: Some(tmpdir.path().as_os_str().to_owned()),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(p.wait().unwrap().success());
    assert!(tmpdir.path().join("here").exists());
}

#[test]
fn failed_cwd() {
    let result = Popen::create(
        &["anything"],
        PopenConfig {
            stdout: Redirection::Pipe,
            cwd: Some("/nosuchdir".into()),
            ..Default::default()
        },
    );
    assert!(
        matches!(&result, Err(PopenError::IoError(e)) if e.raw_os_error() == Some(libc::ENOENT))
    );
}

#[test]
fn exec_not_executable() {
    let tmpdir = TempDir::new().unwrap();
    let script = tmpdir.path().join("script");
    fs::write(&script, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&script, fs::Permissions::from_mode(0o644)).unwrap();
    let result = Popen::create(&[&script], PopenConfig::default());
    assert!(
        matches!(&result, Err(PopenError::IoError(e)) if e.kind() == io::ErrorKind::PermissionDenied)
    );
}

#[test]
fn setuid_setgid_to_self() {
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    let mut p = Popen::create(
        &["sh", "-c", "echo $(id -u) $(id -g)"],
        PopenConfig {
            stdout: Redirection::Pipe,
            setuid: Some(uid),
            setgid: Some(gid),
            ..Default::default()
        },
    )
    .unwrap();
    let (out, _) = p.communicate(None).unwrap();
    assert_eq!(out.unwrap(), format!("{} {}\n", uid, gid));
    assert!(p.wait().unwrap().success());
}

#[test]
fn setpgid() {
    let mut p = Popen::create(
        &["sleep", "1000"],
        PopenConfig {
            setpgid: true,
            ..Default::default()
        },
    )
    .unwrap();
    let pid = p.pid().unwrap() as libc::pid_t;
    // The child may not have reached setpgid() yet when fork returns, but it
    // has by the time exec succeeded, which create waits for.
    assert_eq!(unsafe { libc::getpgid(pid) }, pid);
    kill(&p, libc::SIGKILL);
    p.wait().unwrap();
}

#[cfg(target_os = "linux")]
#[test]
fn signals_are_reset_in_child() {
    fn status_mask(status: &str, field: &str) -> u64 {
        let line = status
            .lines()
            .find(|l| l.starts_with(field))
            .unwrap();
        u64::from_str_radix(line[field.len()..].trim(), 16).unwrap()
    }

    // The test harness ignores SIGPIPE; also block SIGUSR1 in this thread,
    // which is the one that forks.
    let mut set = unsafe { std::mem::zeroed::<libc::sigset_t>() };
    let mut old = unsafe { std::mem::zeroed::<libc::sigset_t>() };
    unsafe {
        libc::sigemptyset(&mut set);
        libc::sigaddset(&mut set, libc::SIGUSR1);
        libc::pthread_sigmask(libc::SIG_BLOCK, &set, &mut old);
    }
    let mut p = Popen::create(
        &["cat", "/proc/self/status"],
        PopenConfig {
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    unsafe {
        libc::pthread_sigmask(libc::SIG_SETMASK, &old, ptr::null_mut());
    }

    let (out, _) = p.communicate(None).unwrap();
    let out = out.unwrap();
    assert!(p.wait().unwrap().success());
    assert_eq!(status_mask(&out, "SigBlk:"), 0);
    assert_eq!(status_mask(&out, "SigIgn:") & (1 << (libc::SIGPIPE - 1)), 0);
}

#[test]
fn drop_waits_for_child() {
    let pid = {
        let p = Popen::create(&["true"], PopenConfig::default()).unwrap();
        p.pid().unwrap() as libc::pid_t
    };
    // already reaped by drop
    let ret = unsafe { libc::waitpid(pid, ptr::null_mut(), libc::WNOHANG) };
    assert_eq!(ret, -1);
    assert_eq!(io::Error::last_os_error().raw_os_error(), Some(libc::ECHILD));
}

#[test]
fn drop_closes_stdin_before_waiting() {
    // cat only exits once its stdin is closed
    let p = Popen::create(
        &["cat"],
        PopenConfig {
            stdin: Redirection::Pipe,
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    drop(p);
}

#[test]
fn detach_does_not_wait_on_drop() {
    let start = Instant::now();
    let pid = {
        let mut p = Popen::create(&["sleep", "1"], PopenConfig::default()).unwrap();
        p.detach();
        p.pid().unwrap() as libc::pid_t
    };
    assert!(start.elapsed() < Duration::from_millis(500));
    // reap it ourselves
    assert_eq!(unsafe { libc::waitpid(pid, ptr::null_mut(), 0) }, pid);
}

#[test]
fn detached_config() {
    let pid = {
        let p = Popen::create(
            &["true"],
            PopenConfig {
                detached: true,
                ..Default::default()
            },
        )
        .unwrap();
        p.pid().unwrap() as libc::pid_t
    };
    assert_eq!(unsafe { libc::waitpid(pid, ptr::null_mut(), 0) }, pid);
}

#[test]
fn communicate_input_output() {
    let mut p = Popen::create(
        &["cat"],
        PopenConfig {
            stdin: Redirection::Pipe,
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    let (out, err) = p.communicate(Some("hello world")).unwrap();
    assert_eq!(out.unwrap(), "hello world");
    assert!(err.is_none());
    assert!(p.wait().unwrap().success());
}

#[test]
fn communicate_input_requires_pipe() {
    let mut p = Popen::create(
        &["true"],
        PopenConfig {
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )
    .unwrap();
    let result = p.communicate(Some("data"));
    assert!(matches!(result, Err(PopenError::LogicError(_))));
    p.wait().unwrap();
}

#[test]
fn config_clone_aliases_descriptor() {
    let tmpdir = TempDir::new().unwrap();
    let tmpname = tmpdir.path().join("output");
    let config = PopenConfig {
        stdout: Redirection::append(&tmpname).unwrap(),
        ..Default::default()
    };
    // The clone borrows the descriptor; the original still owns it and is
    // used afterwards.
    let mut p1 = Popen::create(&["printf", "foo"], config.clone()).unwrap();
    assert!(p1.wait().unwrap().success());
    let mut p2 = Popen::create(&["printf", "bar"], config).unwrap();
    assert!(p2.wait().unwrap().success());
    assert_eq!(fs::read_to_string(&tmpname).unwrap(), "foobar");
}
