//! Connect two children through a pipe, like `cat file | grep apple`.
//!
//! Run with: cargo run --example chain

use std::env;
use std::ffi::OsStr;
use std::fs;

use posix_popen::{make_pipe, Popen, PopenConfig, Redirection};

fn main() -> posix_popen::Result<()> {
    let path = env::temp_dir().join("posix_popen_demo_chain.txt");
    fs::write(&path, "apple\nbanana\npineapple\nlemon\n")?;

    let (read_end, write_end) = make_pipe()?;

    // Each end is moved into a config and closed in the parent once its
    // child is started, so grep sees EOF when cat exits.
    let mut cat = Popen::create(
        &[OsStr::new("cat"), path.as_os_str()],
        PopenConfig {
            stdout: Redirection::from(write_end),
            ..Default::default()
        },
    )?;
    let mut grep = Popen::create(
        &["grep", "apple"],
        PopenConfig {
            stdin: Redirection::from(read_end),
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )?;

    let (out, _) = grep.communicate(None)?;
    print!("{}", out.unwrap_or_default());
    println!("cat: {}, grep: {}", cat.wait()?, grep.wait()?);

    fs::remove_file(&path)?;
    Ok(())
}
