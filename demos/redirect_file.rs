//! Redirect a child's standard streams to and from files.
//!
//! Run with: cargo run --example redirect_file

use std::env;
use std::fs;
use std::io;

use posix_popen::{Exec, NullFile, Popen, PopenConfig, Redirection};

fn main() -> posix_popen::Result<()> {
    let dir = env::temp_dir();
    let output_path = dir.join("posix_popen_demo_output.txt");
    let input_path = dir.join("posix_popen_demo_input.txt");

    // stdout to a file, stderr merged into it
    let mut p = Popen::create(
        &["sh", "-c", "echo to stdout; echo to stderr >&2"],
        PopenConfig {
            stdout: Redirection::write(&output_path)?,
            stderr: Redirection::Merge,
            ..Default::default()
        },
    )?;
    p.wait()?;
    println!("File contents:\n{}", fs::read_to_string(&output_path)?);

    // append one more line
    Exec::cmd("echo")
        .arg("appended")
        .stdout(Redirection::append(&output_path)?)
        .join()?;
    println!("After append:\n{}", fs::read_to_string(&output_path)?);

    // stdin from a file
    fs::write(&input_path, "apple\nbanana\npineapple\nlemon\n")?;
    let mut p = Popen::create(
        &["grep", "apple"],
        PopenConfig {
            stdin: Redirection::read(&input_path)?,
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )?;
    let (out, _) = p.communicate(None)?;
    p.wait()?;
    print!("Filtered from file:\n{}", out.unwrap_or_default());

    // discard output
    Exec::cmd("echo")
        .arg("This output is discarded")
        .stdout(NullFile)
        .join()?;

    for path in [&output_path, &input_path] {
        fs::remove_file(path).or_else(|e| match e.kind() {
            io::ErrorKind::NotFound => Ok(()),
            _ => Err(e),
        })?;
    }
    Ok(())
}
