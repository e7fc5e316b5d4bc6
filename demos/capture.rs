//! Capture the output of a command with the `Exec` builder.
//!
//! Run with: cargo run --example capture

use posix_popen::{Exec, Redirection};

fn main() -> posix_popen::Result<()> {
    let output = Exec::cmd("echo").arg("Hello from a child!").capture()?;
    println!("Output: {}", output.stdout_str().trim());
    println!("Exit status: {}", output.exit_status);

    let output = Exec::shell("echo stdout; echo stderr >&2")
        .stdout(Redirection::Pipe)
        .stderr(Redirection::Merge)
        .capture()?;
    println!("\nMerged output:\n{}", output.stdout_str().trim());

    let output = Exec::cmd("sort")
        .stdin("pear\napple\nfig\n")
        .stdout(Redirection::Pipe)
        .capture()?;
    println!("\nSorted:\n{}", output.stdout_str().trim());

    let cmd = Exec::cmd("sh").arg("-c").arg("exit 3").env("GREETING", "hi there");
    println!("\nRunning {:?}", cmd);
    let status = cmd.join()?;
    println!("Exit status: {}, success: {}", status, status.success());

    Ok(())
}
