//! Wait for a child with a timeout, and poll without blocking.
//!
//! Run with: cargo run --example timeout

use std::thread;
use std::time::Duration;

use posix_popen::{Popen, PopenConfig, Redirection};

fn main() -> posix_popen::Result<()> {
    println!("Waiting with timeout...");
    let mut p = Popen::create(&["sleep", "2"], PopenConfig::default())?;

    match p.wait_timeout(Duration::from_millis(100))? {
        Some(status) => println!("Process exited: {}", status),
        None => {
            println!("Timeout! pid {:?} is still running", p.pid());
            let status = p.wait()?;
            println!("Process eventually finished with {}", status);
        }
    }

    println!("\nPolling a quick command...");
    let mut p = Popen::create(
        &["echo", "quick"],
        PopenConfig {
            stdout: Redirection::Pipe,
            ..Default::default()
        },
    )?;
    loop {
        if let Some(status) = p.poll() {
            println!("Command finished with: {}", status);
            break;
        }
        thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
