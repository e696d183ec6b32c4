//! Single-session bridge: one shell on one PTY, its output mirrored to
//! stdout until it exits.

use std::io::{Read, Write};

use anyhow::{Context, Result};
use tracing::info;

use crate::broker::pty::{PtyProcess, READ_BUFFER_SIZE};

/// Allocate one PTY, start `shell` on it, and copy master output to stdout
/// while waiting for the shell to exit.
///
/// Setup failures are fatal here: with no session left to serve, the
/// caller reports the error and exits.
pub fn run(shell: &str) -> Result<()> {
    let (pty, mut reader) =
        PtyProcess::spawn(shell).with_context(|| format!("failed to attach shell '{shell}'"))?;

    info!(shell, pid = ?pty.pid(), "started shell");

    let output = std::thread::spawn(move || {
        let mut stdout = std::io::stdout();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if stdout
                        .write_all(&buf[..n])
                        .and_then(|()| stdout.flush())
                        .is_err()
                    {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let status = pty.wait().context("failed to wait for shell exit")?;
    let _ = output.join();

    info!(code = status.exit_code(), "shell exited");
    Ok(())
}
