//! PTY allocation and shell launching using portable-pty.

use std::io::{Read, Write};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, ExitStatus, MasterPty, PtySize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use webterm_core::error::BrokerError;

/// Fixed terminal geometry. Resize negotiation is out of scope; every
/// session gets a classic 80x24.
const PTY_ROWS: u16 = 24;
const PTY_COLS: u16 = 80;

/// Buffer size for reading from the master handle.
pub const READ_BUFFER_SIZE: usize = 4096;

/// One allocated PTY pair with a shell attached to its slave side.
///
/// Owns the master handle, the writer side, and the child process. The
/// reader is handed out exactly once at spawn time, so only one capture
/// loop can ever drain the master.
pub struct PtyProcess {
    /// Master handle, held open for the session's lifetime.
    /// Wrapped in a Mutex to make PtyProcess Sync.
    _master: Mutex<Box<dyn MasterPty + Send>>,
    /// Writer side of the master. Writes pass straight through to the
    /// kernel; there is no queue in between.
    writer: Mutex<Box<dyn Write + Send>>,
    /// Child process handle for exit checks and cleanup.
    child: Mutex<Box<dyn Child + Send + Sync>>,
}

impl PtyProcess {
    /// Allocate a PTY pair and spawn `shell` on the slave side.
    ///
    /// The child is made the leader of a new session with the slave as its
    /// controlling terminal, and its environment is seeded with `TERM` so
    /// interactive shells behave. Returns the process together with the
    /// sole reader over the master output.
    pub fn spawn(shell: &str) -> Result<(Self, Box<dyn Read + Send>), BrokerError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: PTY_ROWS,
                cols: PTY_COLS,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BrokerError::Allocation(e.to_string()))?;

        let mut cmd = CommandBuilder::new(shell);
        cmd.env("TERM", "xterm");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BrokerError::spawn(shell, e))?;

        // The parent has no further use for the slave once the child holds it.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BrokerError::Allocation(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BrokerError::Allocation(e.to_string()))?;

        Ok((
            Self {
                _master: Mutex::new(pair.master),
                writer: Mutex::new(writer),
                child: Mutex::new(child),
            },
            reader,
        ))
    }

    /// Write bytes verbatim to the child's terminal.
    ///
    /// Blocks until the kernel accepts the bytes. Call from a blocking
    /// context.
    pub fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = self
            .writer
            .lock()
            .map_err(|_| poisoned("pty writer"))?;
        writer.write_all(data)?;
        writer.flush()
    }

    /// Process id of the shell, if the platform exposes one.
    pub fn pid(&self) -> Option<u32> {
        self.child.lock().ok().and_then(|c| c.process_id())
    }

    /// Check without blocking whether the shell has exited.
    pub fn has_exited(&self) -> bool {
        self.child
            .lock()
            .ok()
            .and_then(|mut child| child.try_wait().ok())
            .map(|status| status.is_some())
            .unwrap_or(false)
    }

    /// Block until the shell exits and return its exit status.
    pub fn wait(&self) -> std::io::Result<ExitStatus> {
        self.child
            .lock()
            .map_err(|_| poisoned("pty child"))?
            .wait()
    }

    /// Kill the shell if it is still running and collect its exit status
    /// so no zombie is left behind.
    pub fn kill_and_reap(&self) {
        if let Ok(mut child) = self.child.lock() {
            if let Err(e) = child.kill() {
                debug!("failed to kill child (may have already exited): {}", e);
            }
            // Non-blocking; we just signaled it.
            if let Err(e) = child.try_wait() {
                debug!("failed to collect child exit status: {}", e);
            }
        }
    }
}

impl Drop for PtyProcess {
    fn drop(&mut self) {
        // close() normally runs kill_and_reap first; this catches sessions
        // dropped on other paths so no shell outlives its broker.
        if let Ok(mut child) = self.child.lock() {
            let _ = child.kill();
            let _ = child.try_wait();
        }
    }
}

fn poisoned(what: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("{what} mutex poisoned"),
    )
}

/// Blocking read loop over the master, run on a dedicated thread.
///
/// Forwards each chunk over `tx` until end-of-stream, a read error, or the
/// receiver going away. End-of-stream is the expected exit: the shell has
/// terminated and the kernel hung up the pair.
pub fn read_loop(mut reader: Box<dyn Read + Send>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                debug!("pty reader reached end of stream");
                break;
            }
            Ok(n) => {
                if tx.blocking_send(buf[..n].to_vec()).is_err() {
                    debug!("pty output channel closed");
                    break;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(e) => {
                warn!("pty read error: {}", e);
                break;
            }
        }
    }
}
