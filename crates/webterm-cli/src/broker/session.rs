//! Session table and broker operations.
//!
//! The broker owns every live session, runs one capture task per session,
//! and exposes open/write/subscribe/close. All shared state is reached
//! through the broker's `Arc`; there is no ambient global table.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info};

use webterm_core::error::BrokerError;
use webterm_core::protocol::TerminalId;

use crate::broker::pty::{read_loop, PtyProcess};

/// Interval between snapshot emissions on a read stream.
pub const HEARTBEAT: Duration = Duration::from_secs(1);

/// How often the sweeper checks for exited shells.
const SWEEP_INTERVAL: Duration = Duration::from_millis(500);

/// Channel depth between the blocking reader thread and the capture task.
const CAPTURE_CHANNEL_DEPTH: usize = 64;

/// One live shell bound to one PTY.
pub struct Session {
    pub id: TerminalId,
    pty: PtyProcess,
    /// Output accumulated since open. Append-only while the session lives,
    /// so any snapshot is a prefix of every later one. Grows without bound:
    /// full-history snapshot delivery is the read contract.
    log: Mutex<Vec<u8>>,
    /// Flips to true exactly once, on close. No transition leaves closed.
    closed_tx: watch::Sender<bool>,
}

impl Session {
    fn new(id: TerminalId, pty: PtyProcess) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            id,
            pty,
            log: Mutex::new(Vec::new()),
            closed_tx,
        }
    }

    /// Append captured output. Only the capture task calls this.
    fn append(&self, chunk: &[u8]) {
        if let Ok(mut log) = self.log.lock() {
            log.extend_from_slice(chunk);
        }
    }

    /// A consistent point-in-time copy of the full output log.
    pub fn snapshot(&self) -> Vec<u8> {
        self.log.lock().map(|log| log.clone()).unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    fn mark_closed(&self) {
        self.closed_tx.send_replace(true);
    }

    fn closed(&self) -> watch::Receiver<bool> {
        self.closed_tx.subscribe()
    }

    pub fn pid(&self) -> Option<u32> {
        self.pty.pid()
    }
}

/// Owns the table of live sessions.
///
/// Construct once, share via `Arc`. Entries are inserted by `open` and
/// removed only by `close`; a missing id and a closed id are the same
/// thing to callers.
pub struct SessionBroker {
    sessions: RwLock<HashMap<TerminalId, Arc<Session>>>,
    /// Ids are unique and strictly increasing for the process lifetime;
    /// Relaxed is enough for a standalone counter.
    next_id: AtomicU64,
    shell: String,
}

impl SessionBroker {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            shell: shell.into(),
        }
    }

    /// Allocate a PTY, start the shell on it, register the session under a
    /// fresh id, and start its capture task.
    ///
    /// Allocation and spawn failures are local to this call; the broker
    /// keeps serving other sessions.
    pub async fn open(self: &Arc<Self>) -> Result<TerminalId, BrokerError> {
        let (pty, reader) = PtyProcess::spawn(&self.shell)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, pty));

        self.sessions.write().await.insert(id, session.clone());
        spawn_capture(Arc::downgrade(self), session.clone(), reader);

        info!(id, pid = ?session.pid(), shell = %self.shell, "opened terminal session");
        Ok(id)
    }

    /// Forward bytes verbatim and in order to the session's terminal.
    ///
    /// The registry lock is held only for the lookup; the blocking write
    /// runs on the blocking pool with no queue in between.
    pub async fn write(&self, id: TerminalId, data: &[u8]) -> Result<(), BrokerError> {
        let session = self.get(id).await?;
        let data = data.to_vec();

        tokio::task::spawn_blocking(move || session.pty.write(&data))
            .await
            .map_err(|e| BrokerError::Io(e.to_string()))?
            .map_err(|e| BrokerError::Io(e.to_string()))
    }

    /// Start a snapshot stream over the session's output log.
    pub async fn subscribe(&self, id: TerminalId) -> Result<Subscriber, BrokerError> {
        let session = self.get(id).await?;
        Ok(Subscriber::new(session, HEARTBEAT))
    }

    /// Close a session: evict it, mark it closed, kill and reap the shell.
    ///
    /// Idempotent. Invoked by the capture task on end-of-stream, by the
    /// sweeper when the shell exits, and by explicit request.
    pub async fn close(&self, id: TerminalId) {
        let Some(session) = self.sessions.write().await.remove(&id) else {
            return;
        };
        session.mark_closed();
        session.pty.kill_and_reap();
        info!(id, "closed terminal session");
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn get(&self, id: TerminalId) -> Result<Arc<Session>, BrokerError> {
        let sessions = self.sessions.read().await;
        match sessions.get(&id) {
            Some(session) if !session.is_closed() => Ok(session.clone()),
            _ => Err(BrokerError::NotFound(id)),
        }
    }

    /// Spawn a background task that closes sessions whose shell exited.
    ///
    /// End-of-stream on the master normally closes a session first; the
    /// sweeper catches shells that exit while the master stays readable.
    /// Runs until the broker is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;

                let Some(broker) = weak.upgrade() else {
                    debug!("broker dropped, sweeper exiting");
                    break;
                };

                let dead: Vec<TerminalId> = {
                    let sessions = broker.sessions.read().await;
                    sessions
                        .iter()
                        .filter(|(_, session)| session.pty.has_exited())
                        .map(|(id, _)| *id)
                        .collect()
                };

                for id in dead {
                    debug!(id, "shell exited, closing session");
                    broker.close(id).await;
                }
            }
        });
    }
}

/// Start the capture task for a session.
///
/// A dedicated thread blocks on the master read and feeds chunks over a
/// channel; the capture task appends them to the session log. When the
/// channel drains dry (end-of-stream or read error) the task closes the
/// session. The reader is moved in here, so there is never more than one
/// capture loop per master.
fn spawn_capture(
    broker: Weak<SessionBroker>,
    session: Arc<Session>,
    reader: Box<dyn Read + Send>,
) {
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(CAPTURE_CHANNEL_DEPTH);
    std::thread::spawn(move || read_loop(reader, tx));

    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            session.append(&chunk);
        }

        debug!(id = session.id, "capture task finished");
        match broker.upgrade() {
            Some(broker) => broker.close(session.id).await,
            // Broker already gone; still flip the flag so subscribers end.
            None => session.mark_closed(),
        }
    });
}

/// A snapshot stream over one session's output log.
///
/// Yields the full accumulated log immediately, so a late subscriber sees
/// complete history, then one snapshot per heartbeat. When the session
/// closes, one final snapshot is yielded and the stream ends. Dropping the
/// subscriber stops delivery for this consumer only; the session itself
/// stays open for future subscribers.
pub struct Subscriber {
    session: Arc<Session>,
    closed: watch::Receiver<bool>,
    period: Duration,
    started: bool,
    done: bool,
}

impl Subscriber {
    fn new(session: Arc<Session>, period: Duration) -> Self {
        let closed = session.closed();
        Self {
            session,
            closed,
            period,
            started: false,
            done: false,
        }
    }

    /// The next snapshot, or `None` once the stream has ended.
    pub async fn next_snapshot(&mut self) -> Option<Vec<u8>> {
        if self.done {
            return None;
        }

        if !self.started {
            self.started = true;
            if self.session.is_closed() {
                self.done = true;
            }
            return Some(self.session.snapshot());
        }

        tokio::select! {
            _ = tokio::time::sleep(self.period) => Some(self.session.snapshot()),
            _ = self.closed.wait_for(|closed| *closed) => {
                self.done = true;
                Some(self.session.snapshot())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHELL: &str = "/bin/sh";

    fn broker() -> Arc<SessionBroker> {
        Arc::new(SessionBroker::new(SHELL))
    }

    /// Poll the session's snapshot until it contains `needle` or five
    /// seconds pass; returns the last snapshot as text.
    async fn wait_for_output(broker: &Arc<SessionBroker>, id: TerminalId, needle: &str) -> String {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let text = {
                let sessions = broker.sessions.read().await;
                let snapshot = sessions.get(&id).map(|s| s.snapshot()).unwrap_or_default();
                String::from_utf8_lossy(&snapshot).to_string()
            };
            if text.contains(needle) || tokio::time::Instant::now() > deadline {
                return text;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    #[tokio::test]
    async fn test_ids_strictly_increasing_from_one() {
        let broker = broker();

        let id1 = broker.open().await.expect("open 1");
        let id2 = broker.open().await.expect("open 2");
        let id3 = broker.open().await.expect("open 3");

        assert_eq!(id1, 1);
        assert!(id1 < id2 && id2 < id3);

        broker.close(id1).await;
        broker.close(id2).await;
        broker.close(id3).await;

        // Closed ids are never reused.
        let id4 = broker.open().await.expect("open 4");
        assert!(id4 > id3);
        broker.close(id4).await;
    }

    #[tokio::test]
    async fn test_echo_roundtrip() {
        let broker = broker();
        let id = broker.open().await.expect("open");

        broker.write(id, b"echo hi\n").await.expect("write");

        let text = wait_for_output(&broker, id, "\nhi").await;
        assert!(
            text.contains("echo hi"),
            "echoed input missing from output: {:?}",
            text
        );
        assert!(
            text.contains("\nhi") || text.contains("\rhi"),
            "command result missing from output: {:?}",
            text
        );

        broker.close(id).await;
    }

    #[tokio::test]
    async fn test_write_unknown_session_is_not_found() {
        let broker = broker();

        let result = broker.write(999, b"x").await;
        assert!(matches!(result, Err(BrokerError::NotFound(999))));
        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_subscribe_unknown_session_is_not_found() {
        let broker = broker();

        let result = broker.subscribe(999).await;
        assert!(matches!(result, Err(BrokerError::NotFound(999))));
    }

    #[tokio::test]
    async fn test_concurrent_opens_get_distinct_isolated_sessions() {
        let broker = broker();

        let (a, b) = tokio::join!(
            {
                let broker = broker.clone();
                async move { broker.open().await }
            },
            {
                let broker = broker.clone();
                async move { broker.open().await }
            }
        );
        let id_a = a.expect("open a");
        let id_b = b.expect("open b");
        assert_ne!(id_a, id_b);

        broker.write(id_a, b"echo marker_alpha\n").await.expect("write a");
        broker.write(id_b, b"echo marker_bravo\n").await.expect("write b");

        let text_a = wait_for_output(&broker, id_a, "marker_alpha").await;
        let text_b = wait_for_output(&broker, id_b, "marker_bravo").await;

        assert!(text_a.contains("marker_alpha"));
        assert!(!text_a.contains("marker_bravo"), "output intermixed: {:?}", text_a);
        assert!(text_b.contains("marker_bravo"));
        assert!(!text_b.contains("marker_alpha"), "output intermixed: {:?}", text_b);

        broker.close(id_a).await;
        broker.close(id_b).await;
    }

    #[tokio::test]
    async fn test_snapshots_are_monotonic_prefixes() {
        let broker = broker();
        let id = broker.open().await.expect("open");

        broker.write(id, b"echo first_line\n").await.expect("write");
        wait_for_output(&broker, id, "first_line").await;

        let earlier = {
            let sessions = broker.sessions.read().await;
            sessions.get(&id).unwrap().snapshot()
        };

        broker.write(id, b"echo second_line\n").await.expect("write");
        wait_for_output(&broker, id, "second_line").await;

        let later = {
            let sessions = broker.sessions.read().await;
            sessions.get(&id).unwrap().snapshot()
        };

        assert!(
            later.starts_with(&earlier),
            "earlier snapshot is not a prefix of the later one"
        );

        broker.close(id).await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_evicts() {
        let broker = broker();
        let id = broker.open().await.expect("open");
        assert_eq!(broker.session_count().await, 1);

        broker.close(id).await;
        broker.close(id).await;

        assert_eq!(broker.session_count().await, 0);
        assert!(matches!(
            broker.write(id, b"x").await,
            Err(BrokerError::NotFound(_))
        ));
        assert!(matches!(
            broker.subscribe(id).await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_capture_task_closes_session_on_shell_exit() {
        let broker = broker();
        let id = broker.open().await.expect("open");

        broker.write(id, b"exit 0\n").await.expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while broker.session_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(broker.session_count().await, 0, "session should self-close on EOF");
        assert!(matches!(
            broker.write(id, b"x").await,
            Err(BrokerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_sweeper_closes_dead_sessions() {
        let broker = broker();
        broker.spawn_sweeper();

        let id = broker.open().await.expect("open");
        broker.write(id, b"exit 0\n").await.expect("write");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while broker.session_count().await > 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        assert_eq!(broker.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_sweeper_keeps_live_sessions() {
        let broker = broker();
        broker.spawn_sweeper();

        let id = broker.open().await.expect("open");
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert_eq!(broker.session_count().await, 1, "live session must survive the sweeper");
        broker.close(id).await;
    }

    #[tokio::test]
    async fn test_subscriber_first_snapshot_is_immediate() {
        let broker = broker();
        let id = broker.open().await.expect("open");

        let mut subscriber = broker.subscribe(id).await.expect("subscribe");
        let first = tokio::time::timeout(Duration::from_millis(200), subscriber.next_snapshot())
            .await
            .expect("first snapshot must not wait for the heartbeat");
        assert!(first.is_some());

        broker.close(id).await;
    }

    #[tokio::test]
    async fn test_disconnected_subscriber_leaves_session_running() {
        let broker = broker();
        let id = broker.open().await.expect("open");

        broker.write(id, b"echo history_marker\n").await.expect("write");
        wait_for_output(&broker, id, "history_marker").await;

        // First subscriber reads one snapshot and disconnects.
        {
            let mut subscriber = broker.subscribe(id).await.expect("subscribe");
            let snapshot = subscriber.next_snapshot().await.expect("snapshot");
            assert!(String::from_utf8_lossy(&snapshot).contains("history_marker"));
        }

        // Session is still running and writable.
        broker.write(id, b"echo still_here\n").await.expect("write after disconnect");
        wait_for_output(&broker, id, "still_here").await;

        // A second subscriber sees the full accumulated history at once.
        let mut subscriber = broker.subscribe(id).await.expect("resubscribe");
        let snapshot = subscriber.next_snapshot().await.expect("snapshot");
        let text = String::from_utf8_lossy(&snapshot);
        assert!(text.contains("history_marker"));
        assert!(text.contains("still_here"));

        broker.close(id).await;
    }

    #[tokio::test]
    async fn test_subscriber_ends_with_final_snapshot_after_close() {
        let broker = broker();
        let id = broker.open().await.expect("open");

        let mut subscriber = broker.subscribe(id).await.expect("subscribe");
        assert!(subscriber.next_snapshot().await.is_some());

        broker.write(id, b"exit 0\n").await.expect("write");

        // Drain until the stream ends; it must end shortly after closure,
        // with a final snapshot preceding the None.
        let drained = tokio::time::timeout(Duration::from_secs(10), async {
            let mut yielded = 0u32;
            while subscriber.next_snapshot().await.is_some() {
                yielded += 1;
            }
            yielded
        })
        .await
        .expect("stream should end after the session closes");

        assert!(drained >= 1, "a final snapshot should precede the end of stream");
    }
}
