use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::Stream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use relay_core::events::{ControlEvent, ProgressEvent, SinkEvent};
use relay_core::ids::SessionId;

use crate::queue::ProgressReporter;

pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_SINK_BUFFER: usize = 64;

/// Identifies one registration, so cleanup for a stale connection never
/// removes a newer one for the same session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn_{}", self.0)
    }
}

/// What happened to a frame handed to `emit`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EmitOutcome {
    Delivered,
    /// No stream is open for the session.
    NoSink,
    /// The client is not draining fast enough; the frame was discarded.
    Dropped,
    /// The client went away; the entry has been removed.
    Closed,
}

struct SinkEntry {
    conn_id: ConnectionId,
    tx: mpsc::Sender<String>,
    keep_alive: JoinHandle<()>,
    connected_at: DateTime<Utc>,
}

struct RegistryInner {
    sinks: DashMap<SessionId, SinkEntry>,
    next_conn: AtomicU64,
    keep_alive_interval: Duration,
    buffer: usize,
}

impl RegistryInner {
    /// Remove the entry only if it still belongs to `conn_id`.
    fn remove_connection(&self, session_id: &SessionId, conn_id: ConnectionId) -> Option<SinkEntry> {
        self.sinks
            .remove_if(session_id, |_, entry| entry.conn_id == conn_id)
            .map(|(_, entry)| entry)
    }
}

/// Session id → open event stream.
#[derive(Clone)]
pub struct EventSinkRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for EventSinkRegistry {
    fn default() -> Self {
        Self::new(KEEP_ALIVE_INTERVAL, DEFAULT_SINK_BUFFER)
    }
}

fn frame(event: &SinkEvent) -> String {
    // Serializing these plain structs cannot fail.
    serde_json::to_string(event).unwrap_or_default()
}

impl EventSinkRegistry {
    pub fn new(keep_alive_interval: Duration, buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sinks: DashMap::new(),
                next_conn: AtomicU64::new(1),
                keep_alive_interval: keep_alive_interval.max(Duration::from_millis(1)),
                buffer: buffer.max(1),
            }),
        }
    }

    /// Attach `tx` as the session's stream, replacing any previous one.
    ///
    /// Writes `{"type":"connected"}` immediately and starts the keep-alive
    /// task, which also removes the entry once the receiver is dropped.
    pub fn register(&self, session_id: SessionId, tx: mpsc::Sender<String>) -> ConnectionId {
        let conn_id = ConnectionId(self.inner.next_conn.fetch_add(1, Ordering::Relaxed));

        if let Err(e) = tx.try_send(frame(&ControlEvent::Connected.into())) {
            debug!(session_id = %session_id, %conn_id, error = %e, "connected frame not written");
        }

        let keep_alive = tokio::spawn(keep_alive_loop(
            Arc::downgrade(&self.inner),
            session_id.clone(),
            conn_id,
            tx.clone(),
            self.inner.keep_alive_interval,
        ));

        let entry = SinkEntry {
            conn_id,
            tx,
            keep_alive,
            connected_at: Utc::now(),
        };

        if let Some(previous) = self.inner.sinks.insert(session_id.clone(), entry) {
            previous.keep_alive.abort();
            info!(session_id = %session_id, replaced = %previous.conn_id, "stream replaced");
        }
        info!(session_id = %session_id, event = "sse_connect", %conn_id);

        conn_id
    }

    /// Open a bounded channel for the session and return its receiving end.
    /// Dropping the stream deregisters this connection.
    pub fn open(&self, session_id: SessionId) -> SinkStream {
        let (tx, rx) = mpsc::channel(self.inner.buffer);
        let conn_id = self.register(session_id.clone(), tx);
        SinkStream {
            rx: ReceiverStream::new(rx),
            registry: Arc::downgrade(&self.inner),
            session_id,
            conn_id,
        }
    }

    /// Write one JSON frame without blocking.
    pub fn emit(&self, session_id: &SessionId, event: &SinkEvent) -> EmitOutcome {
        let Some((tx, conn_id)) = self
            .inner
            .sinks
            .get(session_id)
            .map(|entry| (entry.tx.clone(), entry.conn_id))
        else {
            return EmitOutcome::NoSink;
        };

        match tx.try_send(frame(event)) {
            Ok(()) => EmitOutcome::Delivered,
            Err(mpsc::error::TrySendError::Full(msg)) => {
                warn!(
                    session_id = %session_id,
                    %conn_id,
                    kind = event.kind(),
                    msg_len = msg.len(),
                    "stream buffer full, dropping frame"
                );
                EmitOutcome::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                if let Some(entry) = self.inner.remove_connection(session_id, conn_id) {
                    entry.keep_alive.abort();
                }
                warn!(session_id = %session_id, %conn_id, kind = event.kind(), "stream closed during emit");
                EmitOutcome::Closed
            }
        }
    }

    /// Drop the session's stream, if any. Idempotent.
    pub fn deregister(&self, session_id: &SessionId) -> bool {
        match self.inner.sinks.remove(session_id) {
            Some((_, entry)) => {
                entry.keep_alive.abort();
                info!(session_id = %session_id, conn_id = %entry.conn_id, event = "sse_close");
                true
            }
            None => false,
        }
    }

    pub fn is_open(&self, session_id: &SessionId) -> bool {
        self.inner.sinks.contains_key(session_id)
    }

    pub fn connected_at(&self, session_id: &SessionId) -> Option<DateTime<Utc>> {
        self.inner.sinks.get(session_id).map(|entry| entry.connected_at)
    }

    pub fn open_count(&self) -> usize {
        self.inner.sinks.len()
    }
}

impl ProgressReporter for EventSinkRegistry {
    fn report(&self, session_id: &SessionId, progress: ProgressEvent) -> EmitOutcome {
        self.emit(session_id, &progress.into())
    }
}

async fn keep_alive_loop(
    registry: Weak<RegistryInner>,
    session_id: SessionId,
    conn_id: ConnectionId,
    tx: mpsc::Sender<String>,
    period: Duration,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // first tick is immediate

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match tx.try_send(frame(&ControlEvent::KeepAlive.into())) {
                    Ok(()) => debug!(session_id = %session_id, %conn_id, "keep-alive"),
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(session_id = %session_id, %conn_id, "keep-alive skipped, buffer full");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            _ = tx.closed() => break,
        }
    }

    info!(session_id = %session_id, %conn_id, "stream disconnected");
    if let Some(inner) = registry.upgrade() {
        // Dropping our own JoinHandle detaches it; nothing to abort.
        drop(inner.remove_connection(&session_id, conn_id));
    }
}

/// Receiving end of a session stream, yielding serialized JSON frames.
pub struct SinkStream {
    rx: ReceiverStream<String>,
    registry: Weak<RegistryInner>,
    session_id: SessionId,
    conn_id: ConnectionId,
}

impl SinkStream {
    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.conn_id
    }
}

impl Stream for SinkStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.rx).poll_next(cx)
    }
}

impl Drop for SinkStream {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            if let Some(entry) = inner.remove_connection(&self.session_id, self.conn_id) {
                entry.keep_alive.abort();
                info!(session_id = %self.session_id, conn_id = %self.conn_id, "stream dropped by client");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use serde_json::{json, Value};

    fn sid(s: &str) -> SessionId {
        SessionId::from_raw(s)
    }

    fn parse(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    fn progress(completed: usize, total: usize) -> SinkEvent {
        ProgressEvent {
            completed,
            total,
            last_completed: "q".into(),
        }
        .into()
    }

    #[tokio::test]
    async fn open_sends_connected_first() {
        let registry = EventSinkRegistry::default();
        let mut stream = registry.open(sid("s1"));

        let first = stream.next().await.unwrap();
        assert_eq!(parse(&first), json!({"type": "connected"}));
        assert!(registry.is_open(&sid("s1")));
        assert!(registry.connected_at(&sid("s1")).is_some());
    }

    #[tokio::test]
    async fn emit_delivers_json_frame() {
        let registry = EventSinkRegistry::default();
        let mut stream = registry.open(sid("s1"));
        let _connected = stream.next().await;

        assert_eq!(registry.emit(&sid("s1"), &progress(1, 2)), EmitOutcome::Delivered);
        let frame = stream.next().await.unwrap();
        assert_eq!(
            parse(&frame),
            json!({"completed": 1, "total": 2, "lastCompleted": "q"})
        );
    }

    #[tokio::test]
    async fn emit_unknown_session_is_noop() {
        let registry = EventSinkRegistry::default();
        assert_eq!(registry.emit(&sid("nobody"), &progress(1, 1)), EmitOutcome::NoSink);
        assert_eq!(registry.open_count(), 0);
    }

    #[tokio::test]
    async fn emit_after_receiver_dropped_deregisters() {
        let registry = EventSinkRegistry::default();
        let (tx, rx) = mpsc::channel(8);
        registry.register(sid("s1"), tx);
        drop(rx);

        let outcome = registry.emit(&sid("s1"), &progress(1, 1));
        // The keep-alive task may have noticed the closure first.
        assert!(matches!(outcome, EmitOutcome::Closed | EmitOutcome::NoSink));
        assert!(!registry.is_open(&sid("s1")));
    }

    #[tokio::test]
    async fn full_buffer_drops_frame() {
        let registry = EventSinkRegistry::new(KEEP_ALIVE_INTERVAL, 1);
        let (tx, _rx) = mpsc::channel(1);
        // The connected frame fills the only slot.
        registry.register(sid("s1"), tx);

        assert_eq!(registry.emit(&sid("s1"), &progress(1, 1)), EmitOutcome::Dropped);
        assert!(registry.is_open(&sid("s1")));
    }

    #[tokio::test]
    async fn deregister_is_idempotent_and_ends_stream() {
        let registry = EventSinkRegistry::default();
        let mut stream = registry.open(sid("s1"));
        let _connected = stream.next().await;

        assert!(registry.deregister(&sid("s1")));
        assert!(!registry.deregister(&sid("s1")));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_stream_deregisters() {
        let registry = EventSinkRegistry::default();
        let stream = registry.open(sid("s1"));
        assert_eq!(registry.open_count(), 1);

        drop(stream);
        assert_eq!(registry.open_count(), 0);
    }

    #[tokio::test]
    async fn stale_stream_drop_keeps_newer_connection() {
        let registry = EventSinkRegistry::default();
        let old = registry.open(sid("s1"));
        let mut new = registry.open(sid("s1"));
        assert_ne!(old.connection_id(), new.connection_id());

        drop(old);
        assert!(registry.is_open(&sid("s1")));

        let _connected = new.next().await;
        assert_eq!(registry.emit(&sid("s1"), &progress(1, 1)), EmitOutcome::Delivered);
        assert!(new.next().await.is_some());
    }

    #[tokio::test]
    async fn replaced_stream_ends() {
        let registry = EventSinkRegistry::default();
        let mut old = registry.open(sid("s1"));
        let _new = registry.open(sid("s1"));

        assert_eq!(parse(&old.next().await.unwrap()), json!({"type": "connected"}));
        assert!(old.next().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn keep_alive_every_interval() {
        let registry = EventSinkRegistry::default();
        let mut stream = registry.open(sid("s1"));
        let _connected = stream.next().await;

        tokio::time::advance(Duration::from_secs(30)).await;
        let frame = stream.next().await.unwrap();
        assert_eq!(parse(&frame), json!({"type": "keep-alive"}));

        tokio::time::advance(Duration::from_secs(30)).await;
        let frame = stream.next().await.unwrap();
        assert_eq!(parse(&frame), json!({"type": "keep-alive"}));
    }

    #[tokio::test]
    async fn keep_alive_task_cleans_up_after_disconnect() {
        let registry = EventSinkRegistry::default();
        let (tx, rx) = mpsc::channel(8);
        registry.register(sid("s1"), tx);
        drop(rx);

        for _ in 0..100 {
            if !registry.is_open(&sid("s1")) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!registry.is_open(&sid("s1")));
    }

    #[tokio::test]
    async fn reporter_forwards_progress() {
        let registry = EventSinkRegistry::default();
        let mut stream = registry.open(sid("s1"));
        let _connected = stream.next().await;

        let outcome = registry.report(
            &sid("s1"),
            ProgressEvent {
                completed: 2,
                total: 2,
                last_completed: "b".into(),
            },
        );
        assert_eq!(outcome, EmitOutcome::Delivered);
        assert_eq!(parse(&stream.next().await.unwrap())["lastCompleted"], "b");
    }
}
