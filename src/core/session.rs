/// Session Manager
///
/// In-memory sessions binding a client to an SSE stream and an activity
/// window. The session map is the only hot shared state of the server and
/// sits behind one mutex, so `create`, `touch`, `is_valid`, the expiry sweep
/// and stream teardown always observe the same snapshot. No `.await` ever
/// happens while that mutex is held.
///
/// Event sequencing: each stream has a single-writer lock. A pushed event
/// takes that lock, allocates the session's next sequence number, then
/// queues the frame, so frames reach the wire in sequence order.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::Value;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Default idle timeout (30 minutes).
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// One server-sent event.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    /// Per-session sequence number; `None` for unsequenced frames.
    pub id: Option<u64>,
    pub event: String,
    pub data: Value,
}

impl SseEvent {
    /// Wire frame: optional `id:` line, `event:` line, `data:` line and a
    /// terminating blank line.
    pub fn to_frame(&self) -> String {
        let data = serde_json::to_string(&self.data).unwrap_or_else(|_| "null".to_string());
        let mut frame = String::with_capacity(data.len() + self.event.len() + 32);
        if let Some(seq) = self.id {
            frame.push_str(&format!("id: {seq}\n"));
        }
        frame.push_str(&format!("event: {}\ndata: {}\n\n", self.event, data));
        frame
    }
}

/// Tuning for SSE sinks.
#[derive(Debug, Clone, Copy)]
pub struct SinkOptions {
    /// Frames queued before a push has to wait for the client to drain.
    pub capacity: usize,
    /// How long a push may wait on a stalled client before the stream is cut.
    pub send_timeout: Duration,
    /// Interval of `: keep-alive` comment frames on an idle stream.
    pub keep_alive: Duration,
}

impl Default for SinkOptions {
    fn default() -> Self {
        Self {
            capacity: 64,
            send_timeout: Duration::from_secs(5),
            keep_alive: Duration::from_secs(15),
        }
    }
}

/// Write side of one SSE stream.
pub struct EventSink {
    tx: mpsc::Sender<Bytes>,
    writer: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    close_signal: Notify,
    send_timeout: Duration,
}

impl EventSink {
    /// Create a sink and the stream that drains it into an HTTP response.
    pub fn channel(options: SinkOptions) -> (Arc<EventSink>, EventStream) {
        let (tx, rx) = mpsc::channel(options.capacity.max(1));
        let sink = Arc::new(EventSink {
            tx,
            writer: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            close_signal: Notify::new(),
            send_timeout: options.send_timeout,
        });
        let stream = EventStream {
            rx,
            sink: Arc::clone(&sink),
            keep_alive: options.keep_alive,
        };
        (sink, stream)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the sink; the paired stream ends and later sends are dropped.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.close_signal.notify_one();
        }
    }

    /// Format and queue a single event. Returns `false` when the sink is
    /// closed, in which case the event is silently dropped.
    pub async fn send_event(&self, name: &str, payload: Value, seq: Option<u64>) -> bool {
        let _writer = self.writer.lock().await;
        let event = SseEvent {
            id: seq,
            event: name.to_string(),
            data: payload,
        };
        self.write_frame(&event).await
    }

    /// Queue an event whose sequence number is allocated under the writer
    /// lock. `allocate` returning `None` aborts the send.
    pub async fn send_sequenced<F>(&self, name: &str, payload: Value, allocate: F) -> Option<u64>
    where
        F: FnOnce() -> Option<u64>,
    {
        let _writer = self.writer.lock().await;
        if self.is_closed() {
            return None;
        }
        let seq = allocate()?;
        let event = SseEvent {
            id: Some(seq),
            event: name.to_string(),
            data: payload,
        };
        self.write_frame(&event).await.then_some(seq)
    }

    async fn write_frame(&self, event: &SseEvent) -> bool {
        if self.is_closed() {
            return false;
        }
        let frame = Bytes::from(event.to_frame());
        match self.tx.send_timeout(frame, self.send_timeout).await {
            Ok(()) => true,
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                warn!(event = %event.event, "SSE client stalled, closing stream");
                self.close();
                false
            }
            Err(mpsc::error::SendTimeoutError::Closed(_)) => {
                self.close();
                false
            }
        }
    }
}

/// Read side of an `EventSink`, turned into an HTTP body with `into_body`.
///
/// Dropping it (client disconnect) closes the sink.
pub struct EventStream {
    rx: mpsc::Receiver<Bytes>,
    sink: Arc<EventSink>,
    keep_alive: Duration,
}

impl EventStream {
    /// Receive the next frame; `None` once the sink is closed.
    pub async fn next_frame(&mut self) -> Option<Bytes> {
        if self.sink.is_closed() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.sink.close_signal.notified() => None,
            frame = self.rx.recv() => frame,
            _ = tokio::time::sleep(self.keep_alive) => {
                Some(Bytes::from_static(b": keep-alive\n\n"))
            }
        }
    }

    pub fn into_body(self) -> impl Stream<Item = Result<Bytes, Infallible>> + 'static {
        futures_util::stream::unfold(self, |mut stream| async move {
            let frame = stream.next_frame().await?;
            Some((Ok(frame), stream))
        })
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.sink.close();
    }
}

/// Server-side state of one session.
struct Session {
    created_at: Instant,
    last_activity: Instant,
    next_event_seq: u64,
    stream: Option<Arc<EventSink>>,
}

impl Session {
    fn new(now: Instant) -> Self {
        Self {
            created_at: now,
            last_activity: now,
            next_event_seq: 1,
            stream: None,
        }
    }

    /// Live while idle time is under the timeout and any attached stream is
    /// still open.
    fn is_live(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity) < timeout
            && !self.stream.as_ref().is_some_and(|s| s.is_closed())
    }

    fn close(&self) {
        if let Some(stream) = &self.stream {
            stream.close();
        }
    }
}

/// Process-wide registry of live sessions. Cheap to clone.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<Mutex<HashMap<String, Session>>>,
    timeout: Duration,
}

impl SessionManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            sessions: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Mint an unguessable session id from the wall clock's nanoseconds and
    /// 128 random bits.
    pub fn generate_id() -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        let entropy: u128 = rand::random();
        format!("{nanos:x}-{entropy:032x}")
    }

    /// Register a fresh session under `id`, replacing any previous one.
    pub fn create(&self, id: &str) {
        let previous = self
            .lock()
            .insert(id.to_string(), Session::new(Instant::now()));
        if let Some(previous) = previous {
            previous.close();
        }
        info!(session_id = %id, "session created");
    }

    /// Generate an id and create a session under it.
    pub fn create_session(&self) -> String {
        let id = Self::generate_id();
        self.create(&id);
        id
    }

    /// Whether `id` names a live session. Expired sessions found here are
    /// removed on the spot so no caller can see them as valid afterwards.
    pub fn is_valid(&self, id: &str) -> bool {
        let mut sessions = self.lock();
        self.check_live(&mut sessions, id, Instant::now())
    }

    /// Refresh the activity timestamp. Returns `false` (and never revives)
    /// an unknown or expired session.
    pub fn touch(&self, id: &str) -> bool {
        let now = Instant::now();
        let mut sessions = self.lock();
        if !self.check_live(&mut sessions, id, now) {
            return false;
        }
        if let Some(session) = sessions.get_mut(id) {
            session.last_activity = now;
        }
        true
    }

    /// Bind a stream sink to the session, closing any sink it replaces.
    pub fn attach_stream(&self, id: &str, sink: Arc<EventSink>) -> bool {
        let mut sessions = self.lock();
        if !self.check_live(&mut sessions, id, Instant::now()) {
            sink.close();
            return false;
        }
        let Some(session) = sessions.get_mut(id) else {
            return false;
        };
        if let Some(old) = session.stream.replace(sink) {
            old.close();
        }
        true
    }

    /// Allocate the session's next event sequence number (1, 2, 3, ...).
    pub fn next_event_seq(&self, id: &str) -> Option<u64> {
        let mut sessions = self.lock();
        if !self.check_live(&mut sessions, id, Instant::now()) {
            return None;
        }
        let session = sessions.get_mut(id)?;
        let seq = session.next_event_seq;
        session.next_event_seq += 1;
        Some(seq)
    }

    /// Push a sequenced event onto the session's stream. Returns the
    /// sequence number used, or `None` if there is no open stream; a stream
    /// found closed deregisters the session.
    pub async fn push_event(&self, id: &str, name: &str, payload: Value) -> Option<u64> {
        let sink = {
            let mut sessions = self.lock();
            if !self.check_live(&mut sessions, id, Instant::now()) {
                return None;
            }
            sessions.get(id)?.stream.clone()?
        };
        let seq = sink
            .send_sequenced(name, payload, || self.next_event_seq(id))
            .await;
        if seq.is_none() && sink.is_closed() {
            self.remove(id);
        }
        seq
    }

    /// Push an event to every session with an attached stream. Returns how
    /// many streams accepted it.
    pub async fn broadcast_event(&self, name: &str, payload: Value) -> usize {
        let ids: Vec<String> = self
            .lock()
            .iter()
            .filter(|(_, s)| s.stream.is_some())
            .map(|(id, _)| id.clone())
            .collect();
        let mut delivered = 0;
        for id in ids {
            if self.push_event(&id, name, payload.clone()).await.is_some() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Remove a session and close its stream. Idempotent.
    pub fn remove(&self, id: &str) -> bool {
        let removed = self.lock().remove(id);
        match removed {
            Some(session) => {
                session.close();
                info!(
                    session_id = %id,
                    age_secs = session.created_at.elapsed().as_secs(),
                    "session removed"
                );
                true
            }
            None => false,
        }
    }

    /// Remove every expired (or stream-closed) session, close its sink and
    /// return the removed ids.
    ///
    /// The whole pass runs under the session mutex, so two sweeps never
    /// interleave and a concurrent `remove` of the same id is a no-op for
    /// whichever side comes second.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = Instant::now();
        let mut sessions = self.lock();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| !s.is_live(now, self.timeout))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            if let Some(session) = sessions.remove(id) {
                session.close();
            }
        }
        expired
    }

    /// Close and drop every session (shutdown).
    pub fn close_all(&self) -> usize {
        let drained: Vec<(String, Session)> = self.lock().drain().collect();
        for (_, session) in &drained {
            session.close();
        }
        drained.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock().len()
    }

    /// Start the background expiry sweep on a fixed interval.
    pub fn spawn_sweeper(&self, every: Duration) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                let expired = manager.sweep_expired();
                if !expired.is_empty() {
                    info!(count = expired.len(), sessions = ?expired, "expired sessions removed");
                } else {
                    debug!("session sweep: nothing expired");
                }
            }
        })
    }

    fn check_live(
        &self,
        sessions: &mut HashMap<String, Session>,
        id: &str,
        now: Instant,
    ) -> bool {
        match sessions.get(id) {
            Some(session) if session.is_live(now, self.timeout) => true,
            Some(_) => {
                if let Some(session) = sessions.remove(id) {
                    session.close();
                }
                debug!(session_id = %id, "session expired on access");
                false
            }
            None => false,
        }
    }

    // Nothing panics while holding the lock, but recover the map anyway.
    fn lock(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const TIMEOUT: Duration = Duration::from_secs(60);

    fn frame_text(frame: &Bytes) -> String {
        String::from_utf8(frame.to_vec()).expect("utf8")
    }

    #[test]
    fn frame_format_with_and_without_sequence() {
        let with = SseEvent {
            id: Some(3),
            event: "message".into(),
            data: json!({"a": 1}),
        };
        assert_eq!(with.to_frame(), "id: 3\nevent: message\ndata: {\"a\":1}\n\n");
        let without = SseEvent {
            id: None,
            event: "connected".into(),
            data: json!({"sessionId": "s"}),
        };
        assert_eq!(
            without.to_frame(),
            "event: connected\ndata: {\"sessionId\":\"s\"}\n\n"
        );
    }

    #[test]
    fn generated_ids_are_unique_and_not_sequential() {
        let a = SessionManager::generate_id();
        let b = SessionManager::generate_id();
        assert_ne!(a, b);
        assert!(a.len() > 32);
    }

    #[tokio::test(start_paused = true)]
    async fn session_expires_after_idle_timeout() {
        let manager = SessionManager::new(TIMEOUT);
        manager.create("s1");

        tokio::time::advance(TIMEOUT - Duration::from_millis(1)).await;
        assert!(manager.is_valid("s1"));

        tokio::time::advance(Duration::from_millis(2)).await;
        assert!(!manager.is_valid("s1"));
        // irrecoverable: touch does not revive it
        assert!(!manager.touch("s1"));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn touch_extends_the_activity_window() {
        let manager = SessionManager::new(TIMEOUT);
        manager.create("s1");
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(manager.touch("s1"));
        tokio::time::advance(Duration::from_secs(50)).await;
        assert!(manager.is_valid("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_and_closes_sinks() {
        let manager = SessionManager::new(TIMEOUT);
        manager.create("old");
        let (sink, _stream) = EventSink::channel(SinkOptions::default());
        assert!(manager.attach_stream("old", Arc::clone(&sink)));

        tokio::time::advance(Duration::from_secs(30)).await;
        manager.create("fresh");
        tokio::time::advance(Duration::from_secs(31)).await;

        let removed = manager.sweep_expired();
        assert_eq!(removed, vec!["old".to_string()]);
        assert!(sink.is_closed());
        assert!(manager.is_valid("fresh"));
        // a racing manual removal after the sweep is a no-op
        assert!(!manager.remove("old"));
        assert!(manager.sweep_expired().is_empty());
    }

    #[tokio::test]
    async fn pushed_events_are_sequenced_from_one() {
        let manager = SessionManager::new(TIMEOUT);
        let id = manager.create_session();
        let (sink, mut stream) = EventSink::channel(SinkOptions::default());
        assert!(manager.attach_stream(&id, sink.clone()));

        // unsequenced connected event does not consume a number
        assert!(sink.send_event("connected", json!({"sessionId": id}), None).await);
        for n in 0..3 {
            let seq = manager.push_event(&id, "message", json!({"n": n})).await;
            assert_eq!(seq, Some(n + 1));
        }

        let first = stream.next_frame().await.expect("frame");
        assert!(frame_text(&first).starts_with("event: connected\n"));
        for expected in 1..=3 {
            let frame = stream.next_frame().await.expect("frame");
            assert!(frame_text(&frame).starts_with(&format!("id: {expected}\n")));
        }
    }

    #[tokio::test]
    async fn concurrent_pushes_are_written_in_sequence_order() {
        let manager = SessionManager::new(TIMEOUT);
        let id = manager.create_session();
        let (sink, mut stream) = EventSink::channel(SinkOptions {
            capacity: 128,
            ..SinkOptions::default()
        });
        manager.attach_stream(&id, sink);

        let mut tasks = Vec::new();
        for n in 0..20 {
            let manager = manager.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                manager.push_event(&id, "message", json!(n)).await
            }));
        }
        for task in tasks {
            assert!(task.await.expect("join").is_some());
        }

        for expected in 1..=20 {
            let frame = stream.next_frame().await.expect("frame");
            assert!(frame_text(&frame).starts_with(&format!("id: {expected}\n")));
        }
    }

    #[tokio::test]
    async fn closed_sink_drops_events_and_deregisters_session() {
        let manager = SessionManager::new(TIMEOUT);
        let id = manager.create_session();
        let (sink, stream) = EventSink::channel(SinkOptions::default());
        manager.attach_stream(&id, sink.clone());

        drop(stream); // client went away
        assert!(sink.is_closed());
        assert!(!sink.send_event("message", json!(1), None).await);
        assert_eq!(manager.push_event(&id, "message", json!(1)).await, None);
        assert!(!manager.is_valid(&id));
    }

    #[tokio::test]
    async fn close_ends_the_stream() {
        let (sink, mut stream) = EventSink::channel(SinkOptions::default());
        sink.close();
        assert!(stream.next_frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_stream_emits_keep_alive_comments() {
        let (_sink, mut stream) = EventSink::channel(SinkOptions {
            keep_alive: Duration::from_secs(15),
            ..SinkOptions::default()
        });
        let frame = stream.next_frame().await.expect("keep-alive");
        assert_eq!(frame_text(&frame), ": keep-alive\n\n");
    }

    #[tokio::test]
    async fn close_all_closes_every_stream() {
        let manager = SessionManager::new(TIMEOUT);
        let mut sinks = Vec::new();
        for _ in 0..3 {
            let id = manager.create_session();
            let (sink, stream) = EventSink::channel(SinkOptions::default());
            manager.attach_stream(&id, sink.clone());
            sinks.push((sink, stream));
        }
        assert_eq!(manager.broadcast_event("shutdown", json!({})).await, 3);
        assert_eq!(manager.close_all(), 3);
        assert_eq!(manager.session_count(), 0);
        assert!(sinks.iter().all(|(sink, _)| sink.is_closed()));
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_client_is_cut_off_and_deregistered() {
        let manager = SessionManager::new(TIMEOUT);
        let id = manager.create_session();
        let (sink, _stream) = EventSink::channel(SinkOptions {
            capacity: 1,
            send_timeout: Duration::from_secs(5),
            ..SinkOptions::default()
        });
        assert!(manager.attach_stream(&id, Arc::clone(&sink)));

        // fills the one-frame queue; nobody drains the stream
        assert_eq!(manager.push_event(&id, "message", json!(1)).await, Some(1));
        // waits out the send timeout, then gives up on the client
        assert_eq!(manager.push_event(&id, "message", json!(2)).await, None);

        assert!(sink.is_closed());
        assert!(!manager.is_valid(&id));
        assert_eq!(manager.session_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweeper_removes_expired_sessions() {
        let manager = SessionManager::new(TIMEOUT);
        manager.create("idle");
        let sweeper = manager.spawn_sweeper(Duration::from_secs(10));
        // let the sweeper arm its interval before moving the clock
        tokio::task::yield_now().await;

        tokio::time::advance(TIMEOUT + Duration::from_secs(10)).await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert_eq!(manager.session_count(), 0);
        sweeper.abort();
    }
}
