//! Frontend session registry.
//!
//! Every attached frontend gets a mailbox session: a ring buffer of recent
//! frames for Last-Event-ID replay plus a broadcast channel for live
//! delivery. SSE frontends survive reconnects this way; streamable-HTTP
//! frontends use the same mailbox for their GET channel. Stale sessions are
//! swept by a background task.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::response::sse::Event;
use tokio::sync::broadcast;

use crate::bridge::proxy::{FrontendSink, ProxyEngine};
use crate::protocol::Message;

/// Maximum number of frames kept for replay per session.
const HISTORY_SIZE: usize = 100;

/// Sessions idle longer than this are cleaned up.
const SESSION_TIMEOUT: Duration = Duration::from_secs(3600);

/// Sweep interval for stale sessions.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60);

/// A buffered SSE event with an id for replay support.
#[derive(Clone, Debug)]
pub struct BufferedEvent {
    /// Monotonically increasing per session.
    pub id: u64,
    /// SSE event name (`message`, `endpoint`).
    pub event_type: String,
    /// Payload.
    pub data: String,
}

impl BufferedEvent {
    #[must_use]
    pub fn to_sse_event(&self) -> Event {
        Event::default()
            .id(self.id.to_string())
            .event(self.event_type.clone())
            .data(self.data.clone())
    }
}

/// One frontend session: mailbox plus live broadcast.
pub struct FrontendSession {
    pub id: String,
    tx: broadcast::Sender<BufferedEvent>,
    history: Mutex<VecDeque<BufferedEvent>>,
    next_event_id: AtomicU64,
    last_active: Mutex<Instant>,
    /// Engine this session is attached to, for detach on removal.
    engine: RwLock<Option<Arc<ProxyEngine>>>,
}

impl FrontendSession {
    #[must_use]
    pub fn new(id: String) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            id,
            tx,
            history: Mutex::new(VecDeque::with_capacity(HISTORY_SIZE)),
            next_event_id: AtomicU64::new(1),
            last_active: Mutex::new(Instant::now()),
            engine: RwLock::new(None),
        }
    }

    /// Remember the engine this session belongs to.
    pub fn bind_engine(&self, engine: &Arc<ProxyEngine>) {
        if let Ok(mut slot) = self.engine.write() {
            *slot = Some(Arc::clone(engine));
        }
    }

    #[must_use]
    pub fn engine(&self) -> Option<Arc<ProxyEngine>> {
        self.engine.read().ok().and_then(|e| e.clone())
    }

    /// Queue an event: stored for replay and broadcast to live listeners.
    pub fn push_event(&self, event_type: impl Into<String>, data: impl Into<String>) -> u64 {
        let id = self.next_event_id.fetch_add(1, Ordering::SeqCst);
        let event = BufferedEvent { id, event_type: event_type.into(), data: data.into() };

        if let Ok(mut history) = self.history.lock() {
            if history.len() >= HISTORY_SIZE {
                history.pop_front();
            }
            history.push_back(event.clone());
        }

        let _ = self.tx.send(event);
        self.touch();
        id
    }

    /// Queue one protocol frame as a `message` event.
    pub fn push_message(&self, message: &Message) -> bool {
        match message.to_json() {
            Ok(data) => {
                self.push_event("message", data);
                true
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id, error = %e, "failed to serialize frame");
                false
            }
        }
    }

    /// Events after the given id, for replay on reconnection.
    #[must_use]
    pub fn events_after(&self, last_event_id: u64) -> Vec<BufferedEvent> {
        self.history
            .lock()
            .map(|history| history.iter().filter(|e| e.id > last_event_id).cloned().collect())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BufferedEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn is_stale(&self) -> bool {
        self.last_active.lock().map(|t| t.elapsed() > SESSION_TIMEOUT).unwrap_or(true)
    }

    pub fn touch(&self) {
        if let Ok(mut slot) = self.last_active.lock() {
            *slot = Instant::now();
        }
    }
}

impl std::fmt::Debug for FrontendSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrontendSession").field("id", &self.id).finish()
    }
}

/// [`FrontendSink`] adapter: the engine delivers server-to-client frames
/// into the session mailbox.
pub struct SessionSink(pub Arc<FrontendSession>);

#[async_trait]
impl FrontendSink for SessionSink {
    async fn push(&self, message: Message) -> bool {
        self.0.push_message(&message)
    }
}

/// Registry of live frontend sessions.
#[derive(Clone)]
pub struct SessionManager {
    sessions: Arc<RwLock<HashMap<String, Arc<FrontendSession>>>>,
}

impl SessionManager {
    #[must_use]
    pub fn new() -> Self {
        Self { sessions: Arc::new(RwLock::new(HashMap::new())) }
    }

    /// Create a session and attach it to the given engine.
    #[must_use]
    pub fn create(&self, engine: &Arc<ProxyEngine>) -> Arc<FrontendSession> {
        let id = uuid::Uuid::new_v4().to_string();
        let session = Arc::new(FrontendSession::new(id.clone()));
        session.bind_engine(engine);
        engine.attach(&id, Arc::new(SessionSink(Arc::clone(&session))));

        if let Ok(mut sessions) = self.sessions.write() {
            sessions.insert(id, Arc::clone(&session));
        }
        tracing::debug!(session_id = %session.id, "created frontend session");
        session
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<FrontendSession>> {
        self.sessions.read().ok().and_then(|sessions| sessions.get(id).cloned())
    }

    /// Existing session by id, or a fresh one bound to the engine.
    #[must_use]
    pub fn get_or_create(&self, id: Option<&str>, engine: &Arc<ProxyEngine>) -> Arc<FrontendSession> {
        if let Some(id) = id {
            if let Some(session) = self.get(id) {
                session.touch();
                return session;
            }
        }
        self.create(engine)
    }

    /// Remove and detach one session.
    pub async fn remove(&self, id: &str) -> bool {
        let session = self
            .sessions
            .write()
            .ok()
            .and_then(|mut sessions| sessions.remove(id));
        match session {
            Some(session) => {
                if let Some(engine) = session.engine() {
                    engine.detach(id).await;
                }
                tracing::debug!(session_id = %id, "removed frontend session");
                true
            }
            None => false,
        }
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.read().map(|s| s.len()).unwrap_or(0)
    }

    /// Close every session: detaches each from its engine and drops the
    /// broadcast senders, which ends the open SSE/GET streams built on them.
    /// Without this, one live stream keeps graceful shutdown waiting forever.
    pub async fn close_all(&self) -> usize {
        let ids: Vec<String> = self
            .sessions
            .read()
            .map(|sessions| sessions.keys().cloned().collect())
            .unwrap_or_default();
        let count = ids.len();
        for id in ids {
            self.remove(&id).await;
        }
        if count > 0 {
            tracing::info!(count, "closed all frontend sessions");
        }
        count
    }

    /// Sweep sessions idle past the timeout.
    pub async fn cleanup_stale(&self) -> usize {
        let stale: Vec<String> = self
            .sessions
            .read()
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|(_, s)| s.is_stale())
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default();
        let count = stale.len();
        for id in stale {
            self.remove(&id).await;
        }
        count
    }

    /// Start the background sweep task.
    pub fn start_cleanup_task(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                let cleaned = manager.cleanup_stale().await;
                if cleaned > 0 {
                    tracing::debug!(count = cleaned, "cleaned up stale sessions");
                }
            }
        });
    }
}

impl Default for SessionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager").field("count", &self.count()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{RequestId, Response};
    use serde_json::json;

    fn test_engine() -> Arc<ProxyEngine> {
        ProxyEngine::aggregate(Vec::new(), Arc::new(crate::bridge::aggregate::Aggregator::new(
            crate::config::BridgeSettings::default(),
        )))
    }

    #[tokio::test]
    async fn push_and_replay() {
        let session = FrontendSession::new("test".into());
        let id1 = session.push_event("message", r#"{"n":1}"#);
        let id2 = session.push_event("message", r#"{"n":2}"#);
        let id3 = session.push_event("message", r#"{"n":3}"#);
        assert_eq!((id1, id2, id3), (1, 2, 3));

        let events = session.events_after(1);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].id, 2);
    }

    #[tokio::test]
    async fn ring_buffer_evicts_oldest() {
        let session = FrontendSession::new("test".into());
        for n in 0..150 {
            session.push_event("message", format!(r#"{{"n":{n}}}"#));
        }
        let events = session.events_after(0);
        assert_eq!(events.len(), HISTORY_SIZE);
        assert_eq!(events[0].id, 51);
    }

    #[tokio::test]
    async fn manager_lookup_and_remove() {
        let manager = SessionManager::new();
        let engine = test_engine();
        let session = manager.create(&engine);
        assert_eq!(manager.count(), 1);
        assert!(manager.get(&session.id).is_some());
        assert!(manager.get("nope").is_none());

        assert!(manager.remove(&session.id).await);
        assert_eq!(manager.count(), 0);
        assert!(!engine.has_frontends());
    }

    #[tokio::test]
    async fn close_all_ends_live_subscriptions() {
        let manager = SessionManager::new();
        let engine = test_engine();
        let session = manager.create(&engine);
        let mut rx = session.subscribe();
        session.push_event("message", r#"{"n":1}"#);
        drop(session);

        assert_eq!(manager.close_all().await, 1);
        assert_eq!(manager.count(), 0);
        assert!(!engine.has_frontends());

        // The buffered event drains, then the channel reports closed, which
        // is what ends an open event stream.
        assert!(rx.recv().await.is_ok());
        assert!(matches!(
            rx.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn sink_delivers_serialized_frames() {
        let session = Arc::new(FrontendSession::new("s".into()));
        let sink = SessionSink(Arc::clone(&session));
        let delivered = sink
            .push(Response::ok(RequestId::Number(1), json!({"ok": true})).into())
            .await;
        assert!(delivered);
        let events = session.events_after(0);
        assert_eq!(events.len(), 1);
        assert!(events[0].data.contains("\"ok\":true"));
    }
}
