//! Session registry and fan-out to every connected client.
//!
//! Uses a single tokio broadcast channel of pre-encoded frames, so a send is
//! O(1) regardless of the number of sessions and never waits on a slow
//! consumer. Each session holds an independent receiver that buffers up to
//! `capacity` frames.
//!
//! Overflow policy: drop-oldest. A session that falls more than `capacity`
//! frames behind loses the oldest frames; its connection task sees
//! `RecvError::Lagged`, records it here and asks the engine for a fresh
//! snapshot, so the client never silently diverges.
//!
//! Reference: Patterson & Hennessy, Section 6.4 — Interconnection Networks

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{ProtocolError, ServerMessage};

/// Opaque handle identifying one connected client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Session lifecycle: `Connecting → Synced → Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered, `initial_board` not yet delivered
    Connecting,
    /// Snapshot delivered; mutation requests are accepted
    Synced,
    Disconnected,
}

/// A registered session.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    /// Client network address, when known
    pub origin: Option<String>,
    pub connected_at: SystemTime,
    pub state: SessionState,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub resyncs: u64,
    pub active_sessions: usize,
}

/// Broadcast counters, atomic so `broadcast()` never takes a lock.
#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
    resyncs: AtomicU64,
}

/// Frame receiver handed to each session.
pub type FrameReceiver = broadcast::Receiver<Arc<str>>;

/// Tracks connected sessions and their outbound channels.
pub struct SessionRegistry {
    sender: broadcast::Sender<Arc<str>>,
    sessions: RwLock<HashMap<SessionId, SessionInfo>>,
    /// Frames buffered per session before drop-oldest kicks in
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl SessionRegistry {
    /// Create a registry whose sessions each buffer up to `capacity` frames.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            sessions: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a new session in the `Connecting` state.
    ///
    /// The receiver only sees frames broadcast after this call.
    pub async fn register(&self, origin: Option<String>) -> (SessionId, FrameReceiver) {
        let id = SessionId::new();
        let info = SessionInfo {
            id,
            origin,
            connected_at: SystemTime::now(),
            state: SessionState::Connecting,
        };
        let mut sessions = self.sessions.write().await;
        sessions.insert(id, info);
        (id, self.sender.subscribe())
    }

    /// Remove a session. Calling it again for the same id is a no-op.
    pub async fn unregister(&self, id: &SessionId) -> Option<SessionInfo> {
        let mut sessions = self.sessions.write().await;
        sessions.remove(id).map(|mut info| {
            info.state = SessionState::Disconnected;
            info
        })
    }

    /// Fresh receiver for a registered session that fell behind.
    pub async fn resubscribe(&self, id: &SessionId) -> Option<FrameReceiver> {
        let sessions = self.sessions.read().await;
        if sessions.contains_key(id) {
            self.stats.resyncs.fetch_add(1, Ordering::Relaxed);
            Some(self.sender.subscribe())
        } else {
            None
        }
    }

    /// Move a session to `Synced`. Returns `false` for unknown sessions.
    pub async fn mark_synced(&self, id: &SessionId) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.get_mut(id) {
            Some(info) => {
                info.state = SessionState::Synced;
                true
            }
            None => false,
        }
    }

    /// Current state; `None` once the session is unregistered.
    pub async fn state(&self, id: &SessionId) -> Option<SessionState> {
        self.sessions.read().await.get(id).map(|info| info.state)
    }

    pub async fn info(&self, id: &SessionId) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).cloned()
    }

    /// Encode `msg` once and deliver it to every registered session.
    ///
    /// Returns the number of receivers the frame was queued for.
    pub fn broadcast(&self, msg: &ServerMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(msg.encode_shared()?))
    }

    /// Deliver a pre-encoded frame. Fully lock-free.
    pub fn broadcast_raw(&self, frame: Arc<str>) -> usize {
        let count = self.sender.send(frame).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Record `dropped` frames lost by a lagging session.
    pub fn record_lag(&self, dropped: u64) {
        self.stats.messages_dropped.fetch_add(dropped, Ordering::Relaxed);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn sessions(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            resyncs: self.stats.resyncs.load(Ordering::Relaxed),
            active_sessions: self.session_count().await,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CellUpdate, Color};
    use tokio::sync::broadcast::error::RecvError;

    fn delta(x: u32) -> ServerMessage {
        ServerMessage::ChangeColor(CellUpdate {
            x,
            y: 0,
            color: Color::white(),
        })
    }

    #[tokio::test]
    async fn test_register_unregister() {
        let registry = SessionRegistry::new(16);
        let (id, _rx) = registry.register(Some("127.0.0.1:1".into())).await;

        assert_eq!(registry.session_count().await, 1);
        assert_eq!(registry.state(&id).await, Some(SessionState::Connecting));

        let listed = registry.sessions().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].origin.as_deref(), Some("127.0.0.1:1"));

        let info = registry.unregister(&id).await.unwrap();
        assert_eq!(info.state, SessionState::Disconnected);
        assert_eq!(info.origin.as_deref(), Some("127.0.0.1:1"));
        assert_eq!(registry.session_count().await, 0);

        // Idempotent
        assert!(registry.unregister(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_mark_synced() {
        let registry = SessionRegistry::new(16);
        let (id, _rx) = registry.register(None).await;

        assert!(registry.mark_synced(&id).await);
        assert_eq!(registry.state(&id).await, Some(SessionState::Synced));
        assert!(!registry.mark_synced(&SessionId::new()).await);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_session() {
        let registry = SessionRegistry::new(16);
        let (_a, mut rx_a) = registry.register(None).await;
        let (_b, mut rx_b) = registry.register(None).await;
        let (_c, mut rx_c) = registry.register(None).await;

        let count = registry.broadcast(&delta(1)).unwrap();
        assert_eq!(count, 3);

        let expected = delta(1).encode().unwrap();
        for rx in [&mut rx_a, &mut rx_b, &mut rx_c] {
            assert_eq!(&*rx.recv().await.unwrap(), expected.as_str());
        }
    }

    #[tokio::test]
    async fn test_late_session_misses_earlier_frames() {
        let registry = SessionRegistry::new(16);
        registry.broadcast(&delta(1)).unwrap();

        let (_id, mut rx) = registry.register(None).await;
        registry.broadcast(&delta(2)).unwrap();

        let frame = rx.recv().await.unwrap();
        assert_eq!(ServerMessage::decode(&frame).unwrap(), delta(2));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_session_drops_oldest_without_blocking() {
        let registry = SessionRegistry::new(4);
        let (id, mut slow) = registry.register(None).await;

        for x in 0..10 {
            registry.broadcast(&delta(x)).unwrap();
        }

        match slow.recv().await {
            Err(RecvError::Lagged(n)) => {
                assert_eq!(n, 6);
                registry.record_lag(n);
            }
            other => panic!("expected lag, got {other:?}"),
        }
        // Oldest retained frame is the 7th broadcast
        let frame = slow.recv().await.unwrap();
        assert_eq!(ServerMessage::decode(&frame).unwrap(), delta(6));

        let mut fresh = registry.resubscribe(&id).await.unwrap();
        assert!(fresh.try_recv().is_err());

        let stats = registry.stats().await;
        assert_eq!(stats.messages_sent, 10);
        assert_eq!(stats.messages_dropped, 6);
        assert_eq!(stats.resyncs, 1);
        assert_eq!(stats.active_sessions, 1);
    }

    #[tokio::test]
    async fn test_resubscribe_unknown_session() {
        let registry = SessionRegistry::new(4);
        assert!(registry.resubscribe(&SessionId::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_with_no_sessions() {
        let registry = SessionRegistry::new(8);
        assert_eq!(registry.broadcast(&delta(0)).unwrap(), 0);
        assert_eq!(registry.capacity(), 8);
    }
}
