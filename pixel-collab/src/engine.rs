//! Synchronization engine: the single serialization point for the board.
//!
//! Architecture:
//! ```text
//!  session tasks                  engine task                 writer task
//! ┌───────────┐  Command   ┌──────────────────────┐  WriteJob  ┌─────────────┐
//! │ gateway A │ ─────────► │ Board (owned)        │ ─────────► │ BoardStore  │
//! │ gateway B │ ─────────► │  1. validate         │   FIFO     │ UpdateLog   │
//! └─────▲─────┘   mpsc     │  2. set_cell         │            │ retry set   │
//!       │                  │  3. issue persist    │            └─────────────┘
//!       │                  │  4. broadcast delta  │
//!       │                  └──────────┬───────────┘
//!       │        frames               │
//!       └───────────────── SessionRegistry (broadcast channel)
//! ```
//!
//! Commands are processed strictly one at a time, in arrival order across all
//! sessions. That total order is what makes last-write-wins well defined and
//! what makes a snapshot reflect every mutation accepted before it.
//!
//! Persistence is write-behind: the engine hands each accepted mutation to a
//! single FIFO writer and moves on. A failed write never rolls back the
//! in-memory board or suppresses the broadcast; the cell is kept in a retry
//! set (newer writes to the same cell supersede it) and retried periodically.
//!
//! The writer queue is bounded. Without an update log, writes that find it
//! full spill into an overflow map keyed by coordinate, so a slow store costs
//! at most one entry per cell. With an update log every record must be kept,
//! and the engine waits for queue space instead.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::board::{Board, BoardConfig, InitReport, MutationError, StartupError};
use crate::broadcast::{FrameReceiver, SessionId, SessionRegistry, SessionState};
use crate::protocol::{CellUpdate, ChangeColorRequest, Color, Grid, ServerMessage};
use crate::storage::{AuditEntry, BoardStore, StoreError, UpdateLog};

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub board: BoardConfig,
    /// Frames buffered per session before drop-oldest
    pub broadcast_capacity: usize,
    /// Commands queued for the engine before senders wait
    pub command_capacity: usize,
    /// Persistence jobs queued for the writer before spilling or waiting
    pub write_capacity: usize,
    /// How often failed cell writes are retried
    pub retry_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            board: BoardConfig::default(),
            broadcast_capacity: 256,
            command_capacity: 1024,
            write_capacity: 4096,
            retry_interval: Duration::from_secs(5),
        }
    }
}

/// Engine statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub accepted: u64,
    pub rejected: u64,
    pub persisted: u64,
    pub persist_failures: u64,
    pub pending_retries: u64,
    /// Writes that found the writer queue full and went to the overflow map
    pub spilled_writes: u64,
    pub active_sessions: usize,
}

/// Errors returned through [`EngineHandle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The request was validated and refused
    Rejected(MutationError),
    /// The engine task has shut down
    Stopped,
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected(e) => write!(f, "Mutation rejected: {e}"),
            Self::Stopped => write!(f, "Engine stopped"),
        }
    }
}

impl std::error::Error for EngineError {}

/// A session's view of the board at registration time plus the stream of
/// every delta accepted after it.
pub struct Subscription {
    pub session_id: SessionId,
    pub snapshot: Grid,
    pub receiver: FrameReceiver,
}

enum Command {
    Connect {
        origin: Option<String>,
        reply: oneshot::Sender<Subscription>,
    },
    Submit {
        session: SessionId,
        request: ChangeColorRequest,
        reply: oneshot::Sender<Result<CellUpdate, MutationError>>,
    },
    Resync {
        session: SessionId,
        reply: oneshot::Sender<Option<Subscription>>,
    },
    Disconnect {
        session: SessionId,
    },
    Snapshot {
        reply: oneshot::Sender<Grid>,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<EngineStats>,
    },
    Shutdown,
}

/// Counters shared between the engine and its writer.
#[derive(Default)]
struct PersistCounters {
    persisted: AtomicU64,
    failures: AtomicU64,
    pending: AtomicU64,
    spilled: AtomicU64,
}

/// Cell writes that did not fit in the writer queue, keyed by coordinate.
///
/// Only ever non-empty while the queue holds nothing newer than its entries:
/// the engine keeps spilling until the writer has drained it.
type Overflow = Arc<Mutex<BTreeMap<(u32, u32), Color>>>;

fn lock_overflow(overflow: &Overflow) -> MutexGuard<'_, BTreeMap<(u32, u32), Color>> {
    overflow.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cloneable handle used by connection tasks to talk to the engine.
#[derive(Clone)]
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    registry: Arc<SessionRegistry>,
}

impl EngineHandle {
    /// Register a session and take its snapshot in one step.
    pub async fn connect(&self, origin: Option<String>) -> Result<Subscription, EngineError> {
        self.request(|reply| Command::Connect { origin, reply }).await
    }

    /// Mark a session `Synced` once its `initial_board` has been delivered.
    pub async fn mark_synced(&self, session: SessionId) -> bool {
        self.registry.mark_synced(&session).await
    }

    /// Submit a mutation request and wait for its outcome.
    pub async fn submit(
        &self,
        session: SessionId,
        request: ChangeColorRequest,
    ) -> Result<CellUpdate, EngineError> {
        self.request(|reply| Command::Submit {
            session,
            request,
            reply,
        })
        .await?
        .map_err(EngineError::Rejected)
    }

    /// Swap a lagging session onto a fresh receiver with a fresh snapshot.
    ///
    /// `None` if the session is no longer registered.
    pub async fn resync(&self, session: SessionId) -> Result<Option<Subscription>, EngineError> {
        self.request(|reply| Command::Resync { session, reply }).await
    }

    pub async fn disconnect(&self, session: SessionId) {
        if self.commands.send(Command::Disconnect { session }).await.is_err() {
            // Engine gone: make sure the registry entry does not leak
            self.registry.unregister(&session).await;
        }
    }

    pub async fn snapshot(&self) -> Result<Grid, EngineError> {
        self.request(|reply| Command::Snapshot { reply }).await
    }

    /// Wait until every mutation accepted before this call has been handed
    /// to the store (pending retries get one more attempt).
    pub async fn flush(&self) -> Result<(), EngineError> {
        self.request(|reply| Command::Flush { reply }).await
    }

    pub async fn stats(&self) -> Result<EngineStats, EngineError> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Stop the engine after the commands already queued.
    pub async fn shutdown(&self) {
        let _ = self.commands.send(Command::Shutdown).await;
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| EngineError::Stopped)?;
        rx.await.map_err(|_| EngineError::Stopped)
    }
}

/// The engine task state.
pub struct SyncEngine {
    board: Board,
    registry: Arc<SessionRegistry>,
    writer: mpsc::Sender<WriteJob>,
    overflow: Overflow,
    /// Audit records cannot be coalesced, so a full queue means waiting
    audit_enabled: bool,
    counters: Arc<PersistCounters>,
    accepted: u64,
    rejected: u64,
}

impl SyncEngine {
    /// Load the board from `store` and spawn the engine and writer tasks.
    ///
    /// Fails if the store cannot be scanned or provisioned; the caller must
    /// not serve in that case.
    pub async fn start(
        config: EngineConfig,
        store: Arc<dyn BoardStore>,
        update_log: Option<Arc<dyn UpdateLog>>,
    ) -> Result<(EngineHandle, JoinHandle<()>), StartupError> {
        let board_config = config.board.clone();
        let init_store = store.clone();
        let (board, report) =
            tokio::task::spawn_blocking(move || Board::initialize(&board_config, init_store.as_ref()))
                .await
                .map_err(|e| StartupError::Persistence(StoreError::Unavailable(e.to_string())))??;

        log_init(&config.board, &report);
        Ok(Self::spawn(config, board, store, update_log))
    }

    /// Spawn the engine around an already-initialized board.
    pub fn spawn(
        config: EngineConfig,
        board: Board,
        store: Arc<dyn BoardStore>,
        update_log: Option<Arc<dyn UpdateLog>>,
    ) -> (EngineHandle, JoinHandle<()>) {
        let registry = Arc::new(SessionRegistry::new(config.broadcast_capacity));
        let counters = Arc::new(PersistCounters::default());
        let overflow = Overflow::default();
        let (writer_tx, writer_rx) = mpsc::channel(config.write_capacity.max(1));
        let (command_tx, command_rx) = mpsc::channel(config.command_capacity.max(1));
        let audit_enabled = update_log.is_some();

        let writer = PersistenceWriter {
            store,
            update_log,
            pending: BTreeMap::new(),
            overflow: overflow.clone(),
            flushes: Vec::new(),
            counters: counters.clone(),
            retry_interval: config.retry_interval,
        };
        tokio::spawn(writer.run(writer_rx));

        let engine = SyncEngine {
            board,
            registry: registry.clone(),
            writer: writer_tx,
            overflow,
            audit_enabled,
            counters,
            accepted: 0,
            rejected: 0,
        };
        let task = tokio::spawn(engine.run(command_rx));

        (
            EngineHandle {
                commands: command_tx,
                registry,
            },
            task,
        )
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        while let Some(command) = commands.recv().await {
            match command {
                Command::Connect { origin, reply } => {
                    let subscription = self.connect(origin).await;
                    if let Err(subscription) = reply.send(subscription) {
                        // Caller went away before receiving its session
                        self.registry.unregister(&subscription.session_id).await;
                    }
                }
                Command::Submit {
                    session,
                    request,
                    reply,
                } => {
                    let outcome = self.apply(session, request).await;
                    let _ = reply.send(outcome);
                }
                Command::Resync { session, reply } => {
                    let subscription =
                        self.registry.resubscribe(&session).await.map(|receiver| Subscription {
                            session_id: session,
                            snapshot: self.board.get_snapshot(),
                            receiver,
                        });
                    let _ = reply.send(subscription);
                }
                Command::Disconnect { session } => {
                    if let Some(info) = self.registry.unregister(&session).await {
                        log::debug!(
                            "Session {session} unregistered ({})",
                            info.origin.as_deref().unwrap_or("unknown origin")
                        );
                    }
                }
                Command::Snapshot { reply } => {
                    let _ = reply.send(self.board.get_snapshot());
                }
                Command::Flush { reply } => {
                    if self.writer.send(WriteJob::Flush(reply)).await.is_err() {
                        log::error!("Persistence writer is gone; flush cannot complete");
                    }
                }
                Command::Stats { reply } => {
                    let _ = reply.send(self.stats().await);
                }
                Command::Shutdown => break,
            }
        }
        log::info!(
            "Sync engine stopped ({} accepted, {} rejected)",
            self.accepted,
            self.rejected
        );
    }

    /// Register and snapshot inside the same command so the session sees
    /// every later delta and none of the earlier ones.
    async fn connect(&mut self, origin: Option<String>) -> Subscription {
        let (session_id, receiver) = self.registry.register(origin).await;
        Subscription {
            session_id,
            snapshot: self.board.get_snapshot(),
            receiver,
        }
    }

    /// Validate, apply, issue persistence, then broadcast.
    async fn apply(
        &mut self,
        session: SessionId,
        request: ChangeColorRequest,
    ) -> Result<CellUpdate, MutationError> {
        match self.try_apply(session, &request).await {
            Ok(update) => {
                self.accepted += 1;
                log::debug!(
                    "Session {session} set ({}, {}) to {}",
                    update.x,
                    update.y,
                    update.color
                );
                Ok(update)
            }
            Err(e) => {
                self.rejected += 1;
                log::warn!("Dropped change_color from session {session}: {e}");
                Err(e)
            }
        }
    }

    async fn try_apply(
        &mut self,
        session: SessionId,
        request: &ChangeColorRequest,
    ) -> Result<CellUpdate, MutationError> {
        let info = match self.registry.info(&session).await {
            Some(info) if info.state == SessionState::Synced => info,
            _ => return Err(MutationError::NotSynced),
        };

        let (x, y) = self.board.check_bounds(request.x, request.y)?;
        let color = Color::parse(&request.color)
            .map_err(|_| MutationError::InvalidColor(request.color.clone()))?;
        let previous = self.board.set_cell(request.x, request.y, color.clone())?;
        let update = CellUpdate { x, y, color };

        let audit = AuditEntry::new(x, y, update.color.clone())
            .with_previous(previous)
            .with_origin(info.origin);
        self.enqueue_write(update.clone(), audit).await;

        if let Err(e) = self
            .registry
            .broadcast(&ServerMessage::ChangeColor(update.clone()))
        {
            log::error!("Failed to encode delta for ({x}, {y}): {e}");
        }

        Ok(update)
    }

    /// Hand an accepted mutation to the writer, spilling into the overflow
    /// map when the queue is full and no update log needs the record.
    async fn enqueue_write(&mut self, update: CellUpdate, audit: AuditEntry) {
        let (x, y) = (update.x, update.y);

        if self.audit_enabled {
            let job = WriteJob::Persist { update, audit };
            if self.writer.send(job).await.is_err() {
                log::error!("Persistence writer is gone; ({x}, {y}) will not be persisted");
            }
            return;
        }
        self.queue_or_spill(update, audit);
    }

    fn queue_or_spill(&self, update: CellUpdate, audit: AuditEntry) {
        let (x, y) = (update.x, update.y);
        let mut overflow = lock_overflow(&self.overflow);
        if overflow.is_empty() {
            let job = WriteJob::Persist {
                update: update.clone(),
                audit,
            };
            match self.writer.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Closed(_)) => {
                    log::error!("Persistence writer is gone; ({x}, {y}) will not be persisted");
                    return;
                }
                Err(TrySendError::Full(_)) => {
                    log::debug!("Writer queue full; spilling ({x}, {y}) to overflow");
                }
            }
        }
        overflow.insert((x, y), update.color);
        self.counters.spilled.fetch_add(1, Ordering::Relaxed);
    }

    async fn stats(&self) -> EngineStats {
        EngineStats {
            accepted: self.accepted,
            rejected: self.rejected,
            persisted: self.counters.persisted.load(Ordering::Relaxed),
            persist_failures: self.counters.failures.load(Ordering::Relaxed),
            pending_retries: self.counters.pending.load(Ordering::Relaxed),
            spilled_writes: self.counters.spilled.load(Ordering::Relaxed),
            active_sessions: self.registry.session_count().await,
        }
    }
}

fn log_init(config: &BoardConfig, report: &InitReport) {
    if report.filled == 0 {
        log::info!(
            "Board data already exists: loaded {} cells ({}×{})",
            report.loaded,
            config.width,
            config.height
        );
    } else {
        log::info!(
            "Board provisioned {}×{}: {} cells loaded, {} filled with {}",
            config.width,
            config.height,
            report.loaded,
            report.filled,
            config.default_color
        );
    }
}

enum WriteJob {
    Persist { update: CellUpdate, audit: AuditEntry },
    Flush(oneshot::Sender<()>),
}

/// Single consumer of persistence work, so writes reach the store in the
/// order the engine accepted them.
struct PersistenceWriter {
    store: Arc<dyn BoardStore>,
    update_log: Option<Arc<dyn UpdateLog>>,
    /// Cells whose last write failed, keyed by coordinate
    pending: BTreeMap<(u32, u32), Color>,
    overflow: Overflow,
    /// Flushes waiting for the queue and the overflow map to drain
    flushes: Vec<oneshot::Sender<()>>,
    counters: Arc<PersistCounters>,
    retry_interval: Duration,
}

impl PersistenceWriter {
    async fn run(mut self, mut jobs: mpsc::Receiver<WriteJob>) {
        let mut ticker = tokio::time::interval(self.retry_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                job = jobs.recv() => match job {
                    Some(WriteJob::Persist { update, audit }) => self.persist(update, audit).await,
                    Some(WriteJob::Flush(reply)) => self.flushes.push(reply),
                    None => break,
                },
                _ = ticker.tick() => {
                    if !self.pending.is_empty() {
                        self.retry_pending().await;
                    }
                }
            }
            self.settle(&jobs).await;
        }

        self.settle(&jobs).await;
        self.retry_pending().await;
        if !self.pending.is_empty() {
            log::error!(
                "Persistence writer exiting with {} unpersisted cells",
                self.pending.len()
            );
        }
    }

    /// Once the queue is empty, write spilled cells and answer the flushes
    /// that were waiting on them.
    async fn settle(&mut self, jobs: &mpsc::Receiver<WriteJob>) {
        let spilled = {
            let mut overflow = lock_overflow(&self.overflow);
            // Queued jobs are older than anything spilled
            if !jobs.is_empty() {
                return;
            }
            std::mem::take(&mut *overflow)
        };

        if !spilled.is_empty() {
            log::debug!("Writing {} spilled cells", spilled.len());
        }
        for ((x, y), color) in spilled {
            self.persist_cell(x, y, color).await;
        }

        if !self.flushes.is_empty() {
            self.retry_pending().await;
            for reply in std::mem::take(&mut self.flushes) {
                let _ = reply.send(());
            }
        }
    }

    async fn persist(&mut self, update: CellUpdate, audit: AuditEntry) {
        self.persist_cell(update.x, update.y, update.color).await;

        if let Some(update_log) = &self.update_log {
            let update_log = update_log.clone();
            let result = tokio::task::spawn_blocking(move || update_log.append(audit))
                .await
                .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())));
            match result {
                Ok(seq) => log::trace!("Update log record {seq} appended"),
                Err(e) => log::error!("Failed to append update log record: {e}"),
            }
        }
    }

    async fn persist_cell(&mut self, x: u32, y: u32, color: Color) {
        // A newer write supersedes any failed one for the same cell
        self.pending.remove(&(x, y));

        match self.upsert(x, y, color.clone()).await {
            Ok(()) => {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                log::error!("Failed to persist ({x}, {y}) = {color}: {e}; queued for retry");
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                self.pending.insert((x, y), color);
            }
        }
        self.counters
            .pending
            .store(self.pending.len() as u64, Ordering::Relaxed);
    }

    async fn retry_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }

        let pending = std::mem::take(&mut self.pending);
        let total = pending.len();
        for ((x, y), color) in pending {
            if let Err(e) = self.upsert(x, y, color.clone()).await {
                log::debug!("Retry of ({x}, {y}) failed: {e}");
                self.pending.insert((x, y), color);
            } else {
                self.counters.persisted.fetch_add(1, Ordering::Relaxed);
            }
        }

        let recovered = total - self.pending.len();
        if recovered > 0 {
            log::info!("Reconciled {recovered} of {total} unpersisted cells");
        }
        self.counters
            .pending
            .store(self.pending.len() as u64, Ordering::Relaxed);
    }

    async fn upsert(&self, x: u32, y: u32, color: Color) -> Result<(), StoreError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.upsert(x, y, &color))
            .await
            .unwrap_or_else(|e| Err(StoreError::Unavailable(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use std::sync::atomic::AtomicBool;

    fn color(hex: &str) -> Color {
        Color::parse(hex).unwrap()
    }

    fn config(width: u32, height: u32) -> EngineConfig {
        EngineConfig {
            board: BoardConfig::new(width, height, Color::white()),
            broadcast_capacity: 64,
            command_capacity: 64,
            write_capacity: 64,
            retry_interval: Duration::from_millis(20),
        }
    }

    async fn start(width: u32, height: u32) -> (EngineHandle, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let (handle, _task) = SyncEngine::start(
            config(width, height),
            store.clone(),
            Some(store.clone() as Arc<dyn UpdateLog>),
        )
        .await
        .unwrap();
        (handle, store)
    }

    async fn synced(handle: &EngineHandle) -> Subscription {
        let sub = handle.connect(None).await.unwrap();
        assert!(handle.mark_synced(sub.session_id).await);
        sub
    }

    fn next_delta(rx: &mut FrameReceiver) -> ServerMessage {
        let frame = rx.try_recv().expect("expected a broadcast frame");
        ServerMessage::decode(&frame).unwrap()
    }

    /// Store whose writes can be switched off.
    struct FlakyStore {
        inner: MemoryStore,
        down: AtomicBool,
    }

    impl BoardStore for FlakyStore {
        fn scan_all(&self) -> Result<Vec<crate::storage::CellRecord>, StoreError> {
            self.inner.scan_all()
        }

        fn upsert(&self, x: u32, y: u32, color: &Color) -> Result<(), StoreError> {
            if self.down.load(Ordering::SeqCst) {
                return Err(StoreError::Unavailable("switched off".into()));
            }
            self.inner.upsert(x, y, color)
        }
    }

    #[tokio::test]
    async fn test_reference_scenario() {
        let (handle, _store) = start(3, 2).await;
        let mut a = synced(&handle).await;

        let update = handle
            .submit(a.session_id, ChangeColorRequest::new(1, 0, "#FF0000"))
            .await
            .unwrap();
        assert_eq!(update, CellUpdate { x: 1, y: 0, color: color("#FF0000") });
        assert_eq!(next_delta(&mut a.receiver), ServerMessage::ChangeColor(update));

        let late = handle.connect(None).await.unwrap();
        let w = Color::white();
        assert_eq!(
            late.snapshot,
            vec![
                vec![w.clone(), color("#FF0000"), w.clone()],
                vec![w.clone(), w.clone(), w],
            ]
        );
    }

    #[tokio::test]
    async fn test_broadcast_includes_sender_and_all_sessions() {
        let (handle, _store) = start(4, 4).await;
        let mut sessions = Vec::new();
        for _ in 0..3 {
            sessions.push(synced(&handle).await);
        }

        handle
            .submit(sessions[1].session_id, ChangeColorRequest::new(2, 3, "#00ff00"))
            .await
            .unwrap();

        let expected = ServerMessage::ChangeColor(CellUpdate { x: 2, y: 3, color: color("#00FF00") });
        for sub in sessions.iter_mut() {
            assert_eq!(next_delta(&mut sub.receiver), expected);
        }
    }

    #[tokio::test]
    async fn test_late_session_gets_snapshot_not_delta() {
        let (handle, _store) = start(2, 2).await;
        let a = synced(&handle).await;
        handle
            .submit(a.session_id, ChangeColorRequest::new(0, 0, "#123456"))
            .await
            .unwrap();

        let mut late = handle.connect(None).await.unwrap();
        assert_eq!(late.snapshot[0][0], color("#123456"));
        assert!(late.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_out_of_bounds_is_rejected_without_broadcast() {
        let (handle, store) = start(3, 2).await;
        let mut a = synced(&handle).await;
        let before = handle.snapshot().await.unwrap();

        for (x, y) in [(3, 0), (0, -1), (-5, 1), (0, 2)] {
            match handle
                .submit(a.session_id, ChangeColorRequest::new(x, y, "#000000"))
                .await
            {
                Err(EngineError::Rejected(MutationError::OutOfBounds { .. })) => {}
                other => panic!("expected OutOfBounds for ({x}, {y}), got {other:?}"),
            }
        }

        handle.flush().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap(), before);
        assert!(a.receiver.try_recv().is_err());
        assert_eq!(store.update_count(), 0);

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.rejected, 4);
        assert_eq!(stats.accepted, 0);
    }

    #[tokio::test]
    async fn test_invalid_color_is_rejected() {
        let (handle, _store) = start(3, 2).await;
        let mut a = synced(&handle).await;

        let err = handle
            .submit(a.session_id, ChangeColorRequest::new(0, 0, "rebeccapurple"))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            EngineError::Rejected(MutationError::InvalidColor("rebeccapurple".into()))
        );
        assert!(a.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsynced_session_is_rejected() {
        let (handle, _store) = start(3, 2).await;
        let sub = handle.connect(None).await.unwrap();

        let err = handle
            .submit(sub.session_id, ChangeColorRequest::new(0, 0, "#000000"))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Rejected(MutationError::NotSynced));

        let err = handle
            .submit(SessionId::new(), ChangeColorRequest::new(0, 0, "#000000"))
            .await
            .unwrap_err();
        assert_eq!(err, EngineError::Rejected(MutationError::NotSynced));
    }

    #[tokio::test]
    async fn test_last_write_wins_in_processing_order() {
        let (handle, store) = start(3, 3).await;
        let mut a = synced(&handle).await;
        let b = synced(&handle).await;

        handle
            .submit(a.session_id, ChangeColorRequest::new(1, 1, "#AA0000"))
            .await
            .unwrap();
        handle
            .submit(b.session_id, ChangeColorRequest::new(1, 1, "#00BB00"))
            .await
            .unwrap();

        assert_eq!(
            next_delta(&mut a.receiver),
            ServerMessage::ChangeColor(CellUpdate { x: 1, y: 1, color: color("#AA0000") })
        );
        assert_eq!(
            next_delta(&mut a.receiver),
            ServerMessage::ChangeColor(CellUpdate { x: 1, y: 1, color: color("#00BB00") })
        );

        handle.flush().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap()[1][1], color("#00BB00"));
        assert_eq!(store.get(1, 1), Some(color("#00BB00")));

        let log: Vec<Color> = store
            .read_since(0)
            .unwrap()
            .into_iter()
            .map(|r| r.color)
            .collect();
        assert_eq!(log, vec![color("#AA0000"), color("#00BB00")]);
    }

    #[tokio::test]
    async fn test_audit_records_previous_color() {
        let (handle, store) = start(2, 1).await;
        let a = synced(&handle).await;
        handle
            .submit(a.session_id, ChangeColorRequest::new(1, 0, "#010203"))
            .await
            .unwrap();
        handle
            .submit(a.session_id, ChangeColorRequest::new(1, 0, "#040506"))
            .await
            .unwrap();
        handle.flush().await.unwrap();

        let records = store.read_since(0).unwrap();
        assert_eq!(records[0].previous_color, Some(Color::white()));
        assert_eq!(records[1].previous_color, Some(color("#010203")));
    }

    #[tokio::test]
    async fn test_store_failure_keeps_memory_and_broadcast() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            down: AtomicBool::new(false),
        });
        let (handle, _task) = SyncEngine::start(config(2, 2), store.clone(), None)
            .await
            .unwrap();
        let mut a = synced(&handle).await;

        store.down.store(true, Ordering::SeqCst);
        handle
            .submit(a.session_id, ChangeColorRequest::new(1, 1, "#FF00FF"))
            .await
            .unwrap();

        assert_eq!(
            next_delta(&mut a.receiver),
            ServerMessage::ChangeColor(CellUpdate { x: 1, y: 1, color: color("#FF00FF") })
        );
        handle.flush().await.unwrap();
        assert_eq!(handle.snapshot().await.unwrap()[1][1], color("#FF00FF"));
        assert_eq!(store.inner.get(1, 1), Some(Color::white()));

        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.persist_failures, 1);
        assert_eq!(stats.pending_retries, 1);

        // Store comes back: the retry reconciles the cell
        store.down.store(false, Ordering::SeqCst);
        handle.flush().await.unwrap();
        assert_eq!(store.inner.get(1, 1), Some(color("#FF00FF")));
        assert_eq!(handle.stats().await.unwrap().pending_retries, 0);
    }

    #[tokio::test]
    async fn test_newer_write_supersedes_pending_retry() {
        let store = Arc::new(FlakyStore {
            inner: MemoryStore::new(),
            down: AtomicBool::new(false),
        });
        let (handle, _task) = SyncEngine::start(config(2, 2), store.clone(), None)
            .await
            .unwrap();
        let a = synced(&handle).await;

        store.down.store(true, Ordering::SeqCst);
        handle
            .submit(a.session_id, ChangeColorRequest::new(0, 1, "#111111"))
            .await
            .unwrap();
        handle.flush().await.unwrap();

        store.down.store(false, Ordering::SeqCst);
        handle
            .submit(a.session_id, ChangeColorRequest::new(0, 1, "#222222"))
            .await
            .unwrap();
        handle.flush().await.unwrap();

        assert_eq!(store.inner.get(0, 1), Some(color("#222222")));
        assert_eq!(handle.stats().await.unwrap().pending_retries, 0);
    }

    /// Store whose writes block while the gate is held for writing.
    struct GatedStore {
        inner: MemoryStore,
        gate: std::sync::RwLock<()>,
    }

    impl BoardStore for GatedStore {
        fn scan_all(&self) -> Result<Vec<crate::storage::CellRecord>, StoreError> {
            self.inner.scan_all()
        }

        fn upsert(&self, x: u32, y: u32, color: &Color) -> Result<(), StoreError> {
            let _open = self.gate.read().unwrap();
            self.inner.upsert(x, y, color)
        }
    }

    #[tokio::test]
    async fn test_slow_store_spills_to_overflow() {
        let store = Arc::new(GatedStore {
            inner: MemoryStore::new(),
            gate: std::sync::RwLock::new(()),
        });
        let engine_config = EngineConfig {
            write_capacity: 1,
            ..config(4, 4)
        };
        let (handle, _task) = SyncEngine::start(engine_config, store.clone(), None)
            .await
            .unwrap();
        let a = synced(&handle).await;

        let gate = store.gate.write().unwrap();
        for i in 0..40i64 {
            let hex = format!("#0000{i:02X}");
            handle
                .submit(a.session_id, ChangeColorRequest::new(i % 4, (i / 4) % 4, hex))
                .await
                .unwrap();
        }
        // The engine kept accepting while the store was stuck
        let stats = handle.stats().await.unwrap();
        assert_eq!(stats.accepted, 40);
        assert!(stats.spilled_writes > 0);
        drop(gate);

        handle.flush().await.unwrap();
        let snapshot = handle.snapshot().await.unwrap();
        assert_eq!(snapshot[1][0], color("#000024"));
        for (y, row) in snapshot.iter().enumerate() {
            for (x, cell) in row.iter().enumerate() {
                assert_eq!(store.inner.get(x as u32, y as u32).as_ref(), Some(cell));
            }
        }
    }

    #[tokio::test]
    async fn test_update_log_never_spills() {
        let store = Arc::new(MemoryStore::new());
        let engine_config = EngineConfig {
            write_capacity: 1,
            ..config(3, 3)
        };
        let (handle, _task) = SyncEngine::start(
            engine_config,
            store.clone(),
            Some(store.clone() as Arc<dyn UpdateLog>),
        )
        .await
        .unwrap();
        let a = synced(&handle).await;

        for i in 0..30i64 {
            handle
                .submit(a.session_id, ChangeColorRequest::new(i % 3, 0, "#ABCDEF"))
                .await
                .unwrap();
        }
        handle.flush().await.unwrap();

        assert_eq!(store.read_since(0).unwrap().len(), 30);
        assert_eq!(handle.stats().await.unwrap().spilled_writes, 0);
    }

    #[tokio::test]
    async fn test_startup_fails_when_store_unreadable() {
        struct DeadStore;

        impl BoardStore for DeadStore {
            fn scan_all(&self) -> Result<Vec<crate::storage::CellRecord>, StoreError> {
                Err(StoreError::Unavailable("no route to host".into()))
            }

            fn upsert(&self, _x: u32, _y: u32, _color: &Color) -> Result<(), StoreError> {
                Err(StoreError::Unavailable("no route to host".into()))
            }
        }

        let result = SyncEngine::start(config(2, 2), Arc::new(DeadStore), None).await;
        match result {
            Err(StartupError::Persistence(StoreError::Unavailable(_))) => {}
            Err(other) => panic!("unexpected error {other}"),
            Ok(_) => panic!("engine must not start without its initial state"),
        }
    }

    #[tokio::test]
    async fn test_disconnect_releases_session() {
        let (handle, _store) = start(2, 2).await;
        let a = synced(&handle).await;
        assert_eq!(handle.stats().await.unwrap().active_sessions, 1);

        handle.disconnect(a.session_id).await;
        handle.disconnect(a.session_id).await;
        assert_eq!(handle.stats().await.unwrap().active_sessions, 0);
        assert!(handle.resync(a.session_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resync_returns_current_snapshot() {
        let (handle, _store) = start(2, 2).await;
        let a = synced(&handle).await;
        handle
            .submit(a.session_id, ChangeColorRequest::new(1, 0, "#ABCDEF"))
            .await
            .unwrap();

        let mut fresh = handle.resync(a.session_id).await.unwrap().unwrap();
        assert_eq!(fresh.snapshot[0][1], color("#ABCDEF"));
        assert!(fresh.receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_stops_engine() {
        let (handle, _store) = start(2, 2).await;
        handle.shutdown().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(handle.snapshot().await.unwrap_err(), EngineError::Stopped);
    }
}
