//! WebSocket gateway in front of the sync engine.
//!
//! Architecture:
//! ```text
//! Client A ──┐                          ┌── SessionRegistry ──┬──► Client A
//!             ├── handshake ── session ──┤   (broadcast)       ├──► Client B
//! Client B ──┘   (origin)      task      └── SyncEngine ───────┘
//!                                              │
//!                                              ├── BoardStore (RocksDB | memory)
//!                                              └── UpdateLog  (RocksDB | memory)
//! ```
//!
//! Each connection gets one task that:
//! - checks the `Origin` header during the handshake
//! - registers with the engine and sends `initial_board`
//! - forwards `change_color` requests to the engine
//! - relays broadcast frames, resyncing with a fresh snapshot if it lags
//! - answers rejected requests to this client only
//!
//! The task owns no board data; everything goes through [`EngineHandle`].
//!
//! Reference: Kleppmann — Designing Data-Intensive Applications, Chapters 5 & 8

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::board::{BoardConfig, StartupError};
use crate::broadcast::SessionId;
use crate::engine::{EngineConfig, EngineError, EngineHandle, Subscription, SyncEngine};
use crate::protocol::{ClientMessage, Color, Rejection, ServerMessage};
use crate::storage::{BoardStore, MemoryStore, RocksStore, StoreConfig, UpdateLog};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub board: BoardConfig,
    /// RocksDB path (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    /// Frames buffered per session before drop-oldest
    pub broadcast_capacity: usize,
    /// Engine command queue depth
    pub command_capacity: usize,
    /// Browser origins admitted at handshake; `*` admits all
    pub allowed_origins: Vec<String>,
    /// Append every accepted mutation to the update log
    pub audit_log: bool,
    /// Retry period for cells whose write failed
    pub retry_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4000".to_string(),
            board: BoardConfig::default(),
            storage_path: None,
            broadcast_capacity: 256,
            command_capacity: 1024,
            allowed_origins: vec!["*".to_string()],
            audit_log: true,
            retry_interval_ms: 5000,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `PIXEL_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with values from `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = parse_var::<u16>(&lookup, "PORT") {
            config.bind_addr = format!("0.0.0.0:{port}");
        }
        if let Some(addr) = lookup("PIXEL_BIND_ADDR").filter(|a| !a.trim().is_empty()) {
            config.bind_addr = addr.trim().to_string();
        }
        if let Some(path) = lookup("PIXEL_DB_PATH").filter(|p| !p.trim().is_empty()) {
            config.storage_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(width) = parse_var(&lookup, "PIXEL_BOARD_WIDTH") {
            config.board.width = width;
        }
        if let Some(height) = parse_var(&lookup, "PIXEL_BOARD_HEIGHT") {
            config.board.height = height;
        }
        if let Some(color) = parse_var::<Color>(&lookup, "PIXEL_DEFAULT_COLOR") {
            config.board.default_color = color;
        }
        if let Some(origins) = lookup("PIXEL_ALLOWED_ORIGINS") {
            let origins: Vec<String> = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
            if !origins.is_empty() {
                config.allowed_origins = origins;
            }
        }
        if let Some(capacity) = parse_var(&lookup, "PIXEL_BROADCAST_CAPACITY") {
            config.broadcast_capacity = capacity;
        }
        if let Some(raw) = lookup("PIXEL_AUDIT_LOG") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "0" | "false" | "off" | "no" => config.audit_log = false,
                "1" | "true" | "on" | "yes" => config.audit_log = true,
                other => log::warn!("Ignoring PIXEL_AUDIT_LOG={other:?}: expected true or false"),
            }
        }
        if let Some(ms) = parse_var(&lookup, "PIXEL_RETRY_INTERVAL_MS") {
            config.retry_interval_ms = ms;
        }

        config
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            board: self.board.clone(),
            broadcast_capacity: self.broadcast_capacity,
            command_capacity: self.command_capacity,
            retry_interval: Duration::from_millis(self.retry_interval_ms.max(1)),
            ..EngineConfig::default()
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(e) => {
            log::warn!("Ignoring {key}={raw:?}: {e}");
            None
        }
    }
}

/// Whether a handshake carrying `origin` may proceed.
///
/// Requests without an `Origin` header come from non-browser clients and are
/// always admitted.
pub fn origin_allowed(allowed: &[String], origin: Option<&str>) -> bool {
    let Some(origin) = origin else {
        return true;
    };
    let origin = origin.trim_end_matches('/');
    allowed
        .iter()
        .any(|a| a == "*" || a.trim_end_matches('/').eq_ignore_ascii_case(origin))
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub refused_handshakes: u64,
    pub total_messages: u64,
    pub malformed_messages: u64,
    pub rejected_mutations: u64,
    pub resyncs: u64,
}

/// The canvas server.
pub struct CanvasServer {
    config: ServerConfig,
    engine: EngineHandle,
    allowed_origins: Arc<Vec<String>>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CanvasServer {
    /// Open the configured store, load the board and start the engine.
    ///
    /// Any failure here is fatal: the server must not accept connections
    /// without its initial state.
    pub async fn start(config: ServerConfig) -> Result<Self, StartupError> {
        let (store, update_log): (Arc<dyn BoardStore>, Arc<dyn UpdateLog>) =
            match &config.storage_path {
                Some(path) => {
                    let rocks = Arc::new(RocksStore::open(StoreConfig::at(path))?);
                    log::info!("Opened board store at {}", path.display());
                    (rocks.clone() as Arc<dyn BoardStore>, rocks as Arc<dyn UpdateLog>)
                }
                None => {
                    log::warn!("No storage path configured; the board will not survive a restart");
                    let memory = Arc::new(MemoryStore::new());
                    (memory.clone() as Arc<dyn BoardStore>, memory as Arc<dyn UpdateLog>)
                }
            };
        let update_log = config.audit_log.then_some(update_log);

        let (engine, _task) = SyncEngine::start(config.engine_config(), store, update_log).await?;
        Ok(Self::with_engine(config, engine))
    }

    /// Serve an engine that was started elsewhere.
    pub fn with_engine(config: ServerConfig, engine: EngineHandle) -> Self {
        Self {
            allowed_origins: Arc::new(config.allowed_origins.clone()),
            config,
            engine,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections from an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Canvas server listening on {}", listener.local_addr()?);

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::error!("Failed to accept connection: {e}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let engine = self.engine.clone();
            let stats = self.stats.clone();
            let allowed = self.allowed_origins.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, engine, stats, allowed).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        engine: EngineHandle,
        stats: Arc<RwLock<ServerStats>>,
        allowed: Arc<Vec<String>>,
    ) -> Result<(), BoxError> {
        let check_origin = |request: &Request, response: Response| {
            let admitted = match request.headers().get(header::ORIGIN) {
                None => true,
                Some(value) => value
                    .to_str()
                    .map(|origin| origin_allowed(&allowed, Some(origin)))
                    .unwrap_or(false),
            };
            if admitted {
                Ok(response)
            } else {
                let mut refusal = ErrorResponse::new(Some("Origin not allowed".to_string()));
                *refusal.status_mut() = StatusCode::FORBIDDEN;
                Err(refusal)
            }
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_origin).await {
            Ok(ws) => ws,
            Err(WsError::Http(response)) if response.status() == StatusCode::FORBIDDEN => {
                log::warn!("Refused handshake from {addr}: origin not allowed");
                stats.write().await.refused_handshakes += 1;
                return Ok(());
            }
            Err(e) => {
                log::debug!("Handshake with {addr} failed: {e}");
                return Ok(());
            }
        };

        let subscription = engine.connect(Some(addr.to_string())).await?;
        let session = subscription.session_id;
        log::info!("Session {session} connected from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::run_session(ws_stream, subscription, &engine, &stats).await;

        engine.disconnect(session).await;
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Session {session} from {addr} disconnected");

        result
    }

    async fn run_session(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        subscription: Subscription,
        engine: &EngineHandle,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let Subscription {
            session_id,
            snapshot,
            mut receiver,
        } = subscription;

        // Frames accepted after the snapshot queue up in `receiver` meanwhile
        let initial = ServerMessage::InitialBoard(snapshot).encode()?;
        ws_sender.send(Message::text(initial)).await?;
        engine.mark_synced(session_id).await;

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            stats.write().await.total_messages += 1;
                            if let Some(reply) =
                                Self::handle_request(engine, session_id, text.as_str(), stats).await?
                            {
                                ws_sender.send(Message::text(reply)).await?;
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            {
                                let mut s = stats.write().await;
                                s.total_messages += 1;
                                s.malformed_messages += 1;
                            }
                            log::warn!("Session {session_id} sent a binary frame");
                            let reply = ServerMessage::Rejected(Rejection::malformed(
                                "binary frames are not supported",
                            ))
                            .encode()?;
                            ws_sender.send(Message::text(reply)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => break,

                        Some(Err(e)) => {
                            log::warn!("WebSocket error on session {session_id}: {e}");
                            break;
                        }

                        // Pings are answered by tungstenite itself
                        _ => {}
                    }
                }

                frame = receiver.recv() => {
                    match frame {
                        Ok(frame) => {
                            ws_sender.send(Message::text(frame.to_string())).await?;
                        }
                        Err(RecvError::Lagged(n)) => {
                            log::warn!("Session {session_id} lagged by {n} frames; resyncing");
                            engine.registry().record_lag(n);
                            stats.write().await.resyncs += 1;

                            let Some(fresh) = engine.resync(session_id).await? else {
                                break;
                            };
                            receiver = fresh.receiver;
                            let board = ServerMessage::InitialBoard(fresh.snapshot).encode()?;
                            ws_sender.send(Message::text(board)).await?;
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
        }

        Ok(())
    }

    /// Forward one text frame to the engine. Returns the rejection to send
    /// back to this session, if any.
    async fn handle_request(
        engine: &EngineHandle,
        session: SessionId,
        text: &str,
        stats: &Arc<RwLock<ServerStats>>,
    ) -> Result<Option<String>, BoxError> {
        let request = match ClientMessage::decode(text) {
            Ok(ClientMessage::ChangeColor(request)) => request,
            Err(e) => {
                log::warn!("Dropped malformed frame from session {session}: {e}");
                stats.write().await.malformed_messages += 1;
                let reply = ServerMessage::Rejected(Rejection::malformed(e.to_string()));
                return Ok(Some(reply.encode()?));
            }
        };

        let (x, y) = (request.x, request.y);
        match engine.submit(session, request).await {
            Ok(_) => Ok(None),
            Err(EngineError::Rejected(e)) => {
                stats.write().await.rejected_mutations += 1;
                Ok(Some(ServerMessage::Rejected(e.to_rejection(x, y)).encode()?))
            }
            Err(e @ EngineError::Stopped) => Err(e.into()),
        }
    }

    /// Persist everything accepted so far and stop the engine.
    pub async fn shutdown(&self) {
        if let Err(e) = self.engine.flush().await {
            log::warn!("Flush before shutdown failed: {e}");
        }
        self.engine.shutdown().await;
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }
}
