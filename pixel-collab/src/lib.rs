//! # pixel-collab — Real-time shared pixel canvas
//!
//! Many clients view and paint a common grid of colored cells. Every accepted
//! change is applied to the authoritative in-memory board, handed to durable
//! storage and broadcast to every connected client.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐     WebSocket      ┌──────────────┐
//! │ CanvasClient │ ◄─────────────────► │ CanvasServer │
//! │ (per user)   │     JSON frames     │ (gateway)    │
//! └──────────────┘                     └──────┬───────┘
//!                                             │ commands (mpsc)
//!                                             ▼
//!                                      ┌──────────────┐
//!                                      │ SyncEngine   │ owns Board
//!                                      │ (one task)   │
//!                                      └──┬────────┬──┘
//!                         write-behind    │        │  deltas
//!                                ┌────────┘        └────────┐
//!                                ▼                          ▼
//!                        ┌───────────────┐         ┌─────────────────┐
//!                        │ BoardStore    │         │ SessionRegistry │
//!                        │ UpdateLog     │         │ (fan-out)       │
//!                        └───────────────┘         └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (`initial_board`, `change_color`, `rejected`)
//! - [`board`] — Dense grid, initialization against the store, bounds checks
//! - [`broadcast`] — Session registry and drop-oldest fan-out
//! - [`engine`] — Single serialization point and write-behind persistence
//! - [`server`] — WebSocket gateway
//! - [`client`] — WebSocket client
//! - [`storage`] — RocksDB and in-memory stores, update log
//!
//! ## Guarantees
//!
//! | Property | Mechanism |
//! |----------|-----------|
//! | Last write wins per cell | One engine task processes commands in order |
//! | Snapshot reflects prior writes | Snapshots are taken inside the engine |
//! | No gap between snapshot and deltas | Register and snapshot in one command |
//! | Slow clients never stall others | Bounded broadcast, drop-oldest + resync |
//! | Per-cell write order in the store | Single FIFO persistence writer |

pub mod protocol;
pub mod board;
pub mod broadcast;
pub mod engine;
pub mod server;
pub mod client;
pub mod storage;

// Re-exports for convenience
pub use protocol::{
    CellUpdate, ChangeColorRequest, ClientMessage, Color, Grid, ProtocolError, RejectReason,
    Rejection, ServerMessage,
};
pub use board::{Board, BoardConfig, InitReport, MutationError, StartupError};
pub use broadcast::{BroadcastStats, SessionId, SessionInfo, SessionRegistry, SessionState};
pub use engine::{EngineConfig, EngineError, EngineHandle, EngineStats, Subscription, SyncEngine};
pub use server::{CanvasServer, ServerConfig, ServerStats};
pub use client::{CanvasClient, ClientEvent, ConnectionState};
pub use storage::{
    BoardMetadata, BoardStore, CellRecord, MemoryStore, MutationRecord, RocksStore, StoreConfig,
    StoreError, UpdateLog,
};
