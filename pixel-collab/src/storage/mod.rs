//! Durable storage collaborators for the canvas.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  upsert (x,y)   ┌──────────────┐
//! │ SyncEngine  │ ──────────────► │ BoardStore   │  one record per cell
//! │ (in-memory) │                 └──────────────┘
//! └──────┬──────┘  append         ┌──────────────┐
//!        └──────────────────────► │ UpdateLog    │  append-only audit trail
//!                                 └──────────────┘
//! ```
//!
//! Both collaborators are synchronous traits; the engine calls them from a
//! single writer task through `spawn_blocking`, which keeps writes to the
//! same cell in the order the engine accepted them.
//!
//! Implementations:
//! - [`RocksStore`] — RocksDB column families `cells`, `updates`, `metadata`
//! - [`MemoryStore`] — in-process maps, used when no storage path is set

pub mod audit;
pub mod memory;
pub mod rocks;

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

use crate::protocol::Color;

pub use audit::{AuditEntry, MutationRecord};
pub use memory::MemoryStore;
pub use rocks::{RocksStore, StoreConfig};

/// One persisted cell.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRecord {
    pub x: u32,
    pub y: u32,
    pub color: Color,
}

impl CellRecord {
    pub fn new(x: u32, y: u32, color: Color) -> Self {
        Self { x, y, color }
    }
}

/// Board dimensions as last provisioned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoardMetadata {
    pub width: u32,
    pub height: u32,
    pub default_color: Color,
    /// Creation timestamp (seconds since epoch)
    pub created_at: u64,
    /// Last provisioning timestamp (seconds since epoch)
    pub updated_at: u64,
}

impl BoardMetadata {
    pub fn new(width: u32, height: u32, default_color: Color) -> Self {
        let now = unix_secs();
        Self {
            width,
            height,
            default_color,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Key-value store of cell colors addressed by `(x, y)`.
pub trait BoardStore: Send + Sync {
    /// Every persisted cell, in no particular order.
    fn scan_all(&self) -> Result<Vec<CellRecord>, StoreError>;

    /// Create or replace the cell at `(x, y)`.
    fn upsert(&self, x: u32, y: u32, color: &Color) -> Result<(), StoreError>;

    fn upsert_batch(&self, cells: &[CellRecord]) -> Result<(), StoreError> {
        for cell in cells {
            self.upsert(cell.x, cell.y, &cell.color)?;
        }
        Ok(())
    }

    fn load_metadata(&self) -> Result<Option<BoardMetadata>, StoreError> {
        Ok(None)
    }

    fn save_metadata(&self, _metadata: &BoardMetadata) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Append-only record of accepted mutations.
pub trait UpdateLog: Send + Sync {
    /// Seal `entry` with the next sequence number and append it.
    fn append(&self, entry: AuditEntry) -> Result<u64, StoreError>;

    /// All records with `sequence >= since`, in sequence order.
    fn read_since(&self, since: u64) -> Result<Vec<MutationRecord>, StoreError>;
}

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// RocksDB internal error
    DatabaseError(String),
    /// Serialization failed
    SerializationError(String),
    /// Deserialization failed
    DeserializationError(String),
    /// Backend cannot be reached (or its worker died)
    Unavailable(String),
    /// Record failed its integrity check
    CorruptRecord(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::DatabaseError(e) => write!(f, "Database error: {e}"),
            StoreError::SerializationError(e) => write!(f, "Serialization error: {e}"),
            StoreError::DeserializationError(e) => write!(f, "Deserialization error: {e}"),
            StoreError::Unavailable(e) => write!(f, "Store unavailable: {e}"),
            StoreError::CorruptRecord(e) => write!(f, "Corrupt record: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub(crate) fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
