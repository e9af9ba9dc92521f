//! In-process store used when no storage path is configured.
//!
//! Nothing survives a restart; the board is re-provisioned with the default
//! color every time the process starts.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use super::{AuditEntry, BoardMetadata, BoardStore, CellRecord, MutationRecord, StoreError, UpdateLog};
use crate::protocol::Color;

/// Map-backed implementation of [`BoardStore`] and [`UpdateLog`].
#[derive(Default)]
pub struct MemoryStore {
    cells: Mutex<BTreeMap<(u32, u32), Color>>,
    updates: Mutex<Vec<MutationRecord>>,
    metadata: Mutex<Option<BoardMetadata>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted cells.
    pub fn cell_count(&self) -> usize {
        lock(&self.cells).map(|cells| cells.len()).unwrap_or(0)
    }

    /// Persisted color at `(x, y)`, if any.
    pub fn get(&self, x: u32, y: u32) -> Option<Color> {
        lock(&self.cells).ok()?.get(&(x, y)).cloned()
    }

    /// Number of update-log records.
    pub fn update_count(&self) -> usize {
        lock(&self.updates).map(|updates| updates.len()).unwrap_or(0)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, StoreError> {
    mutex
        .lock()
        .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
}

impl BoardStore for MemoryStore {
    fn scan_all(&self) -> Result<Vec<CellRecord>, StoreError> {
        Ok(lock(&self.cells)?
            .iter()
            .map(|(&(x, y), color)| CellRecord::new(x, y, color.clone()))
            .collect())
    }

    fn upsert(&self, x: u32, y: u32, color: &Color) -> Result<(), StoreError> {
        lock(&self.cells)?.insert((x, y), color.clone());
        Ok(())
    }

    fn upsert_batch(&self, cells: &[CellRecord]) -> Result<(), StoreError> {
        let mut map = lock(&self.cells)?;
        for cell in cells {
            map.insert((cell.x, cell.y), cell.color.clone());
        }
        Ok(())
    }

    fn load_metadata(&self) -> Result<Option<BoardMetadata>, StoreError> {
        Ok(lock(&self.metadata)?.clone())
    }

    fn save_metadata(&self, metadata: &BoardMetadata) -> Result<(), StoreError> {
        *lock(&self.metadata)? = Some(metadata.clone());
        Ok(())
    }
}

impl UpdateLog for MemoryStore {
    fn append(&self, entry: AuditEntry) -> Result<u64, StoreError> {
        let mut updates = lock(&self.updates)?;
        let sequence = updates.len() as u64;
        updates.push(MutationRecord::seal(sequence, entry));
        Ok(sequence)
    }

    fn read_since(&self, since: u64) -> Result<Vec<MutationRecord>, StoreError> {
        Ok(lock(&self.updates)?
            .iter()
            .filter(|r| r.sequence >= since)
            .cloned()
            .collect())
    }
}
