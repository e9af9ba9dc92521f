//! Update-log records: the audit trail of accepted mutations.
//!
//! Each accepted `change_color` produces one [`MutationRecord`]:
//! ```text
//! ┌──────────┬─────┬─────┬───────┬──────────┬────────┬───────────┬──────────┐
//! │ sequence │  x  │  y  │ color │ previous │ origin │ timestamp │ checksum │
//! └──────────┴─────┴─────┴───────┴──────────┴────────┴───────────┴──────────┘
//! ```
//!
//! Records are never rewritten. The sequence number reflects the order in
//! which the engine accepted the mutations, so two conflicting writes to the
//! same cell appear in the log in the order that decided the final color.

use serde::{Deserialize, Serialize};

use super::{unix_millis, StoreError};
use crate::protocol::Color;

/// A mutation as handed to the update log, before it gets a sequence number.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEntry {
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub previous_color: Option<Color>,
    /// Client network address, when known
    pub origin: Option<String>,
    /// Milliseconds since epoch
    pub timestamp_ms: u64,
}

impl AuditEntry {
    pub fn new(x: u32, y: u32, color: Color) -> Self {
        Self {
            x,
            y,
            color,
            previous_color: None,
            origin: None,
            timestamp_ms: unix_millis(),
        }
    }

    pub fn with_previous(mut self, previous: Color) -> Self {
        self.previous_color = Some(previous);
        self
    }

    pub fn with_origin(mut self, origin: Option<String>) -> Self {
        self.origin = origin;
        self
    }
}

/// A sealed update-log record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationRecord {
    /// Monotonically increasing sequence number
    pub sequence: u64,
    pub x: u32,
    pub y: u32,
    pub color: Color,
    pub previous_color: Option<Color>,
    pub origin: Option<String>,
    pub timestamp_ms: u64,
    /// FNV-1a checksum over every other field
    pub checksum: u32,
}

impl MutationRecord {
    /// Assign `sequence` to `entry` and compute its checksum.
    pub fn seal(sequence: u64, entry: AuditEntry) -> Self {
        let mut record = Self {
            sequence,
            x: entry.x,
            y: entry.y,
            color: entry.color,
            previous_color: entry.previous_color,
            origin: entry.origin,
            timestamp_ms: entry.timestamp_ms,
            checksum: 0,
        };
        record.checksum = record.compute_checksum();
        record
    }

    pub fn verify(&self) -> bool {
        self.checksum == self.compute_checksum()
    }

    fn compute_checksum(&self) -> u32 {
        let mut hash = Fnv::new();
        hash.write(&self.sequence.to_le_bytes());
        hash.write(&self.x.to_le_bytes());
        hash.write(&self.y.to_le_bytes());
        hash.write(self.color.as_str().as_bytes());
        match &self.previous_color {
            Some(previous) => {
                hash.write(&[1]);
                hash.write(previous.as_str().as_bytes());
            }
            None => hash.write(&[0]),
        }
        match &self.origin {
            Some(origin) => {
                hash.write(&[1]);
                hash.write(origin.as_bytes());
            }
            None => hash.write(&[0]),
        }
        hash.write(&self.timestamp_ms.to_le_bytes());
        hash.finish()
    }

    pub fn encode(&self) -> Result<Vec<u8>, StoreError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| StoreError::SerializationError(e.to_string()))
    }

    /// Decode and verify. A record whose checksum does not match is
    /// reported as [`StoreError::CorruptRecord`].
    pub fn decode(bytes: &[u8]) -> Result<Self, StoreError> {
        let (record, _): (Self, _) =
            bincode::serde::decode_from_slice(bytes, bincode::config::standard())
                .map_err(|e| StoreError::DeserializationError(e.to_string()))?;
        if !record.verify() {
            return Err(StoreError::CorruptRecord(format!(
                "checksum mismatch at sequence {}",
                record.sequence
            )));
        }
        Ok(record)
    }

    /// Decode a batch of serialized records, skipping ones that fail to
    /// decode or verify.
    ///
    /// Returns valid records in sequence order and the count skipped.
    pub fn recover(serialized: &[Vec<u8>]) -> (Vec<MutationRecord>, usize) {
        let mut valid = Vec::with_capacity(serialized.len());
        let mut corrupted = 0;

        for bytes in serialized {
            match Self::decode(bytes) {
                Ok(record) => valid.push(record),
                Err(e) => {
                    log::warn!("Skipping update-log record: {e}");
                    corrupted += 1;
                }
            }
        }

        valid.sort_by_key(|r| r.sequence);
        (valid, corrupted)
    }
}

/// 32-bit FNV-1a.
struct Fnv(u32);

impl Fnv {
    fn new() -> Self {
        Self(0x811c_9dc5)
    }

    fn write(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.0 ^= *byte as u32;
            self.0 = self.0.wrapping_mul(0x0100_0193);
        }
    }

    fn finish(&self) -> u32 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn red() -> Color {
        Color::parse("#FF0000").unwrap()
    }

    #[test]
    fn test_seal_and_verify() {
        let entry = AuditEntry::new(3, 4, red())
            .with_previous(Color::white())
            .with_origin(Some("10.0.0.1:5000".into()));
        let record = MutationRecord::seal(7, entry);

        assert_eq!(record.sequence, 7);
        assert_eq!(record.previous_color, Some(Color::white()));
        assert!(record.verify());
    }

    #[test]
    fn test_checksum_detects_tampering() {
        let record = MutationRecord::seal(1, AuditEntry::new(0, 0, red()));

        let mut tampered = record.clone();
        tampered.color = Color::white();
        assert!(!tampered.verify());

        let mut tampered = record.clone();
        tampered.sequence = 2;
        assert!(!tampered.verify());

        let mut tampered = record;
        tampered.origin = Some("elsewhere".into());
        assert!(!tampered.verify());
    }

    #[test]
    fn test_decode_rejects_bad_checksum() {
        let mut record = MutationRecord::seal(9, AuditEntry::new(1, 1, red()));
        record.checksum ^= 0xFFFF;
        let bytes = record.encode().unwrap();

        match MutationRecord::decode(&bytes) {
            Err(StoreError::CorruptRecord(msg)) => assert!(msg.contains('9')),
            other => panic!("expected CorruptRecord, got {other:?}"),
        }
    }

    #[test]
    fn test_recover_skips_garbage_and_sorts() {
        let mut serialized: Vec<Vec<u8>> = [4u64, 1, 3, 0]
            .iter()
            .map(|seq| {
                MutationRecord::seal(*seq, AuditEntry::new(*seq as u32, 0, red()))
                    .encode()
                    .unwrap()
            })
            .collect();
        serialized.push(vec![0xFF; 12]);

        let (records, corrupted) = MutationRecord::recover(&serialized);
        assert_eq!(corrupted, 1);
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![0, 1, 3, 4]);
    }
}
