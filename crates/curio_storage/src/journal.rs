//! Commit journal.
//!
//! Every committed transaction is appended as one framed record:
//!
//! ```text
//! | magic "CJRN" (4) | length (4, LE) | JSON payload (N) | crc32 (4, LE) |
//! ```
//!
//! The checksum covers magic, length and payload. On recovery a record cut
//! short by a crash is treated as the end of the journal and dropped; a
//! checksum mismatch on a complete record is fatal.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::key::Key;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::warn;

/// Magic bytes opening every journal record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"CJRN";

const HEADER_SIZE: usize = 8;
const CRC_SIZE: usize = 4;

/// One row write inside a commit record. `value: None` is a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct JournalWrite {
    pub table: String,
    pub key: Key,
    pub value: Option<Value>,
}

/// A journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub(crate) enum JournalRecord {
    /// Writes of one committed transaction and the counters it advanced.
    Commit {
        sequence: u64,
        writes: Vec<JournalWrite>,
        #[serde(default)]
        counters: BTreeMap<String, i64>,
    },
    /// Full image of the store written by a checkpoint.
    Snapshot {
        sequence: u64,
        tables: BTreeMap<String, Vec<(Key, Value)>>,
        counters: BTreeMap<String, i64>,
    },
}

/// Append-only journal over a storage backend.
pub(crate) struct Journal {
    backend: Box<dyn StorageBackend>,
}

impl Journal {
    pub(crate) fn new(backend: Box<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    /// Reads every complete record, truncating a torn tail.
    pub(crate) fn replay(&mut self) -> StoreResult<Vec<JournalRecord>> {
        let size = self.backend.size()?;
        let mut offset = 0u64;
        let mut records = Vec::new();

        while offset < size {
            if size - offset < HEADER_SIZE as u64 {
                self.cut_torn_tail(offset, size)?;
                break;
            }
            let header = self.backend.read_at(offset, HEADER_SIZE)?;
            if header[..4] != JOURNAL_MAGIC {
                return Err(StoreError::Corrupted(format!(
                    "invalid magic at offset {offset}"
                )));
            }
            let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
            let total = (HEADER_SIZE + len + CRC_SIZE) as u64;
            if size - offset < total {
                self.cut_torn_tail(offset, size)?;
                break;
            }

            let frame = self.backend.read_at(offset, total as usize)?;
            let body_end = HEADER_SIZE + len;
            let stored = u32::from_le_bytes([
                frame[body_end],
                frame[body_end + 1],
                frame[body_end + 2],
                frame[body_end + 3],
            ]);
            let computed = compute_crc32(&frame[..body_end]);
            if stored != computed {
                return Err(StoreError::Corrupted(format!(
                    "checksum mismatch at offset {offset}: expected {stored:#010x}, got {computed:#010x}"
                )));
            }

            let record: JournalRecord = serde_json::from_slice(&frame[HEADER_SIZE..body_end])
                .map_err(|e| StoreError::Corrupted(format!("undecodable record at {offset}: {e}")))?;
            records.push(record);
            offset += total;
        }

        Ok(records)
    }

    fn cut_torn_tail(&mut self, offset: u64, size: u64) -> StoreResult<()> {
        warn!(offset, dropped = size - offset, "truncating torn journal tail");
        self.backend.truncate(offset)
    }

    /// Appends one record.
    pub(crate) fn append(&mut self, record: &JournalRecord, sync: bool) -> StoreResult<()> {
        let frame = encode_frame(record)?;
        self.backend.append(&frame)?;
        self.backend.flush()?;
        if sync {
            self.backend.sync()?;
        }
        Ok(())
    }

    /// Replaces the whole journal with a single record.
    pub(crate) fn rewrite(&mut self, record: &JournalRecord) -> StoreResult<()> {
        let frame = encode_frame(record)?;
        self.backend.truncate(0)?;
        self.backend.append(&frame)?;
        self.backend.sync()
    }

    pub(crate) fn size(&self) -> StoreResult<u64> {
        self.backend.size()
    }
}

fn encode_frame(record: &JournalRecord) -> StoreResult<Vec<u8>> {
    let payload = serde_json::to_vec(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::Corrupted("journal record larger than 4 GiB".into()))?;
    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&JOURNAL_MAGIC);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = compute_crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// CRC-32 (IEEE) of `data`.
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut bit = 0;
            while bit < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                bit += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use serde_json::json;

    fn commit(sequence: u64) -> JournalRecord {
        JournalRecord::Commit {
            sequence,
            writes: vec![JournalWrite {
                table: "items".into(),
                key: Key::Int(sequence as i64),
                value: Some(json!({"id": sequence})),
            }],
            counters: BTreeMap::new(),
        }
    }

    #[test]
    fn crc_matches_reference_vector() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn replays_appended_records() {
        let mut journal = Journal::new(Box::new(InMemoryBackend::new()));
        journal.append(&commit(1), false).unwrap();
        journal.append(&commit(2), false).unwrap();
        assert_eq!(journal.replay().unwrap(), vec![commit(1), commit(2)]);
    }

    #[test]
    fn torn_tail_is_dropped() {
        let full = encode_frame(&commit(1)).unwrap();
        let torn = encode_frame(&commit(2)).unwrap();
        let mut bytes = full.clone();
        bytes.extend_from_slice(&torn[..torn.len() - 3]);

        let mut journal = Journal::new(Box::new(InMemoryBackend::with_data(bytes)));
        assert_eq!(journal.replay().unwrap(), vec![commit(1)]);
        assert_eq!(journal.size().unwrap(), full.len() as u64);
    }

    #[test]
    fn checksum_mismatch_is_corruption() {
        let mut bytes = encode_frame(&commit(1)).unwrap();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        let mut journal = Journal::new(Box::new(InMemoryBackend::with_data(bytes)));
        assert!(matches!(journal.replay(), Err(StoreError::Corrupted(_))));
    }

    #[test]
    fn rewrite_leaves_single_record() {
        let mut journal = Journal::new(Box::new(InMemoryBackend::new()));
        journal.append(&commit(1), false).unwrap();
        journal.append(&commit(2), false).unwrap();
        journal.rewrite(&commit(3)).unwrap();
        assert_eq!(journal.replay().unwrap(), vec![commit(3)]);
    }
}
