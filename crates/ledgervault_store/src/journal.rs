//! Append-only journal of store mutations.
//!
//! Each record is framed as:
//!
//! ```text
//! | magic (4) | version (2) | length (4) | CBOR payload | crc32 (4) |
//! ```
//!
//! The CRC covers the header and the payload. On open, a record that is
//! cut short at the end of the backend (a torn write) is truncated away;
//! any other damage is reported as corruption.

use crate::backend::StorageBackend;
use crate::error::{StoreError, StoreResult};
use crate::record::JournalRecord;
use ledgervault_protocol::{from_cbor, to_cbor};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Magic bytes opening every record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"LVJR";

/// Current record format version.
pub const JOURNAL_VERSION: u16 = 1;

const HEADER_SIZE: usize = 10;
const CRC_SIZE: usize = 4;

/// Counters gathered while replaying a journal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JournalStats {
    /// Valid records.
    pub records: u64,
    /// Journal size in bytes after recovery.
    pub bytes: u64,
    /// Bytes cut from a torn tail on open.
    pub truncated_bytes: u64,
    /// Records per kind.
    pub by_kind: BTreeMap<&'static str, u64>,
}

/// Writer over a [`StorageBackend`].
pub struct Journal {
    backend: Box<dyn StorageBackend>,
    sync_on_write: bool,
    stats: JournalStats,
}

impl Journal {
    /// Opens a journal and returns the records it holds, oldest first.
    pub fn open(
        mut backend: Box<dyn StorageBackend>,
        sync_on_write: bool,
    ) -> StoreResult<(Self, Vec<JournalRecord>)> {
        let size = backend.size()?;
        let mut stats = JournalStats::default();
        let mut records = Vec::new();
        let mut offset = 0u64;

        while offset < size {
            match read_record(backend.as_ref(), offset, size)? {
                Some((record, len)) => {
                    *stats.by_kind.entry(record.kind()).or_default() += 1;
                    stats.records += 1;
                    records.push(record);
                    offset += len;
                }
                None => {
                    warn!(offset, size, "truncating torn journal tail");
                    backend.truncate(offset)?;
                    stats.truncated_bytes = size - offset;
                    break;
                }
            }
        }

        stats.bytes = offset;
        debug!(records = stats.records, bytes = stats.bytes, "journal opened");
        Ok((
            Self {
                backend,
                sync_on_write,
                stats,
            },
            records,
        ))
    }

    /// Appends one record. On failure the backend is rolled back to its
    /// previous size so a later reopen does not see a partial record.
    pub fn append(&mut self, record: &JournalRecord) -> StoreResult<u64> {
        let frame = encode_frame(record)?;
        let start = self.backend.size()?;

        let written = self.backend.append(&frame).and_then(|offset| {
            if self.sync_on_write {
                self.backend.sync()?;
            } else {
                self.backend.flush()?;
            }
            Ok(offset)
        });

        match written {
            Ok(offset) => {
                *self.stats.by_kind.entry(record.kind()).or_default() += 1;
                self.stats.records += 1;
                self.stats.bytes = offset + frame.len() as u64;
                Ok(offset)
            }
            Err(err) => {
                if let Err(rollback) = self.backend.truncate(start) {
                    warn!(error = %rollback, "journal rollback failed");
                }
                Err(err.into())
            }
        }
    }

    /// Returns replay and write counters.
    #[must_use]
    pub fn stats(&self) -> &JournalStats {
        &self.stats
    }
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("sync_on_write", &self.sync_on_write)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

/// Frames a record for appending.
pub fn encode_frame(record: &JournalRecord) -> StoreResult<Vec<u8>> {
    let payload = to_cbor(record)?;
    let len = u32::try_from(payload.len())
        .map_err(|_| StoreError::constraint("journal record exceeds 4 GiB"))?;

    let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
    frame.extend_from_slice(&JOURNAL_MAGIC);
    frame.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&payload);
    let crc = crc32(&frame);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Reads the record at `offset`. Returns `None` for a torn tail.
fn read_record(
    backend: &dyn StorageBackend,
    offset: u64,
    size: u64,
) -> StoreResult<Option<(JournalRecord, u64)>> {
    if size - offset < HEADER_SIZE as u64 {
        return Ok(None);
    }
    let header = backend.read_at(offset, HEADER_SIZE)?;
    if header[0..4] != JOURNAL_MAGIC {
        return Err(StoreError::Corrupted(format!(
            "invalid magic at offset {offset}"
        )));
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version > JOURNAL_VERSION {
        return Err(StoreError::Corrupted(format!(
            "unsupported record version {version} at offset {offset}"
        )));
    }
    let payload_len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as u64;
    let total = HEADER_SIZE as u64 + payload_len + CRC_SIZE as u64;
    if size - offset < total {
        return Ok(None);
    }

    let body = backend.read_at(offset, (total - CRC_SIZE as u64) as usize)?;
    let stored = backend.read_at(offset + total - CRC_SIZE as u64, CRC_SIZE)?;
    let stored = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);
    if crc32(&body) != stored {
        if offset + total == size {
            return Ok(None);
        }
        return Err(StoreError::Corrupted(format!(
            "checksum mismatch at offset {offset}"
        )));
    }

    let record = from_cbor(&body[HEADER_SIZE..])
        .map_err(|e| StoreError::Corrupted(format!("undecodable record at offset {offset}: {e}")))?;
    Ok(Some((record, total)))
}

/// CRC-32 (IEEE).
#[must_use]
pub fn crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut n = 0;
        while n < 256 {
            let mut c = n as u32;
            let mut k = 0;
            while k < 8 {
                c = if c & 1 != 0 { 0xEDB8_8320 ^ (c >> 1) } else { c >> 1 };
                k += 1;
            }
            table[n] = c;
            n += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize] ^ (crc >> 8)
    })
}
