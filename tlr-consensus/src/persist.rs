//! Durable-state contract and codec.
//!
//! The engine serializes its persistent state (current term, vote, full log)
//! into an opaque blob and hands it to a [`Persister`]. Raft's durability
//! rule is the persister's contract: `save` returns only once the blob is
//! actually durable, because the engine acknowledges votes and appends to
//! remote peers immediately afterwards.
//!
//! # Blob format
//!
//! Little-endian, checksummed with CRC32:
//!
//! ```text
//! [magic: 4][current_term: u64][voted_for: u64][entry_count: u64][header_crc: u32]
//! then per entry:
//! [id: u64][term: u64][data_len: u32][entry_header_crc: u32][data][data_crc: u32]
//! ```
//!
//! `voted_for` uses `u64::MAX` as the "none" sentinel. Each entry header is
//! validated before `data_len` is trusted, so a corrupted length field cannot
//! trigger an oversized allocation.

use crate::log::Log;
use bytes::Bytes;
use crc32fast::Hasher;
use std::fs::{self, File};
use std::io::Write;
use std::path::PathBuf;
use tlr_core::{LogEntry, NodeId, Result, Term, TillerError, TILLER_MAGIC};

const HEADER_SIZE: usize = 4 + 8 + 8 + 8;
const HEADER_CRC_SIZE: usize = 4;
const ENTRY_HEADER_SIZE: usize = 8 + 8 + 4;
const ENTRY_CRC_SIZE: usize = 4;
const VOTED_FOR_NONE: u64 = u64::MAX;

/// Durable storage the engine consumes. One instance per node.
pub trait Persister: Send {
    /// Persist `blob` atomically, replacing any previous blob. Must not
    /// return before the bytes are durable.
    fn save(&mut self, blob: &[u8]) -> Result<()>;

    /// The most recently saved blob, or `None` for a fresh node.
    fn load(&mut self) -> Result<Option<Bytes>>;
}

fn crc(bytes: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    hasher.update(bytes);
    hasher.finalize()
}

/// Serialize the persistent state into a self-validating blob.
pub(crate) fn encode_state(term: Term, voted_for: Option<NodeId>, log: &Log) -> Vec<u8> {
    let payload: usize = log
        .entries()
        .iter()
        .map(|e| ENTRY_HEADER_SIZE + ENTRY_CRC_SIZE + e.data.len() + ENTRY_CRC_SIZE)
        .sum();
    let mut buf = Vec::with_capacity(HEADER_SIZE + HEADER_CRC_SIZE + payload);

    buf.extend_from_slice(&TILLER_MAGIC);
    buf.extend_from_slice(&term.to_le_bytes());
    buf.extend_from_slice(
        &voted_for
            .map_or(VOTED_FOR_NONE, u64::from)
            .to_le_bytes(),
    );
    buf.extend_from_slice(&(log.len() as u64).to_le_bytes());
    buf.extend_from_slice(&crc(&buf).to_le_bytes());

    for entry in log.entries() {
        let start = buf.len();
        buf.extend_from_slice(&entry.id.to_le_bytes());
        buf.extend_from_slice(&entry.term.to_le_bytes());
        buf.extend_from_slice(&(entry.data.len() as u32).to_le_bytes());
        let header_crc = crc(&buf[start..]);
        buf.extend_from_slice(&header_crc.to_le_bytes());
        buf.extend_from_slice(&entry.data);
        buf.extend_from_slice(&crc(&entry.data).to_le_bytes());
    }

    buf
}

fn read_u64(buf: &[u8], at: usize) -> Result<u64> {
    let bytes: [u8; 8] = buf
        .get(at..at + 8)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| TillerError::InvalidData("state blob truncated".into()))?;
    Ok(u64::from_le_bytes(bytes))
}

fn read_u32(buf: &[u8], at: usize) -> Result<u32> {
    let bytes: [u8; 4] = buf
        .get(at..at + 4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| TillerError::InvalidData("state blob truncated".into()))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Decode a blob produced by [`encode_state`]. Entry payloads are zero-copy
/// slices of the input buffer.
pub(crate) fn decode_state(blob: &Bytes) -> Result<(Term, Option<NodeId>, Vec<LogEntry>)> {
    if blob.len() < HEADER_SIZE + HEADER_CRC_SIZE {
        return Err(TillerError::InvalidData(
            "state blob smaller than header".into(),
        ));
    }
    if blob[0..4] != TILLER_MAGIC {
        return Err(TillerError::InvalidData("bad magic in state blob".into()));
    }

    let stored_crc = read_u32(blob, HEADER_SIZE)?;
    if crc(&blob[..HEADER_SIZE]) != stored_crc {
        return Err(TillerError::DataCorruption(
            "state blob header checksum mismatch".into(),
        ));
    }

    let term = read_u64(blob, 4)?;
    let voted_raw = read_u64(blob, 12)?;
    let voted_for = if voted_raw == VOTED_FOR_NONE {
        None
    } else {
        u32::try_from(voted_raw)
            .map(Some)
            .map_err(|_| TillerError::InvalidData("voted_for out of range".into()))?
    };
    let entry_count = read_u64(blob, 20)?;

    let mut entries = Vec::new();
    let mut at = HEADER_SIZE + HEADER_CRC_SIZE;
    for _ in 0..entry_count {
        let header_end = at + ENTRY_HEADER_SIZE;
        let stored_header_crc = read_u32(blob, header_end)?;
        let header = blob
            .get(at..header_end)
            .ok_or_else(|| TillerError::InvalidData("state blob truncated".into()))?;
        // Validate the header before trusting data_len.
        if crc(header) != stored_header_crc {
            return Err(TillerError::DataCorruption(
                "entry header checksum mismatch".into(),
            ));
        }

        let id = read_u64(blob, at)?;
        let entry_term = read_u64(blob, at + 8)?;
        let data_len = read_u32(blob, at + 16)? as usize;

        let data_start = header_end + ENTRY_CRC_SIZE;
        let data_end = data_start + data_len;
        if blob.len() < data_end + ENTRY_CRC_SIZE {
            return Err(TillerError::InvalidData("state blob truncated".into()));
        }
        let stored_data_crc = read_u32(blob, data_end)?;
        if crc(&blob[data_start..data_end]) != stored_data_crc {
            return Err(TillerError::DataCorruption(
                "entry payload checksum mismatch".into(),
            ));
        }

        if id != entries.len() as u64 + 1 {
            return Err(TillerError::InvalidData(
                "log entries in state blob are not contiguous".into(),
            ));
        }
        entries.push(LogEntry::new(id, entry_term, blob.slice(data_start..data_end)));
        at = data_end + ENTRY_CRC_SIZE;
    }

    if at != blob.len() {
        return Err(TillerError::InvalidData(
            "trailing bytes after state blob".into(),
        ));
    }

    Ok((term, voted_for, entries))
}

/// Single-file persister with atomic replacement (temp file + rename).
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    /// Use `path` as the state file; parent directories are created eagerly.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }
}

impl Persister for FilePersister {
    fn save(&mut self, blob: &[u8]) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(blob)?;
        file.sync_all()?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Bytes>> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(fs::read(&self.path)?)))
    }
}

/// In-process persister for tests and embedded single-process clusters.
#[derive(Debug, Default)]
pub struct MemoryPersister {
    blob: Option<Bytes>,
}

impl MemoryPersister {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&mut self, blob: &[u8]) -> Result<()> {
        self.blob = Some(Bytes::copy_from_slice(blob));
        Ok(())
    }

    fn load(&mut self) -> Result<Option<Bytes>> {
        Ok(self.blob.clone())
    }
}
