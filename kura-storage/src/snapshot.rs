//! # Snapshot File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Header (64 bytes)                            │
//! │   magic      = "MKVS"        (4 B)           │
//! │   version    = u32 (= 1)                     │
//! │   record_cnt = u32                           │
//! │   wal_lsn    = u64   # next LSN not covered  │
//! │   timestamp  = u64                           │
//! │   checksum   = u32   # over the other fields │
//! │   reserved   = 32 B                          │
//! ├──────────────────────────────────────────────┤
//! │ record_cnt × { u32 key_len, key,             │
//! │                u32 val_len, val }            │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! Keys and values are the canonical byte encodings. A legacy snapshot
//! carrying LSN 0 simply replays the whole WAL on top.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use tracing::{debug, warn};

use kura_core::error::{Error, Result};
use kura_core::SNAPSHOT_FORMAT_VERSION;

pub const SNAPSHOT_MAGIC: &[u8; 4] = b"MKVS";
const RESERVED_LEN: usize = 32;

/// XOR fold over every header field other than the checksum itself.
fn header_checksum(version: u32, record_count: u32, wal_lsn: u64, timestamp: u64) -> u32 {
    let mut checksum = 0u32;
    checksum ^= version;
    checksum ^= record_count;
    checksum ^= wal_lsn as u32;
    checksum ^= (wal_lsn >> 32) as u32;
    checksum ^= timestamp as u32;
    checksum ^= (timestamp >> 32) as u32;
    for (i, &b) in SNAPSHOT_MAGIC.iter().enumerate() {
        checksum ^= u32::from(b) << (i * 8);
    }
    checksum
}

/// `snapshot_<unix_ms>.bin`
pub fn snapshot_file_name(timestamp_ms: i64) -> String {
    format!("snapshot_{}.bin", timestamp_ms)
}

/// Timestamp embedded in a snapshot filename, if it has the expected shape.
pub fn parse_snapshot_timestamp(file_name: &str) -> Option<i64> {
    let rest = file_name.strip_prefix("snapshot_")?;
    let digits = rest.strip_suffix(".bin")?;
    digits.parse().ok()
}

/// All snapshots in `dir`, newest first by the filename timestamp.
pub fn list_snapshots(dir: &Path) -> Result<Vec<(i64, PathBuf)>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut snapshots = Vec::new();
    let entries = fs::read_dir(dir).map_err(|e| Error::io("list snapshots", e))?;
    for entry in entries {
        let entry = entry.map_err(|e| Error::io("list snapshots", e))?;
        let name = entry.file_name();
        if let Some(ts) = name.to_str().and_then(parse_snapshot_timestamp) {
            snapshots.push((ts, entry.path()));
        }
    }

    snapshots.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(snapshots)
}

/// Write a complete snapshot: header, records, flush, fsync.
pub fn write_snapshot(
    path: &Path,
    entries: &[(Bytes, Bytes)],
    wal_lsn: u64,
    timestamp_ms: i64,
) -> Result<()> {
    let record_count = u32::try_from(entries.len()).map_err(|_| Error::Internal {
        message: format!("snapshot record count {} exceeds u32", entries.len()),
    })?;

    let file = File::create(path).map_err(|e| Error::io("create snapshot", e))?;
    let mut writer = BufWriter::new(file);

    let timestamp = timestamp_ms as u64;
    let checksum = header_checksum(SNAPSHOT_FORMAT_VERSION, record_count, wal_lsn, timestamp);

    writer
        .write_all(SNAPSHOT_MAGIC)
        .and_then(|_| writer.write_u32::<LittleEndian>(SNAPSHOT_FORMAT_VERSION))
        .and_then(|_| writer.write_u32::<LittleEndian>(record_count))
        .and_then(|_| writer.write_u64::<LittleEndian>(wal_lsn))
        .and_then(|_| writer.write_u64::<LittleEndian>(timestamp))
        .and_then(|_| writer.write_u32::<LittleEndian>(checksum))
        .and_then(|_| writer.write_all(&[0u8; RESERVED_LEN]))
        .map_err(|e| Error::io("write snapshot header", e))?;

    for (key, value) in entries {
        writer
            .write_u32::<LittleEndian>(key.len() as u32)
            .and_then(|_| writer.write_all(key))
            .and_then(|_| writer.write_u32::<LittleEndian>(value.len() as u32))
            .and_then(|_| writer.write_all(value))
            .map_err(|e| Error::io("write snapshot record", e))?;
    }

    writer
        .flush()
        .map_err(|e| Error::io("flush snapshot", e))?;
    writer
        .get_ref()
        .sync_all()
        .map_err(|e| Error::io("fsync snapshot", e))?;

    debug!(
        path = %path.display(),
        records = entries.len(),
        wal_lsn,
        "snapshot written"
    );
    Ok(())
}

/// Read and fully validate a snapshot. Any mismatch aborts with
/// `CorruptSnapshot`; no partial data is returned.
pub fn read_snapshot(path: &Path) -> Result<(Vec<(Bytes, Bytes)>, u64)> {
    let file = File::open(path).map_err(|e| Error::io("open snapshot", e))?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| Error::corrupt("truncated header"))?;
    if &magic != SNAPSHOT_MAGIC {
        return Err(Error::corrupt("bad magic"));
    }

    let version = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::corrupt("truncated header"))?;
    if version != SNAPSHOT_FORMAT_VERSION {
        return Err(Error::corrupt(format!("unsupported version {}", version)));
    }

    let record_count = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::corrupt("truncated header"))?;
    let wal_lsn = reader
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::corrupt("truncated header"))?;
    let timestamp = reader
        .read_u64::<LittleEndian>()
        .map_err(|_| Error::corrupt("truncated header"))?;
    let stored_checksum = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| Error::corrupt("truncated header"))?;

    let mut reserved = [0u8; RESERVED_LEN];
    reader
        .read_exact(&mut reserved)
        .map_err(|_| Error::corrupt("truncated header"))?;

    let expected = header_checksum(version, record_count, wal_lsn, timestamp);
    if stored_checksum != expected {
        warn!(
            path = %path.display(),
            stored = stored_checksum,
            expected,
            "snapshot header checksum mismatch"
        );
        return Err(Error::corrupt("header checksum mismatch"));
    }

    let mut entries = Vec::with_capacity(record_count as usize);
    for i in 0..record_count {
        let key_len = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::corrupt(format!("truncated at record {} key length", i)))?;
        let mut key = vec![0u8; key_len as usize];
        reader
            .read_exact(&mut key)
            .map_err(|_| Error::corrupt(format!("truncated at record {} key", i)))?;

        let val_len = reader
            .read_u32::<LittleEndian>()
            .map_err(|_| Error::corrupt(format!("truncated at record {} value length", i)))?;
        let mut value = vec![0u8; val_len as usize];
        reader
            .read_exact(&mut value)
            .map_err(|_| Error::corrupt(format!("truncated at record {} value", i)))?;

        entries.push((Bytes::from(key), Bytes::from(value)));
    }

    Ok((entries, wal_lsn))
}
