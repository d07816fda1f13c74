//! # Write-Ahead Log
//!
//! Length-prefixed record stream on top of the append-only writer, with an
//! in-memory buffer and a background fsync thread.
//!
//! ## Frame layout (little-endian)
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ u32 frame_len     # length of the remainder │
//! │ u8  op            # 1=PUT 2=DELETE 3=SNAP   │
//! │ u32 key_len;   key bytes                    │
//! │ u32 value_len; value bytes  (0 for DELETE)  │
//! │ i64 timestamp_ms                            │
//! │ u64 lsn           # record-level LSN        │
//! │ u32 checksum      # over key ‖ value        │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! There is no file-level header; corruption is detected per record via the
//! checksum and frame-length sanity checks. Replay after a snapshot is
//! addressed by the per-record LSN.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use bytes::{Buf, Bytes};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use kura_core::error::{Error, Result};

use crate::append_file::AppendFile;

/// Minimum frame body: op + two length prefixes + timestamp + lsn + checksum.
const MIN_FRAME_BODY: usize = 1 + 4 + 4 + 8 + 8 + 4;

/// Name of the log file inside the data directory.
pub const WAL_FILE_NAME: &str = "wal.log";
/// Name of the snapshot directory inside the data directory.
pub const SNAPSHOTS_DIR_NAME: &str = "snapshots";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WalOp {
    Put = 1,
    Delete = 2,
    Snapshot = 3,
}

impl TryFrom<u8> for WalOp {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(WalOp::Put),
            2 => Ok(WalOp::Delete),
            3 => Ok(WalOp::Snapshot),
            other => Err(Error::Internal {
                message: format!("invalid WAL op: {}", other),
            }),
        }
    }
}

/// One committed mutation.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub op: WalOp,
    pub key: Bytes,
    pub value: Bytes,
    pub timestamp_ms: i64,
    pub lsn: u64,
}

impl LogRecord {
    pub fn put(key: Bytes, value: Bytes, timestamp_ms: i64, lsn: u64) -> Self {
        Self {
            op: WalOp::Put,
            key,
            value,
            timestamp_ms,
            lsn,
        }
    }

    pub fn delete(key: Bytes, timestamp_ms: i64, lsn: u64) -> Self {
        Self {
            op: WalOp::Delete,
            key,
            value: Bytes::new(),
            timestamp_ms,
            lsn,
        }
    }

    /// Polynomial rolling hash over `key ‖ value`.
    pub fn checksum(&self) -> u32 {
        let mut checksum: u32 = 0;
        for &b in self.key.iter().chain(self.value.iter()) {
            checksum = checksum.wrapping_mul(31).wrapping_add(u32::from(b));
        }
        checksum
    }

    /// Serialise into a framed byte string ready for the log.
    fn encode(&self) -> Result<Vec<u8>> {
        if self.key.len() > u32::MAX as usize {
            return Err(Error::OversizedRecord {
                what: "key",
                len: self.key.len(),
            });
        }
        if self.value.len() > u32::MAX as usize {
            return Err(Error::OversizedRecord {
                what: "value",
                len: self.value.len(),
            });
        }

        let body_len = MIN_FRAME_BODY + self.key.len() + self.value.len();
        let mut out = Vec::with_capacity(4 + body_len);

        out.extend_from_slice(&(body_len as u32).to_le_bytes());
        out.push(self.op as u8);
        out.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.key);
        out.extend_from_slice(&(self.value.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.value);
        out.extend_from_slice(&self.timestamp_ms.to_le_bytes());
        out.extend_from_slice(&self.lsn.to_le_bytes());
        out.extend_from_slice(&self.checksum().to_le_bytes());

        Ok(out)
    }

    /// Parse one frame body. Returns the record and the checksum stored in
    /// the frame; the caller decides what to do with a mismatch.
    fn decode(mut body: &[u8]) -> Result<(LogRecord, u32)> {
        if body.len() < MIN_FRAME_BODY {
            return Err(Error::Internal {
                message: format!("WAL frame too short: {} bytes", body.len()),
            });
        }

        let op = WalOp::try_from(body.get_u8())?;

        let key_len = body.get_u32_le() as usize;
        if body.remaining() < key_len {
            return Err(Error::Internal {
                message: "WAL frame truncated inside key".into(),
            });
        }
        let key = Bytes::copy_from_slice(&body[..key_len]);
        body.advance(key_len);

        if body.remaining() < 4 {
            return Err(Error::Internal {
                message: "WAL frame truncated before value length".into(),
            });
        }
        let value_len = body.get_u32_le() as usize;
        if body.remaining() < value_len + 8 + 8 + 4 {
            return Err(Error::Internal {
                message: "WAL frame truncated inside value".into(),
            });
        }
        let value = Bytes::copy_from_slice(&body[..value_len]);
        body.advance(value_len);

        let timestamp_ms = body.get_i64_le();
        let lsn = body.get_u64_le();
        let stored_checksum = body.get_u32_le();

        Ok((
            LogRecord {
                op,
                key,
                value,
                timestamp_ms,
                lsn,
            },
            stored_checksum,
        ))
    }
}

/// WAL tuning knobs.
#[derive(Debug, Clone)]
pub struct WalConfig {
    pub data_dir: PathBuf,
    pub buffer_size: usize,
    pub fsync_interval: Duration,
}

struct WalState {
    writer: Option<AppendFile>,
    buffer: Vec<u8>,
}

struct WalShared {
    wal_path: PathBuf,
    snapshots_dir: PathBuf,
    buffer_size: usize,
    fsync_interval: Duration,
    state: Mutex<WalState>,
    fsync_running: AtomicBool,
}

impl WalShared {
    /// Push the buffer through the writer and fsync. Caller holds the state
    /// lock. On failure the buffer is retained so the records are not lost
    /// silently; a later flush may still succeed.
    fn flush_locked(&self, state: &mut WalState) -> Result<()> {
        if state.buffer.is_empty() {
            return Ok(());
        }
        let writer = state.writer.as_mut().ok_or(Error::WalClosed)?;
        writer.append(&state.buffer)?;
        writer.sync()?;
        state.buffer.clear();
        Ok(())
    }
}

/// Durable, append-only record of mutations. `append` buffers in memory;
/// durability comes from `flush`, called by the background fsync thread,
/// by the buffer-full path, and on shutdown.
pub struct WriteAheadLog {
    shared: Arc<WalShared>,
    fsync_thread: Mutex<Option<JoinHandle<()>>>,
}

impl WriteAheadLog {
    pub fn open(config: WalConfig) -> Result<Self> {
        let wal_path = config.data_dir.join(WAL_FILE_NAME);
        let snapshots_dir = config.data_dir.join(SNAPSHOTS_DIR_NAME);

        fs::create_dir_all(&config.data_dir).map_err(|e| Error::io("create data dir", e))?;
        fs::create_dir_all(&snapshots_dir).map_err(|e| Error::io("create snapshots dir", e))?;

        let writer = AppendFile::open(&wal_path)?;

        info!(path = %wal_path.display(), "WAL opened");

        Ok(Self {
            shared: Arc::new(WalShared {
                wal_path,
                snapshots_dir,
                buffer_size: config.buffer_size,
                fsync_interval: config.fsync_interval,
                state: Mutex::new(WalState {
                    writer: Some(writer),
                    buffer: Vec::with_capacity(config.buffer_size),
                }),
                fsync_running: AtomicBool::new(false),
            }),
            fsync_thread: Mutex::new(None),
        })
    }

    pub fn wal_path(&self) -> &Path {
        &self.shared.wal_path
    }

    pub fn snapshots_dir(&self) -> &Path {
        &self.shared.snapshots_dir
    }

    /// Append a record. The record is buffered; if it does not fit in the
    /// reserve, the buffer is flushed to disk first. A returned error means
    /// the record is not committed.
    pub fn append(&self, record: &LogRecord) -> Result<()> {
        let frame = record.encode()?;

        let mut state = self.shared.state.lock();
        if !state.buffer.is_empty() && state.buffer.len() + frame.len() > self.shared.buffer_size {
            self.shared.flush_locked(&mut state)?;
        }
        state.buffer.extend_from_slice(&frame);
        Ok(())
    }

    /// Copy the in-memory buffer to the kernel and fsync.
    pub fn flush(&self) -> Result<()> {
        let mut state = self.shared.state.lock();
        self.shared.flush_locked(&mut state)
    }

    /// Parse the whole file from offset 0. Stops cleanly at a truncated
    /// trailing frame; records with a checksum mismatch are skipped.
    pub fn read_all(&self) -> Result<Vec<LogRecord>> {
        let data = match fs::read(&self.shared.wal_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io("read WAL", e)),
        };

        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset + 4 <= data.len() {
            let frame_len = u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]) as usize;
            offset += 4;

            if frame_len < MIN_FRAME_BODY || offset + frame_len > data.len() {
                // Truncated or nonsensical trailing frame: end of usable log.
                debug!(offset, frame_len, "stopping WAL scan at partial frame");
                break;
            }

            match LogRecord::decode(&data[offset..offset + frame_len]) {
                Ok((record, stored_checksum)) => {
                    if record.checksum() == stored_checksum {
                        records.push(record);
                    } else {
                        warn!(lsn = record.lsn, "skipping WAL record with bad checksum");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "skipping undecodable WAL frame");
                }
            }
            offset += frame_len;
        }

        Ok(records)
    }

    /// Records strictly after the given LSN, in log order.
    pub fn read_after_lsn(&self, lsn: u64) -> Result<Vec<LogRecord>> {
        Ok(self
            .read_all()?
            .into_iter()
            .filter(|r| r.lsn > lsn)
            .collect())
    }

    /// On-disk size plus buffered-but-unflushed bytes. Drives the
    /// checkpoint size trigger.
    pub fn log_size(&self) -> u64 {
        let buffered = self.shared.state.lock().buffer.len() as u64;
        let on_disk = fs::metadata(&self.shared.wal_path)
            .map(|m| m.len())
            .unwrap_or(0);
        on_disk + buffered
    }

    /// Drop the log entirely: close the file, delete it together with the
    /// snapshot directory contents, reopen empty, clear the buffer.
    pub fn clear_all(&self) -> Result<()> {
        let mut state = self.shared.state.lock();

        state.writer = None;
        state.buffer.clear();

        match fs::remove_file(&self.shared.wal_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("remove WAL file", e)),
        }

        if self.shared.snapshots_dir.exists() {
            fs::remove_dir_all(&self.shared.snapshots_dir)
                .map_err(|e| Error::io("remove snapshots dir", e))?;
        }
        fs::create_dir_all(&self.shared.snapshots_dir)
            .map_err(|e| Error::io("recreate snapshots dir", e))?;

        state.writer = Some(AppendFile::open(&self.shared.wal_path)?);
        info!("WAL cleared");
        Ok(())
    }

    /// Truncate only the log file, leaving snapshots in place. Used by the
    /// checkpoint protocol after the snapshot is durable.
    pub fn truncate_log(&self) -> Result<()> {
        let mut state = self.shared.state.lock();

        state.writer = None;
        state.buffer.clear();

        match fs::remove_file(&self.shared.wal_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io("remove WAL file", e)),
        }

        state.writer = Some(AppendFile::open(&self.shared.wal_path)?);
        debug!("WAL truncated after checkpoint");
        Ok(())
    }

    /// Spin the dedicated fsync thread: sleep `fsync_interval`, flush, repeat.
    pub fn start_background_fsync(&self) {
        if self.shared.fsync_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name("kura-wal-fsync".into())
            .spawn(move || {
                debug!("WAL fsync thread started");
                while shared.fsync_running.load(Ordering::Relaxed) {
                    std::thread::sleep(shared.fsync_interval);
                    if !shared.fsync_running.load(Ordering::Relaxed) {
                        break;
                    }
                    let mut state = shared.state.lock();
                    if let Err(e) = shared.flush_locked(&mut state) {
                        error!(error = %e, "background fsync failed");
                    }
                }
                debug!("WAL fsync thread stopped");
            })
            .expect("failed to spawn WAL fsync thread");

        *self.fsync_thread.lock() = Some(handle);
    }

    pub fn stop_background_fsync(&self) {
        self.shared.fsync_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.fsync_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WriteAheadLog {
    fn drop(&mut self) {
        self.stop_background_fsync();
        if let Err(e) = self.flush() {
            error!(error = %e, "final WAL flush failed on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_wal(dir: &Path) -> WriteAheadLog {
        WriteAheadLog::open(WalConfig {
            data_dir: dir.to_path_buf(),
            buffer_size: 1024,
            fsync_interval: Duration::from_millis(50),
        })
        .unwrap()
    }

    #[test]
    fn record_encode_decode() {
        let record = LogRecord::put(
            Bytes::from_static(b"k1"),
            Bytes::from_static(b"v1"),
            1_700_000_000_000,
            7,
        );
        let frame = record.encode().unwrap();
        let body = &frame[4..];
        let (decoded, checksum) = LogRecord::decode(body).unwrap();

        assert_eq!(decoded.op, WalOp::Put);
        assert_eq!(decoded.key, record.key);
        assert_eq!(decoded.value, record.value);
        assert_eq!(decoded.timestamp_ms, record.timestamp_ms);
        assert_eq!(decoded.lsn, 7);
        assert_eq!(checksum, record.checksum());
    }

    #[test]
    fn checksum_depends_on_key_and_value() {
        let a = LogRecord::put(Bytes::from_static(b"ab"), Bytes::from_static(b"c"), 0, 0);
        let b = LogRecord::put(Bytes::from_static(b"a"), Bytes::from_static(b"bc"), 0, 0);
        // Same concatenation hashes the same; the length prefixes keep the
        // frames distinct.
        assert_eq!(a.checksum(), b.checksum());

        let c = LogRecord::put(Bytes::from_static(b"ab"), Bytes::from_static(b"d"), 0, 0);
        assert_ne!(a.checksum(), c.checksum());
    }

    #[test]
    fn buffered_append_is_visible_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let wal = test_wal(dir.path());

        let record = LogRecord::put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), 1, 1);
        wal.append(&record).unwrap();
        assert!(wal.read_all().unwrap().is_empty());

        wal.flush().unwrap();
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].key, record.key);
    }

    #[test]
    fn full_buffer_spills_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let wal = test_wal(dir.path());

        // Each record is well over 100 bytes; the 1KiB buffer fills fast.
        for i in 0..64u32 {
            let record = LogRecord::put(
                Bytes::from(format!("key-{}", i).into_bytes()),
                Bytes::from(vec![b'x'; 100]),
                i as i64,
                u64::from(i),
            );
            wal.append(&record).unwrap();
        }
        wal.flush().unwrap();

        assert_eq!(wal.read_all().unwrap().len(), 64);
    }

    #[test]
    fn normal_sized_records_encode() {
        // The oversized guard triggers only past u32::MAX bytes, which is
        // not allocatable in a unit test; assert the happy path and the
        // error shape instead.
        let record = LogRecord::put(Bytes::from_static(b"k"), Bytes::from_static(b"v"), 0, 0);
        assert!(record.encode().is_ok());

        let err = Error::OversizedRecord {
            what: "value",
            len: u32::MAX as usize + 1,
        };
        assert_eq!(err.error_code(), "OVERSIZED_RECORD");
    }

    #[test]
    fn read_after_lsn_filters() {
        let dir = tempfile::tempdir().unwrap();
        let wal = test_wal(dir.path());

        for lsn in 1..=10u64 {
            wal.append(&LogRecord::put(
                Bytes::from(format!("k{}", lsn).into_bytes()),
                Bytes::from_static(b"v"),
                lsn as i64,
                lsn,
            ))
            .unwrap();
        }
        wal.flush().unwrap();

        let tail = wal.read_after_lsn(7).unwrap();
        assert_eq!(tail.len(), 3);
        assert_eq!(tail[0].lsn, 8);
        assert_eq!(tail[2].lsn, 10);
    }

    #[test]
    fn truncated_trailing_frame_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let wal = test_wal(dir.path());

        for i in 0..3u64 {
            wal.append(&LogRecord::put(
                Bytes::from(format!("k{}", i).into_bytes()),
                Bytes::from_static(b"value"),
                i as i64,
                i + 1,
            ))
            .unwrap();
        }
        wal.flush().unwrap();
        drop(wal);

        // Chop bytes off the end, as a crash mid-write would.
        let path = dir.path().join(WAL_FILE_NAME);
        let mut data = fs::read(&path).unwrap();
        data.truncate(data.len() - 7);
        fs::write(&path, &data).unwrap();

        let wal = test_wal(dir.path());
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].lsn, 2);
    }

    #[test]
    fn corrupted_record_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let wal = test_wal(dir.path());

        for i in 0..3u64 {
            wal.append(&LogRecord::put(
                Bytes::from(format!("k{}", i).into_bytes()),
                Bytes::from_static(b"value"),
                i as i64,
                i + 1,
            ))
            .unwrap();
        }
        wal.flush().unwrap();
        drop(wal);

        // Flip a byte inside the second record's value.
        let path = dir.path().join(WAL_FILE_NAME);
        let mut data = fs::read(&path).unwrap();
        let frame_len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
        let second_value_byte = 4 + frame_len + 4 + 1 + 4 + 2 + 4;
        data[second_value_byte] ^= 0xff;
        fs::write(&path, &data).unwrap();

        let wal = test_wal(dir.path());
        let records = wal.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].lsn, 1);
        assert_eq!(records[1].lsn, 3);
    }

    #[test]
    fn clear_all_resets_log_and_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let wal = test_wal(dir.path());

        wal.append(&LogRecord::put(
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
            1,
            1,
        ))
        .unwrap();
        wal.flush().unwrap();

        let snap = wal.snapshots_dir().join("snapshot_1.bin");
        fs::write(&snap, b"stale").unwrap();

        wal.clear_all().unwrap();
        assert!(wal.read_all().unwrap().is_empty());
        assert!(!snap.exists());
        assert!(wal.snapshots_dir().exists());

        // Log is usable again after the reset.
        wal.append(&LogRecord::put(
            Bytes::from_static(b"k2"),
            Bytes::from_static(b"v2"),
            2,
            2,
        ))
        .unwrap();
        wal.flush().unwrap();
        assert_eq!(wal.read_all().unwrap().len(), 1);
    }

    #[test]
    fn background_fsync_flushes_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let wal = test_wal(dir.path());

        wal.start_background_fsync();
        wal.append(&LogRecord::put(
            Bytes::from_static(b"k"),
            Bytes::from_static(b"v"),
            1,
            1,
        ))
        .unwrap();

        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(wal.read_all().unwrap().len(), 1);
        wal.stop_background_fsync();
    }
}
