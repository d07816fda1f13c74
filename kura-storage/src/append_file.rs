//! Append-only file writer.
//!
//! Wraps a file opened in append-create-write-only mode, so appends are
//! atomic relative to one another even across concurrent openers of the same
//! path. Writes go straight to the kernel with no user-space buffering;
//! durability requires an explicit [`sync`](AppendFile::sync).
//!
//! Not internally synchronised; the WAL and group-commit layers serialise
//! their callers.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use kura_core::error::{Error, Result};

#[derive(Debug)]
pub struct AppendFile {
    file: File,
    path: PathBuf,
    written_bytes: u64,
}

impl AppendFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| Error::io("open append file", e))?;

        Ok(Self {
            file,
            path,
            written_bytes: 0,
        })
    }

    /// Write all of `data`, looping over partial writes and retrying when a
    /// signal interrupts the syscall.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        let mut written = 0;
        while written < data.len() {
            match self.file.write(&data[written..]) {
                Ok(0) => {
                    return Err(Error::io(
                        "append",
                        std::io::Error::new(ErrorKind::WriteZero, "write returned 0 bytes"),
                    ));
                }
                Ok(n) => {
                    written += n;
                    self.written_bytes += n as u64;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io("append", e)),
            }
        }
        Ok(())
    }

    /// Writes are unbuffered at user level, so there is nothing to push to
    /// the kernel here. Kept for interface symmetry with `sync`.
    pub fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    /// Force data and metadata to durable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all().map_err(|e| Error::io("fsync", e))
    }

    /// Total bytes appended through this handle.
    pub fn written_bytes(&self) -> u64 {
        self.written_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_accumulate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");

        let mut file = AppendFile::open(&path).unwrap();
        file.append(b"hello ").unwrap();
        file.append(b"world").unwrap();
        file.sync().unwrap();
        assert_eq!(file.written_bytes(), 11);

        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[test]
    fn reopen_appends_to_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");

        {
            let mut file = AppendFile::open(&path).unwrap();
            file.append(b"first").unwrap();
        }
        {
            let mut file = AppendFile::open(&path).unwrap();
            file.append(b"|second").unwrap();
            // The counter is per-handle, not per-file.
            assert_eq!(file.written_bytes(), 7);
        }

        assert_eq!(std::fs::read(&path).unwrap(), b"first|second");
    }

    #[test]
    fn open_fails_on_bad_path() {
        let err = AppendFile::open("/nonexistent-dir-kura/x.log").unwrap_err();
        assert_eq!(err.error_code(), "IO_ERROR");
    }
}
