//! Synchronous file engine abstraction.
//!
//! The thread-pool backend drives an ordinary blocking engine from worker
//! threads. The engine itself is not required to be thread-safe: the
//! backend guards every call with a single per-file mutex so that a seek
//! and its following transfer stay atomic with respect to other chunks.
//!
//! [`FsFileEngine`] is the default, `std::fs`-backed implementation; the
//! [`FileEngine`] trait is the seam where tests substitute a faulty engine.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// How a file should be opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct OpenMode {
    /// Allow reads.
    pub read: bool,
    /// Allow writes.
    pub write: bool,
    /// Create the file if it does not exist.
    pub create: bool,
    /// Truncate the file on open.
    pub truncate: bool,
    /// Force writes to the end of the file.
    pub append: bool,
}

impl OpenMode {
    /// Read-only access to an existing file.
    pub const fn read_only() -> Self {
        Self {
            read: true,
            write: false,
            create: false,
            truncate: false,
            append: false,
        }
    }

    /// Write-only access, creating the file if needed.
    pub const fn write_only() -> Self {
        Self {
            read: false,
            write: true,
            create: true,
            truncate: false,
            append: false,
        }
    }

    /// Read-write access, creating the file if needed.
    pub const fn read_write() -> Self {
        Self {
            read: true,
            write: true,
            create: true,
            truncate: false,
            append: false,
        }
    }

    /// Truncate the file on open.
    pub const fn truncating(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Append to the file instead of writing in place.
    pub const fn appending(mut self) -> Self {
        self.append = true;
        self
    }
}

/// Minimal synchronous engine surface consumed by the thread-pool backend.
pub trait FileEngine: Send {
    /// Opens `path` with `mode`. Returns whether the open succeeded.
    fn open(&mut self, path: &Path, mode: OpenMode) -> bool;
    /// Whether a file is currently open.
    fn is_open(&self) -> bool;
    /// Positions the engine at `offset`. Returns whether the seek was
    /// accepted; a negative offset is always rejected.
    fn seek(&mut self, offset: i64) -> bool;
    /// Reads up to `buf.len()` bytes at the current position. A short
    /// count means end-of-file.
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;
    /// Writes `buf` at the current position.
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize>;
    /// Flushes buffered data to the file. Returns whether it succeeded.
    fn flush(&mut self) -> bool;
    /// Size of the open file in bytes, or -1 if not open.
    fn size(&self) -> i64;
    /// Closes the file. Further calls behave as if never opened.
    fn close(&mut self);
}

/// `std::fs`-backed engine.
#[derive(Debug, Default)]
pub struct FsFileEngine {
    file: Option<fs::File>,
}

impl FsFileEngine {
    /// Creates an engine with no file open.
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileEngine for FsFileEngine {
    fn open(&mut self, path: &Path, mode: OpenMode) -> bool {
        let mut options = fs::OpenOptions::new();
        options
            .read(mode.read)
            .write(mode.write && !mode.append)
            .create(mode.create)
            .truncate(mode.truncate)
            .append(mode.append);
        match options.open(path) {
            Ok(file) => {
                self.file = Some(file);
                true
            }
            Err(err) => {
                log::debug!("open of {} failed: {err}", path.display());
                false
            }
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn seek(&mut self, offset: i64) -> bool {
        if offset < 0 {
            return false;
        }
        match &mut self.file {
            Some(file) => file.seek(SeekFrom::Start(offset as u64)).is_ok(),
            None => false,
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let Some(file) = &mut self.file else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        // One logical read fills the buffer or hits end-of-file; a short
        // count from a single syscall must not masquerade as EOF.
        let mut total = 0;
        while total < buf.len() {
            match file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let Some(file) = &mut self.file else {
            return Err(std::io::Error::from(std::io::ErrorKind::NotConnected));
        };
        let mut total = 0;
        while total < buf.len() {
            match file.write(&buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(total)
    }

    fn flush(&mut self) -> bool {
        match &mut self.file {
            Some(file) => file.sync_data().is_ok(),
            None => false,
        }
    }

    fn size(&self) -> i64 {
        self.file
            .as_ref()
            .and_then(|file| file.metadata().ok())
            .map_or(-1, |meta| i64::try_from(meta.len()).unwrap_or(i64::MAX))
    }

    fn close(&mut self) {
        self.file = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_read_write_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.bin");

        let mut engine = FsFileEngine::new();
        assert!(engine.open(&path, OpenMode::read_write()));
        assert!(engine.seek(0));
        assert_eq!(engine.write(b"hello engine").expect("write"), 12);
        assert_eq!(engine.size(), 12);

        assert!(engine.seek(6));
        let mut buf = [0u8; 6];
        assert_eq!(engine.read(&mut buf).expect("read"), 6);
        assert_eq!(&buf, b"engine");
    }

    #[test]
    fn test_negative_seek_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.bin");
        let mut engine = FsFileEngine::new();
        assert!(engine.open(&path, OpenMode::read_write()));
        assert!(!engine.seek(-1));
    }

    #[test]
    fn test_unopened_engine_reports_closed() {
        let mut engine = FsFileEngine::new();
        assert!(!engine.is_open());
        assert_eq!(engine.size(), -1);
        assert!(!engine.seek(0));
        assert!(!engine.flush());
        assert!(engine.read(&mut [0u8; 4]).is_err());
    }

    #[test]
    fn test_short_read_at_eof() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"0123456789").expect("seed file");

        let mut engine = FsFileEngine::new();
        assert!(engine.open(&path, OpenMode::read_only()));
        assert!(engine.seek(7));
        let mut buf = [0u8; 8];
        assert_eq!(engine.read(&mut buf).expect("read"), 3);
        assert_eq!(&buf[..3], b"789");
    }

    #[test]
    fn test_open_missing_file_read_only_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut engine = FsFileEngine::new();
        assert!(!engine.open(&dir.path().join("missing"), OpenMode::read_only()));
    }
}
