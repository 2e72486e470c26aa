//! The public asynchronous file handle.

use crate::backend::{self, Backend, BackendKind};
use crate::engine::OpenMode;
use crate::op::{
    Operation, ReadOperation, VectoredReadOperation, VectoredWriteOperation, WriteOperation,
};
use crate::storage::BufList;
use std::path::Path;
use std::sync::{Arc, Weak};

/// Construction options for [`AsyncFile`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Config {
    /// Force a specific execution backend. `None` picks the native backend
    /// where available and falls back to the thread pool otherwise.
    pub backend: Option<BackendKind>,
}

/// A file whose reads and writes run asynchronously at explicit offsets.
///
/// Every submission returns immediately with an operation handle; the work
/// itself is driven by the file's backend. There is no file position:
/// every transfer names its own offset, so independent submissions never
/// disturb each other.
///
/// ```no_run
/// use asyncfile::{AsyncFile, OpenMode};
///
/// let file = AsyncFile::new();
/// file.open("data.bin", OpenMode::read_write()).wait();
/// let write = file.write(0, &b"hello"[..]);
/// write.wait();
/// let read = file.read(0, 5);
/// read.wait();
/// assert_eq!(read.data(), b"hello");
/// ```
///
/// Dropping the file aborts everything still in flight and closes the
/// underlying file.
#[derive(Debug)]
pub struct AsyncFile {
    backend: Arc<dyn Backend>,
}

impl AsyncFile {
    /// Creates a file handle on the preferred backend for this platform.
    pub fn new() -> Self {
        Self {
            backend: backend::default_backend(),
        }
    }

    /// Creates a file handle per `config`. Returns `None` when the
    /// requested backend is not available in this build or on this kernel.
    pub fn with_config(config: Config) -> Option<Self> {
        let backend = match config.backend {
            None => backend::default_backend(),
            Some(kind) => backend::for_kind(kind)?,
        };
        Some(Self { backend })
    }

    fn backlink(&self) -> Weak<dyn Backend> {
        Arc::downgrade(&self.backend)
    }

    /// Queues an asynchronous open of `path`. Exactly one open may be
    /// active per file; a second open while one is pending or the file is
    /// already open fails with [`Error::Open`](crate::Error::Open).
    pub fn open(&self, path: impl AsRef<Path>, mode: OpenMode) -> Operation {
        Operation::new(self.backend.open(path.as_ref(), mode), self.backlink())
    }

    /// Aborts every operation still in flight and closes the file. Every
    /// tracked operation is finished (aborted or with its real result)
    /// before this returns. Closing a closed file does nothing.
    pub fn close(&self) {
        self.backend.close();
    }

    /// Current file size in bytes, or -1 when no file is open.
    pub fn size(&self) -> i64 {
        self.backend.size()
    }

    /// Queues a flush of written data down to the file.
    pub fn flush(&self) -> Operation {
        Operation::new(self.backend.flush(), self.backlink())
    }

    /// Queues a read of up to `max_size` bytes at `offset` into a buffer
    /// the operation owns. A negative `max_size` is treated as zero.
    pub fn read(&self, offset: i64, max_size: i64) -> ReadOperation {
        let len = match usize::try_from(max_size) {
            Ok(len) => len,
            Err(_) => {
                log::warn!("negative read size {max_size} clamped to 0");
                0
            }
        };
        ReadOperation::new(self.backend.read(offset, vec![0; len]), self.backlink())
    }

    /// Queues a read at `offset` into `buf`; up to `buf.len()` bytes are
    /// delivered and the buffer is handed back truncated to that count.
    pub fn read_into(&self, offset: i64, buf: Vec<u8>) -> ReadOperation {
        ReadOperation::new(self.backend.read(offset, buf), self.backlink())
    }

    /// Queues a write of `data` at `offset`.
    pub fn write(&self, offset: i64, data: impl Into<Vec<u8>>) -> WriteOperation {
        WriteOperation::new(self.backend.write(offset, data.into()), self.backlink())
    }

    /// Queues a write of `buf` at `offset`. The buffer is handed back
    /// through [`WriteOperation::data`] once the operation finishes.
    pub fn write_from(&self, offset: i64, buf: Vec<u8>) -> WriteOperation {
        WriteOperation::new(self.backend.write(offset, buf), self.backlink())
    }

    /// Queues a single read at `offset` spanning `bufs` in order: earlier
    /// buffers fill before later ones, and each comes back truncated to
    /// the bytes it received.
    ///
    /// Returns `None` when the backend cannot submit vectored I/O (a ring
    /// without vectored opcodes); callers then issue per-buffer reads.
    pub fn read_vectored(&self, offset: i64, bufs: Vec<Vec<u8>>) -> Option<VectoredReadOperation> {
        let bufs: BufList = bufs.into_iter().collect();
        let op = self.backend.read_vectored(offset, bufs)?;
        Some(VectoredReadOperation::new(op, self.backlink()))
    }

    /// Queues a single write at `offset` draining `bufs` in order.
    /// `None` as for [`read_vectored`](AsyncFile::read_vectored).
    pub fn write_vectored(
        &self,
        offset: i64,
        bufs: Vec<Vec<u8>>,
    ) -> Option<VectoredWriteOperation> {
        let bufs: BufList = bufs.into_iter().collect();
        let op = self.backend.write_vectored(offset, bufs)?;
        Some(VectoredWriteOperation::new(op, self.backlink()))
    }
}

impl Default for AsyncFile {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AsyncFile {
    fn drop(&mut self) {
        self.backend.close();
    }
}
