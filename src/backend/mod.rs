//! Execution backends.
//!
//! A backend owns the file resource and drives every queued operation to
//! its terminal state. Two implementations exist: the native one built on
//! the shared batched-async-I/O engine (Linux, behind the `io-uring`
//! feature) and the portable thread-pool fallback. Both present identical
//! operation semantics; which one a file uses is chosen at construction
//! and never changes.

use crate::engine::OpenMode;
use crate::op::OpShared;
use crate::storage::BufList;
use std::path::Path;
use std::sync::Arc;

pub(crate) mod thread_pool;

#[cfg(all(target_os = "linux", feature = "io-uring"))]
pub(crate) mod uring;

/// Backend contract shared by the native and thread-pool implementations.
///
/// Submission methods hand back the operation record already queued; the
/// record finishes asynchronously. Vectored submissions return `None` when
/// the backend cannot express the request, letting the caller fall back to
/// issuing the spans one by one.
pub(crate) trait Backend: Send + Sync {
    /// Queues an asynchronous open of `path`.
    fn open(&self, path: &Path, mode: OpenMode) -> Arc<OpShared>;

    /// Aborts every tracked operation and releases the file. Idempotent.
    fn close(&self);

    /// Current size of the open file in bytes, or -1 when no file is open.
    fn size(&self) -> i64;

    /// Queues a flush of all written data to the file.
    fn flush(&self) -> Arc<OpShared>;

    /// Queues a read at `offset` into `buf`; the buffer's length is the
    /// requested byte count and it is truncated to the bytes delivered.
    fn read(&self, offset: i64, buf: Vec<u8>) -> Arc<OpShared>;

    /// Queues a write of `buf` at `offset`.
    fn write(&self, offset: i64, buf: Vec<u8>) -> Arc<OpShared>;

    /// Queues a vectored read at `offset`, or returns the buffers back via
    /// `None` when vectored submission is unsupported.
    fn read_vectored(&self, offset: i64, bufs: BufList) -> Option<Arc<OpShared>>;

    /// Queues a vectored write at `offset`; `None` as for `read_vectored`.
    fn write_vectored(&self, offset: i64, bufs: BufList) -> Option<Arc<OpShared>>;

    /// Cancels `op` if the backend still tracks it and blocks until the
    /// operation is finished. A no-op for already finished operations.
    fn cancel_and_wait(&self, op: &Arc<OpShared>);
}

impl std::fmt::Debug for dyn Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Backend")
    }
}

/// Which execution backend a file runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Batched async I/O through the shared kernel ring. Only available on
    /// Linux with the `io-uring` feature; selecting it elsewhere fails.
    Native,
    /// Portable fallback driving blocking file I/O from a shared worker
    /// pool.
    ThreadPool,
}

#[cfg(all(target_os = "linux", feature = "io-uring"))]
fn native() -> Option<Arc<dyn Backend>> {
    uring::UringBackend::create()
}

#[cfg(not(all(target_os = "linux", feature = "io-uring")))]
fn native() -> Option<Arc<dyn Backend>> {
    None
}

/// Creates the preferred backend: native where it is available, otherwise
/// the thread-pool fallback. Never fails.
pub(crate) fn default_backend() -> Arc<dyn Backend> {
    match native() {
        Some(backend) => backend,
        None => thread_pool::ThreadPoolBackend::create(),
    }
}

/// Creates the explicitly requested backend, or `None` when it is not
/// available in this build or on this kernel.
pub(crate) fn for_kind(kind: BackendKind) -> Option<Arc<dyn Backend>> {
    match kind {
        BackendKind::Native => native(),
        BackendKind::ThreadPool => Some(thread_pool::ThreadPoolBackend::create()),
    }
}
