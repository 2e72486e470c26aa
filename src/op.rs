//! Operation state and the caller-visible operation handles.
//!
//! Every asynchronous request is backed by one [`OpShared`] record, shared
//! between the caller's handle and the execution backend driving it. The
//! record's lifecycle phase is monotonic: Running, then Finished, exactly
//! once. `bytes_processed` and `error` are only meaningful to readers after
//! the operation finishes.
//!
//! # Completion and cancellation
//!
//! Completion is a single-fire event: the first call to
//! [`OpShared::complete`] wins and wakes every waiter; later calls are
//! no-ops. This is also how the completion/cancellation race is resolved —
//! an operation that completed just before a cancel reached it is *not*
//! retroactively marked aborted.
//!
//! Dropping a handle whose operation is still running blocks until the
//! owning backend has cancelled the operation or confirmed it finished, so
//! a backend can never keep working on buffers the caller has let go of.

use crate::backend::Backend;
use crate::error::{Error, Kind};
use crate::storage::DataStorage;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::{Arc, Weak};

/// Mutable portion of an operation record.
#[derive(Debug)]
pub(crate) struct OpState {
    pub(crate) processed: i64,
    pub(crate) error: Option<Error>,
    pub(crate) finished: bool,
    pub(crate) storage: DataStorage,
}

/// Shared record of one in-flight or completed operation.
#[derive(Debug)]
pub(crate) struct OpShared {
    kind: Kind,
    offset: i64,
    state: Mutex<OpState>,
    done: Condvar,
}

impl OpShared {
    pub(crate) fn new(kind: Kind, offset: i64, storage: DataStorage) -> Arc<Self> {
        Arc::new(Self {
            kind,
            offset,
            state: Mutex::new(OpState {
                processed: 0,
                error: None,
                finished: false,
                storage,
            }),
            done: Condvar::new(),
        })
    }

    pub(crate) fn kind(&self) -> Kind {
        self.kind
    }

    pub(crate) fn offset(&self) -> i64 {
        self.offset
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.lock().finished
    }

    pub(crate) fn error(&self) -> Option<Error> {
        self.state.lock().error
    }

    pub(crate) fn processed(&self) -> i64 {
        self.state.lock().processed
    }

    pub(crate) fn append_processed(&self, num: i64) {
        self.state.lock().processed += num;
    }

    /// Pre-sets the error a racing engine completion should report, without
    /// finishing the operation. Used when a file is being closed while the
    /// operation is still tracked by its backend.
    pub(crate) fn mark_error(&self, err: Error) {
        let mut state = self.state.lock();
        if !state.finished {
            state.error = Some(err);
        }
    }

    /// Transitions the operation to Finished and wakes all waiters. The
    /// first caller wins; a later call (a completion racing a cancel, or
    /// vice versa) is a no-op. Returns whether this call did the transition.
    pub(crate) fn complete(&self, err: Option<Error>) -> bool {
        let mut state = self.state.lock();
        if state.finished {
            return false;
        }
        state.error = err;
        state.finished = true;
        self.done.notify_all();
        true
    }

    /// Blocks until the operation finishes and returns its final error.
    pub(crate) fn wait(&self) -> Option<Error> {
        let mut state = self.state.lock();
        while !state.finished {
            self.done.wait(&mut state);
        }
        state.error
    }

    /// Direct access to the guarded state, for the owning backend.
    pub(crate) fn state(&self) -> MutexGuard<'_, OpState> {
        self.state.lock()
    }

    /// Takes the buffer for transfer chunk `idx` out of the storage,
    /// leaving an empty placeholder. The backend gives it back (possibly
    /// truncated) through [`OpShared::restore_chunk`] when the chunk is
    /// done, so no lock is held across the actual I/O.
    pub(crate) fn take_chunk(&self, idx: usize) -> Vec<u8> {
        let mut state = self.state.lock();
        match &mut state.storage {
            DataStorage::Owned(buf) => {
                debug_assert_eq!(idx, 0);
                std::mem::take(buf)
            }
            DataStorage::ReadBufs(bufs) => std::mem::take(&mut bufs[idx]),
            DataStorage::WriteBufs(bufs) => std::mem::take(&mut bufs[idx]),
            DataStorage::Empty => panic!("empty storage has no transfer chunks"),
        }
    }

    pub(crate) fn restore_chunk(&self, idx: usize, buf: Vec<u8>) {
        let mut state = self.state.lock();
        match &mut state.storage {
            DataStorage::Owned(slot) => *slot = buf,
            DataStorage::ReadBufs(bufs) => bufs[idx] = buf,
            DataStorage::WriteBufs(bufs) => bufs[idx] = buf,
            DataStorage::Empty => panic!("empty storage has no transfer chunks"),
        }
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.state.lock().storage.chunk_count()
    }
}

/// Handle to an asynchronous file operation.
///
/// The handle is the caller's only view of the in-flight work: it exposes
/// the operation's kind, completion state and final error, and
/// [`wait`](Operation::wait) blocks until the backend finishes the
/// operation.
///
/// Dropping a handle whose operation is still running first asks the
/// owning backend to cancel it and blocks until the backend confirms the
/// operation is finished or removed from its queues.
#[derive(Debug)]
pub struct Operation {
    pub(crate) shared: Arc<OpShared>,
    pub(crate) backend: Weak<dyn Backend>,
}

impl Operation {
    pub(crate) fn new(shared: Arc<OpShared>, backend: Weak<dyn Backend>) -> Self {
        Self { shared, backend }
    }

    /// The kind of work this operation performs.
    pub fn kind(&self) -> Kind {
        self.shared.kind()
    }

    /// Whether the operation has reached its terminal state.
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// The operation's error, `None` on success. Only meaningful once
    /// [`is_finished`](Operation::is_finished) returns true.
    pub fn error(&self) -> Option<Error> {
        self.shared.error()
    }

    /// Blocks the calling thread until the operation completes and returns
    /// its final error (`None` on success).
    pub fn wait(&self) -> Option<Error> {
        self.shared.wait()
    }
}

impl Drop for Operation {
    fn drop(&mut self) {
        if self.shared.is_finished() {
            return;
        }
        // The weak link never keeps the file alive; if the backend is gone
        // it has already aborted everything it was tracking.
        if let Some(backend) = self.backend.upgrade() {
            backend.cancel_and_wait(&self.shared);
        }
    }
}

macro_rules! rw_accessors {
    ($ty:ty) => {
        impl $ty {
            /// The file offset this operation started at.
            pub fn offset(&self) -> i64 {
                self.inner.shared.offset()
            }

            /// Total bytes transferred, or -1 while the operation is still
            /// running.
            pub fn bytes_processed(&self) -> i64 {
                if !self.inner.shared.is_finished() {
                    return -1;
                }
                self.inner.shared.processed()
            }
        }

        impl std::ops::Deref for $ty {
            type Target = Operation;

            fn deref(&self) -> &Operation {
                &self.inner
            }
        }
    };
}

/// Handle to a read operation that owns its destination buffer.
#[derive(Debug)]
pub struct ReadOperation {
    inner: Operation,
}

rw_accessors!(ReadOperation);

impl ReadOperation {
    pub(crate) fn new(shared: Arc<OpShared>, backend: Weak<dyn Backend>) -> Self {
        debug_assert_eq!(shared.kind(), Kind::Read);
        debug_assert!(shared.state().storage.is_owned());
        Self {
            inner: Operation::new(shared, backend),
        }
    }

    /// The bytes read, truncated to what was actually delivered. Empty
    /// until the operation finishes.
    pub fn data(&self) -> Vec<u8> {
        if !self.inner.shared.is_finished() {
            return Vec::new();
        }
        self.inner.shared.state().storage.owned().clone()
    }
}

/// Handle to a write operation that owns its source buffer.
#[derive(Debug)]
pub struct WriteOperation {
    inner: Operation,
}

rw_accessors!(WriteOperation);

impl WriteOperation {
    pub(crate) fn new(shared: Arc<OpShared>, backend: Weak<dyn Backend>) -> Self {
        debug_assert_eq!(shared.kind(), Kind::Write);
        debug_assert!(shared.state().storage.is_owned());
        Self {
            inner: Operation::new(shared, backend),
        }
    }

    /// The bytes this operation was asked to write. Empty until the
    /// operation finishes.
    pub fn data(&self) -> Vec<u8> {
        if !self.inner.shared.is_finished() {
            return Vec::new();
        }
        self.inner.shared.state().storage.owned().clone()
    }
}

/// Handle to a read operation over one or more caller-provided buffers.
#[derive(Debug)]
pub struct VectoredReadOperation {
    inner: Operation,
}

rw_accessors!(VectoredReadOperation);

impl VectoredReadOperation {
    pub(crate) fn new(shared: Arc<OpShared>, backend: Weak<dyn Backend>) -> Self {
        debug_assert_eq!(shared.kind(), Kind::Read);
        debug_assert!(shared.state().storage.is_read_bufs());
        Self {
            inner: Operation::new(shared, backend),
        }
    }

    /// The buffers handed over at submission, each truncated to the bytes
    /// actually delivered into it (earlier buffers fill before later ones).
    /// Empty until the operation finishes.
    pub fn buffers(&self) -> Vec<Vec<u8>> {
        if !self.inner.shared.is_finished() {
            return Vec::new();
        }
        self.inner.shared.state().storage.read_bufs().to_vec()
    }
}

/// Handle to a write operation over one or more caller-provided buffers.
#[derive(Debug)]
pub struct VectoredWriteOperation {
    inner: Operation,
}

rw_accessors!(VectoredWriteOperation);

impl VectoredWriteOperation {
    pub(crate) fn new(shared: Arc<OpShared>, backend: Weak<dyn Backend>) -> Self {
        debug_assert_eq!(shared.kind(), Kind::Write);
        debug_assert!(shared.state().storage.is_write_bufs());
        Self {
            inner: Operation::new(shared, backend),
        }
    }

    /// The source buffers handed over at submission. Empty until the
    /// operation finishes.
    pub fn buffers(&self) -> Vec<Vec<u8>> {
        if !self.inner.shared.is_finished() {
            return Vec::new();
        }
        self.inner.shared.state().storage.write_bufs().to_vec()
    }
}
