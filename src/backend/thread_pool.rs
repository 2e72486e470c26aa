//! Thread-pool fallback backend.
//!
//! Operations are queued strictly first-in first-out and executed one at a
//! time; a vectored operation is further broken into one transfer chunk per
//! buffer. Each chunk becomes one job on the shared worker pool, which
//! drives the blocking [`FileEngine`] under the engine mutex so a seek and
//! the transfer that follows it stay atomic.
//!
//! Cancellation uses a discard flag: the in-flight chunk is allowed to run
//! to the end (blocking I/O cannot be interrupted mid-syscall), its result
//! is thrown away, and the canceller finalizes the operation itself once
//! the worker signals idle.
//!
//! Lock order: `inner` before any operation record's state, and `inner`
//! before the engine mutex (teardown closes the engine under `inner` so a
//! fresh open cannot interleave). Workers take the engine mutex with no
//! other lock held and release it before touching `inner`.

use crate::backend::Backend;
use crate::engine::{FileEngine, FsFileEngine, OpenMode};
use crate::error::{Error, Kind};
use crate::op::OpShared;
use crate::pool::PoolRef;
use crate::storage::{BufList, DataStorage};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Closed,
    OpenPending,
    Opened,
}

struct Inner {
    file_state: FileState,
    open_target: Option<(PathBuf, OpenMode)>,
    queue: VecDeque<Arc<OpShared>>,
    current: Option<Arc<OpShared>>,
    chunk_index: usize,
    chunk_in_flight: bool,
    discard: bool,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            file_state: FileState::Closed,
            open_target: None,
            queue: VecDeque::new(),
            current: None,
            chunk_index: 0,
            chunk_in_flight: false,
            discard: false,
        }
    }
}

pub(crate) struct ThreadPoolBackend {
    me: Weak<Self>,
    pool: PoolRef,
    engine: Mutex<Box<dyn FileEngine>>,
    inner: Mutex<Inner>,
    // Signaled whenever chunk_in_flight drops to false.
    idle: Condvar,
}

impl ThreadPoolBackend {
    pub(crate) fn create() -> Arc<dyn Backend> {
        Self::with_engine(Box::new(FsFileEngine::new()))
    }

    fn with_engine(engine: Box<dyn FileEngine>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            pool: PoolRef::acquire(),
            engine: Mutex::new(engine),
            inner: Mutex::new(Inner::default()),
            idle: Condvar::new(),
        })
    }

    fn submit(&self, op: Arc<OpShared>) -> Arc<OpShared> {
        let mut inner = self.inner.lock();
        if inner.file_state == FileState::Closed {
            drop(inner);
            op.complete(Some(Error::FileNotOpen));
            return op;
        }
        if op.offset() < 0 {
            drop(inner);
            op.complete(Some(Error::IncorrectOffset));
            return op;
        }
        if matches!(op.kind(), Kind::Read | Kind::Write) && op.chunk_count() == 0 {
            drop(inner);
            op.complete(None);
            return op;
        }
        inner.queue.push_back(Arc::clone(&op));
        self.pump(&mut inner);
        op
    }

    /// Starts the next queued operation if nothing is running.
    fn pump(&self, inner: &mut Inner) {
        if inner.current.is_some() {
            return;
        }
        let Some(op) = inner.queue.pop_front() else {
            return;
        };
        inner.current = Some(op);
        inner.chunk_index = 0;
        inner.discard = false;
        self.dispatch_current(inner);
    }

    /// Spawns the worker job for the current operation's next chunk.
    fn dispatch_current(&self, inner: &mut Inner) {
        let op = match &inner.current {
            Some(op) => Arc::clone(op),
            None => return,
        };
        inner.chunk_in_flight = true;
        let me = self.me.clone();
        match op.kind() {
            Kind::Open => {
                let (path, mode) = match inner.open_target.take() {
                    Some(target) => target,
                    None => {
                        // Cleared by a racing close; the op is finalized there.
                        inner.chunk_in_flight = false;
                        return;
                    }
                };
                self.pool.spawn(move || {
                    let Some(backend) = me.upgrade() else {
                        op.complete(Some(Error::Aborted));
                        return;
                    };
                    let ok = backend.engine.lock().open(&path, mode);
                    backend.open_done(&op, ok);
                });
            }
            Kind::Flush => {
                self.pool.spawn(move || {
                    let Some(backend) = me.upgrade() else {
                        op.complete(Some(Error::Aborted));
                        return;
                    };
                    let err = {
                        let mut engine = backend.engine.lock();
                        if !engine.is_open() {
                            Some(Error::FileNotOpen)
                        } else if engine.flush() {
                            None
                        } else {
                            Some(Error::Flush)
                        }
                    };
                    backend.simple_done(&op, err);
                });
            }
            Kind::Read | Kind::Write => {
                let idx = inner.chunk_index;
                // Later chunks pick up right after the bytes already moved.
                let offset = op.offset() + op.processed();
                let is_read = op.kind() == Kind::Read;
                let mut buf = op.take_chunk(idx);
                self.pool.spawn(move || {
                    let Some(backend) = me.upgrade() else {
                        op.complete(Some(Error::Aborted));
                        return;
                    };
                    let result = {
                        let mut engine = backend.engine.lock();
                        if !engine.is_open() {
                            Err(Error::FileNotOpen)
                        } else if !engine.seek(offset) {
                            Err(Error::IncorrectOffset)
                        } else if is_read {
                            match engine.read(&mut buf) {
                                Ok(n) => {
                                    buf.truncate(n);
                                    Ok(n as i64)
                                }
                                Err(err) => Err(map_transfer_error(&err, Error::Read)),
                            }
                        } else {
                            match engine.write(&buf) {
                                Ok(n) => Ok(n as i64),
                                Err(err) => Err(map_transfer_error(&err, Error::Write)),
                            }
                        }
                    };
                    if is_read && result.is_err() {
                        // An erroring read span comes back empty, never full
                        // of stale bytes.
                        buf.clear();
                    }
                    backend.chunk_done(&op, idx, buf, result);
                });
            }
            Kind::Unknown => {
                debug_assert!(false, "unknown operations are never queued");
                inner.chunk_in_flight = false;
            }
        }
    }

    /// True while `inner` says someone else (a canceller or a close) has
    /// taken over finalizing `op`.
    fn discarded(inner: &Inner, op: &Arc<OpShared>) -> bool {
        inner.discard
            || !matches!(&inner.current, Some(current) if Arc::ptr_eq(current, op))
    }

    fn open_done(&self, op: &Arc<OpShared>, ok: bool) {
        let mut inner = self.inner.lock();
        inner.chunk_in_flight = false;
        self.idle.notify_all();
        if Self::discarded(&inner, op) {
            return;
        }
        inner.current = None;
        inner.file_state = if ok {
            FileState::Opened
        } else {
            FileState::Closed
        };
        drop(inner);
        op.complete(if ok { None } else { Some(Error::Open) });
        let mut inner = self.inner.lock();
        self.pump(&mut inner);
    }

    fn simple_done(&self, op: &Arc<OpShared>, err: Option<Error>) {
        let mut inner = self.inner.lock();
        inner.chunk_in_flight = false;
        self.idle.notify_all();
        if Self::discarded(&inner, op) {
            return;
        }
        inner.current = None;
        drop(inner);
        op.complete(err);
        let mut inner = self.inner.lock();
        self.pump(&mut inner);
    }

    fn chunk_done(&self, op: &Arc<OpShared>, idx: usize, buf: Vec<u8>, result: Result<i64, Error>) {
        op.restore_chunk(idx, buf);
        let mut inner = self.inner.lock();
        inner.chunk_in_flight = false;
        self.idle.notify_all();
        if Self::discarded(&inner, op) {
            return;
        }
        let error = match result {
            Ok(n) => {
                op.append_processed(n);
                None
            }
            Err(err) => Some(err),
        };
        let last = idx + 1 >= op.chunk_count();
        if error.is_some() || last {
            // A failed chunk ends the operation; later chunks never run.
            inner.current = None;
            drop(inner);
            op.complete(error);
            let mut inner = self.inner.lock();
            self.pump(&mut inner);
        } else {
            inner.chunk_index = idx + 1;
            self.dispatch_current(&mut inner);
        }
    }
}

fn map_transfer_error(err: &io::Error, fallback: Error) -> Error {
    match err.kind() {
        io::ErrorKind::NotConnected => Error::FileNotOpen,
        io::ErrorKind::InvalidInput => Error::IncorrectOffset,
        _ => fallback,
    }
}

impl Backend for ThreadPoolBackend {
    fn open(&self, path: &Path, mode: OpenMode) -> Arc<OpShared> {
        let op = OpShared::new(Kind::Open, 0, DataStorage::Empty);
        let mut inner = self.inner.lock();
        if inner.file_state != FileState::Closed {
            drop(inner);
            op.complete(Some(Error::Open));
            return op;
        }
        inner.file_state = FileState::OpenPending;
        inner.open_target = Some((path.to_path_buf(), mode));
        inner.queue.push_back(Arc::clone(&op));
        self.pump(&mut inner);
        op
    }

    fn close(&self) {
        let mut inner = self.inner.lock();
        let queued: Vec<Arc<OpShared>> = inner.queue.drain(..).collect();
        let current = inner.current.take();
        if current.is_some() {
            inner.discard = true;
            while inner.chunk_in_flight {
                self.idle.wait(&mut inner);
            }
            inner.discard = false;
        }
        inner.file_state = FileState::Closed;
        inner.open_target = None;
        // Engine teardown happens under the state lock: a concurrent open()
        // must not be able to open the engine between the state reset and
        // this close. Safe to nest, workers never hold the engine mutex
        // while acquiring the state lock.
        self.engine.lock().close();
        drop(inner);
        for op in queued {
            op.complete(Some(Error::Aborted));
        }
        if let Some(op) = current {
            op.complete(Some(Error::Aborted));
        }
    }

    fn size(&self) -> i64 {
        self.engine.lock().size()
    }

    fn flush(&self) -> Arc<OpShared> {
        self.submit(OpShared::new(Kind::Flush, 0, DataStorage::Empty))
    }

    fn read(&self, offset: i64, buf: Vec<u8>) -> Arc<OpShared> {
        self.submit(OpShared::new(Kind::Read, offset, DataStorage::Owned(buf)))
    }

    fn write(&self, offset: i64, buf: Vec<u8>) -> Arc<OpShared> {
        self.submit(OpShared::new(Kind::Write, offset, DataStorage::Owned(buf)))
    }

    fn read_vectored(&self, offset: i64, bufs: BufList) -> Option<Arc<OpShared>> {
        Some(self.submit(OpShared::new(Kind::Read, offset, DataStorage::ReadBufs(bufs))))
    }

    fn write_vectored(&self, offset: i64, bufs: BufList) -> Option<Arc<OpShared>> {
        Some(self.submit(OpShared::new(
            Kind::Write,
            offset,
            DataStorage::WriteBufs(bufs),
        )))
    }

    fn cancel_and_wait(&self, op: &Arc<OpShared>) {
        let mut inner = self.inner.lock();
        let is_current = matches!(&inner.current, Some(current) if Arc::ptr_eq(current, op));
        if is_current {
            inner.discard = true;
            while inner.chunk_in_flight {
                self.idle.wait(&mut inner);
            }
            inner.current = None;
            inner.discard = false;
            if op.kind() == Kind::Open {
                inner.file_state = FileState::Closed;
                inner.open_target = None;
                // The worker may have opened the file after the cancel won.
                // Close it before releasing the state lock so a successor
                // open() cannot interleave and lose its engine to this
                // teardown.
                self.engine.lock().close();
            }
            drop(inner);
            op.complete(Some(Error::Aborted));
            let mut inner = self.inner.lock();
            self.pump(&mut inner);
            return;
        }
        if let Some(pos) = inner.queue.iter().position(|queued| Arc::ptr_eq(queued, op)) {
            inner.queue.remove(pos);
            if op.kind() == Kind::Open {
                inner.file_state = FileState::Closed;
                inner.open_target = None;
            }
            drop(inner);
            op.complete(Some(Error::Aborted));
            return;
        }
        drop(inner);
        // Not tracked anymore: either finished, or a worker is completing
        // it right now.
        op.wait();
    }
}
