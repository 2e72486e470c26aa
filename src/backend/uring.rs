//! Native backend on top of the shared batched-async-I/O engine.
//!
//! Each file tracks its unfinished operations and the ring request handle
//! belonging to each. Completion callbacks run on the ring's driver thread;
//! they remove the operation from the tracking maps *before* firing the
//! completion, so a waiter observing Finished can rely on the backend no
//! longer touching the operation's buffers.
//!
//! Nothing here ever blocks on the ring from a completion callback; a
//! cleanup that needs another kernel round trip (closing a stray
//! descriptor from a cancelled open) is queued fire-and-forget instead.

#![allow(unsafe_code)]

use crate::backend::Backend;
use crate::engine::OpenMode;
use crate::error::{Error, Kind};
use crate::op::OpShared;
use crate::ring::{IoRing, RequestHandle, RingOutcome, RingPayload};
use crate::storage::{BufList, DataStorage};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Arc, Weak};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Closed,
    OpenPending,
    Opened,
}

struct Inner {
    fd: RawFd,
    file_state: FileState,
    /// Unfinished operations, in submission order.
    ops: Vec<Arc<OpShared>>,
    /// Ring request handle per unfinished operation.
    handles: HashMap<usize, RequestHandle>,
}

pub(crate) struct UringBackend {
    me: Weak<Self>,
    ring: &'static IoRing,
    inner: Mutex<Inner>,
}

fn key(op: &Arc<OpShared>) -> usize {
    Arc::as_ptr(op) as usize
}

fn open_flags(mode: OpenMode) -> i32 {
    let mut flags = match (mode.read, mode.write) {
        (true, false) => libc::O_RDONLY,
        (false, _) => libc::O_WRONLY,
        (true, true) => libc::O_RDWR,
    };
    if mode.create && mode.write {
        flags |= libc::O_CREAT;
    }
    if mode.truncate {
        flags |= libc::O_TRUNC;
    }
    if mode.append {
        flags |= libc::O_APPEND;
    }
    flags | libc::O_CLOEXEC
}

fn map_errno(op: &Arc<OpShared>, errno: i32, kind_err: Error) -> Error {
    // An operation the backend already condemned reports Aborted no matter
    // what the kernel says.
    if op.error() == Some(Error::Aborted) || errno == libc::ECANCELED {
        Error::Aborted
    } else if errno == libc::EBADF {
        Error::FileNotOpen
    } else if errno == libc::EINVAL || errno == libc::ENXIO {
        Error::IncorrectOffset
    } else {
        kind_err
    }
}

impl UringBackend {
    pub(crate) fn create() -> Option<Arc<dyn Backend>> {
        let ring = IoRing::shared()?;
        let backend = Arc::new_cyclic(|me: &Weak<Self>| Self {
            me: me.clone(),
            ring,
            inner: Mutex::new(Inner {
                fd: -1,
                file_state: FileState::Closed,
                ops: Vec::new(),
                handles: HashMap::new(),
            }),
        });
        let backend: Arc<dyn Backend> = backend;
        Some(backend)
    }

    /// Removes `op` from the tracking maps, then finishes it. Map removal
    /// must come first: a finished operation is no longer the backend's.
    fn finish(&self, op: &Arc<OpShared>, err: Option<Error>) {
        {
            let mut inner = self.inner.lock();
            inner.handles.remove(&key(op));
            inner.ops.retain(|tracked| !Arc::ptr_eq(tracked, op));
        }
        op.complete(err);
    }

    fn open_finished(&self, op: &Arc<OpShared>, outcome: RingOutcome) {
        match outcome {
            Ok(fd) => {
                let fd = fd as RawFd;
                let mut inner = self.inner.lock();
                let tracked = inner.ops.iter().any(|tracked| Arc::ptr_eq(tracked, op));
                if tracked && inner.file_state == FileState::OpenPending {
                    inner.fd = fd;
                    inner.file_state = FileState::Opened;
                    drop(inner);
                    self.finish(op, None);
                } else {
                    // The open was cancelled (or the file closed) while the
                    // request was in flight and still succeeded; the fresh
                    // descriptor must not leak.
                    drop(inner);
                    self.finish(op, Some(Error::Aborted));
                    self.ring.queue_request(RingPayload::close(fd), None, None);
                }
            }
            Err(errno) => {
                let mut inner = self.inner.lock();
                if inner.file_state == FileState::OpenPending {
                    inner.file_state = FileState::Closed;
                }
                drop(inner);
                self.finish(op, Some(map_errno(op, errno, Error::Open)));
            }
        }
    }

    fn transfer_finished(&self, op: &Arc<OpShared>, outcome: RingOutcome, is_read: bool) {
        match outcome {
            Ok(n) => {
                {
                    let mut state = op.state();
                    state.processed += n;
                    if is_read {
                        let total = state.processed;
                        state.storage.truncate_read(total);
                    }
                }
                self.finish(op, op.error());
            }
            Err(errno) => {
                let kind_err = if is_read { Error::Read } else { Error::Write };
                self.finish(op, Some(map_errno(op, errno, kind_err)));
            }
        }
    }

    fn flush_finished(&self, op: &Arc<OpShared>, outcome: RingOutcome) {
        match outcome {
            Ok(_) => self.finish(op, op.error()),
            Err(errno) => self.finish(op, Some(map_errno(op, errno, Error::Flush))),
        }
    }

    /// Queues a read or write whose buffers live in the operation's
    /// storage. The operation itself is the request keepalive, so the
    /// kernel-visible pointers stay valid until the completion is reaped.
    fn start_transfer(&self, op: Arc<OpShared>) -> Arc<OpShared> {
        let mut inner = self.inner.lock();
        if inner.file_state != FileState::Opened {
            drop(inner);
            op.complete(Some(Error::FileNotOpen));
            return op;
        }
        if op.offset() < 0 {
            drop(inner);
            op.complete(Some(Error::IncorrectOffset));
            return op;
        }
        let fd = inner.fd;
        let offset = op.offset() as u64;
        let is_read = op.kind() == Kind::Read;

        // SAFETY: the pointers target buffers inside the operation's
        // storage; the ring pins the operation until the request completes
        // and the backend does not touch the storage while it is tracked.
        let payload = unsafe {
            let mut state = op.state();
            match &mut state.storage {
                DataStorage::Owned(buf) if is_read => {
                    RingPayload::read(fd, offset, buf.as_mut_ptr(), buf.len() as u32)
                }
                DataStorage::Owned(buf) => {
                    RingPayload::write(fd, offset, buf.as_ptr(), buf.len() as u32)
                }
                DataStorage::ReadBufs(bufs) => {
                    let iovecs = bufs
                        .iter_mut()
                        .map(|buf| libc::iovec {
                            iov_base: buf.as_mut_ptr().cast(),
                            iov_len: buf.len(),
                        })
                        .collect();
                    RingPayload::read_vectored(fd, offset, iovecs)
                }
                DataStorage::WriteBufs(bufs) => {
                    let iovecs = bufs
                        .iter()
                        .map(|buf| libc::iovec {
                            iov_base: buf.as_ptr() as *mut libc::c_void,
                            iov_len: buf.len(),
                        })
                        .collect();
                    RingPayload::write_vectored(fd, offset, iovecs)
                }
                DataStorage::Empty => unreachable!("transfers always carry storage"),
            }
        };

        let me = self.me.clone();
        let callback_op = Arc::clone(&op);
        let handle = self.ring.queue_request(
            payload,
            Some(Box::new(move |outcome| {
                let Some(backend) = me.upgrade() else {
                    callback_op.complete(Some(Error::Aborted));
                    return;
                };
                backend.transfer_finished(&callback_op, outcome, is_read);
            })),
            Some(Arc::clone(&op)),
        );
        // The inner lock is still held, so the completion callback cannot
        // observe the maps before both entries exist.
        inner.handles.insert(key(&op), handle);
        inner.ops.push(Arc::clone(&op));
        drop(inner);
        op
    }
}

impl Backend for UringBackend {
    fn open(&self, path: &Path, mode: OpenMode) -> Arc<OpShared> {
        let op = OpShared::new(Kind::Open, 0, DataStorage::Empty);
        let mut inner = self.inner.lock();
        if inner.file_state != FileState::Closed {
            drop(inner);
            op.complete(Some(Error::Open));
            return op;
        }
        if !mode.read && !mode.write {
            // No access requested; the blocking engine rejects this too.
            drop(inner);
            op.complete(Some(Error::Open));
            return op;
        }
        let Ok(cpath) = CString::new(path.as_os_str().as_bytes()) else {
            drop(inner);
            op.complete(Some(Error::Open));
            return op;
        };
        inner.file_state = FileState::OpenPending;

        let me = self.me.clone();
        let callback_op = Arc::clone(&op);
        let handle = self.ring.queue_request(
            RingPayload::open(cpath, open_flags(mode)),
            Some(Box::new(move |outcome| {
                let Some(backend) = me.upgrade() else {
                    callback_op.complete(Some(Error::Aborted));
                    return;
                };
                backend.open_finished(&callback_op, outcome);
            })),
            Some(Arc::clone(&op)),
        );
        inner.handles.insert(key(&op), handle);
        inner.ops.push(Arc::clone(&op));
        drop(inner);
        op
    }

    fn close(&self) {
        let (ops, handles, fd) = {
            let mut inner = self.inner.lock();
            let ops = inner.ops.clone();
            let handles: Vec<RequestHandle> = inner.handles.values().cloned().collect();
            let fd = inner.fd;
            inner.fd = -1;
            inner.file_state = FileState::Closed;
            (ops, handles, fd)
        };
        // Condemn first so a request the cancel misses still reports
        // Aborted, then cancel everything in flight.
        for op in &ops {
            op.mark_error(Error::Aborted);
        }
        for handle in &handles {
            self.ring
                .queue_request(RingPayload::cancel(handle.user_data()), None, None);
        }
        if fd >= 0 {
            let close_handle = self.ring.queue_request(RingPayload::close(fd), None, None);
            self.ring.wait_for_request(&close_handle);
        }
        for handle in &handles {
            self.ring.wait_for_request(handle);
        }
    }

    fn size(&self) -> i64 {
        let fd = {
            let inner = self.inner.lock();
            if inner.file_state != FileState::Opened {
                return -1;
            }
            inner.fd
        };
        let result = Arc::new(Mutex::new(-1i64));
        let slot = Arc::clone(&result);
        let handle = self.ring.queue_request(
            RingPayload::stat(fd),
            Some(Box::new(move |outcome| {
                if let Ok(size) = outcome {
                    *slot.lock() = size;
                }
            })),
            None,
        );
        self.ring.wait_for_request(&handle);
        let size = *result.lock();
        size
    }

    fn flush(&self) -> Arc<OpShared> {
        let op = OpShared::new(Kind::Flush, 0, DataStorage::Empty);
        let mut inner = self.inner.lock();
        if inner.file_state != FileState::Opened {
            drop(inner);
            op.complete(Some(Error::FileNotOpen));
            return op;
        }
        let fd = inner.fd;
        let me = self.me.clone();
        let callback_op = Arc::clone(&op);
        let handle = self.ring.queue_request(
            RingPayload::flush(fd),
            Some(Box::new(move |outcome| {
                let Some(backend) = me.upgrade() else {
                    callback_op.complete(Some(Error::Aborted));
                    return;
                };
                backend.flush_finished(&callback_op, outcome);
            })),
            Some(Arc::clone(&op)),
        );
        inner.handles.insert(key(&op), handle);
        inner.ops.push(Arc::clone(&op));
        drop(inner);
        op
    }

    fn read(&self, offset: i64, buf: Vec<u8>) -> Arc<OpShared> {
        self.start_transfer(OpShared::new(Kind::Read, offset, DataStorage::Owned(buf)))
    }

    fn write(&self, offset: i64, buf: Vec<u8>) -> Arc<OpShared> {
        self.start_transfer(OpShared::new(Kind::Write, offset, DataStorage::Owned(buf)))
    }

    fn read_vectored(&self, offset: i64, bufs: BufList) -> Option<Arc<OpShared>> {
        if !self.ring.supports_vectored_read() {
            return None;
        }
        Some(self.start_transfer(OpShared::new(
            Kind::Read,
            offset,
            DataStorage::ReadBufs(bufs),
        )))
    }

    fn write_vectored(&self, offset: i64, bufs: BufList) -> Option<Arc<OpShared>> {
        if !self.ring.supports_vectored_write() {
            return None;
        }
        Some(self.start_transfer(OpShared::new(
            Kind::Write,
            offset,
            DataStorage::WriteBufs(bufs),
        )))
    }

    fn cancel_and_wait(&self, op: &Arc<OpShared>) {
        let handle = {
            let inner = self.inner.lock();
            inner.handles.get(&key(op)).cloned()
        };
        let Some(handle) = handle else {
            // Already finished, or its completion callback is running.
            op.wait();
            return;
        };
        let cancel_handle =
            self.ring
                .queue_request(RingPayload::cancel(handle.user_data()), None, None);
        self.ring.wait_for_request(&cancel_handle);
        // Whichever way the race went, the request's own completion has
        // the final word; wait for its callback to run.
        self.ring.wait_for_request(&handle);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn backend_or_skip() -> Option<Arc<dyn Backend>> {
        UringBackend::create()
    }

    #[test]
    fn test_open_write_read_round_trip() {
        let Some(backend) = backend_or_skip() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("ring.bin");

        assert_eq!(backend.open(&path, OpenMode::read_write()).wait(), None);
        let write = backend.write(0, b"native ring backend".to_vec());
        assert_eq!(write.wait(), None);
        assert_eq!(write.processed(), 19);
        assert_eq!(backend.size(), 19);

        let read = backend.read(7, vec![0; 4]);
        assert_eq!(read.wait(), None);
        assert_eq!(read.state().storage.owned().as_slice(), b"ring");
        backend.close();
    }

    #[test]
    fn test_short_read_truncates_result() {
        let Some(backend) = backend_or_skip() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("short.bin");
        std::fs::write(&path, b"0123456789").expect("seed file");

        assert_eq!(backend.open(&path, OpenMode::read_only()).wait(), None);
        let read = backend.read(6, vec![0; 32]);
        assert_eq!(read.wait(), None);
        assert_eq!(read.processed(), 4);
        assert_eq!(read.state().storage.owned().as_slice(), b"6789");
        backend.close();
    }

    #[test]
    fn test_vectored_read_distributes_front_to_back() {
        let Some(backend) = backend_or_skip() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vec.bin");
        std::fs::write(&path, b"abcdef").expect("seed file");

        assert_eq!(backend.open(&path, OpenMode::read_only()).wait(), None);
        let bufs: BufList = smallvec![vec![0; 4], vec![0; 4]];
        let Some(read) = backend.read_vectored(0, bufs) else {
            backend.close();
            return;
        };
        assert_eq!(read.wait(), None);
        assert_eq!(read.processed(), 6);
        let lens: Vec<usize> = {
            let state = read.state();
            state.storage.read_bufs().iter().map(Vec::len).collect()
        };
        assert_eq!(lens, [4, 2]);
        backend.close();
    }

    #[test]
    fn test_open_missing_file_fails_with_open_error() {
        let Some(backend) = backend_or_skip() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let open = backend.open(&dir.path().join("missing"), OpenMode::read_only());
        assert_eq!(open.wait(), Some(Error::Open));
        // The failed open leaves the file closed; a retry is allowed.
        assert_eq!(backend.size(), -1);
    }

    #[test]
    fn test_open_without_access_mode_fails() {
        let Some(backend) = backend_or_skip() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("noaccess.bin");
        std::fs::write(&path, b"x").expect("seed file");
        let open = backend.open(&path, OpenMode::default());
        assert_eq!(open.wait(), Some(Error::Open));
        assert_eq!(backend.size(), -1);
    }

    #[test]
    fn test_close_then_reads_report_file_not_open() {
        let Some(backend) = backend_or_skip() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("closed.bin");
        assert_eq!(backend.open(&path, OpenMode::read_write()).wait(), None);
        backend.close();
        assert_eq!(backend.read(0, vec![0; 4]).wait(), Some(Error::FileNotOpen));
    }
}
