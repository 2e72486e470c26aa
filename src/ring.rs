//! Shared native batched-async-I/O engine (io_uring, Linux only).
//!
//! One process-wide ring serves every file using the native backend. A
//! dedicated driver thread owns the `io_uring` instance: submissions arrive
//! over a channel (an eventfd poll entry wakes the driver out of its
//! completion wait), completions are reaped and dispatched *on the driver
//! thread, in completion order*. That thread is the single safe completion
//! context; callbacks never run on the submitting thread.
//!
//! Every request keeps its operation's shared record alive until the
//! completion is reaped, so kernel-visible buffers cannot be freed while a
//! request is in flight.
//!
//! NOTE: This module uses unsafe to submit SQEs that carry raw buffer
//! pointers. The safety invariants are documented inline.

#![allow(unsafe_code)]

use crate::op::OpShared;
use io_uring::{opcode, squeue, types, IoUring, Probe};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::ffi::CString;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, TryRecvError};
use std::sync::{Arc, OnceLock};
use std::thread;

const ENTRIES: u32 = 256;
const WAKE_USER_DATA: u64 = u64::MAX;

/// Result of one ring request: the raw non-negative result value (bytes
/// transferred, new descriptor, or zero) or the errno it failed with.
pub(crate) type RingOutcome = Result<i64, i32>;

/// Completion callback, invoked once on the driver thread.
pub(crate) type RingCallback = Box<dyn FnOnce(RingOutcome) + Send + 'static>;

struct ReqState {
    user_data: u64,
    done: Mutex<bool>,
    settled: Condvar,
}

/// Opaque handle to one queued request.
#[derive(Clone)]
pub(crate) struct RequestHandle(Arc<ReqState>);

impl RequestHandle {
    fn new(user_data: u64) -> Self {
        Self(Arc::new(ReqState {
            user_data,
            done: Mutex::new(false),
            settled: Condvar::new(),
        }))
    }

    pub(crate) fn user_data(&self) -> u64 {
        self.0.user_data
    }

    fn settle(&self) {
        let mut done = self.0.done.lock();
        *done = true;
        self.0.settled.notify_all();
    }

    fn wait(&self) {
        let mut done = self.0.done.lock();
        while !*done {
            self.0.settled.wait(&mut done);
        }
    }
}

struct RawBuf(*mut u8);
// SAFETY: the pointed-to buffer belongs to the request's keepalive
// operation record, which stays alive until the completion is reaped.
unsafe impl Send for RawBuf {}

struct RawConstBuf(*const u8);
// SAFETY: as for `RawBuf`.
unsafe impl Send for RawConstBuf {}

struct IoVecList(Vec<libc::iovec>);
// SAFETY: every iovec targets a buffer owned by the request's keepalive
// operation record.
unsafe impl Send for IoVecList {}

/// What a request asks the ring to do.
pub(crate) enum RingPayload {
    Open { path: CString, flags: i32 },
    Close { fd: RawFd },
    Read { fd: RawFd, offset: u64, buf: RawBuf, len: u32 },
    Write { fd: RawFd, offset: u64, buf: RawConstBuf, len: u32 },
    ReadVectored { fd: RawFd, offset: u64, iovecs: IoVecList },
    WriteVectored { fd: RawFd, offset: u64, iovecs: IoVecList },
    Flush { fd: RawFd },
    Stat { fd: RawFd },
    Cancel { target: u64 },
}

impl RingPayload {
    pub(crate) fn open(path: CString, flags: i32) -> Self {
        Self::Open { path, flags }
    }

    pub(crate) fn close(fd: RawFd) -> Self {
        Self::Close { fd }
    }

    /// # Safety
    ///
    /// `buf..buf+len` must stay valid and unmoved until the request
    /// completes; callers guarantee this by passing the owning operation
    /// as the request's keepalive.
    pub(crate) unsafe fn read(fd: RawFd, offset: u64, buf: *mut u8, len: u32) -> Self {
        Self::Read {
            fd,
            offset,
            buf: RawBuf(buf),
            len,
        }
    }

    /// # Safety
    ///
    /// As for [`RingPayload::read`].
    pub(crate) unsafe fn write(fd: RawFd, offset: u64, buf: *const u8, len: u32) -> Self {
        Self::Write {
            fd,
            offset,
            buf: RawConstBuf(buf),
            len,
        }
    }

    /// # Safety
    ///
    /// Every iovec must point into buffers that stay valid and unmoved
    /// until the request completes (keepalive-guaranteed).
    pub(crate) unsafe fn read_vectored(fd: RawFd, offset: u64, iovecs: Vec<libc::iovec>) -> Self {
        Self::ReadVectored {
            fd,
            offset,
            iovecs: IoVecList(iovecs),
        }
    }

    /// # Safety
    ///
    /// As for [`RingPayload::read_vectored`].
    pub(crate) unsafe fn write_vectored(fd: RawFd, offset: u64, iovecs: Vec<libc::iovec>) -> Self {
        Self::WriteVectored {
            fd,
            offset,
            iovecs: IoVecList(iovecs),
        }
    }

    pub(crate) fn flush(fd: RawFd) -> Self {
        Self::Flush { fd }
    }

    pub(crate) fn stat(fd: RawFd) -> Self {
        Self::Stat { fd }
    }

    pub(crate) fn cancel(target: u64) -> Self {
        Self::Cancel { target }
    }
}

struct Submission {
    payload: RingPayload,
    callback: Option<RingCallback>,
    keepalive: Option<Arc<OpShared>>,
    handle: RequestHandle,
}

/// The shared batched-async-I/O engine.
pub(crate) struct IoRing {
    tx: Mutex<mpsc::Sender<Submission>>,
    wake: OwnedFd,
    next_user_data: AtomicU64,
    vectored_read: bool,
    vectored_write: bool,
}

impl IoRing {
    /// The process-wide shared instance, or `None` if the ring could not
    /// be initialized (old kernel, seccomp, resource limits).
    pub(crate) fn shared() -> Option<&'static IoRing> {
        static RING: OnceLock<Option<IoRing>> = OnceLock::new();
        RING.get_or_init(|| match IoRing::new() {
            Ok(ring) => Some(ring),
            Err(err) => {
                log::warn!("io_uring engine failed to initialize: {err}");
                None
            }
        })
        .as_ref()
    }

    fn new() -> io::Result<Self> {
        let ring = IoUring::new(ENTRIES)?;
        let mut probe = Probe::new();
        ring.submitter().register_probe(&mut probe)?;
        let vectored_read = probe.is_supported(opcode::Readv::CODE);
        let vectored_write = probe.is_supported(opcode::Writev::CODE);

        let wake = create_eventfd()?;
        let wake_fd = wake.as_raw_fd();
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name("asyncfile-ioring".into())
            .spawn(move || driver_loop(ring, rx, wake_fd))?;

        Ok(Self {
            tx: Mutex::new(tx),
            wake,
            next_user_data: AtomicU64::new(1),
            vectored_read,
            vectored_write,
        })
    }

    pub(crate) fn supports_vectored_read(&self) -> bool {
        self.vectored_read
    }

    pub(crate) fn supports_vectored_write(&self) -> bool {
        self.vectored_write
    }

    /// Queues one request. `keepalive` pins the operation record (and with
    /// it any buffers the payload points into) until the completion is
    /// reaped; `callback` runs once on the driver thread.
    pub(crate) fn queue_request(
        &self,
        payload: RingPayload,
        callback: Option<RingCallback>,
        keepalive: Option<Arc<OpShared>>,
    ) -> RequestHandle {
        let user_data = self.next_user_data.fetch_add(1, Ordering::Relaxed);
        let handle = RequestHandle::new(user_data);
        let submission = Submission {
            payload,
            callback,
            keepalive,
            handle: handle.clone(),
        };
        if let Err(returned) = self.tx.lock().send(submission) {
            // Driver gone; settle immediately so nobody hangs.
            let submission = returned.0;
            if let Some(cb) = submission.callback {
                cb(Err(libc::ECANCELED));
            }
            submission.handle.settle();
            return handle;
        }
        self.wake_driver();
        handle
    }

    /// Blocks until the request settles (its callback has run).
    pub(crate) fn wait_for_request(&self, handle: &RequestHandle) {
        handle.wait();
    }

    fn wake_driver(&self) {
        let value: u64 = 1;
        let bytes = value.to_ne_bytes();
        // SAFETY: the eventfd stays open for the life of the ring.
        let _ = unsafe {
            libc::write(
                self.wake.as_raw_fd(),
                bytes.as_ptr().cast::<libc::c_void>(),
                bytes.len(),
            )
        };
    }
}

struct Pending {
    handle: RequestHandle,
    callback: Option<RingCallback>,
    // Held until completion: keeps payload storage (path, iovec array)
    // and the operation's buffers alive while the kernel uses them.
    _payload: RingPayload,
    _keepalive: Option<Arc<OpShared>>,
}

fn driver_loop(mut ring: IoUring, rx: mpsc::Receiver<Submission>, wake_fd: RawFd) {
    let mut pending: HashMap<u64, Pending> = HashMap::new();
    let _ = arm_wake(&mut ring, wake_fd);
    let _ = ring.submit();

    loop {
        loop {
            match rx.try_recv() {
                Ok(submission) => stage(&mut ring, &mut pending, submission),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => return,
            }
        }

        if pending.is_empty() {
            // Nothing in the kernel; park on the channel instead of the ring.
            match rx.recv() {
                Ok(submission) => {
                    stage(&mut ring, &mut pending, submission);
                    continue;
                }
                Err(_) => return,
            }
        }

        match ring.submit_and_wait(1) {
            Ok(_) => {}
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => continue,
            Err(err) => {
                log::warn!("io_uring submit failed, failing in-flight requests: {err}");
                for (_, entry) in pending.drain() {
                    if let Some(cb) = entry.callback {
                        cb(Err(err.raw_os_error().unwrap_or(libc::EIO)));
                    }
                    entry.handle.settle();
                }
                return;
            }
        }

        let completions: Vec<(u64, i32)> = ring
            .completion()
            .map(|cqe| (cqe.user_data(), cqe.result()))
            .collect();
        for (user_data, res) in completions {
            if user_data == WAKE_USER_DATA {
                drain_eventfd(wake_fd);
                let _ = arm_wake(&mut ring, wake_fd);
                continue;
            }
            let Some(entry) = pending.remove(&user_data) else {
                continue;
            };
            let outcome = if res < 0 {
                Err(-res)
            } else {
                Ok(i64::from(res))
            };
            if let Some(cb) = entry.callback {
                cb(outcome);
            }
            // Settle only after the callback: waiters may rely on the
            // callback's bookkeeping having happened.
            entry.handle.settle();
        }
    }
}

fn stage(ring: &mut IoUring, pending: &mut HashMap<u64, Pending>, submission: Submission) {
    let user_data = submission.handle.user_data();

    // Stat is answered inline; no kernel round trip needed.
    if let RingPayload::Stat { fd } = submission.payload {
        let outcome = fstat_size(fd);
        if let Some(cb) = submission.callback {
            cb(outcome);
        }
        submission.handle.settle();
        return;
    }

    let entry = build_entry(&submission.payload, user_data);
    push_entry(ring, &entry);
    pending.insert(
        user_data,
        Pending {
            handle: submission.handle,
            callback: submission.callback,
            _payload: submission.payload,
            _keepalive: submission.keepalive,
        },
    );
}

fn build_entry(payload: &RingPayload, user_data: u64) -> squeue::Entry {
    let entry = match payload {
        RingPayload::Open { path, flags } => {
            opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), path.as_ptr())
                .flags(*flags)
                .mode(0o666)
                .build()
        }
        RingPayload::Close { fd } => opcode::Close::new(types::Fd(*fd)).build(),
        RingPayload::Read {
            fd,
            offset,
            buf,
            len,
        } => opcode::Read::new(types::Fd(*fd), buf.0, *len)
            .offset(*offset)
            .build(),
        RingPayload::Write {
            fd,
            offset,
            buf,
            len,
        } => opcode::Write::new(types::Fd(*fd), buf.0, *len)
            .offset(*offset)
            .build(),
        RingPayload::ReadVectored { fd, offset, iovecs } => {
            opcode::Readv::new(types::Fd(*fd), iovecs.0.as_ptr(), iovecs.0.len() as u32)
                .offset(*offset)
                .build()
        }
        RingPayload::WriteVectored { fd, offset, iovecs } => {
            opcode::Writev::new(types::Fd(*fd), iovecs.0.as_ptr(), iovecs.0.len() as u32)
                .offset(*offset)
                .build()
        }
        RingPayload::Flush { fd } => opcode::Fsync::new(types::Fd(*fd)).build(),
        RingPayload::Cancel { target } => opcode::AsyncCancel::new(*target).build(),
        RingPayload::Stat { .. } => unreachable!("stat is handled inline"),
    };
    entry.user_data(user_data)
}

fn push_entry(ring: &mut IoUring, entry: &squeue::Entry) {
    // SAFETY: every pointer the entry carries targets storage owned by the
    // matching `Pending` record (payload or operation keepalive), which
    // outlives the request.
    unsafe {
        while ring.submission().push(entry).is_err() {
            // Submission queue full; flush it and retry.
            let _ = ring.submit();
        }
    }
}

fn arm_wake(ring: &mut IoUring, wake_fd: RawFd) -> io::Result<()> {
    let entry = opcode::PollAdd::new(types::Fd(wake_fd), libc::POLLIN as u32)
        .build()
        .user_data(WAKE_USER_DATA);
    // SAFETY: PollAdd only borrows the fd, which outlives the ring.
    unsafe {
        ring.submission()
            .push(&entry)
            .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "submission queue full"))?;
    }
    Ok(())
}

fn drain_eventfd(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        // SAFETY: buf is a valid 8-byte buffer; the fd is our eventfd.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr().cast::<libc::c_void>(), buf.len()) };
        if n < 0 {
            break;
        }
    }
}

fn create_eventfd() -> io::Result<OwnedFd> {
    // SAFETY: eventfd creates a new descriptor we immediately take
    // ownership of.
    let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is newly created and owned by this function.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

fn fstat_size(fd: RawFd) -> RingOutcome {
    // SAFETY: st is a valid stat buffer for the duration of the call.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc < 0 {
        Err(io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(libc::EIO))
    } else {
        Ok(st.st_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    fn shared_or_skip() -> Option<&'static IoRing> {
        let ring = IoRing::shared();
        if ring.is_none() {
            // Kernel without io_uring (or sandboxed); nothing to verify.
        }
        ring
    }

    #[test]
    fn test_stat_request_reports_file_size() {
        let Some(ring) = shared_or_skip() else {
            return;
        };
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("stat.bin");
        std::fs::write(&path, b"0123456789").expect("seed file");
        let file = std::fs::File::open(&path).expect("open");

        let (tx, rx) = channel();
        let handle = ring.queue_request(
            RingPayload::stat(file.as_raw_fd()),
            Some(Box::new(move |outcome| {
                let _ = tx.send(outcome);
            })),
            None,
        );
        ring.wait_for_request(&handle);
        let outcome = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("stat settled");
        assert_eq!(outcome, Ok(10));
    }

    #[test]
    fn test_cancel_of_unknown_request_settles() {
        let Some(ring) = shared_or_skip() else {
            return;
        };
        let handle = ring.queue_request(RingPayload::cancel(u64::MAX - 1), None, None);
        // Must not hang; the kernel reports ENOENT for the unknown target.
        ring.wait_for_request(&handle);
    }
}
