//! Asynchronous random-access file I/O.
//!
//! [`AsyncFile`] queues reads, writes and flushes at explicit offsets and
//! returns immediately with an operation handle; the transfer itself runs
//! on one of two interchangeable backends with identical semantics:
//!
//! - the native backend, which batches requests through a shared kernel
//!   ring (Linux, behind the `io-uring` feature), and
//! - a portable thread-pool fallback driving ordinary blocking file I/O.
//!
//! Operations finish exactly once, report a typed [`Error`] or success,
//! and can be cancelled; dropping a handle cancels the work it names and
//! blocks until the backend has let go of its buffers. A short transfer
//! near end-of-file is a success with a reduced byte count, never an
//! error.
//!
//! ```no_run
//! use asyncfile::{AsyncFile, OpenMode};
//!
//! let file = AsyncFile::new();
//! file.open("journal.log", OpenMode::read_write()).wait();
//! file.write(0, &b"entry"[..]).wait();
//! let read = file.read(0, 5);
//! assert_eq!(read.wait(), None);
//! assert_eq!(read.data(), b"entry");
//! ```

#![warn(missing_docs)]

mod backend;
mod engine;
mod error;
mod file;
mod op;
mod pool;
#[cfg(all(target_os = "linux", feature = "io-uring"))]
mod ring;
mod storage;

pub use backend::BackendKind;
pub use engine::{FileEngine, FsFileEngine, OpenMode};
pub use error::{Error, Kind};
pub use file::{AsyncFile, Config};
pub use op::{
    Operation, ReadOperation, VectoredReadOperation, VectoredWriteOperation, WriteOperation,
};
