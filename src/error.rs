//! Error taxonomy and operation classification.
//!
//! Errors are explicit and typed. An operation that completes successfully
//! carries no error at all (`Option::<Error>::None`); in particular a short
//! read or write near end-of-file is a *success* with a reduced byte count,
//! not an error. Raw engine error codes never escape the backends; they are
//! translated into this taxonomy at the backend boundary.

/// The kind of work an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Kind {
    /// Not a real operation; never produced by the public API.
    #[default]
    Unknown,
    /// A read from the file into a buffer or set of buffers.
    Read,
    /// A write from a buffer or set of buffers into the file.
    Write,
    /// A flush of buffered data to the file.
    Flush,
    /// Opening the file.
    Open,
}

/// Why an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum Error {
    /// The operation targeted a file that has not been successfully opened.
    #[error("file is not open")]
    FileNotOpen,
    /// The offset was negative, or the underlying seek rejected it.
    #[error("incorrect offset")]
    IncorrectOffset,
    /// The read failed for an engine-reported reason not covered above.
    #[error("read failed")]
    Read,
    /// The write failed for an engine-reported reason not covered above.
    #[error("write failed")]
    Write,
    /// The flush failed.
    #[error("flush failed")]
    Flush,
    /// The open failed, or an open was attempted while the file was not
    /// closed.
    #[error("open failed")]
    Open,
    /// The operation was cancelled, either explicitly or because the file
    /// was closed or destroyed while it was outstanding.
    #[error("operation aborted")]
    Aborted,
}
