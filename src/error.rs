//! Fabric-wide error taxonomy
//!
//! Every fallible operation in the crate returns [`DriverResult`]. At the 9P
//! boundary the server turns errors into `Rerror` replies carrying the
//! `Display` text; anything the client should not see stays in the log.

use std::fmt;
use std::io;

/// Error kind shared by the protocol engine, the driver framework and the
/// device drivers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// Malformed frame, unknown size, count exceeding msize. Fatal for the
    /// connection that produced it.
    Protocol(String),
    /// Unsupported protocol version string
    Version(String),
    /// Request named a fid that was never allocated
    NoSuchFid(u32),
    /// Walk tried to bind a fid number that is already in use
    FidInUse(u32),
    /// Path does not match the driver's file-tree grammar
    InvalidPath(String),
    /// Path is well-formed but no such device, partition or file exists
    NotFound(String),
    /// Access past the end of a device, partition or buffer
    OutOfRange { offset: u64, limit: u64 },
    /// Write to a read-only virtual file or disallowed control command
    Readonly(String),
    /// Underlying sector or MMIO I/O failed
    Backend(String),
    /// Operation observed a cancelled context
    Cancelled,
    /// Operation was initiated after the driver stopped
    Stopped,
    /// Framework misuse: duplicate registration, capability mismatch
    Config(String),
    /// Bug or invariant violation inside a driver
    Internal(String),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            DriverError::Version(v) => write!(f, "unsupported version: {}", v),
            DriverError::NoSuchFid(fid) => write!(f, "unknown fid {}", fid),
            DriverError::FidInUse(fid) => write!(f, "fid {} already in use", fid),
            DriverError::InvalidPath(path) => write!(f, "invalid path: {}", path),
            DriverError::NotFound(what) => write!(f, "not found: {}", what),
            DriverError::OutOfRange { offset, limit } => {
                write!(f, "offset {} out of range (limit {})", offset, limit)
            }
            DriverError::Readonly(what) => write!(f, "read-only: {}", what),
            DriverError::Backend(msg) => write!(f, "backend error: {}", msg),
            DriverError::Cancelled => write!(f, "operation cancelled"),
            DriverError::Stopped => write!(f, "driver stopped"),
            DriverError::Config(msg) => write!(f, "configuration error: {}", msg),
            DriverError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for DriverError {}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        DriverError::Backend(err.to_string())
    }
}

impl DriverError {
    /// Errors that terminate the connection instead of becoming `Rerror`.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DriverError::Protocol(_))
    }

    /// The client-safe string placed in an `Rerror` reply.
    pub fn ename(&self) -> String {
        self.to_string()
    }
}

/// Result type for fabric operations
pub type DriverResult<T> = Result<T, DriverError>;
