//! Error types for the diag transport.

use thiserror::Error;

/// Broad failure classes.
///
/// Every [`DiagError`] belongs to exactly one class. Callers use the class to
/// decide whether a failure is worth retrying: only transport and timeout
/// failures are transient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Subsystem or argument misuse, rejected synchronously.
    Configuration,
    /// Allocation failure or oversized request.
    Resource,
    /// Device read/write failure.
    Transport,
    /// An awaited response did not arrive in time.
    Timeout,
    /// Truncated or unrecognized input.
    Malformed,
}

/// Main error type for the diag transport.
#[derive(Debug, Error)]
pub enum DiagError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration value.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A component was used before `init()` or after `exit()`.
    #[error("Subsystem not initialized")]
    NotInitialized,

    /// The device handle is closed.
    #[error("Device not open")]
    DeviceClosed,

    /// Processor index outside the configured range.
    #[error("Invalid processor: {0}")]
    InvalidProcessor(i32),

    /// Client id does not name an active DCI client.
    #[error("Invalid DCI client id: {0}")]
    InvalidClient(i32),

    /// A DCI client is already active for the processor.
    #[error("Duplicate DCI client for processor {0}")]
    DuplicateClient(i32),

    /// The kernel refused the DCI registration.
    #[error("DCI registration rejected by device")]
    NoRegistration,

    /// Memory for a buffer or table entry could not be obtained.
    #[error("Out of memory: {0}")]
    NoMemory(String),

    /// Request exceeds the maximum (or is empty).
    #[error("Packet of {size} bytes outside allowed range 1..={max}")]
    HugePacket { size: usize, max: usize },

    /// Writing to the device failed.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Invalid argument.
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation not supported by this device or build.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Fixed-capacity table is full.
    #[error("Table full (capacity {0})")]
    TableFull(usize),

    /// A wait exceeded its deadline.
    #[error("Timed out waiting for {0}")]
    Timeout(String),

    /// Truncated or inconsistent record.
    #[error("Malformed frame: {0}")]
    Malformed(String),

    /// Unexpected but well-formed protocol content.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Subsystem is shutting down.
    #[error("Shutting down")]
    Shutdown,
}

impl DiagError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DiagError::Config(_)
            | DiagError::NotInitialized
            | DiagError::InvalidProcessor(_)
            | DiagError::InvalidClient(_)
            | DiagError::DuplicateClient(_)
            | DiagError::NoRegistration
            | DiagError::InvalidParameter(_)
            | DiagError::NotSupported(_)
            | DiagError::TableFull(_)
            | DiagError::Shutdown => ErrorKind::Configuration,
            DiagError::NoMemory(_) | DiagError::HugePacket { .. } => ErrorKind::Resource,
            DiagError::Io(_) | DiagError::SendFailed(_) | DiagError::DeviceClosed => {
                ErrorKind::Transport
            }
            DiagError::Timeout(_) => ErrorKind::Timeout,
            DiagError::Malformed(_) | DiagError::Protocol(_) | DiagError::Json(_) => {
                ErrorKind::Malformed
            }
        }
    }

    /// True if retrying the same operation later may succeed.
    #[inline]
    pub fn is_transient(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Timeout)
    }
}

/// Result type alias using DiagError.
pub type Result<T> = std::result::Result<T, DiagError>;
