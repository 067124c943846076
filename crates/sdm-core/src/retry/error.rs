//! Worker error type, kept structured until retry classification is done.

use std::fmt;
use std::io;
use std::time::Duration;

/// Error from a single segment transfer attempt (curl failure, HTTP error,
/// or local write failure). Converted to `anyhow` only after the retry loop
/// gives up.
#[derive(Debug)]
pub enum WorkerError {
    /// libcurl reported an error (timeout, connection, DNS, ...).
    Curl(curl::Error),
    /// Non-2xx HTTP status, with any `Retry-After` the response carried.
    Http { code: u32, retry_after: Option<Duration> },
    /// Transfer ended with fewer bytes than the requested range. The server
    /// closed early; retry resumes from the bytes already written.
    ShortBody { expected: u64, received: u64 },
    /// Local write failed (disk full, permission denied). Not retried.
    Storage(io::Error),
}

impl WorkerError {
    /// Message suitable for surfacing on a Failed job. Local I/O errors get
    /// the prefixes the UI layer keys on.
    pub fn user_message(&self) -> String {
        match self {
            WorkerError::Storage(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                format!("Permission denied: {}", e)
            }
            WorkerError::Storage(e) if e.kind() == io::ErrorKind::StorageFull => {
                format!("Disk full: {}", e)
            }
            other => other.to_string(),
        }
    }
}

impl fmt::Display for WorkerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerError::Curl(e) => write!(f, "{}", e),
            WorkerError::Http { code, .. } => write!(f, "HTTP {}", code),
            WorkerError::ShortBody { expected, received } => {
                write!(f, "short body: expected {} bytes, got {}", expected, received)
            }
            WorkerError::Storage(e) => write!(f, "storage: {}", e),
        }
    }
}

impl std::error::Error for WorkerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            WorkerError::Curl(e) => Some(e),
            WorkerError::Storage(e) => Some(e),
            WorkerError::Http { .. } | WorkerError::ShortBody { .. } => None,
        }
    }
}
