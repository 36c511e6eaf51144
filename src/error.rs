//! Error taxonomy for a counting call.
//!
//! Every fallible stage returns [`CountError`]. Join misses are not errors and
//! never appear here; they are counted in [`crate::types::Diagnostics`].

use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

/// Whether a corrupt compressed stream looks cut short or is plain garbage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressKind {
    /// The stream ended early, e.g. a file still being written.
    Truncated,
    /// The stream is not valid compressed data.
    Invalid,
}

impl fmt::Display for DecompressKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecompressKind::Truncated => f.write_str("truncated"),
            DecompressKind::Invalid => f.write_str("invalid"),
        }
    }
}

#[derive(Error, Debug)]
pub enum CountError {
    #[error("I/O error on '{}': {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{kind} compressed stream in '{}': {detail}", .path.display())]
    Decompress {
        path: PathBuf,
        kind: DecompressKind,
        detail: String,
    },

    #[error("'{}' ends in the middle of a record (line {line})", .path.display())]
    TruncatedInput { path: PathBuf, line: u64 },

    #[error("malformed record in '{}' at line {line}: {reason}", .path.display())]
    MalformedRecord {
        path: PathBuf,
        line: u64,
        reason: String,
    },

    #[error(
        "mates of '{}' and '{}' are out of step: {detail}",
        .read1.display(),
        .read2.display()
    )]
    UnpairedMates {
        read1: PathBuf,
        read2: PathBuf,
        detail: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal fault: {0}")]
    InternalFault(String),
}

pub type Result<T> = std::result::Result<T, CountError>;

impl CountError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CountError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn malformed(path: impl Into<PathBuf>, line: u64, reason: impl Into<String>) -> Self {
        CountError::MalformedRecord {
            path: path.into(),
            line,
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        CountError::Config(msg.into())
    }

    /// Converts a caught panic payload into an `InternalFault`.
    pub fn from_panic(context: &str, payload: Box<dyn std::any::Any + Send>) -> Self {
        let msg = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        CountError::InternalFault(format!("{context} panicked: {msg}"))
    }

    /// Malformed records are the only failures a lenient call may skip.
    pub fn is_skippable(&self) -> bool {
        matches!(self, CountError::MalformedRecord { .. })
    }
}

/// Thread-safe capture that keeps only the first error raised by any thread.
pub struct FirstErrorCapture {
    has_error: AtomicBool,
    error: Mutex<Option<CountError>>,
}

impl FirstErrorCapture {
    pub fn new() -> Self {
        Self {
            has_error: AtomicBool::new(false),
            error: Mutex::new(None),
        }
    }

    /// Returns true if this error was stored, false if one already existed.
    pub fn store(&self, err: CountError) -> bool {
        if self
            .has_error
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            *self.error.lock() = Some(err);
            true
        } else {
            false
        }
    }

    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::SeqCst)
    }

    pub fn take(&self) -> Option<CountError> {
        self.error.lock().take()
    }
}

impl Default for FirstErrorCapture {
    fn default() -> Self {
        Self::new()
    }
}
