//! Error types shared across every component boundary in the crate.

use std::fmt;
use thiserror::Error;

/// Broad classification of where a failure originated, mirrored onto the
/// `error(flag, kind, message)` application callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Listen/bind/create failures; the server does not start.
    Start,
    /// Accept-time failures: cookie mismatch, total-cap exceeded, wrap failure.
    Accept,
    /// Engine/session-level fatals on an established broker.
    Protocol,
    /// IPC failures or unsupported cross-process operations.
    Cluster,
    /// The platform refused an operation (e.g. cluster on Windows).
    OsBroken,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Start => "START",
            ErrorKind::Accept => "ACCEPT",
            ErrorKind::Protocol => "PROTOCOL",
            ErrorKind::Cluster => "CLUSTER",
            ErrorKind::OsBroken => "OS_BROKEN",
        };
        f.write_str(s)
    }
}

/// The crate's unified error type. Every fallible component boundary named
/// in the design returns `Result<T, Error>`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("[{kind}] bind failed for {address}: {reason}")]
    Bind {
        kind: ErrorKind,
        address: String,
        reason: String,
    },

    #[error("[{kind}] accept rejected: {reason}")]
    Accept { kind: ErrorKind, reason: String },

    #[error("[{kind}] total connections cannot exceed maximum ({limit}) for scheme {scheme_id}")]
    TotalCapExceeded {
        kind: ErrorKind,
        scheme_id: u64,
        limit: usize,
    },

    #[error("[{kind}] protocol failure on broker {broker_id}: {reason}")]
    Protocol {
        kind: ErrorKind,
        broker_id: u64,
        reason: String,
    },

    #[error("[{kind}] cluster IPC failure: {reason}")]
    Cluster { kind: ErrorKind, reason: String },

    #[error("[{kind}] unsupported on this platform: {operation}")]
    Unsupported { kind: ErrorKind, operation: String },

    #[error("[{kind}] I/O error: {source}")]
    Io {
        kind: ErrorKind,
        #[source]
        source: std::io::Error,
    },

    #[error("[{kind}] TLS error: {reason}")]
    Tls { kind: ErrorKind, reason: String },
}

impl Error {
    /// The `ErrorKind` this error is reported under, for dispatch to the
    /// application's `error(flag, kind, message)` callback.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Bind { kind, .. }
            | Error::Accept { kind, .. }
            | Error::TotalCapExceeded { kind, .. }
            | Error::Protocol { kind, .. }
            | Error::Cluster { kind, .. }
            | Error::Unsupported { kind, .. }
            | Error::Io { kind, .. }
            | Error::Tls { kind, .. } => *kind,
        }
    }

    pub fn io(kind: ErrorKind, source: std::io::Error) -> Self {
        Error::Io { kind, source }
    }

    pub fn accept(reason: impl Into<String>) -> Self {
        Error::Accept {
            kind: ErrorKind::Accept,
            reason: reason.into(),
        }
    }

    pub fn protocol(broker_id: u64, reason: impl Into<String>) -> Self {
        Error::Protocol {
            kind: ErrorKind::Protocol,
            broker_id,
            reason: reason.into(),
        }
    }

    pub fn cluster(reason: impl Into<String>) -> Self {
        Error::Cluster {
            kind: ErrorKind::Cluster,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_display() {
        let err = Error::TotalCapExceeded {
            kind: ErrorKind::Accept,
            scheme_id: 7,
            limit: 2,
        };
        assert_eq!(err.kind(), ErrorKind::Accept);
        let msg = err.to_string();
        assert!(msg.contains("cannot exceed maximum"));
    }

    #[test]
    fn io_error_preserves_source() {
        let io_err = std::io::Error::new(std::io::ErrorKind::Other, "boom");
        let err = Error::io(ErrorKind::Start, io_err);
        assert_eq!(err.kind(), ErrorKind::Start);
        assert!(format!("{err}").contains("boom"));
    }
}
