//! The client-wide error taxonomy (spec §7).

use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::value::ValueError;
use crate::wire::MessageType;

/// A daemon-reported POSIX-style error code.
///
/// This mirrors the large, not-exhaustively-named enumeration the daemon
/// returns verbatim in an `Error` confirmation body (spec §7). Only the
/// codes a caller is likely to match on by name get a variant; anything
/// else round-trips through [`DaemonError::Other`] rather than failing to
/// parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum DaemonErrorCode {
    /// Operation on a closed or otherwise invalid session handle.
    BadF = 1,
    /// Invalid arguments.
    Inval = 2,
    /// Target document, revision, or attachment does not exist.
    NoEnt = 3,
    /// A commit raced with another writer.
    Conflict = 4,
    /// Permission denied.
    Access = 5,
    /// Out of space on the target store.
    NoSpc = 6,
    /// Operation not supported by this store or document.
    NoSys = 7,
    /// I/O error at the store backend.
    Io = 8,
    /// The store is read-only.
    Rofs = 9,
    /// Operation would block / resource temporarily unavailable.
    Again = 10,
    /// Resource is busy (e.g. concurrent exclusive operation in progress).
    Busy = 11,
}

/// A daemon error, named where recognized and preserved verbatim otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DaemonError {
    /// A recognized POSIX-style code.
    #[error("daemon error: {0:?}")]
    Known(DaemonErrorCode),
    /// An error code the client does not have a named variant for.
    #[error("daemon error: unrecognized code {0}")]
    Other(u16),
}

impl From<u16> for DaemonError {
    fn from(code: u16) -> Self {
        match DaemonErrorCode::try_from(code) {
            Ok(known) => DaemonError::Known(known),
            Err(_) => DaemonError::Other(code),
        }
    }
}

/// The top-level error type returned by every fallible operation in this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection to the daemon was reset or never established.
    #[error("connection reset")]
    ConnReset,
    /// A reply was malformed, or of a type not expected for the request
    /// that was sent.
    #[error("malformed or unexpected reply to {0:?}")]
    BadRpc(MessageType),
    /// The daemon's protocol version does not match what this client speaks.
    #[error("protocol version mismatch: daemon speaks {major}.{minor}, client requires 1.0")]
    RpcMismatch {
        /// Daemon-reported major version.
        major: u8,
        /// Daemon-reported minor version.
        minor: u8,
    },
    /// The daemon returned an `Error` confirmation.
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    /// A `Value` could not be decoded or encoded.
    #[error(transparent)]
    Value(#[from] ValueError),
    /// An endpoint discovery or configuration file could not be read or parsed.
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    /// An identifier or link URI could not be parsed.
    #[error(transparent)]
    Parse(#[from] crate::link::LinkParseError),
    /// A [`crate::document::Document`] operation was attempted in a session
    /// state that does not support it (e.g. `commit` on a peek session).
    #[error("cannot {operation}: {detail}")]
    InvalidLinkState {
        /// The operation that was attempted.
        operation: &'static str,
        /// Why it isn't valid right now.
        detail: String,
    },
}

impl Error {
    /// Whether this error is a daemon-reported `Conflict`, the one case
    /// spec §7 calls out as retryable at the caller's discretion.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Daemon(DaemonError::Known(DaemonErrorCode::Conflict))
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_code_round_trips() {
        let err = DaemonError::from(4u16);
        assert_eq!(err, DaemonError::Known(DaemonErrorCode::Conflict));
    }

    #[test]
    fn unknown_code_preserved_verbatim() {
        let err = DaemonError::from(9999u16);
        assert_eq!(err, DaemonError::Other(9999));
    }

    #[test]
    fn conflict_detection() {
        let err = Error::Daemon(DaemonError::from(4u16));
        assert!(err.is_conflict());
        let other = Error::Daemon(DaemonError::from(2u16));
        assert!(!other.is_conflict());
    }
}
