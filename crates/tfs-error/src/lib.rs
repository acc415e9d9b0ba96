#![forbid(unsafe_code)]
//! Error types for TarnFS.
//!
//! Defines `TfsError` and a `Result<T>` alias used throughout the
//! workspace, plus errno mappings for kernel-facing callers.

use tfs_types::ParseError;
use thiserror::Error;

/// Unified error type for all TarnFS operations.
#[derive(Debug, Error)]
pub enum TfsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A journal device write failed and the journal latched its error
    /// state. Irreversible until a full re-mount.
    #[error("journal is in error state")]
    JournalIo,

    #[error("read-only filesystem: insufficient writable journal devices")]
    ReadOnly,

    #[error("no space left on device")]
    NoSpace,

    #[error("interrupted while waiting on the journal")]
    Interrupted,

    #[error("allocation failed: {0}")]
    Oom(&'static str),

    #[error("invalid on-disk format: {0}")]
    Parse(#[from] ParseError),
}

impl TfsError {
    /// Convert this error into a POSIX errno.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::JournalIo => libc::EIO,
            Self::ReadOnly => libc::EROFS,
            Self::NoSpace => libc::ENOSPC,
            Self::Interrupted => libc::EINTR,
            Self::Oom(_) => libc::ENOMEM,
            Self::Parse(_) => libc::EINVAL,
        }
    }
}

/// Result alias using `TfsError`.
pub type Result<T> = std::result::Result<T, TfsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert_eq!(TfsError::JournalIo.to_errno(), libc::EIO);
        assert_eq!(TfsError::ReadOnly.to_errno(), libc::EROFS);
        assert_eq!(TfsError::NoSpace.to_errno(), libc::ENOSPC);
        assert_eq!(TfsError::Interrupted.to_errno(), libc::EINTR);
        assert_eq!(TfsError::Oom("pin fifo").to_errno(), libc::ENOMEM);
    }

    #[test]
    fn parse_error_converts() {
        let err: TfsError = ParseError::IntegerConversion { field: "seq" }.into();
        assert_eq!(err.to_errno(), libc::EINVAL);
    }
}
