//! Changelog error type and its closed status-code enumeration.

use thiserror::Error;

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::error::ModelError;

/// Status code reported by a successful changelog operation.
pub const CL_SUCCESS: u8 = 0;

/// Errors produced by changelog operations.
///
/// The numeric codes form a closed enumeration shared with peers and
/// maintenance tooling; `code()` is stable across releases.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChangelogError {
    /// An invalid parameter was passed to the operation.
    #[error("bad data: {0}")]
    BadData(String),

    /// Stored data did not decode as expected.
    #[error("bad format: {0}")]
    BadFormat(String),

    /// The log is in the wrong state for the attempted operation.
    #[error("bad state: cannot {op} while changelog is {state}")]
    BadState {
        /// Operation that was attempted.
        op: &'static str,
        /// State the log was in.
        state: &'static str,
    },

    /// The stored format version does not match this implementation.
    #[error("bad db version: found {found}, expected {expected}")]
    BadDbVersion {
        /// Version marker found in the store.
        found: u32,
        /// Version this implementation writes.
        expected: u32,
    },

    /// The backing store failed.
    #[error("db error: {0}")]
    DbError(String),

    /// The requested entry or record was not found.
    #[error("not found")]
    NotFound,

    /// An allocation or capacity limit was hit.
    #[error("memory error")]
    MemoryError,

    /// An operating-system call failed.
    #[error("system error: {0}")]
    SystemError(String),

    /// A CSN operation failed.
    #[error("csn error: {0}")]
    CsnError(#[from] ModelError),

    /// An RUV operation failed.
    #[error("ruv error: {0}")]
    RuvError(String),

    /// A changelog-set bookkeeping operation failed.
    #[error("objset error: {0}")]
    ObjsetError(String),

    /// The requested replay start point has been trimmed away. The peer
    /// needs a total update.
    #[error("purged data: rid {rid} at {csn}")]
    PurgedData {
        /// Replica the missing range originated from.
        rid: ReplicaId,
        /// The resume point that was requested.
        csn: Csn,
    },

    /// An entry that should be present is absent. This is a correctness
    /// alarm, not a normal empty result.
    #[error("missing data: rid {rid} at {csn}")]
    MissingData {
        /// Replica the absent entry originated from.
        rid: ReplicaId,
        /// The CSN expected to be in the log.
        csn: Csn,
    },

    /// Unclassified failure.
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl ChangelogError {
    /// Stable numeric status code for this error.
    pub fn code(&self) -> u8 {
        match self {
            ChangelogError::BadData(_) => 1,
            ChangelogError::BadFormat(_) => 2,
            ChangelogError::BadState { .. } => 3,
            ChangelogError::BadDbVersion { .. } => 4,
            ChangelogError::DbError(_) => 5,
            ChangelogError::NotFound => 6,
            ChangelogError::MemoryError => 7,
            ChangelogError::SystemError(_) => 8,
            ChangelogError::CsnError(_) => 9,
            ChangelogError::RuvError(_) => 10,
            ChangelogError::ObjsetError(_) => 11,
            ChangelogError::PurgedData { .. } => 12,
            ChangelogError::MissingData { .. } => 13,
            ChangelogError::Unknown(_) => 14,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_stable() {
        assert_eq!(ChangelogError::BadData(String::new()).code(), 1);
        assert_eq!(
            ChangelogError::BadState {
                op: "write",
                state: "closed"
            }
            .code(),
            3
        );
        assert_eq!(
            ChangelogError::BadDbVersion {
                found: 1,
                expected: 5
            }
            .code(),
            4
        );
        assert_eq!(ChangelogError::NotFound.code(), 6);
        assert_eq!(
            ChangelogError::PurgedData {
                rid: ReplicaId::new(3),
                csn: Csn::ZERO
            }
            .code(),
            12
        );
        assert_eq!(
            ChangelogError::MissingData {
                rid: ReplicaId::new(3),
                csn: Csn::ZERO
            }
            .code(),
            13
        );
        assert_eq!(ChangelogError::Unknown(String::new()).code(), 14);
    }

    #[test]
    fn test_model_error_converts_to_csn_error() {
        let err: ChangelogError = ModelError::BadCsnString("xyz".into()).into();
        assert_eq!(err.code(), 9);
    }
}
