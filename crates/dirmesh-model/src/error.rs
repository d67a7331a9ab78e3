//! Error types for the replication model layer.

use thiserror::Error;

use crate::csn::ReplicaId;

/// Errors produced by CSN parsing, generation, and RUV manipulation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    /// A CSN string was not 20 hex characters.
    #[error("invalid csn string '{0}'")]
    BadCsnString(String),

    /// A clock adjustment would exceed the configured skew limit.
    #[error("time adjustment of {adjustment}s exceeds limit of {limit}s")]
    SkewLimitExceeded {
        /// Seconds the generator was asked to absorb.
        adjustment: u64,
        /// Maximum absorbable skew in seconds.
        limit: u64,
    },

    /// Attempted to delete the replica's own entry from its RUV.
    #[error("cannot delete own replica id {0} from the ruv")]
    OwnReplicaId(ReplicaId),

    /// Attempted to delete the last remaining RUV element.
    #[error("cannot delete the last ruv element (rid {0})")]
    LastRuvElement(ReplicaId),

    /// The named replica has no entry in the RUV.
    #[error("replica id {0} not present in the ruv")]
    UnknownReplica(ReplicaId),

    /// A persisted RUV tombstone failed to decode.
    #[error("ruv tombstone decode failed: {0}")]
    TombstoneDecode(String),
}
