//! Error types for the session subsystem.

use thiserror::Error;

use dirmesh_changelog::ChangelogError;
use dirmesh_model::error::ModelError;

/// Errors that can occur while running or serving replication sessions.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A wire payload did not decode.
    #[error("decode error: {0}")]
    Decode(String),

    /// The peer is not registered in the mesh or is marked unreachable.
    #[error("peer unreachable: {purl}")]
    Unreachable {
        /// The peer that could not be contacted.
        purl: String,
    },

    /// The peer did not answer within the transport deadline.
    #[error("peer timed out: {purl}")]
    Timeout {
        /// The peer that failed to answer.
        purl: String,
    },

    /// The replica is held by another session. The display form is the
    /// diagnostic handed back to the rejected acquirer.
    #[error("locked by {holder} for {flavor} update")]
    ReplicaBusy {
        /// Identity string of the current holder.
        holder: String,
        /// Update flavor the holder is running.
        flavor: &'static str,
    },

    /// An update batch arrived outside a replication session.
    #[error("no replication session in progress for {root}")]
    NoSession {
        /// The subtree root the batch targeted.
        root: String,
    },

    /// The consumer asked the current holder to yield.
    #[error("session aborted by consumer")]
    SessionAborted,

    /// A changelog operation failed.
    #[error("changelog error: {0}")]
    Changelog(#[from] ChangelogError),

    /// A CSN or RUV operation failed.
    #[error("model error: {0}")]
    Model(#[from] ModelError),

    /// Unclassified internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_busy_diagnostic_format() {
        let err = SessionError::ReplicaBusy {
            holder: "ldap://peer-a:389".into(),
            flavor: "incremental",
        };
        assert_eq!(
            err.to_string(),
            "locked by ldap://peer-a:389 for incremental update"
        );
    }

    #[test]
    fn test_changelog_error_converts() {
        let err: SessionError = ChangelogError::NotFound.into();
        assert!(matches!(err, SessionError::Changelog(_)));
    }
}
