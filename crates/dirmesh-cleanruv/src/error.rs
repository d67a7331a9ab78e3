//! Error types for rid retirement tasks.

use thiserror::Error;

use dirmesh_changelog::ChangelogError;
use dirmesh_model::csn::ReplicaId;
use dirmesh_session::SessionError;

/// Directory result code returned to a task submitter.
pub const ADMIN_OPERATIONS_ERROR: u32 = 1;
/// Directory result code for refusals on policy grounds.
pub const ADMIN_UNWILLING_TO_PERFORM: u32 = 53;
/// Directory result code for a task entry missing a required attribute.
pub const ADMIN_OBJECT_CLASS_VIOLATION: u32 = 65;

/// Why a clean or abort task could not be launched or finished.
#[derive(Debug, Error)]
pub enum CleanError {
    /// The task entry lacks a required attribute.
    #[error("missing required attribute: {0}")]
    MissingAttribute(&'static str),

    /// The replica id did not parse or is outside the usable range.
    #[error("invalid replica id: {0}")]
    InvalidRid(String),

    /// An attribute carried a value outside its closed vocabulary.
    #[error("invalid attribute value: {0}")]
    InvalidValue(String),

    /// No replica is configured for the named subtree.
    #[error("no replica configured for {0}")]
    NoSuchReplica(String),

    /// Rid retirement cannot originate on a read-only replica.
    #[error("replica is read-only")]
    ReadOnlyReplica,

    /// The local replica's own rid cannot be retired while it serves.
    #[error("rid {0} is the local replica's rid")]
    LocalRid(ReplicaId),

    /// The rid already has a clean task running.
    #[error("rid {0} is already being cleaned")]
    AlreadyCleaning(ReplicaId),

    /// The concurrent-task ceiling was reached.
    #[error("too many cleaning tasks already running")]
    TooManyTasks,

    /// Abort was asked for a rid no task is cleaning.
    #[error("rid {0} is not being cleaned, nothing to abort")]
    NotBeingCleaned(ReplicaId),

    /// Abort was asked for a rid already being aborted.
    #[error("rid {0} is already being aborted")]
    AlreadyAborting(ReplicaId),

    /// A peer exchange failed.
    #[error("session error: {0}")]
    Session(#[from] SessionError),

    /// A changelog operation failed.
    #[error("changelog error: {0}")]
    Changelog(#[from] ChangelogError),
}

impl CleanError {
    /// The directory result code handed back to the task submitter.
    pub fn admin_code(&self) -> u32 {
        match self {
            CleanError::MissingAttribute(_) => ADMIN_OBJECT_CLASS_VIOLATION,
            CleanError::InvalidRid(_) | CleanError::NoSuchReplica(_) => ADMIN_OPERATIONS_ERROR,
            CleanError::Session(_) | CleanError::Changelog(_) => ADMIN_OPERATIONS_ERROR,
            CleanError::InvalidValue(_)
            | CleanError::ReadOnlyReplica
            | CleanError::LocalRid(_)
            | CleanError::AlreadyCleaning(_)
            | CleanError::TooManyTasks
            | CleanError::NotBeingCleaned(_)
            | CleanError::AlreadyAborting(_) => ADMIN_UNWILLING_TO_PERFORM,
        }
    }
}
