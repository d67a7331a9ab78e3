//! Changelog record types and the reserved key layout.
//!
//! Entry keys are the 20-character hex CSN string, so the store's byte
//! order is CSN order. Internal bookkeeping records live under keys that
//! start with `!`, which sorts before every hex digit and therefore stays
//! out of entry range scans.

use serde::{Deserialize, Serialize};

use dirmesh_model::csn::Csn;

use crate::error::ChangelogError;

/// Key of the stored format-version marker.
pub const KEY_VERSION: &[u8] = b"!version";
/// Key of the entry-count record, absent while the log is open.
pub const KEY_ENTRY_COUNT: &[u8] = b"!count";
/// Key of the persisted purge RUV (lower bound of retained changes).
pub const KEY_PURGE_RUV: &[u8] = b"!purge_ruv";
/// Key of the persisted max RUV (upper bound of written changes).
pub const KEY_MAX_RUV: &[u8] = b"!max_ruv";

/// Format version written by this implementation.
pub const CL_VERSION: u32 = 5;

/// Inclusive lower bound of the entry key range.
pub const ENTRY_RANGE_START: &[u8] = b"00000000000000000000";
/// Exclusive upper bound of the entry key range; `g` sorts after every hex
/// digit.
pub const ENTRY_RANGE_END: &[u8] = b"g";

/// Directory operation kind recorded in the changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    /// Entry added.
    Add,
    /// Attribute values changed.
    Modify,
    /// Entry deleted.
    Delete,
    /// Entry renamed.
    ModRdn,
}

impl ChangeOp {
    /// Canonical lowercase name, used in the LDIF serialization.
    pub fn name(&self) -> &'static str {
        match self {
            ChangeOp::Add => "add",
            ChangeOp::Modify => "modify",
            ChangeOp::Delete => "delete",
            ChangeOp::ModRdn => "modrdn",
        }
    }

    /// Parses the canonical name.
    pub fn parse(s: &str) -> Result<Self, ChangelogError> {
        match s {
            "add" => Ok(ChangeOp::Add),
            "modify" => Ok(ChangeOp::Modify),
            "delete" => Ok(ChangeOp::Delete),
            "modrdn" => Ok(ChangeOp::ModRdn),
            other => Err(ChangelogError::BadFormat(format!(
                "unknown change op '{other}'"
            ))),
        }
    }
}

/// One replicated directory operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRecord {
    /// The CSN identifying this change.
    pub csn: Csn,
    /// Operation kind.
    pub op: ChangeOp,
    /// Distinguished name of the affected entry.
    pub target: String,
    /// Serialized operation details.
    pub payload: Vec<u8>,
    /// Seconds since the epoch when this replica recorded the change.
    pub time: u64,
}

impl ChangeRecord {
    /// Creates a record.
    pub fn new(csn: Csn, op: ChangeOp, target: &str, payload: Vec<u8>, time: u64) -> Self {
        ChangeRecord {
            csn,
            op,
            target: target.to_string(),
            payload,
            time,
        }
    }

    /// The store key for this record.
    pub fn key(&self) -> Vec<u8> {
        self.csn.to_string().into_bytes()
    }

    /// Encodes the record body.
    pub fn encode(&self) -> Result<Vec<u8>, ChangelogError> {
        bincode::serialize(self).map_err(|e| ChangelogError::BadFormat(e.to_string()))
    }

    /// Decodes a record body.
    pub fn decode(bytes: &[u8]) -> Result<Self, ChangelogError> {
        bincode::deserialize(bytes).map_err(|e| ChangelogError::BadFormat(e.to_string()))
    }
}
