//! Durable markers for in-flight clean and abort tasks.
//!
//! A launched task writes a marker before its worker starts and deletes
//! it when the work is done. Markers that are still present at startup
//! are resumed. The store stands in for the replica's configuration
//! entry; nodes share one per replica root.

use std::collections::BTreeMap;
use std::sync::Mutex;

use dirmesh_model::csn::ReplicaId;

use crate::error::CleanError;

/// Attribute under which clean markers are stored.
pub const CLEAN_MARKER_ATTR: &str = "replica-clean-ruv";
/// Attribute under which abort markers are stored.
pub const ABORT_MARKER_ATTR: &str = "replica-abort-clean-ruv";

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes")
}

/// Marker for a clean task. The retirement point is not stored; a
/// resumed task recomputes it from the live mesh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanMarker {
    /// Rid being retired.
    pub rid: ReplicaId,
    /// Whether gates on unreachable peers are skipped.
    pub force: bool,
    /// Whether this node originated the task.
    pub original: bool,
    /// Replicated subtree the task runs against.
    pub root: String,
}

impl CleanMarker {
    /// Serializes as `rid:force:original:root`. The root comes last so
    /// any colon inside it survives the round trip.
    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.rid,
            yes_no(self.force),
            yes_no(self.original),
            self.root
        )
    }

    /// Parses a rendered marker.
    pub fn parse(raw: &str) -> Result<Self, CleanError> {
        let mut parts = raw.splitn(4, ':');
        let rid = parse_rid(parts.next(), raw)?;
        let force = parts
            .next()
            .ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
        let original = parts
            .next()
            .ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
        let root = parts
            .next()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
        Ok(CleanMarker {
            rid,
            force: is_yes(force),
            original: is_yes(original),
            root: root.to_string(),
        })
    }
}

/// Marker for an abort task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortMarker {
    /// Rid whose clean task is being unwound.
    pub rid: ReplicaId,
    /// Replicated subtree the task runs against.
    pub root: String,
    /// Whether every peer must confirm the abort before the task ends.
    pub certify: bool,
    /// Whether this node originated the task.
    pub original: bool,
}

impl AbortMarker {
    /// Serializes as `rid:root:certify:original`.
    pub fn render(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.rid,
            self.root,
            yes_no(self.certify),
            yes_no(self.original)
        )
    }

    /// Parses a rendered marker. The trailing fields are split from the
    /// right so a root containing colons still parses.
    pub fn parse(raw: &str) -> Result<Self, CleanError> {
        let mut tail = raw.rsplitn(3, ':');
        let original = tail
            .next()
            .ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
        let certify = tail
            .next()
            .ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
        let head = tail
            .next()
            .ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
        let mut parts = head.splitn(2, ':');
        let rid = parse_rid(parts.next(), raw)?;
        let root = parts
            .next()
            .filter(|r| !r.is_empty())
            .ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
        Ok(AbortMarker {
            rid,
            root: root.to_string(),
            certify: is_yes(certify),
            original: is_yes(original),
        })
    }
}

fn parse_rid(field: Option<&str>, raw: &str) -> Result<ReplicaId, CleanError> {
    let text = field.ok_or_else(|| CleanError::InvalidValue(raw.to_string()))?;
    let id: u16 = text
        .parse()
        .map_err(|_| CleanError::InvalidValue(raw.to_string()))?;
    Ok(ReplicaId::new(id))
}

/// Attribute-keyed marker storage, shared by every task on a node.
#[derive(Debug, Default)]
pub struct MarkerStore {
    values: Mutex<BTreeMap<String, Vec<String>>>,
}

impl MarkerStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        MarkerStore::default()
    }

    pub(crate) fn add(&self, attr: &str, value: String) {
        let mut values = self.values.lock().expect("lock poisoned");
        let slot = values.entry(attr.to_string()).or_default();
        if !slot.contains(&value) {
            slot.push(value);
        }
    }

    fn list(&self, attr: &str) -> Vec<String> {
        self.values
            .lock()
            .expect("lock poisoned")
            .get(attr)
            .cloned()
            .unwrap_or_default()
    }

    /// Removes one exact raw value, for discarding malformed markers.
    pub fn remove_value(&self, attr: &str, value: &str) {
        let mut values = self.values.lock().expect("lock poisoned");
        if let Some(slot) = values.get_mut(attr) {
            slot.retain(|v| v != value);
        }
    }

    fn remove_rid(&self, attr: &str, rid: ReplicaId) {
        let mut values = self.values.lock().expect("lock poisoned");
        if let Some(slot) = values.get_mut(attr) {
            slot.retain(|v| {
                v.splitn(2, ':')
                    .next()
                    .and_then(|f| f.parse::<u16>().ok())
                    .map(ReplicaId::new)
                    != Some(rid)
            });
        }
    }

    fn holds_rid(&self, attr: &str, rid: ReplicaId) -> bool {
        self.list(attr).iter().any(|v| {
            v.splitn(2, ':')
                .next()
                .and_then(|f| f.parse::<u16>().ok())
                .map(ReplicaId::new)
                == Some(rid)
        })
    }

    /// Persists a clean marker.
    pub fn add_clean(&self, marker: &CleanMarker) {
        self.add(CLEAN_MARKER_ATTR, marker.render());
    }

    /// True when a clean marker for `rid` is stored.
    pub fn has_clean(&self, rid: ReplicaId) -> bool {
        self.holds_rid(CLEAN_MARKER_ATTR, rid)
    }

    /// Deletes the clean marker for `rid`, if any.
    pub fn remove_clean(&self, rid: ReplicaId) {
        self.remove_rid(CLEAN_MARKER_ATTR, rid);
    }

    /// Raw clean markers currently stored.
    pub fn clean_markers(&self) -> Vec<String> {
        self.list(CLEAN_MARKER_ATTR)
    }

    /// Persists an abort marker.
    pub fn add_abort(&self, marker: &AbortMarker) {
        self.add(ABORT_MARKER_ATTR, marker.render());
    }

    /// True when an abort marker for `rid` is stored.
    pub fn has_abort(&self, rid: ReplicaId) -> bool {
        self.holds_rid(ABORT_MARKER_ATTR, rid)
    }

    /// Deletes the abort marker for `rid`, if any.
    pub fn remove_abort(&self, rid: ReplicaId) {
        self.remove_rid(ABORT_MARKER_ATTR, rid);
    }

    /// Raw abort markers currently stored.
    pub fn abort_markers(&self) -> Vec<String> {
        self.list(ABORT_MARKER_ATTR)
    }
}
