//! Replica update vectors: per-replica high-water marks.
//!
//! An RUV records, for every replica id it has heard of, the largest CSN
//! seen from that replica plus the replica's locator URL. Elements keep
//! insertion order and the owning replica's element is always first, which
//! is how a peer's identity is read off the RUV it advertises.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::csn::{Csn, ReplicaId};
use crate::error::ModelError;

/// One replica's entry in an RUV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuvElement {
    /// The replica this element tracks.
    pub rid: ReplicaId,
    /// Locator URL of that replica, empty when unknown.
    pub purl: String,
    /// Largest CSN seen from `rid`; `Csn::ZERO` when none has been seen.
    pub csn: Csn,
}

impl RuvElement {
    /// Creates an element with no changes seen yet.
    pub fn new(rid: ReplicaId, purl: &str) -> Self {
        RuvElement {
            rid,
            purl: purl.to_string(),
            csn: Csn::ZERO,
        }
    }
}

/// A replica update vector.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ruv {
    elements: Vec<RuvElement>,
}

impl Ruv {
    /// Creates an empty RUV.
    pub fn new() -> Self {
        Ruv::default()
    }

    /// Creates an RUV seeded with the owning replica's element. The owner
    /// stays the first element for the lifetime of the vector.
    pub fn with_local(rid: ReplicaId, purl: &str) -> Self {
        Ruv {
            elements: vec![RuvElement::new(rid, purl)],
        }
    }

    /// The owning replica's id, read off the first element.
    pub fn local_rid(&self) -> Option<ReplicaId> {
        self.elements.first().map(|e| e.rid)
    }

    /// Number of tracked replicas.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// True when no replicas are tracked.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// All elements in insertion order.
    pub fn elements(&self) -> &[RuvElement] {
        &self.elements
    }

    /// True if `rid` has an element.
    pub fn contains(&self, rid: ReplicaId) -> bool {
        self.elements.iter().any(|e| e.rid == rid)
    }

    /// Largest CSN seen from `rid`, or None when the rid is untracked or
    /// has produced no changes.
    pub fn max_csn_for(&self, rid: ReplicaId) -> Option<Csn> {
        self.elements
            .iter()
            .find(|e| e.rid == rid)
            .map(|e| e.csn)
            .filter(|c| !c.is_zero())
    }

    /// Largest CSN across all elements.
    pub fn max_csn(&self) -> Option<Csn> {
        self.elements
            .iter()
            .map(|e| e.csn)
            .filter(|c| !c.is_zero())
            .max()
    }

    /// Smallest non-zero watermark across all elements. Used as the trim
    /// ceiling when this RUV describes what a set of consumers has seen.
    pub fn min_csn(&self) -> Option<Csn> {
        self.elements
            .iter()
            .map(|e| e.csn)
            .filter(|c| !c.is_zero())
            .min()
    }

    /// Folds a newly seen CSN into the vector, inserting an element for an
    /// unknown rid. Watermarks only move forward.
    pub fn update(&mut self, csn: Csn, purl: &str) {
        match self.elements.iter_mut().find(|e| e.rid == csn.rid) {
            Some(el) => {
                if csn > el.csn {
                    el.csn = csn;
                }
                if el.purl.is_empty() && !purl.is_empty() {
                    el.purl = purl.to_string();
                }
            }
            None => {
                self.elements.push(RuvElement {
                    rid: csn.rid,
                    purl: purl.to_string(),
                    csn,
                });
            }
        }
    }

    /// Merges `other` into self, taking the per-rid maximum and adopting
    /// elements for rids not seen before.
    pub fn merge(&mut self, other: &Ruv) {
        for el in &other.elements {
            match self.elements.iter_mut().find(|e| e.rid == el.rid) {
                Some(mine) => {
                    if el.csn > mine.csn {
                        mine.csn = el.csn;
                    }
                    if mine.purl.is_empty() && !el.purl.is_empty() {
                        mine.purl = el.purl.clone();
                    }
                }
                None => self.elements.push(el.clone()),
            }
        }
    }

    /// True iff the element for `csn`'s rid has a watermark at or past `csn`.
    pub fn covers_csn(&self, csn: &Csn) -> bool {
        self.elements
            .iter()
            .find(|e| e.rid == csn.rid)
            .map(|e| e.csn >= *csn)
            .unwrap_or(false)
    }

    /// Removes the element for `rid`.
    ///
    /// Refuses to remove the owner's element or the last remaining one; an
    /// active RUV must always keep at least its own member.
    pub fn delete_replica(&mut self, rid: ReplicaId) -> Result<(), ModelError> {
        if !self.contains(rid) {
            return Err(ModelError::UnknownReplica(rid));
        }
        if self.local_rid() == Some(rid) {
            return Err(ModelError::OwnReplicaId(rid));
        }
        if self.elements.len() == 1 {
            return Err(ModelError::LastRuvElement(rid));
        }
        self.elements.retain(|e| e.rid != rid);
        Ok(())
    }

    /// Removes the element for `rid` without the ownership guards. Used for
    /// bookkeeping vectors that do not belong to a replica. Returns whether
    /// an element was removed.
    pub fn forget(&mut self, rid: ReplicaId) -> bool {
        let before = self.elements.len();
        self.elements.retain(|e| e.rid != rid);
        before != self.elements.len()
    }

    /// The rid-to-watermark view, ignoring element order and purls.
    pub fn watermarks(&self) -> BTreeMap<ReplicaId, Csn> {
        self.elements.iter().map(|e| (e.rid, e.csn)).collect()
    }

    /// Serializes the vector into its tombstone record form.
    pub fn to_tombstone(&self) -> Result<Vec<u8>, ModelError> {
        bincode::serialize(self).map_err(|e| ModelError::TombstoneDecode(e.to_string()))
    }

    /// Reconstructs a vector from a tombstone record.
    pub fn from_tombstone(bytes: &[u8]) -> Result<Ruv, ModelError> {
        bincode::deserialize(bytes).map_err(|e| ModelError::TombstoneDecode(e.to_string()))
    }
}

impl fmt::Display for Ruv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for el in &self.elements {
            if !first {
                write!(f, " ")?;
            }
            write!(f, "{{replica {} {}}} {}", el.rid, el.purl, el.csn)?;
            first = false;
        }
        Ok(())
    }
}

/// True when a supplier advertising `supplier_ruv` would collide with a
/// writable replica whose id is `local_rid`. The supplier's identity is the
/// first element of the RUV it sends.
pub fn replica_id_conflicts(supplier_ruv: &Ruv, local_rid: ReplicaId, updatable: bool) -> bool {
    updatable && supplier_ruv.local_rid() == Some(local_rid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn csn(t: u64, seq: u16, rid: u16) -> Csn {
        Csn::new(t, seq, ReplicaId::new(rid), 0)
    }

    fn ruv_of(pairs: &[(u16, Csn)]) -> Ruv {
        let mut ruv = Ruv::new();
        for (rid, c) in pairs {
            let mut c = *c;
            c.rid = ReplicaId::new(*rid);
            ruv.update(c, &format!("ldap://replica{rid}"));
        }
        ruv
    }

    mod updates {
        use super::*;

        #[test]
        fn test_update_inserts_and_advances() {
            let mut ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            ruv.update(csn(100, 0, 1), "ldap://one");
            ruv.update(csn(100, 1, 1), "ldap://one");
            assert_eq!(ruv.max_csn_for(ReplicaId::new(1)), Some(csn(100, 1, 1)));

            ruv.update(csn(90, 0, 2), "ldap://two");
            assert_eq!(ruv.len(), 2);
            assert_eq!(ruv.max_csn_for(ReplicaId::new(2)), Some(csn(90, 0, 2)));
        }

        #[test]
        fn test_update_never_regresses() {
            let mut ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            ruv.update(csn(100, 5, 1), "ldap://one");
            ruv.update(csn(100, 2, 1), "ldap://one");
            assert_eq!(ruv.max_csn_for(ReplicaId::new(1)), Some(csn(100, 5, 1)));
        }

        #[test]
        fn test_local_element_stays_first() {
            let mut ruv = Ruv::with_local(ReplicaId::new(7), "ldap://seven");
            ruv.update(csn(50, 0, 2), "ldap://two");
            ruv.update(csn(60, 0, 3), "ldap://three");
            assert_eq!(ruv.local_rid(), Some(ReplicaId::new(7)));
        }

        #[test]
        fn test_fresh_local_element_reports_no_maxcsn() {
            let ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            assert!(ruv.contains(ReplicaId::new(1)));
            assert_eq!(ruv.max_csn_for(ReplicaId::new(1)), None);
            assert_eq!(ruv.max_csn(), None);
        }
    }

    mod covers {
        use super::*;

        #[test]
        fn test_covers_at_and_below_watermark() {
            let ruv = ruv_of(&[(1, csn(100, 3, 1))]);
            assert!(ruv.covers_csn(&csn(100, 3, 1)));
            assert!(ruv.covers_csn(&csn(100, 2, 1)));
            assert!(ruv.covers_csn(&csn(99, 9, 1)));
            assert!(!ruv.covers_csn(&csn(100, 4, 1)));
        }

        #[test]
        fn test_unknown_rid_is_uncovered() {
            let ruv = ruv_of(&[(1, csn(100, 3, 1))]);
            assert!(!ruv.covers_csn(&csn(1, 0, 2)));
        }

        #[test]
        fn test_zero_watermark_covers_nothing_real() {
            let ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            assert!(!ruv.covers_csn(&csn(1, 0, 1)));
        }
    }

    mod merge {
        use super::*;

        #[test]
        fn test_merge_takes_per_rid_max() {
            let mut a = ruv_of(&[(1, csn(100, 0, 1)), (2, csn(50, 0, 2))]);
            let b = ruv_of(&[(1, csn(90, 0, 1)), (2, csn(70, 0, 2)), (3, csn(10, 0, 3))]);
            a.merge(&b);
            assert_eq!(a.max_csn_for(ReplicaId::new(1)), Some(csn(100, 0, 1)));
            assert_eq!(a.max_csn_for(ReplicaId::new(2)), Some(csn(70, 0, 2)));
            assert_eq!(a.max_csn_for(ReplicaId::new(3)), Some(csn(10, 0, 3)));
        }

        #[test]
        fn test_merge_covers_union() {
            let a = ruv_of(&[(1, csn(100, 0, 1))]);
            let b = ruv_of(&[(2, csn(70, 0, 2))]);
            let mut merged = a.clone();
            merged.merge(&b);
            assert!(merged.covers_csn(&csn(100, 0, 1)));
            assert!(merged.covers_csn(&csn(70, 0, 2)));
        }

        proptest! {
            #[test]
            fn prop_merge_commutative(
                pairs_a in proptest::collection::vec((1u16..6, 1u64..1000, 0u16..10), 0..6),
                pairs_b in proptest::collection::vec((1u16..6, 1u64..1000, 0u16..10), 0..6),
            ) {
                let build = |pairs: &[(u16, u64, u16)]| {
                    let mut ruv = Ruv::new();
                    for (rid, t, s) in pairs {
                        ruv.update(Csn::new(*t, *s, ReplicaId::new(*rid), 0), "");
                    }
                    ruv
                };
                let a = build(&pairs_a);
                let b = build(&pairs_b);

                let mut ab = a.clone();
                ab.merge(&b);
                let mut ba = b.clone();
                ba.merge(&a);
                prop_assert_eq!(ab.watermarks(), ba.watermarks());
            }

            #[test]
            fn prop_merge_idempotent(
                pairs in proptest::collection::vec((1u16..6, 1u64..1000, 0u16..10), 0..6),
            ) {
                let mut ruv = Ruv::new();
                for (rid, t, s) in &pairs {
                    ruv.update(Csn::new(*t, *s, ReplicaId::new(*rid), 0), "");
                }
                let mut twice = ruv.clone();
                twice.merge(&ruv);
                prop_assert_eq!(twice.watermarks(), ruv.watermarks());
            }
        }
    }

    mod deletion {
        use super::*;

        #[test]
        fn test_delete_removes_element() {
            let mut ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            ruv.update(csn(10, 0, 2), "ldap://two");
            ruv.delete_replica(ReplicaId::new(2)).unwrap();
            assert!(!ruv.contains(ReplicaId::new(2)));
            assert_eq!(ruv.len(), 1);
        }

        #[test]
        fn test_delete_own_rid_refused() {
            let mut ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            ruv.update(csn(10, 0, 2), "ldap://two");
            let err = ruv.delete_replica(ReplicaId::new(1)).unwrap_err();
            assert_eq!(err, ModelError::OwnReplicaId(ReplicaId::new(1)));
        }

        #[test]
        fn test_delete_last_element_refused() {
            let mut ruv = ruv_of(&[(2, csn(10, 0, 2))]);
            let err = ruv.delete_replica(ReplicaId::new(2)).unwrap_err();
            assert_eq!(err, ModelError::LastRuvElement(ReplicaId::new(2)));
        }

        #[test]
        fn test_delete_unknown_rid_refused() {
            let mut ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            let err = ruv.delete_replica(ReplicaId::new(9)).unwrap_err();
            assert_eq!(err, ModelError::UnknownReplica(ReplicaId::new(9)));
        }

        #[test]
        fn test_forget_has_no_guards() {
            let mut ruv = ruv_of(&[(2, csn(10, 0, 2))]);
            assert!(ruv.forget(ReplicaId::new(2)));
            assert!(ruv.is_empty());
            assert!(!ruv.forget(ReplicaId::new(2)));
        }
    }

    mod persistence {
        use super::*;

        #[test]
        fn test_tombstone_roundtrip() {
            let mut ruv = Ruv::with_local(ReplicaId::new(1), "ldap://one");
            ruv.update(csn(100, 4, 1), "ldap://one");
            ruv.update(csn(90, 0, 2), "ldap://two");

            let bytes = ruv.to_tombstone().unwrap();
            let restored = Ruv::from_tombstone(&bytes).unwrap();
            assert_eq!(restored, ruv);
            assert_eq!(restored.local_rid(), Some(ReplicaId::new(1)));
        }

        #[test]
        fn test_tombstone_garbage_rejected() {
            assert!(Ruv::from_tombstone(&[0xde, 0xad]).is_err());
        }
    }

    mod identity {
        use super::*;

        #[test]
        fn test_duplicate_supplier_detected() {
            let supplier = Ruv::with_local(ReplicaId::new(4), "ldap://other");
            assert!(replica_id_conflicts(&supplier, ReplicaId::new(4), true));
            assert!(!replica_id_conflicts(&supplier, ReplicaId::new(5), true));
        }

        #[test]
        fn test_read_only_replica_never_conflicts() {
            let supplier = Ruv::with_local(ReplicaId::new(4), "ldap://other");
            assert!(!replica_id_conflicts(&supplier, ReplicaId::new(4), false));
        }
    }
}
