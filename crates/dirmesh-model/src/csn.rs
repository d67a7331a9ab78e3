//! Change sequence numbers: totally ordered identifiers for directory changes.
//!
//! A CSN names exactly one change anywhere in the topology. Ordering is
//! lexicographic on (timestamp, sequence, replica id, sub-sequence), so two
//! changes made in the same second on different replicas still have a
//! definite winner.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ModelError;

/// Replica identifier: a small integer uniquely naming one writable replica
/// within a topology.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(u16);

impl ReplicaId {
    /// Reserved id carried by read-only replicas. Never a valid cleanup target.
    pub const READ_ONLY: ReplicaId = ReplicaId(u16::MAX);

    /// Largest raw id value, equal to the read-only sentinel.
    pub const MAX: u16 = u16::MAX;

    /// Creates a replica id from a raw u16 value.
    pub fn new(id: u16) -> Self {
        ReplicaId(id)
    }

    /// Returns the raw u16 value of this replica id.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// True for ids that may be retired through cleanup (1..=65534).
    pub fn is_cleanable(&self) -> bool {
        self.0 >= 1 && self.0 < Self::MAX
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Length of the canonical CSN string form: 8 hex digits of timestamp and
/// 4 each of sequence, replica id, and sub-sequence.
pub const CSN_STRSIZE: usize = 20;

/// A change sequence number.
///
/// The derived `Ord` compares fields in declaration order, which is exactly
/// the required lexicographic order. The string form sorts the same way
/// byte-wise, so CSN strings double as storage keys.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Csn {
    /// Wall-clock seconds at generation time, after generator offsets.
    pub tstamp: u64,
    /// Monotonic counter distinguishing changes within one second.
    pub seqnum: u16,
    /// Originating replica.
    pub rid: ReplicaId,
    /// Sub-operation number for multi-part operations.
    pub subseq: u16,
}

impl Csn {
    /// The all-zeros CSN, used as the "no changes ever seen" placeholder.
    pub const ZERO: Csn = Csn {
        tstamp: 0,
        seqnum: 0,
        rid: ReplicaId(0),
        subseq: 0,
    };

    /// The largest representable CSN, used as an open upper bound in range
    /// scans. Timestamps render as 8 hex digits, so the bound is 2^32-1.
    pub const MAX: Csn = Csn {
        tstamp: u32::MAX as u64,
        seqnum: u16::MAX,
        rid: ReplicaId(u16::MAX),
        subseq: u16::MAX,
    };

    /// Creates a CSN from its four components.
    pub fn new(tstamp: u64, seqnum: u16, rid: ReplicaId, subseq: u16) -> Self {
        Csn {
            tstamp,
            seqnum,
            rid,
            subseq,
        }
    }

    /// True if this is the all-zeros placeholder.
    pub fn is_zero(&self) -> bool {
        *self == Csn::ZERO
    }

    /// Seconds-resolution timestamp component.
    pub fn time(&self) -> u64 {
        self.tstamp
    }
}

impl fmt::Display for Csn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}{:04x}{:04x}{:04x}",
            self.tstamp,
            self.seqnum,
            self.rid.as_u16(),
            self.subseq
        )
    }
}

impl FromStr for Csn {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != CSN_STRSIZE || !s.is_ascii() {
            return Err(ModelError::BadCsnString(s.to_string()));
        }
        let tstamp = u64::from_str_radix(&s[0..8], 16)
            .map_err(|_| ModelError::BadCsnString(s.to_string()))?;
        let seqnum = u16::from_str_radix(&s[8..12], 16)
            .map_err(|_| ModelError::BadCsnString(s.to_string()))?;
        let rid = u16::from_str_radix(&s[12..16], 16)
            .map_err(|_| ModelError::BadCsnString(s.to_string()))?;
        let subseq = u16::from_str_radix(&s[16..20], 16)
            .map_err(|_| ModelError::BadCsnString(s.to_string()))?;
        Ok(Csn {
            tstamp,
            seqnum,
            rid: ReplicaId::new(rid),
            subseq,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_zero_csn_string() {
        assert_eq!(Csn::ZERO.to_string(), "00000000000000000000");
        assert!(Csn::ZERO.is_zero());
    }

    #[test]
    fn test_max_csn_string() {
        assert_eq!(Csn::MAX.to_string(), "ffffffffffffffffffff");
        assert!(Csn::new(u32::MAX as u64, 0, ReplicaId::new(0), 0) <= Csn::MAX);
    }

    #[test]
    fn test_display_width_is_fixed() {
        let csn = Csn::new(0x5f, 3, ReplicaId::new(1), 0);
        let s = csn.to_string();
        assert_eq!(s.len(), CSN_STRSIZE);
        assert_eq!(s, "0000005f000300010000");
    }

    #[test]
    fn test_parse_roundtrip() {
        let csn = Csn::new(1_700_000_000, 42, ReplicaId::new(7), 1);
        let parsed: Csn = csn.to_string().parse().unwrap();
        assert_eq!(parsed, csn);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!("".parse::<Csn>().is_err());
        assert!("1234".parse::<Csn>().is_err());
        assert!("zzzzzzzzzzzzzzzzzzzz".parse::<Csn>().is_err());
        assert!("0000005f00030001000".parse::<Csn>().is_err());
        assert!("0000005f0003000100000".parse::<Csn>().is_err());
    }

    #[test]
    fn test_parse_rejects_non_ascii() {
        assert!("0000005f000300010é0".parse::<Csn>().is_err());
    }

    #[test]
    fn test_order_timestamp_dominates() {
        let a = Csn::new(100, 9, ReplicaId::new(9), 9);
        let b = Csn::new(101, 0, ReplicaId::new(1), 0);
        assert!(a < b);
    }

    #[test]
    fn test_order_seqnum_breaks_time_ties() {
        let a = Csn::new(100, 1, ReplicaId::new(9), 0);
        let b = Csn::new(100, 2, ReplicaId::new(1), 0);
        assert!(a < b);
    }

    #[test]
    fn test_order_rid_breaks_seq_ties() {
        let a = Csn::new(100, 1, ReplicaId::new(1), 9);
        let b = Csn::new(100, 1, ReplicaId::new(2), 0);
        assert!(a < b);
    }

    #[test]
    fn test_order_subseq_last() {
        let a = Csn::new(100, 1, ReplicaId::new(1), 0);
        let b = Csn::new(100, 1, ReplicaId::new(1), 1);
        assert!(a < b);
    }

    #[test]
    fn test_string_order_matches_value_order() {
        let a = Csn::new(100, 0xffff, ReplicaId::new(3), 0);
        let b = Csn::new(0x1000, 0, ReplicaId::new(1), 0);
        assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
    }

    #[test]
    fn test_replica_id_cleanable_range() {
        assert!(!ReplicaId::new(0).is_cleanable());
        assert!(ReplicaId::new(1).is_cleanable());
        assert!(ReplicaId::new(65534).is_cleanable());
        assert!(!ReplicaId::READ_ONLY.is_cleanable());
    }

    #[test]
    fn test_bincode_roundtrip() {
        let csn = Csn::new(1_700_000_000, 7, ReplicaId::new(12), 2);
        let bytes = bincode::serialize(&csn).unwrap();
        let back: Csn = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, csn);
    }

    fn arb_csn() -> impl Strategy<Value = Csn> {
        (any::<u32>(), any::<u16>(), any::<u16>(), any::<u16>()).prop_map(|(t, s, r, u)| {
            Csn::new(t as u64, s, ReplicaId::new(r), u)
        })
    }

    proptest! {
        #[test]
        fn prop_compare_is_total_order(a in arb_csn(), b in arb_csn(), c in arb_csn()) {
            prop_assert_eq!(a.cmp(&a), std::cmp::Ordering::Equal);
            prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
            if a <= b && b <= c {
                prop_assert!(a <= c);
            }
        }

        #[test]
        fn prop_string_roundtrip(a in arb_csn()) {
            let back: Csn = a.to_string().parse().unwrap();
            prop_assert_eq!(back, a);
        }

        #[test]
        fn prop_string_order_is_value_order(a in arb_csn(), b in arb_csn()) {
            prop_assert_eq!(a.cmp(&b), a.to_string().cmp(&b.to_string()));
        }
    }
}
