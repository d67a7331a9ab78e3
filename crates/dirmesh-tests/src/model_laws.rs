//! Ordering and merge laws for CSNs and RUVs.

use proptest::prelude::*;

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::ruv::Ruv;

/// Timestamps render as 8 hex digits, so the text form only holds u32.
fn arb_csn() -> impl Strategy<Value = Csn> {
    (0u64..=u32::MAX as u64, any::<u16>(), any::<u16>(), any::<u16>())
        .prop_map(|(t, s, r, q)| Csn::new(t, s, ReplicaId::new(r), q))
}

fn arb_ruv() -> impl Strategy<Value = Ruv> {
    prop::collection::vec(arb_csn(), 0..8).prop_map(|csns| {
        let mut ruv = Ruv::new();
        for csn in csns {
            ruv.update(csn, "ldap://p:389");
        }
        ruv
    })
}

proptest! {
    #[test]
    fn prop_csn_order_is_lexicographic(a in arb_csn(), b in arb_csn()) {
        let key_a = (a.tstamp, a.seqnum, a.rid.as_u16(), a.subseq);
        let key_b = (b.tstamp, b.seqnum, b.rid.as_u16(), b.subseq);
        prop_assert_eq!(a.cmp(&b), key_a.cmp(&key_b));
    }

    #[test]
    fn prop_csn_text_round_trips(a in arb_csn()) {
        let text = a.to_string();
        prop_assert_eq!(text.len(), 20);
        prop_assert_eq!(text.parse::<Csn>().unwrap(), a);
    }

    /// The changelog keys records by CSN text; byte order must equal
    /// CSN order for range scans to come back in replay order.
    #[test]
    fn prop_csn_text_sorts_like_csn(a in arb_csn(), b in arb_csn()) {
        prop_assert_eq!(a.to_string().cmp(&b.to_string()), a.cmp(&b));
    }

    #[test]
    fn prop_ruv_merge_commutes(a in arb_ruv(), b in arb_ruv()) {
        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);
        prop_assert_eq!(ab.watermarks(), ba.watermarks());
    }

    #[test]
    fn prop_ruv_merge_is_idempotent(a in arb_ruv(), b in arb_ruv()) {
        let mut twice = a.clone();
        twice.merge(&a);
        prop_assert_eq!(twice.watermarks(), a.watermarks());

        let mut ab = a.clone();
        ab.merge(&b);
        let mut again = ab.clone();
        again.merge(&b);
        prop_assert_eq!(again.watermarks(), ab.watermarks());
    }

    #[test]
    fn prop_merged_ruv_covers_both_sides(a in arb_ruv(), b in arb_ruv()) {
        let mut merged = a.clone();
        merged.merge(&b);
        for element in a.elements().iter().chain(b.elements()) {
            prop_assert!(merged.covers_csn(&element.csn));
        }
    }

    /// Merging never moves a watermark backward.
    #[test]
    fn prop_merge_is_monotone(a in arb_ruv(), b in arb_ruv()) {
        let mut merged = a.clone();
        merged.merge(&b);
        for (rid, csn) in a.watermarks() {
            prop_assert!(merged.max_csn_for(rid).unwrap() >= csn);
        }
    }
}
