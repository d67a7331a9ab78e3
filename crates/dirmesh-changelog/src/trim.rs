//! Trim floor computation.

use std::collections::BTreeMap;

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::ruv::Ruv;

/// Computes the floor below which the trim pass may delete entries.
///
/// Starts from the local update vector and lowers each rid's watermark to
/// the smallest value any consumer has confirmed, so no entry a consumer
/// still needs is removed. A consumer that has no watermark for a rid does
/// not hold that rid back; a rid only a consumer knows is added to the
/// floor at the consumer's value. Zero watermarks mean "nothing seen yet"
/// and are ignored on both sides.
///
/// Disabled agreements' consumer vectors belong in `consumers` too: if one
/// is re-enabled after its changes were trimmed, replication to it breaks.
pub fn purge_floor(local: &Ruv, consumers: &[Ruv]) -> Ruv {
    let mut floor: BTreeMap<ReplicaId, Csn> = BTreeMap::new();
    for element in local.elements() {
        if element.csn != Csn::ZERO {
            floor.insert(element.rid, element.csn);
        }
    }
    for consumer in consumers {
        for element in consumer.elements() {
            if element.csn == Csn::ZERO {
                continue;
            }
            let lower = match floor.get(&element.rid) {
                Some(current) => element.csn < *current,
                None => true,
            };
            if lower {
                floor.insert(element.rid, element.csn);
            }
        }
    }

    let mut ruv = Ruv::new();
    for csn in floor.into_values() {
        ruv.update(csn, "");
    }
    ruv
}

#[cfg(test)]
mod tests {
    use super::*;

    fn csn(t: u64, rid: u16) -> Csn {
        Csn::new(t, 0, ReplicaId::new(rid), 0)
    }

    fn ruv_of(csns: &[Csn]) -> Ruv {
        let mut ruv = Ruv::new();
        for c in csns {
            ruv.update(*c, "");
        }
        ruv
    }

    #[test]
    fn test_floor_without_consumers_is_local() {
        let local = ruv_of(&[csn(100, 1), csn(200, 2)]);
        let floor = purge_floor(&local, &[]);
        assert_eq!(floor.max_csn_for(ReplicaId::new(1)), Some(csn(100, 1)));
        assert_eq!(floor.max_csn_for(ReplicaId::new(2)), Some(csn(200, 2)));
    }

    #[test]
    fn test_laggard_consumer_lowers_floor() {
        let local = ruv_of(&[csn(100, 1)]);
        let caught_up = ruv_of(&[csn(100, 1)]);
        let laggard = ruv_of(&[csn(40, 1)]);
        let floor = purge_floor(&local, &[caught_up, laggard]);
        assert_eq!(floor.max_csn_for(ReplicaId::new(1)), Some(csn(40, 1)));
    }

    #[test]
    fn test_consumer_without_rid_does_not_hold_it_back() {
        let local = ruv_of(&[csn(100, 1), csn(200, 2)]);
        let consumer = ruv_of(&[csn(90, 1)]);
        let floor = purge_floor(&local, &[consumer]);
        assert_eq!(floor.max_csn_for(ReplicaId::new(1)), Some(csn(90, 1)));
        assert_eq!(floor.max_csn_for(ReplicaId::new(2)), Some(csn(200, 2)));
    }

    #[test]
    fn test_zero_watermark_is_ignored() {
        let local = ruv_of(&[csn(100, 1)]);
        let mut consumer = Ruv::new();
        consumer.update(Csn::new(0, 0, ReplicaId::new(1), 0), "");
        let floor = purge_floor(&local, &[consumer]);
        assert_eq!(floor.max_csn_for(ReplicaId::new(1)), Some(csn(100, 1)));
    }

    #[test]
    fn test_consumer_only_rid_joins_the_floor() {
        let local = ruv_of(&[csn(100, 1)]);
        let consumer = ruv_of(&[csn(100, 1), csn(50, 7)]);
        let floor = purge_floor(&local, &[consumer]);
        assert_eq!(floor.max_csn_for(ReplicaId::new(7)), Some(csn(50, 7)));
    }

    #[test]
    fn test_minimum_wins_across_many_consumers() {
        let local = ruv_of(&[csn(100, 1)]);
        let consumers = vec![
            ruv_of(&[csn(70, 1)]),
            ruv_of(&[csn(30, 1)]),
            ruv_of(&[csn(95, 1)]),
        ];
        let floor = purge_floor(&local, &consumers);
        assert_eq!(floor.max_csn_for(ReplicaId::new(1)), Some(csn(30, 1)));
    }
}
