//! Changelog round-trips: write/replay, resume points, LDIF transfer.

use std::sync::Arc;

use dirmesh_changelog::{
    ChangeLog, ChangeOp, ChangeRecord, ChangelogConfig, MemoryLogStore,
};
use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::ruv::Ruv;

use crate::harness::SEED_BASE;

fn open_log() -> ChangeLog {
    let log = ChangeLog::new(Arc::new(MemoryLogStore::new()), ChangelogConfig::default());
    log.open().unwrap();
    log
}

fn record(rid: u16, seq: u16) -> ChangeRecord {
    ChangeRecord::new(
        Csn::new(SEED_BASE, seq, ReplicaId::new(rid), 0),
        ChangeOp::Add,
        "cn=x,dc=example,dc=com",
        vec![rid as u8, seq as u8],
        SEED_BASE,
    )
}

fn drain(log: &ChangeLog) -> Vec<ChangeRecord> {
    let mut cursor = log.replay_for(&Ruv::new(), &[]).unwrap();
    let mut records = Vec::new();
    while let Some(rec) = cursor.next() {
        records.push(rec);
    }
    records
}

#[test]
fn test_written_records_replay_in_csn_order() {
    let log = open_log();
    // Written out of order on purpose.
    for (rid, seq) in [(6, 0), (5, 1), (5, 0), (6, 1), (5, 2)] {
        log.write(&record(rid, seq)).unwrap();
    }

    let records = drain(&log);
    assert_eq!(records.len(), 5);
    let csns: Vec<Csn> = records.iter().map(|r| r.csn).collect();
    let mut sorted = csns.clone();
    sorted.sort();
    assert_eq!(csns, sorted);
    assert_eq!(records[0], record(5, 0));
}

#[test]
fn test_iterate_from_includes_the_resume_point() {
    let log = open_log();
    for seq in 0..4 {
        log.write(&record(5, seq)).unwrap();
    }

    let start = Csn::new(SEED_BASE, 1, ReplicaId::new(5), 0);
    let mut cursor = log.iterate_from(ReplicaId::new(5), Some(start)).unwrap();
    let mut seqs = Vec::new();
    while let Some(rec) = cursor.next() {
        seqs.push(rec.csn.seqnum);
    }
    assert_eq!(seqs, vec![1, 2, 3]);
}

#[test]
fn test_replay_skips_excluded_rids() {
    let log = open_log();
    log.write(&record(5, 0)).unwrap();
    log.write(&record(6, 0)).unwrap();

    let mut cursor = log.replay_for(&Ruv::new(), &[ReplicaId::new(5)]).unwrap();
    let mut rids = Vec::new();
    while let Some(rec) = cursor.next() {
        rids.push(rec.csn.rid.as_u16());
    }
    assert_eq!(rids, vec![6]);
}

#[test]
fn test_ldif_export_import_preserves_every_record() {
    let source = open_log();
    for seq in 0..3 {
        source.write(&record(5, seq)).unwrap();
    }
    source.write(&record(6, 0)).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("changelog.ldif");
    assert_eq!(source.export_ldif(&path).unwrap(), 4);

    let restored = ChangeLog::new(Arc::new(MemoryLogStore::new()), ChangelogConfig::default());
    assert_eq!(restored.import_ldif(&path).unwrap(), 4);
    assert_eq!(restored.entry_count(), 4);
    assert_eq!(drain(&restored), drain(&source));
}

#[test]
fn test_purge_rid_is_scoped_and_idempotent() {
    let log = open_log();
    for seq in 0..3 {
        log.write(&record(5, seq)).unwrap();
    }
    log.write(&record(6, 0)).unwrap();

    assert_eq!(log.purge_rid(ReplicaId::new(5)).unwrap(), 3);
    assert_eq!(log.entry_count(), 1);
    assert_eq!(drain(&log)[0].csn.rid, ReplicaId::new(6));

    assert_eq!(log.purge_rid(ReplicaId::new(5)).unwrap(), 0);
}
