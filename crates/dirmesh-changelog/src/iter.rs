//! Replay positioning and iteration.
//!
//! A supplier replays changes to a peer by positioning in the log at the
//! peer's per-rid watermarks and scanning forward in key order. When a
//! requested start point is not in the log the absence is classified: below
//! the purge floor it was trimmed (`PurgedData`, the peer needs a total
//! update); between the floor and the log's own upper bound it should have
//! been there (`MissingData`, a correctness alarm); past the upper bound the
//! peer is simply ahead and there is nothing to send.

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::ruv::Ruv;

use crate::error::ChangelogError;
use crate::record::ChangeRecord;
use crate::store::{ChangeLog, Inner, LogState};

/// Forward-only cursor over the changes one replay pass will send.
///
/// Snapshot semantics: the cursor holds the records selected at creation
/// time; writes after that are picked up by the next positioning call.
/// Exhaustion means the peer is up to date as of the snapshot.
#[derive(Debug)]
pub struct ReplayCursor {
    records: Vec<ChangeRecord>,
    index: usize,
}

impl ReplayCursor {
    fn new(records: Vec<ChangeRecord>) -> Self {
        ReplayCursor { records, index: 0 }
    }

    /// The next change to send, or None when the peer is caught up.
    pub fn next(&mut self) -> Option<ChangeRecord> {
        let record = self.records.get(self.index).cloned();
        if record.is_some() {
            self.index += 1;
        }
        record
    }

    /// Changes left to send.
    pub fn remaining(&self) -> usize {
        self.records.len() - self.index
    }

    /// True when there was nothing to send in the first place.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

impl ChangeLog {
    /// Positions at `start` and returns the entries originated by `rid`
    /// from there on, in CSN order; `start` itself is included when
    /// present. A start at or past the rid's newest logged change means
    /// the peer is caught up and yields an empty cursor. `None` means
    /// the peer has never seen this rid and wants everything from the
    /// rid's first entry.
    pub fn iterate_from(
        &self,
        rid: ReplicaId,
        start: Option<Csn>,
    ) -> Result<ReplayCursor, ChangelogError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        if inner.state != LogState::Open {
            return Err(ChangelogError::BadState {
                op: "iterate",
                state: inner.state.name(),
            });
        }

        match start {
            Some(csn) => {
                if let Some(supplier_max) = inner.max_ruv.max_csn_for(rid) {
                    if csn >= supplier_max {
                        return Ok(ReplayCursor::new(Vec::new()));
                    }
                }
                if !self.store.contains_key(csn.to_string().as_bytes())? {
                    check_start_absent(&inner, rid, csn)?;
                    // fall through: resume point absent but classified as
                    // harmless, scan from wherever the rid's entries begin
                }
                self.collect_rid(rid, |c| c >= csn)
            }
            None => {
                if inner.purge_ruv.max_csn_for(rid).is_some() {
                    // the rid's earliest changes were trimmed; a peer that
                    // has nothing cannot be seeded incrementally
                    return Err(ChangelogError::PurgedData {
                        rid,
                        csn: Csn::ZERO,
                    });
                }
                self.collect_rid(rid, |_| true)
            }
        }
    }

    /// Positions by the peer's whole RUV and returns every change the peer
    /// does not cover, across all rids, in CSN order. Rids in `exclude`
    /// are never emitted; callers pass rids that are being cleaned.
    pub fn replay_for(
        &self,
        consumer: &Ruv,
        exclude: &[ReplicaId],
    ) -> Result<ReplayCursor, ChangelogError> {
        let inner = self
            .inner
            .read()
            .map_err(|e| ChangelogError::DbError(e.to_string()))?;
        if inner.state != LogState::Open {
            return Err(ChangelogError::BadState {
                op: "replay",
                state: inner.state.name(),
            });
        }

        for element in inner.max_ruv.elements() {
            let rid = element.rid;
            if exclude.contains(&rid) {
                continue;
            }
            let supplier_max = match inner.max_ruv.max_csn_for(rid) {
                Some(m) => m,
                None => continue,
            };
            match consumer.max_csn_for(rid) {
                Some(watermark) => {
                    if watermark >= supplier_max {
                        continue;
                    }
                    if !self.store.contains_key(watermark.to_string().as_bytes())? {
                        check_start_absent(&inner, rid, watermark)?;
                    }
                }
                None => {
                    if inner.purge_ruv.max_csn_for(rid).is_some() {
                        return Err(ChangelogError::PurgedData {
                            rid,
                            csn: Csn::ZERO,
                        });
                    }
                }
            }
        }

        let mut records = Vec::new();
        for (_, value) in self.scan_entries()? {
            let record = ChangeRecord::decode(&value)?;
            if exclude.contains(&record.csn.rid) {
                continue;
            }
            if consumer.covers_csn(&record.csn) {
                continue;
            }
            records.push(record);
        }
        Ok(ReplayCursor::new(records))
    }

    /// Every change in the log except those from `exclude`, in CSN order,
    /// with no positioning against a consumer RUV. A total update reseeds
    /// the peer from scratch, so trim history is irrelevant to it.
    pub fn replay_all(&self, exclude: &[ReplicaId]) -> Result<ReplayCursor, ChangelogError> {
        {
            let inner = self
                .inner
                .read()
                .map_err(|e| ChangelogError::DbError(e.to_string()))?;
            if inner.state != LogState::Open {
                return Err(ChangelogError::BadState {
                    op: "replay",
                    state: inner.state.name(),
                });
            }
        }
        let mut records = Vec::new();
        for (_, value) in self.scan_entries()? {
            let record = ChangeRecord::decode(&value)?;
            if exclude.contains(&record.csn.rid) {
                continue;
            }
            records.push(record);
        }
        Ok(ReplayCursor::new(records))
    }

    fn collect_rid<F>(&self, rid: ReplicaId, keep: F) -> Result<ReplayCursor, ChangelogError>
    where
        F: Fn(Csn) -> bool,
    {
        let mut records = Vec::new();
        for (_, value) in self.scan_entries()? {
            let record = ChangeRecord::decode(&value)?;
            if record.csn.rid == rid && keep(record.csn) {
                records.push(record);
            }
        }
        Ok(ReplayCursor::new(records))
    }
}

/// Classifies an absent replay start point. `Ok` means the absence is
/// harmless and the scan may proceed from later entries.
fn check_start_absent(inner: &Inner, rid: ReplicaId, start: Csn) -> Result<(), ChangelogError> {
    let supplier_max = match inner.max_ruv.max_csn_for(rid) {
        Some(m) => m,
        // no changes from this rid were ever logged, nothing to miss
        None => return Ok(()),
    };
    match inner.purge_ruv.max_csn_for(rid) {
        None => {
            if start <= supplier_max {
                // logged before this changelog existed, typically loaded
                // during replica initialization
                Err(ChangelogError::PurgedData { rid, csn: start })
            } else {
                Ok(())
            }
        }
        Some(purge) => {
            if start < purge {
                Err(ChangelogError::PurgedData { rid, csn: start })
            } else if start <= supplier_max {
                Err(ChangelogError::MissingData { rid, csn: start })
            } else {
                Ok(())
            }
        }
    }
}
