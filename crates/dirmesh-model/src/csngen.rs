//! CSN generator: per-replica source of strictly increasing CSNs.
//!
//! The generator tracks three time components. `sampled_time` follows the
//! system clock, `local_offset` absorbs backward clock motion and sequence
//! rollover, and `remote_offset` absorbs peers running ahead of the local
//! clock. The timestamp stamped into the next CSN is the sum of all three,
//! so emitted CSNs never regress even when the wall clock does.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::csn::{Csn, ReplicaId};
use crate::error::ModelError;

/// Maximum seconds of skew the generator absorbs before refusing.
pub const CSN_MAX_TIME_ADJUST: u64 = 86_400;

/// Sequence numbers exhaust at this value and roll into `local_offset`.
pub const CSN_MAX_SEQNUM: u16 = 0xffff;

/// Persistable generator state. Saved to the replica's configuration entry
/// and restored at startup so a restart cannot re-issue old CSNs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratorState {
    /// Replica id stamped into every generated CSN.
    pub rid: ReplicaId,
    /// Last system-clock sample, seconds since the epoch.
    pub sampled_time: u64,
    /// Seconds absorbed from backward clock motion and seqnum rollover.
    pub local_offset: u64,
    /// Seconds absorbed from peers ahead of the local clock.
    pub remote_offset: u64,
    /// Next sequence number within the current effective second.
    pub seq_num: u16,
}

/// Generates CSNs for one replica and adjusts its notion of time as peer
/// CSNs are observed.
///
/// All mutating methods take the current wall clock as an explicit argument
/// so the arithmetic is testable; the `*_now` wrappers sample the system
/// clock.
#[derive(Debug, Clone)]
pub struct CsnGenerator {
    state: GeneratorState,
    ignore_time_skew: bool,
}

fn wall_clock_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

impl CsnGenerator {
    /// Creates a fresh generator for `rid` sampled at `now`.
    pub fn new(rid: ReplicaId, now: u64) -> Self {
        CsnGenerator {
            state: GeneratorState {
                rid,
                sampled_time: now,
                local_offset: 0,
                remote_offset: 0,
                seq_num: 0,
            },
            ignore_time_skew: false,
        }
    }

    /// Restores a generator from persisted state.
    pub fn from_state(state: GeneratorState, ignore_time_skew: bool) -> Self {
        CsnGenerator {
            state,
            ignore_time_skew,
        }
    }

    /// Snapshot of the persistable state.
    pub fn state(&self) -> GeneratorState {
        self.state
    }

    /// The replica id this generator stamps into CSNs.
    pub fn rid(&self) -> ReplicaId {
        self.state.rid
    }

    /// Disables or re-enables the skew limit checks.
    pub fn set_ignore_time_skew(&mut self, ignore: bool) {
        self.ignore_time_skew = ignore;
    }

    /// Changes the replica id stamped into future CSNs. Used when a replica
    /// is re-assigned an identity.
    pub fn rewrite_rid(&mut self, rid: ReplicaId) {
        self.state.rid = rid;
    }

    /// True if `csn` was produced by this generator's replica.
    pub fn is_local_csn(&self, csn: &Csn) -> bool {
        self.state.rid == csn.rid
    }

    /// The timestamp the next generated CSN would carry.
    pub fn effective_time(&self) -> u64 {
        self.state.sampled_time + self.state.local_offset + self.state.remote_offset
    }

    /// Generates the next CSN using the system clock.
    pub fn new_csn(&mut self) -> Result<Csn, ModelError> {
        self.new_csn_at(wall_clock_seconds())
    }

    /// Generates the next CSN as of wall-clock second `now`.
    pub fn new_csn_at(&mut self, now: u64) -> Result<Csn, ModelError> {
        self.adjust_local_time(now)?;

        if self.state.seq_num == CSN_MAX_SEQNUM {
            info!(rid = %self.state.rid, "csn sequence rollover; local offset bumped");
            self.state.local_offset += 1;
            self.state.seq_num = 0;
        }

        let csn = Csn::new(self.effective_time(), self.state.seq_num, self.state.rid, 0);
        self.state.seq_num += 1;
        Ok(csn)
    }

    /// Ingests a peer CSN using the system clock.
    pub fn adjust_time(&mut self, remote: &Csn) -> Result<(), ModelError> {
        self.adjust_time_at(remote, wall_clock_seconds())
    }

    /// Adjusts the generator so it will never emit a CSN smaller than
    /// `remote`. Called with the peer's CSN at the start of every
    /// replication session, in both directions.
    pub fn adjust_time_at(&mut self, remote: &Csn, now: u64) -> Result<(), ModelError> {
        let old_time = self.effective_time();
        self.adjust_local_time(now)?;

        let delta = remote.tstamp as i64 - self.effective_time() as i64;
        if delta > 0 {
            let delta = delta as u64;
            if !self.ignore_time_skew
                && self.state.remote_offset + delta > CSN_MAX_TIME_ADJUST
            {
                warn!(
                    rid = %remote.rid,
                    adjustment = delta,
                    limit = CSN_MAX_TIME_ADJUST,
                    "remote time adjustment limit exceeded"
                );
                return Err(ModelError::SkewLimitExceeded {
                    adjustment: delta,
                    limit: CSN_MAX_TIME_ADJUST,
                });
            }
            self.state.remote_offset += delta;
            // Park one second in local_offset where the next clock tick
            // consumes it; otherwise slightly desynchronized suppliers
            // ratchet remote_offset up forever.
            if self.state.local_offset == 0 {
                self.state.local_offset += 1;
                self.state.remote_offset -= 1;
            }
        }

        // The next csn must beat both the remote csn and anything we
        // already emitted.
        let new_time = self.effective_time();
        if new_time > old_time {
            self.state.seq_num = 0;
        }
        if new_time == remote.tstamp && remote.seqnum >= self.state.seq_num {
            if remote.seqnum == CSN_MAX_SEQNUM {
                self.state.seq_num = 0;
                self.state.local_offset += 1;
            } else {
                self.state.seq_num = remote.seqnum + 1;
            }
        }
        Ok(())
    }

    /// Folds a new clock sample into the state. `local_offset` shrinks as
    /// the clock advances and grows when the clock steps backward, keeping
    /// the effective time monotonic.
    fn adjust_local_time(&mut self, now: u64) -> Result<(), ModelError> {
        let time_diff = now as i64 - self.state.sampled_time as i64;

        if time_diff == 0 {
            return Ok(());
        }
        if time_diff.unsigned_abs() > CSN_MAX_TIME_ADJUST {
            info!(
                delta = time_diff,
                current = now,
                previous = self.state.sampled_time,
                "large jump in csn time"
            );
        }
        if !self.ignore_time_skew
            && self.state.local_offset as i64 - time_diff > CSN_MAX_TIME_ADJUST as i64
        {
            let adjustment = (self.state.local_offset as i64 - time_diff) as u64;
            warn!(
                adjustment,
                limit = CSN_MAX_TIME_ADJUST,
                "local time adjustment limit exceeded"
            );
            return Err(ModelError::SkewLimitExceeded {
                adjustment,
                limit: CSN_MAX_TIME_ADJUST,
            });
        }

        let before = self.effective_time();
        self.state.sampled_time = now;
        self.state.local_offset = (self.state.local_offset as i64 - time_diff).max(0) as u64;

        // Resetting on an equal timestamp would let the generator hand out
        // duplicate csns.
        if self.effective_time() > before {
            self.state.seq_num = 0;
        }
        Ok(())
    }
}
