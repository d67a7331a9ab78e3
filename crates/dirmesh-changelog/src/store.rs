//! The changelog store: state machine, writes, rid purge, and the internal
//! bookkeeping records.
//!
//! Two RUVs are kept alongside the entries. The max RUV is the per-rid
//! upper bound of everything written; the purge RUV is the per-rid lower
//! bound below which entries have been trimmed away. Both are held in
//! memory while the log is open and flushed to reserved keys on a clean
//! close. The entry-count record has the same lifecycle, so its absence at
//! open reveals an unclean shutdown and triggers a recount.

use std::sync::{Arc, RwLock};

use tracing::{info, warn};

use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_model::ruv::Ruv;

use crate::error::ChangelogError;
use crate::kv::{BatchOp, LogStore};
use crate::record::{
    ChangeRecord, CL_VERSION, ENTRY_RANGE_END, ENTRY_RANGE_START, KEY_ENTRY_COUNT, KEY_MAX_RUV,
    KEY_PURGE_RUV, KEY_VERSION,
};

/// Lifecycle state of one changelog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogState {
    /// Created but never opened.
    None,
    /// Accepting writes and replay.
    Open,
    /// Close in progress.
    Closing,
    /// Closed; bookkeeping flushed.
    Closed,
}

impl LogState {
    /// Lowercase state name for diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            LogState::None => "none",
            LogState::Open => "open",
            LogState::Closing => "closing",
            LogState::Closed => "closed",
        }
    }
}

/// Trim policy and maintenance tuning for one changelog.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ChangelogConfig {
    /// Trim entries older than this many seconds; 0 disables age trimming.
    pub max_age_secs: u64,
    /// Trim down to this many entries; 0 disables count trimming.
    pub max_entries: u64,
    /// Seconds between background trim passes.
    pub trim_interval_secs: u64,
}

impl Default for ChangelogConfig {
    fn default() -> Self {
        ChangelogConfig {
            max_age_secs: 0,
            max_entries: 0,
            trim_interval_secs: 300,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) state: LogState,
    pub(crate) purge_ruv: Ruv,
    pub(crate) max_ruv: Ruv,
    pub(crate) entry_count: u64,
}

/// One replicated subtree's changelog.
pub struct ChangeLog {
    pub(crate) store: Arc<dyn LogStore>,
    pub(crate) config: ChangelogConfig,
    pub(crate) inner: RwLock<Inner>,
}

impl ChangeLog {
    /// Creates a changelog over `store`. The log starts in the `None` state
    /// and must be opened before use.
    pub fn new(store: Arc<dyn LogStore>, config: ChangelogConfig) -> Self {
        ChangeLog {
            store,
            config,
            inner: RwLock::new(Inner {
                state: LogState::None,
                purge_ruv: Ruv::new(),
                max_ruv: Ruv::new(),
                entry_count: 0,
            }),
        }
    }

    fn lock(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, ChangelogError> {
        self.inner
            .write()
            .map_err(|e| ChangelogError::DbError(e.to_string()))
    }

    fn lock_read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, ChangelogError> {
        self.inner
            .read()
            .map_err(|e| ChangelogError::DbError(e.to_string()))
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LogState {
        self.inner.read().map(|i| i.state).unwrap_or(LogState::None)
    }

    /// Number of entries currently retained. Meaningful while open.
    pub fn entry_count(&self) -> u64 {
        self.inner.read().map(|i| i.entry_count).unwrap_or(0)
    }

    /// Snapshot of the per-rid upper bound of written changes.
    pub fn max_ruv(&self) -> Ruv {
        self.inner
            .read()
            .map(|i| i.max_ruv.clone())
            .unwrap_or_default()
    }

    /// Snapshot of the per-rid purge floor.
    pub fn purge_ruv(&self) -> Ruv {
        self.inner
            .read()
            .map(|i| i.purge_ruv.clone())
            .unwrap_or_default()
    }

    /// The configured trim policy.
    pub fn config(&self) -> &ChangelogConfig {
        &self.config
    }

    /// Opens the log: verifies the version marker, loads the bookkeeping
    /// records, and starts accepting writes. Opening an already-open log is
    /// a no-op.
    pub fn open(&self) -> Result<(), ChangelogError> {
        let mut inner = self.lock()?;
        match inner.state {
            LogState::Open => return Ok(()),
            LogState::Closing => {
                return Err(ChangelogError::BadState {
                    op: "open",
                    state: "closing",
                })
            }
            LogState::None | LogState::Closed => {}
        }

        match self.store.get(KEY_VERSION)? {
            Some(bytes) => {
                let found: u32 = bincode::deserialize(&bytes)
                    .map_err(|e| ChangelogError::BadFormat(e.to_string()))?;
                if found != CL_VERSION {
                    return Err(ChangelogError::BadDbVersion {
                        found,
                        expected: CL_VERSION,
                    });
                }
            }
            None => {
                let bytes = bincode::serialize(&CL_VERSION)
                    .map_err(|e| ChangelogError::BadFormat(e.to_string()))?;
                self.store.put(KEY_VERSION.to_vec(), bytes)?;
            }
        }

        // The bookkeeping records are deleted while the log is open and
        // re-written on a clean close; absence means we have to rebuild
        // from the entries themselves.
        inner.max_ruv = match self.store.get(KEY_MAX_RUV)? {
            Some(bytes) => {
                self.store.delete(KEY_MAX_RUV)?;
                Ruv::from_tombstone(&bytes).map_err(|e| ChangelogError::RuvError(e.to_string()))?
            }
            None => self.construct_ruv(RuvBound::Max)?,
        };
        inner.purge_ruv = match self.store.get(KEY_PURGE_RUV)? {
            Some(bytes) => {
                self.store.delete(KEY_PURGE_RUV)?;
                Ruv::from_tombstone(&bytes).map_err(|e| ChangelogError::RuvError(e.to_string()))?
            }
            None => self.construct_ruv(RuvBound::Min)?,
        };
        inner.entry_count = match self.store.get(KEY_ENTRY_COUNT)? {
            Some(bytes) => {
                self.store.delete(KEY_ENTRY_COUNT)?;
                bincode::deserialize(&bytes)
                    .map_err(|e| ChangelogError::BadFormat(e.to_string()))?
            }
            None => {
                let count = self.scan_entries()?.len() as u64;
                if count > 0 {
                    warn!(count, "entry count record missing; recounted after unclean shutdown");
                }
                count
            }
        };

        inner.state = LogState::Open;
        info!(entries = inner.entry_count, "changelog opened");
        Ok(())
    }

    /// Closes the log, flushing the bookkeeping records. Closing a log that
    /// is not open is a no-op.
    pub fn close(&self) -> Result<(), ChangelogError> {
        let mut inner = self.lock()?;
        match inner.state {
            LogState::None | LogState::Closed => return Ok(()),
            LogState::Closing => return Ok(()),
            LogState::Open => {}
        }
        inner.state = LogState::Closing;

        let count_bytes = bincode::serialize(&inner.entry_count)
            .map_err(|e| ChangelogError::BadFormat(e.to_string()))?;
        let max_bytes = inner
            .max_ruv
            .to_tombstone()
            .map_err(|e| ChangelogError::RuvError(e.to_string()))?;
        let purge_bytes = inner
            .purge_ruv
            .to_tombstone()
            .map_err(|e| ChangelogError::RuvError(e.to_string()))?;
        self.store.write_batch(vec![
            BatchOp::Put {
                key: KEY_ENTRY_COUNT.to_vec(),
                value: count_bytes,
            },
            BatchOp::Put {
                key: KEY_MAX_RUV.to_vec(),
                value: max_bytes,
            },
            BatchOp::Put {
                key: KEY_PURGE_RUV.to_vec(),
                value: purge_bytes,
            },
        ])?;

        inner.state = LogState::Closed;
        info!("changelog closed");
        Ok(())
    }

    /// Appends one change. Rejected unless the log is open; the max RUV
    /// advances with every accepted write.
    pub fn write(&self, record: &ChangeRecord) -> Result<(), ChangelogError> {
        let mut inner = self.lock()?;
        if inner.state != LogState::Open {
            return Err(ChangelogError::BadState {
                op: "write",
                state: inner.state.name(),
            });
        }
        let key = record.key();
        let existed = self.store.contains_key(&key)?;
        self.store.put(key, record.encode()?)?;
        inner.max_ruv.update(record.csn, "");
        if !existed {
            inner.entry_count += 1;
        }
        Ok(())
    }

    /// Fetches one record by CSN.
    pub fn get(&self, csn: &Csn) -> Result<Option<ChangeRecord>, ChangelogError> {
        let inner = self.lock_read()?;
        if inner.state != LogState::Open {
            return Err(ChangelogError::BadState {
                op: "get",
                state: inner.state.name(),
            });
        }
        match self.store.get(csn.to_string().as_bytes())? {
            Some(bytes) => Ok(Some(ChangeRecord::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Deletes every entry originated by `rid` and drops the rid from the
    /// bookkeeping RUVs. Idempotent; returns the number of entries removed.
    pub fn purge_rid(&self, rid: ReplicaId) -> Result<u64, ChangelogError> {
        let mut inner = self.lock()?;
        if inner.state != LogState::Open {
            return Err(ChangelogError::BadState {
                op: "purge",
                state: inner.state.name(),
            });
        }

        let mut batch = Vec::new();
        let mut removed: u64 = 0;
        for (key, value) in self.scan_entries()? {
            let record = ChangeRecord::decode(&value)?;
            if record.csn.rid == rid {
                batch.push(BatchOp::Delete { key });
                removed += 1;
            }
        }
        self.store.write_batch(batch)?;
        inner.entry_count -= removed;
        inner.max_ruv.forget(rid);
        inner.purge_ruv.forget(rid);
        if removed > 0 {
            info!(%rid, removed, "purged rid from changelog");
        }
        Ok(removed)
    }

    /// Trims entries that exceed the age/count policy and are strictly
    /// below `floor`'s watermark for their rid. The per-rid watermark entry
    /// itself is kept as the replay anchor. Returns the number trimmed.
    pub fn trim(&self, floor: &Ruv, now: u64) -> Result<u64, ChangelogError> {
        let mut inner = self.lock()?;
        if inner.state != LogState::Open {
            return Err(ChangelogError::BadState {
                op: "trim",
                state: inner.state.name(),
            });
        }
        if self.config.max_age_secs == 0 && self.config.max_entries == 0 {
            return Ok(0);
        }

        let mut num_to_trim: i64 = if self.config.max_entries > 0 {
            inner.entry_count as i64 - self.config.max_entries as i64
        } else {
            0
        };
        let age_exceeded = |t: u64| {
            self.config.max_age_secs > 0 && now.saturating_sub(t) > self.config.max_age_secs
        };

        let mut batch = Vec::new();
        let mut trimmed: u64 = 0;
        for (key, value) in self.scan_entries()? {
            let record = ChangeRecord::decode(&value)?;
            let watermark = floor.max_csn_for(record.csn.rid);
            let covered_strict = watermark.map(|m| record.csn < m).unwrap_or(false);

            if (num_to_trim > 0 || age_exceeded(record.time)) && covered_strict {
                batch.push(BatchOp::Delete { key });
                inner.purge_ruv.update(record.csn, "");
                if num_to_trim > 0 {
                    num_to_trim -= 1;
                }
                trimmed += 1;
            } else if watermark == Some(record.csn) {
                // A rid's newest covered change stays behind as the anchor
                // for replaying future changes; skipping it keeps an idle
                // rid from blocking the trim forever.
                continue;
            } else {
                // Entries are time ordered; nothing later can be trimmed
                // either.
                break;
            }
        }
        self.store.write_batch(batch)?;
        inner.entry_count -= trimmed;
        if trimmed > 0 {
            info!(trimmed, "trimmed changes from the changelog");
        }
        Ok(trimmed)
    }

    pub(crate) fn scan_entries(&self) -> Result<Vec<(Vec<u8>, Vec<u8>)>, ChangelogError> {
        self.store.scan_range(ENTRY_RANGE_START, ENTRY_RANGE_END)
    }

    fn construct_ruv(&self, bound: RuvBound) -> Result<Ruv, ChangelogError> {
        let mut ruv = Ruv::new();
        for (_, value) in self.scan_entries()? {
            let record = ChangeRecord::decode(&value)?;
            match bound {
                RuvBound::Max => ruv.update(record.csn, ""),
                RuvBound::Min => {
                    if ruv.max_csn_for(record.csn.rid).is_none() {
                        ruv.update(record.csn, "");
                    }
                }
            }
        }
        Ok(ruv)
    }
}

#[derive(Clone, Copy)]
enum RuvBound {
    Max,
    Min,
}
