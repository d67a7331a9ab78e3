//! Shared bookkeeping for rids under retirement.
//!
//! Every clean or abort worker on a node registers here. The registry is
//! what makes the tasks idempotent: a rid in the cleaned or pre-cleaned
//! set is refused a second clean, and an abort flips a flag the running
//! worker observes between waits.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;

use dirmesh_model::csn::ReplicaId;

use crate::error::CleanError;

#[derive(Debug, Default)]
struct RegistryInner {
    /// Rids whose retirement point is known covered; their changes are done.
    cleaned: BTreeSet<ReplicaId>,
    /// Rids admitted for cleaning but still waiting on the retirement point.
    pre_cleaned: BTreeSet<ReplicaId>,
    /// Rids an abort task is unwinding.
    aborted: BTreeSet<ReplicaId>,
    clean_tasks: usize,
    abort_tasks: usize,
}

/// Node-wide registry of cleaning and aborting rids.
#[derive(Debug, Default)]
pub struct RidRegistry {
    inner: Mutex<RegistryInner>,
    stop: Notify,
    shutdown: AtomicBool,
}

impl RidRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        RidRegistry::default()
    }

    /// Admits a clean task for `rid`, marking it pre-cleaned.
    ///
    /// Admission and the pre-cleaned insert happen under one lock so two
    /// concurrent submissions for the same rid cannot both pass.
    pub fn admit_clean(&self, rid: ReplicaId, max_tasks: usize) -> Result<(), CleanError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.cleaned.contains(&rid) || inner.pre_cleaned.contains(&rid) {
            return Err(CleanError::AlreadyCleaning(rid));
        }
        if inner.clean_tasks >= max_tasks {
            return Err(CleanError::TooManyTasks);
        }
        inner.clean_tasks += 1;
        inner.pre_cleaned.insert(rid);
        Ok(())
    }

    /// Admits an abort task for `rid` and marks it aborted.
    pub fn admit_abort(&self, rid: ReplicaId, max_tasks: usize) -> Result<(), CleanError> {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if inner.aborted.contains(&rid) {
            return Err(CleanError::AlreadyAborting(rid));
        }
        if inner.abort_tasks >= max_tasks {
            return Err(CleanError::TooManyTasks);
        }
        inner.abort_tasks += 1;
        inner.aborted.insert(rid);
        Ok(())
    }

    /// Promotes a pre-cleaned rid to cleaned.
    pub fn set_cleaned(&self, rid: ReplicaId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.pre_cleaned.remove(&rid);
        inner.cleaned.insert(rid);
    }

    /// Drops `rid` from the cleaned and pre-cleaned sets.
    pub fn remove_cleaned(&self, rid: ReplicaId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.cleaned.remove(&rid);
        inner.pre_cleaned.remove(&rid);
    }

    /// Drops `rid` from the aborted set.
    pub fn remove_aborted(&self, rid: ReplicaId) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.aborted.remove(&rid);
    }

    /// Returns a clean-task slot to the pool.
    pub fn release_clean_slot(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.clean_tasks = inner.clean_tasks.saturating_sub(1);
    }

    /// Returns an abort-task slot to the pool.
    pub fn release_abort_slot(&self) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.abort_tasks = inner.abort_tasks.saturating_sub(1);
    }

    /// True when `rid` has reached the cleaned state.
    pub fn is_cleaned(&self, rid: ReplicaId) -> bool {
        self.inner.lock().expect("lock poisoned").cleaned.contains(&rid)
    }

    /// True when `rid` is admitted but not yet cleaned.
    pub fn is_pre_cleaned(&self, rid: ReplicaId) -> bool {
        self.inner
            .lock()
            .expect("lock poisoned")
            .pre_cleaned
            .contains(&rid)
    }

    /// True when a clean task owns `rid` in either state.
    pub fn is_retiring(&self, rid: ReplicaId) -> bool {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.cleaned.contains(&rid) || inner.pre_cleaned.contains(&rid)
    }

    /// True when an abort task is unwinding `rid`.
    pub fn is_aborted(&self, rid: ReplicaId) -> bool {
        self.inner.lock().expect("lock poisoned").aborted.contains(&rid)
    }

    /// Every rid a clean task currently owns. Suppliers withhold these
    /// from outgoing sessions so a retired rid cannot leak back in.
    pub fn retiring_rids(&self) -> Vec<ReplicaId> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .cleaned
            .iter()
            .chain(inner.pre_cleaned.iter())
            .copied()
            .collect()
    }

    /// Wakes every worker parked in [`RidRegistry::wait_or_stop`].
    pub fn stop_ruv_cleaning(&self) {
        self.stop.notify_waiters();
    }

    /// Marks the node as shutting down and wakes all workers.
    pub fn begin_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.stop.notify_waiters();
    }

    /// True once shutdown has begun.
    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// True when the worker for `rid` should stop retrying.
    pub fn stopped(&self, rid: ReplicaId) -> bool {
        self.shutting_down() || self.is_aborted(rid)
    }

    /// Sleeps for `dur` unless a stop notification arrives first.
    pub async fn wait_or_stop(&self, dur: Duration) {
        tokio::select! {
            _ = self.stop.notified() => {}
            _ = tokio::time::sleep(dur) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(id: u16) -> ReplicaId {
        ReplicaId::new(id)
    }

    #[test]
    fn test_admit_clean_marks_pre_cleaned() {
        let registry = RidRegistry::new();
        registry.admit_clean(rid(7), 4).unwrap();
        assert!(registry.is_pre_cleaned(rid(7)));
        assert!(!registry.is_cleaned(rid(7)));
        assert!(registry.is_retiring(rid(7)));
    }

    #[test]
    fn test_double_admit_is_refused() {
        let registry = RidRegistry::new();
        registry.admit_clean(rid(7), 4).unwrap();
        let err = registry.admit_clean(rid(7), 4).unwrap_err();
        assert!(matches!(err, CleanError::AlreadyCleaning(r) if r == rid(7)));

        registry.set_cleaned(rid(7));
        let err = registry.admit_clean(rid(7), 4).unwrap_err();
        assert!(matches!(err, CleanError::AlreadyCleaning(_)));
    }

    #[test]
    fn test_task_ceiling() {
        let registry = RidRegistry::new();
        registry.admit_clean(rid(1), 2).unwrap();
        registry.admit_clean(rid(2), 2).unwrap();
        let err = registry.admit_clean(rid(3), 2).unwrap_err();
        assert!(matches!(err, CleanError::TooManyTasks));

        registry.release_clean_slot();
        registry.admit_clean(rid(3), 2).unwrap();
    }

    #[test]
    fn test_clean_and_abort_slots_are_separate() {
        let registry = RidRegistry::new();
        registry.admit_clean(rid(1), 1).unwrap();
        registry.admit_abort(rid(1), 1).unwrap();
        assert!(matches!(
            registry.admit_abort(rid(2), 1).unwrap_err(),
            CleanError::TooManyTasks
        ));
    }

    #[test]
    fn test_set_cleaned_promotes() {
        let registry = RidRegistry::new();
        registry.admit_clean(rid(7), 4).unwrap();
        registry.set_cleaned(rid(7));
        assert!(registry.is_cleaned(rid(7)));
        assert!(!registry.is_pre_cleaned(rid(7)));
        assert!(registry.is_retiring(rid(7)));

        registry.remove_cleaned(rid(7));
        assert!(!registry.is_retiring(rid(7)));
    }

    #[test]
    fn test_abort_flag_stops_worker() {
        let registry = RidRegistry::new();
        registry.admit_clean(rid(7), 4).unwrap();
        assert!(!registry.stopped(rid(7)));
        registry.admit_abort(rid(7), 4).unwrap();
        assert!(registry.stopped(rid(7)));
        registry.remove_aborted(rid(7));
        assert!(!registry.stopped(rid(7)));
    }

    #[test]
    fn test_shutdown_stops_everything() {
        let registry = RidRegistry::new();
        registry.admit_clean(rid(7), 4).unwrap();
        registry.begin_shutdown();
        assert!(registry.stopped(rid(7)));
        assert!(registry.stopped(rid(9)));
    }

    #[tokio::test]
    async fn test_stop_interrupts_wait() {
        let registry = std::sync::Arc::new(RidRegistry::new());
        let waiter = registry.clone();
        let handle = tokio::spawn(async move {
            waiter.wait_or_stop(Duration::from_secs(30)).await;
        });
        // Give the waiter a moment to park before notifying.
        tokio::time::sleep(Duration::from_millis(20)).await;
        registry.stop_ruv_cleaning();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("waiter should wake promptly")
            .unwrap();
    }
}
