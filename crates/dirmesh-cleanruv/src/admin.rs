//! Administrative task surface: task entries, dispatch, startup resume.
//!
//! Tasks arrive as attribute bags the way a directory task entry would,
//! get validated into a launch, and expose a progress log plus a final
//! status a caller can wait on. At startup, persisted markers from
//! interrupted tasks are turned back into running tasks.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{info, warn};

use dirmesh_model::csn::{Csn, ReplicaId};

use crate::error::CleanError;
use crate::marker::{AbortMarker, CleanMarker, ABORT_MARKER_ATTR, CLEAN_MARKER_ATTR};
use crate::task::{CleanOutcome, CleanRunner};

/// Task attribute: the rid to retire or whose clean to abort.
pub const ATTR_RID: &str = "replica-id";
/// Task attribute: the replicated subtree root.
pub const ATTR_BASE_DN: &str = "replica-base-dn";
/// Task attribute: skip liveness and catch-up gates ("yes"/"no").
pub const ATTR_FORCE: &str = "replica-force-cleaning";
/// Task attribute: require every peer to confirm an abort ("yes"/"no").
pub const ATTR_CERTIFY: &str = "replica-certify-all";
/// Task attribute: whether this node originated the task ("yes"/"no").
pub const ATTR_ORIGINAL: &str = "replica-original-task";

/// Which task a submitted entry asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Retire a rid across the mesh.
    CleanAllRuv,
    /// Abort a running retirement.
    AbortCleanAllRuv,
}

impl TaskKind {
    fn prefix(&self) -> &'static str {
        match self {
            TaskKind::CleanAllRuv => "cleanallruv",
            TaskKind::AbortCleanAllRuv => "abort-cleanallruv",
        }
    }
}

/// An attribute bag describing one requested task.
#[derive(Debug, Clone, Default)]
pub struct TaskEntry {
    name: String,
    attrs: BTreeMap<String, String>,
}

impl TaskEntry {
    /// An empty entry named `name`; an empty name gets a generated one.
    pub fn new(name: &str) -> Self {
        TaskEntry {
            name: name.to_string(),
            attrs: BTreeMap::new(),
        }
    }

    /// Adds one attribute.
    pub fn with(mut self, attr: &str, value: &str) -> Self {
        self.attrs.insert(attr.to_string(), value.to_string());
        self
    }

    /// The requested task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Looks up one attribute.
    pub fn get(&self, attr: &str) -> Option<&str> {
        self.attrs.get(attr).map(|s| s.as_str())
    }

    fn require(&self, attr: &'static str) -> Result<&str, CleanError> {
        self.get(attr).ok_or(CleanError::MissingAttribute(attr))
    }
}

/// Final disposition of an admin task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Ran to completion.
    Success,
    /// Stopped by an abort or interrupted by shutdown.
    Stopped,
    /// Failed after launch; carries the directory result code.
    Failed(u32),
}

/// A launched task: name, progress log, and a waitable final status.
#[derive(Debug)]
pub struct TaskHandle {
    name: String,
    kind: TaskKind,
    rid: ReplicaId,
    log: Mutex<Vec<String>>,
    done_tx: watch::Sender<Option<TaskStatus>>,
    done_rx: watch::Receiver<Option<TaskStatus>>,
}

impl TaskHandle {
    fn new(name: String, kind: TaskKind, rid: ReplicaId) -> Arc<Self> {
        let (done_tx, done_rx) = watch::channel(None);
        Arc::new(TaskHandle {
            name,
            kind,
            rid,
            log: Mutex::new(Vec::new()),
            done_tx,
            done_rx,
        })
    }

    /// The task's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// What kind of task this is.
    pub fn kind(&self) -> TaskKind {
        self.kind
    }

    /// The rid the task works on.
    pub fn rid(&self) -> ReplicaId {
        self.rid
    }

    /// Appends one progress line.
    pub fn log_line(&self, line: String) {
        self.log.lock().expect("lock poisoned").push(line);
    }

    /// The progress log so far.
    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("lock poisoned").clone()
    }

    /// The final status, if the task has ended.
    pub fn status(&self) -> Option<TaskStatus> {
        *self.done_rx.borrow()
    }

    fn finish(&self, status: TaskStatus) {
        self.log_line(format!("task ended: {status:?}"));
        let _ = self.done_tx.send(Some(status));
    }

    /// Waits for the task to end.
    pub async fn wait(&self) -> TaskStatus {
        let mut rx = self.done_rx.clone();
        let status = rx
            .wait_for(|s| s.is_some())
            .await
            .expect("status sender held by the handle");
        status.expect("checked by wait_for")
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn is_yes(value: &str) -> bool {
    value.eq_ignore_ascii_case("yes")
}

/// Validates task entries, launches workers, and tracks their handles.
pub struct TaskDispatcher {
    runner: Arc<CleanRunner>,
    tasks: DashMap<String, Arc<TaskHandle>>,
    next_id: AtomicU64,
}

impl TaskDispatcher {
    /// Wraps a runner for task submission.
    pub fn new(runner: Arc<CleanRunner>) -> Self {
        TaskDispatcher {
            runner,
            tasks: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// The runner behind this dispatcher.
    pub fn runner(&self) -> &Arc<CleanRunner> {
        &self.runner
    }

    /// Looks up a task by name.
    pub fn get(&self, name: &str) -> Option<Arc<TaskHandle>> {
        self.tasks.get(name).map(|t| t.clone())
    }

    /// Every task submitted or resumed so far.
    pub fn tasks(&self) -> Vec<Arc<TaskHandle>> {
        self.tasks.iter().map(|t| t.value().clone()).collect()
    }

    fn task_name(&self, kind: TaskKind, requested: &str) -> String {
        if requested.is_empty() {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            format!("{}-{}", kind.prefix(), id)
        } else {
            requested.to_string()
        }
    }

    /// Validates and launches the task an entry describes.
    ///
    /// Refusals come back as errors carrying the directory result code;
    /// anything after a successful launch is reported through the
    /// returned handle.
    pub async fn submit(
        &self,
        kind: TaskKind,
        entry: &TaskEntry,
    ) -> Result<Arc<TaskHandle>, CleanError> {
        let rid_text = entry.require(ATTR_RID)?;
        let rid = rid_text
            .parse::<u16>()
            .map(ReplicaId::new)
            .map_err(|_| CleanError::InvalidRid(rid_text.to_string()))?;
        let root = entry.require(ATTR_BASE_DN)?;
        let original = entry.get(ATTR_ORIGINAL).map(is_yes).unwrap_or(true);

        let join = match kind {
            TaskKind::CleanAllRuv => {
                let force = entry.get(ATTR_FORCE).map(is_yes).unwrap_or(false);
                self.runner.launch_clean(rid, root, force, original).await?
            }
            TaskKind::AbortCleanAllRuv => {
                let certify = match entry.get(ATTR_CERTIFY) {
                    None => false,
                    Some(v) if v.eq_ignore_ascii_case("no") => false,
                    Some(v) if v.eq_ignore_ascii_case("yes") => true,
                    Some(v) => return Err(CleanError::InvalidValue(v.to_string())),
                };
                self.runner.launch_abort(rid, root, certify, original)?
            }
        };

        let handle = TaskHandle::new(self.task_name(kind, entry.name()), kind, rid);
        handle.log_line(format!("{} launched for rid {rid}", handle.name()));
        self.tasks.insert(handle.name().to_string(), handle.clone());
        let completer = handle.clone();
        tokio::spawn(async move {
            let status = match join.await {
                Ok(CleanOutcome::Finished) => TaskStatus::Success,
                Ok(CleanOutcome::Aborted) | Ok(CleanOutcome::Interrupted) => TaskStatus::Stopped,
                Err(err) => {
                    warn!(task = completer.name(), error = %err, "task worker failed");
                    TaskStatus::Failed(crate::error::ADMIN_OPERATIONS_ERROR)
                }
            };
            completer.finish(status);
        });
        Ok(handle)
    }

    /// Turns persisted markers from interrupted tasks back into running
    /// tasks. Clean markers resume first so a paired abort marker still
    /// finds its rid being cleaned.
    pub async fn resume(&self) {
        for raw in self.runner.markers().clean_markers() {
            let marker = match CleanMarker::parse(&raw) {
                Ok(m) => m,
                Err(_) => {
                    warn!(marker = %raw, "discarding malformed clean marker");
                    self.runner.markers().remove_value(CLEAN_MARKER_ATTR, &raw);
                    continue;
                }
            };
            self.resume_clean(marker, &raw).await;
        }

        for raw in self.runner.markers().abort_markers() {
            let marker = match AbortMarker::parse(&raw) {
                Ok(m) => m,
                Err(_) => {
                    warn!(marker = %raw, "discarding malformed abort marker");
                    self.runner.markers().remove_value(ABORT_MARKER_ATTR, &raw);
                    continue;
                }
            };
            self.resume_abort(marker);
        }
    }

    async fn resume_clean(&self, marker: CleanMarker, raw: &str) {
        let rid = marker.rid;
        info!(rid = %rid, "resuming interrupted clean task");

        // Read-only replicas resume the wait-then-purge directly; the
        // retirement point is whatever the local RUV still holds.
        if !self.runner.replica().is_updatable() {
            if self
                .runner
                .registry()
                .admit_clean(rid, self.runner.config().max_tasks)
                .is_err()
            {
                return;
            }
            let maxcsn = self.runner.replica().max_csn_for(rid).unwrap_or(Csn::ZERO);
            let join = self.runner.spawn_consumer(rid, maxcsn, marker.force);
            self.track_resumed(TaskKind::CleanAllRuv, rid, join);
            return;
        }

        match self
            .runner
            .launch_clean(rid, &marker.root, marker.force, marker.original)
            .await
        {
            Ok(join) => self.track_resumed(TaskKind::CleanAllRuv, rid, join),
            Err(err) => {
                warn!(rid = %rid, error = %err, "discarding unresumable clean marker");
                self.runner.markers().remove_value(CLEAN_MARKER_ATTR, raw);
            }
        }
    }

    fn resume_abort(&self, marker: AbortMarker) {
        let rid = marker.rid;
        if !self.runner.registry().is_retiring(rid) {
            info!(rid = %rid, "dropping stale abort marker, nothing is cleaning the rid");
            self.runner.markers().remove_abort(rid);
            return;
        }
        info!(rid = %rid, "resuming interrupted abort task");
        match self
            .runner
            .launch_abort(rid, &marker.root, marker.certify, marker.original)
        {
            Ok(join) => self.track_resumed(TaskKind::AbortCleanAllRuv, rid, join),
            Err(err) => {
                warn!(rid = %rid, error = %err, "discarding unresumable abort marker");
                self.runner.markers().remove_abort(rid);
            }
        }
    }

    fn track_resumed(
        &self,
        kind: TaskKind,
        rid: ReplicaId,
        join: tokio::task::JoinHandle<CleanOutcome>,
    ) {
        let name = match kind {
            TaskKind::CleanAllRuv => format!("restarted-{}", unix_now()),
            TaskKind::AbortCleanAllRuv => format!("restarted-abort-{}", unix_now()),
        };
        let handle = TaskHandle::new(self.task_name(kind, &name), kind, rid);
        handle.log_line(format!("{} resumed for rid {rid}", handle.name()));
        self.tasks.insert(handle.name().to_string(), handle.clone());
        let completer = handle.clone();
        tokio::spawn(async move {
            let status = match join.await {
                Ok(CleanOutcome::Finished) => TaskStatus::Success,
                Ok(CleanOutcome::Aborted) | Ok(CleanOutcome::Interrupted) => TaskStatus::Stopped,
                Err(err) => {
                    warn!(task = completer.name(), error = %err, "task worker failed");
                    TaskStatus::Failed(crate::error::ADMIN_OPERATIONS_ERROR)
                }
            };
            completer.finish(status);
        });
    }
}
