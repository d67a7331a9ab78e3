//! Aborting a running clean task, locally and across the mesh.
//!
//! The abort sets the rid's aborted flag and broadcasts the registry's
//! stop signal; the clean worker observes both between waits, unwinds,
//! and deletes its marker. The abort worker then propagates the abort
//! to every peer and, under certification, waits until none of them
//! still reports the abort running.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use dirmesh_model::csn::ReplicaId;
use dirmesh_session::extop::{
    AbortRuvPayload, RidRootPayload, CLEANRUV_ABORTING, CLEANRUV_ACCEPTED,
    EXTOP_ABORT_CLEANRUV_OID, EXTOP_CLEANRUV_CHECK_STATUS_OID,
};
use dirmesh_session::ResponseCode;

use crate::error::CleanError;
use crate::marker::AbortMarker;
use crate::task::{Backoff, CleanOutcome, CleanRunner};

impl CleanRunner {
    /// Validates, admits, persists the marker, and spawns an abort worker.
    pub fn launch_abort(
        self: &Arc<Self>,
        rid: ReplicaId,
        root: &str,
        certify: bool,
        original: bool,
    ) -> Result<JoinHandle<CleanOutcome>, CleanError> {
        let raw = rid.as_u16();
        if raw == 0 || raw == ReplicaId::MAX {
            return Err(CleanError::InvalidRid(raw.to_string()));
        }
        if !self.registry().is_retiring(rid) {
            return Err(CleanError::NotBeingCleaned(rid));
        }
        if self.registry().is_aborted(rid) {
            return Err(CleanError::AlreadyAborting(rid));
        }
        if self.replica().root() != root {
            return Err(CleanError::NoSuchReplica(root.to_string()));
        }
        self.registry().admit_abort(rid, self.config().max_tasks)?;
        self.markers().add_abort(&AbortMarker {
            rid,
            root: root.to_string(),
            certify,
            original,
        });
        // The flag is already set; the signal wakes the clean worker out
        // of whatever backoff it is parked in.
        self.registry().stop_ruv_cleaning();
        info!(rid = %rid, certify, original, "launching abort of rid retirement");
        Ok(self.spawn_abort_worker(rid, root.to_string(), certify, original))
    }

    /// Spawns the abort worker. Admission and the marker must already
    /// be in place and the stop signal sent.
    pub(crate) fn spawn_abort_worker(
        self: &Arc<Self>,
        rid: ReplicaId,
        root: String,
        certify: bool,
        original: bool,
    ) -> JoinHandle<CleanOutcome> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.abort_worker(rid, &root, certify, original).await })
    }

    async fn abort_worker(
        &self,
        rid: ReplicaId,
        root: &str,
        certify: bool,
        original: bool,
    ) -> CleanOutcome {
        info!(rid = %rid, certify, original, "abort task starting");

        // Tell every peer to stop cleaning the rid. Without certification
        // one pass is made and failures are tolerated.
        let payload = AbortRuvPayload {
            rid,
            root: root.to_string(),
            certify,
        }
        .render();
        let mut backoff = Backoff::new(self.config());
        loop {
            let pending = self.propagate_abort(rid, &payload).await;
            if pending.is_empty() {
                break;
            }
            if !certify {
                warn!(rid = %rid, peers = ?pending,
                    "stopping abort propagation without certification");
                break;
            }
            if self.registry().shutting_down() {
                return self.stop_abort_worker(rid);
            }
            self.registry().wait_or_stop(backoff.advance()).await;
        }

        // Give the local clean worker a bounded window to unwind.
        let tick = Duration::from_millis(self.config().abort_check_interval_ms);
        let mut attempts = 0;
        while self.registry().is_retiring(rid) {
            if self.registry().shutting_down() {
                return self.stop_abort_worker(rid);
            }
            if attempts >= self.config().abort_check_attempts {
                warn!(rid = %rid, "clean task did not stop within the wait limit");
                break;
            }
            attempts += 1;
            tokio::time::sleep(tick).await;
        }

        self.registry().remove_aborted(rid);

        // Only the originating task certifies; a propagated task doing
        // the same sweep would wait on the originator's marker while the
        // originator waits on its own.
        if certify && original {
            let poll = Duration::from_millis(self.config().poll_interval_ms);
            loop {
                let aborting = self.peers_still_aborting(rid, root).await;
                if aborting.is_empty() {
                    break;
                }
                if self.registry().shutting_down() {
                    return self.stop_abort_worker(rid);
                }
                info!(rid = %rid, peers = ?aborting, "waiting for peers to finish aborting");
                tokio::time::sleep(poll).await;
            }
        }

        self.markers().remove_abort(rid);
        self.registry().release_abort_slot();
        info!(rid = %rid, "abort of rid retirement complete");
        CleanOutcome::Finished
    }

    fn stop_abort_worker(&self, rid: ReplicaId) -> CleanOutcome {
        warn!(rid = %rid, "shutting down, the abort task will resume at the next startup");
        self.registry().release_abort_slot();
        CleanOutcome::Interrupted
    }

    /// One abort propagation pass. Returns the purls that did not accept.
    async fn propagate_abort(&self, rid: ReplicaId, payload: &str) -> Vec<String> {
        let mut pending = Vec::new();
        for agmt in self.enabled_agreements() {
            let req = self.request(EXTOP_ABORT_CLEANRUV_OID, agmt.bind_dn(), payload);
            match self.mesh().send_extop(agmt.consumer_purl(), req).await {
                Ok(resp)
                    if resp.code == ResponseCode::Ready && resp.text() == CLEANRUV_ACCEPTED => {}
                Ok(resp) if resp.code == ResponseCode::Busy => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), reply = %resp.text(),
                        "peer rejected the abort, retrying");
                    pending.push(agmt.consumer_purl().to_string());
                }
                Ok(resp) => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), code = ?resp.code,
                        "peer does not support abort, continuing without it");
                }
                Err(err) => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), error = %err,
                        "abort propagation failed");
                    pending.push(agmt.consumer_purl().to_string());
                }
            }
        }
        pending
    }

    async fn peers_still_aborting(&self, rid: ReplicaId, root: &str) -> Vec<String> {
        let payload = RidRootPayload {
            rid,
            root: root.to_string(),
        }
        .render();
        let mut aborting = Vec::new();
        for agmt in self.enabled_agreements() {
            let req = self.request(EXTOP_CLEANRUV_CHECK_STATUS_OID, agmt.bind_dn(), &payload);
            match self.mesh().send_extop(agmt.consumer_purl(), req).await {
                Ok(resp)
                    if resp.code == ResponseCode::Ready && resp.text() != CLEANRUV_ABORTING => {}
                _ => aborting.push(agmt.consumer_purl().to_string()),
            }
        }
        aborting
    }
}
