//! Clean-task execution: the gates, the mesh propagation, and the purge.
//!
//! A clean task retires one rid from the whole mesh. The worker never
//! holds a lock across an await; between attempts it parks on the
//! registry's stop signal so an abort or shutdown wakes it immediately.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{info, warn};

use dirmesh_changelog::ChangeLog;
use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_session::extop::{
    CleanRuvPayload, RidRootPayload, CLEANRUV_ACCEPTED, CLEANRUV_FINISHED, CLEANRUV_NO_MAXCSN,
    EXTOP_CLEANRUV_CHECK_STATUS_OID, EXTOP_CLEANRUV_GET_MAXCSN_OID, EXTOP_CLEANRUV_OID,
};
use dirmesh_session::{Agreement, ExtopRequest, Mesh, Replica, ResponseCode};

use crate::config::CleanConfig;
use crate::error::CleanError;
use crate::marker::{CleanMarker, MarkerStore};
use crate::registry::RidRegistry;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// How a clean worker ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanOutcome {
    /// The rid is gone from the local RUV, the changelog, and every
    /// peer this node propagated to.
    Finished,
    /// An abort task stopped the worker and its marker was removed.
    Aborted,
    /// Shutdown interrupted the worker; its marker stays for resume.
    Interrupted,
}

/// Doubling retry interval, saturating at the configured cap.
pub(crate) struct Backoff {
    next_ms: u64,
    cap_ms: u64,
}

impl Backoff {
    pub(crate) fn new(config: &CleanConfig) -> Self {
        Backoff {
            next_ms: config.backoff_initial_ms,
            cap_ms: config.backoff_cap_ms,
        }
    }

    pub(crate) fn advance(&mut self) -> Duration {
        let current = self.next_ms;
        self.next_ms = self.next_ms.saturating_mul(2).min(self.cap_ms);
        Duration::from_millis(current)
    }
}

/// Runs clean tasks against one replica and its agreements.
pub struct CleanRunner {
    replica: Arc<Replica>,
    changelog: Arc<ChangeLog>,
    mesh: Arc<Mesh>,
    registry: Arc<RidRegistry>,
    markers: Arc<MarkerStore>,
    agreements: RwLock<Vec<Arc<Agreement>>>,
    config: CleanConfig,
    conn_id: u64,
    next_op: AtomicU64,
}

impl CleanRunner {
    /// Wires a runner over the replica's state and the mesh.
    pub fn new(
        replica: Arc<Replica>,
        changelog: Arc<ChangeLog>,
        mesh: Arc<Mesh>,
        registry: Arc<RidRegistry>,
        markers: Arc<MarkerStore>,
        config: CleanConfig,
    ) -> Self {
        CleanRunner {
            replica,
            changelog,
            mesh,
            registry,
            markers,
            agreements: RwLock::new(Vec::new()),
            config,
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::SeqCst),
            next_op: AtomicU64::new(0),
        }
    }

    /// Registers an agreement the runner propagates over.
    pub fn add_agreement(&self, agmt: Arc<Agreement>) {
        self.agreements.write().expect("lock poisoned").push(agmt);
    }

    /// Every registered agreement.
    pub fn agreements(&self) -> Vec<Arc<Agreement>> {
        self.agreements.read().expect("lock poisoned").clone()
    }

    pub(crate) fn enabled_agreements(&self) -> Vec<Arc<Agreement>> {
        self.agreements()
            .into_iter()
            .filter(|a| a.is_enabled())
            .collect()
    }

    /// The replica this runner retires rids for.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// The changelog purged at the end of a clean.
    pub fn changelog(&self) -> &Arc<ChangeLog> {
        &self.changelog
    }

    /// The mesh used for peer exchanges.
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// The shared rid registry.
    pub fn registry(&self) -> &Arc<RidRegistry> {
        &self.registry
    }

    /// The marker store backing restart resume.
    pub fn markers(&self) -> &Arc<MarkerStore> {
        &self.markers
    }

    /// The pacing configuration.
    pub fn config(&self) -> &CleanConfig {
        &self.config
    }

    pub(crate) fn request(&self, oid: &str, bind_dn: &str, payload: &str) -> ExtopRequest {
        let op_id = self.next_op.fetch_add(1, Ordering::SeqCst);
        ExtopRequest::new(oid, self.conn_id, op_id, bind_dn, payload.as_bytes().to_vec())
    }

    /// Validates, admits, persists the marker, and spawns a clean worker.
    ///
    /// The retirement point is the highest CSN the rid is known to have
    /// produced anywhere: the local RUV plus every enabled agreement's
    /// GetMaxCSN answer. Unreachable peers fail the launch unless
    /// `force` is set.
    pub async fn launch_clean(
        self: &Arc<Self>,
        rid: ReplicaId,
        root: &str,
        force: bool,
        original: bool,
    ) -> Result<JoinHandle<CleanOutcome>, CleanError> {
        let raw = rid.as_u16();
        if raw == 0 || raw == ReplicaId::MAX {
            return Err(CleanError::InvalidRid(raw.to_string()));
        }
        if rid == self.replica.rid() {
            return Err(CleanError::LocalRid(rid));
        }
        if self.replica.root() != root {
            return Err(CleanError::NoSuchReplica(root.to_string()));
        }
        if !self.replica.is_updatable() {
            return Err(CleanError::ReadOnlyReplica);
        }
        if self.registry.is_retiring(rid) {
            return Err(CleanError::AlreadyCleaning(rid));
        }

        let maxcsn = self.find_max_csn(rid, force).await?;
        self.registry.admit_clean(rid, self.config.max_tasks)?;
        self.markers.add_clean(&CleanMarker {
            rid,
            force,
            original,
            root: root.to_string(),
        });
        info!(rid = %rid, maxcsn = %maxcsn, force, "launching rid retirement");
        Ok(self.spawn_worker(rid, maxcsn, force, original))
    }

    /// Spawns the propagating worker. Admission and the marker must
    /// already be in place.
    pub(crate) fn spawn_worker(
        self: &Arc<Self>,
        rid: ReplicaId,
        maxcsn: Csn,
        force: bool,
        original: bool,
    ) -> JoinHandle<CleanOutcome> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.clean_worker(rid, maxcsn, force, original).await })
    }

    /// Spawns the read-only wait-then-purge worker.
    pub(crate) fn spawn_consumer(
        self: &Arc<Self>,
        rid: ReplicaId,
        maxcsn: Csn,
        force: bool,
    ) -> JoinHandle<CleanOutcome> {
        let runner = Arc::clone(self);
        tokio::spawn(async move { runner.consumer_worker(rid, maxcsn, force).await })
    }

    async fn find_max_csn(&self, rid: ReplicaId, force: bool) -> Result<Csn, CleanError> {
        let mut maxcsn = self.replica.max_csn_for(rid).unwrap_or(Csn::ZERO);
        let payload = RidRootPayload {
            rid,
            root: self.replica.root().to_string(),
        }
        .render();
        for agmt in self.enabled_agreements() {
            let req = self.request(EXTOP_CLEANRUV_GET_MAXCSN_OID, agmt.bind_dn(), &payload);
            match self.mesh.send_extop(agmt.consumer_purl(), req).await {
                Ok(resp) if resp.code == ResponseCode::Ready => {
                    let text = resp.text();
                    if text == CLEANRUV_NO_MAXCSN {
                        continue;
                    }
                    match text.parse::<Csn>() {
                        Ok(peer_max) => maxcsn = maxcsn.max(peer_max),
                        Err(_) if force => {
                            warn!(rid = %rid, peer = agmt.consumer_purl(), reply = %text,
                                "unparseable retirement point, ignored under force");
                        }
                        Err(_) => return Err(CleanError::InvalidValue(text)),
                    }
                }
                Ok(resp) => {
                    if force {
                        warn!(rid = %rid, peer = agmt.consumer_purl(), code = ?resp.code,
                            "peer refused the retirement-point query, ignored under force");
                    } else {
                        return Err(CleanError::Session(
                            dirmesh_session::SessionError::Internal(format!(
                                "peer {} refused the retirement-point query",
                                agmt.consumer_purl()
                            )),
                        ));
                    }
                }
                Err(err) if force => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), error = %err,
                        "peer unreachable, ignored under force");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(maxcsn)
    }

    async fn clean_worker(
        &self,
        rid: ReplicaId,
        maxcsn: Csn,
        force: bool,
        original: bool,
    ) -> CleanOutcome {
        info!(rid = %rid, maxcsn = %maxcsn, force, original, "clean task starting");
        if force {
            self.registry.set_cleaned(rid);
        }

        // Wait until every change the rid produced has arrived locally.
        if !force && !maxcsn.is_zero() {
            let mut backoff = Backoff::new(&self.config);
            while !self.replica.covers_csn(&maxcsn) {
                if self.registry.stopped(rid) {
                    return self.stop_worker(rid);
                }
                info!(rid = %rid, maxcsn = %maxcsn, "waiting for the retirement point to be covered");
                self.registry.wait_or_stop(backoff.advance()).await;
            }
        }

        // Every peer must be answering before the rid goes away.
        if !force {
            let mut backoff = Backoff::new(&self.config);
            loop {
                if self.registry.stopped(rid) {
                    return self.stop_worker(rid);
                }
                match self.first_unreachable_peer() {
                    None => break,
                    Some(purl) => {
                        warn!(rid = %rid, peer = %purl, "peer unreachable, retrying");
                        self.registry.wait_or_stop(backoff.advance()).await;
                    }
                }
            }
        }

        // Peers must have consumed up to the retirement point, or never
        // have seen the rid at all.
        if !force && !maxcsn.is_zero() {
            let mut backoff = Backoff::new(&self.config);
            while let Some(purl) = self.first_lagging_peer(rid, maxcsn).await {
                if self.registry.stopped(rid) {
                    return self.stop_worker(rid);
                }
                info!(rid = %rid, peer = %purl, "waiting for peer to reach the retirement point");
                self.registry.wait_or_stop(backoff.advance()).await;
            }
        }

        self.registry.set_cleaned(rid);

        // Tell every peer to retire the rid as well.
        let payload = CleanRuvPayload {
            rid,
            root: self.replica.root().to_string(),
            maxcsn,
            force,
        }
        .render();
        let mut backoff = Backoff::new(&self.config);
        loop {
            let pending = self.propagate_clean(rid, &payload).await;
            if pending.is_empty() {
                break;
            }
            if force {
                warn!(rid = %rid, peers = ?pending,
                    "continuing without acknowledgement from every peer");
                break;
            }
            if self.registry.stopped(rid) {
                return self.stop_worker(rid);
            }
            self.registry.wait_or_stop(backoff.advance()).await;
        }

        self.replica.forget_rid(rid);
        match self.changelog.purge_rid(rid) {
            Ok(removed) => info!(rid = %rid, removed, "purged changelog records"),
            Err(err) => warn!(rid = %rid, error = %err, "changelog purge failed"),
        }

        // Wait until no peer's RUV carries the rid any more.
        let poll = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            let holding = self.peers_still_holding(rid, force).await;
            if holding.is_empty() {
                break;
            }
            if force {
                warn!(rid = %rid, peers = ?holding, "peers still hold the rid, continuing under force");
                break;
            }
            if self.registry.stopped(rid) {
                return self.stop_worker(rid);
            }
            info!(rid = %rid, peers = ?holding, "waiting for peers to drop the rid");
            self.registry.wait_or_stop(poll).await;
        }

        // The marker comes off before the final status sweep so peers
        // polling this node already read "finished".
        self.markers.remove_clean(rid);

        if !force {
            loop {
                let cleaning = self.peers_still_cleaning(rid).await;
                if cleaning.is_empty() {
                    break;
                }
                if self.registry.stopped(rid) {
                    return self.stop_worker(rid);
                }
                info!(rid = %rid, peers = ?cleaning, "waiting for peers to finish cleaning");
                self.registry.wait_or_stop(poll).await;
            }
        }

        if original && self.replica.remove_keep_alive(rid) {
            info!(rid = %rid, "removed keep-alive entry");
        }

        for agmt in self.agreements() {
            agmt.forget_rid(rid);
            agmt.restart();
        }

        self.registry.remove_cleaned(rid);
        self.registry.release_clean_slot();
        info!(rid = %rid, "rid retirement complete");
        CleanOutcome::Finished
    }

    /// Waits for local coverage, then purges. Read-only replicas do not
    /// propagate; the in-memory cleaned entry stays until restart so
    /// stragglers from the rid keep being refused.
    async fn consumer_worker(&self, rid: ReplicaId, maxcsn: Csn, force: bool) -> CleanOutcome {
        info!(rid = %rid, maxcsn = %maxcsn, force, "clean task starting on read-only replica");
        if !force && !maxcsn.is_zero() {
            let limit = Duration::from_millis(self.config.max_wait_ms);
            let mut waited = Duration::ZERO;
            let mut backoff = Backoff::new(&self.config);
            while !self.replica.covers_csn(&maxcsn) {
                if self.registry.stopped(rid) {
                    return self.stop_worker(rid);
                }
                if waited >= limit {
                    warn!(rid = %rid, maxcsn = %maxcsn,
                        "retirement point still uncovered after the wait limit, purging anyway");
                    break;
                }
                let step = backoff.advance();
                self.registry.wait_or_stop(step).await;
                waited += step;
            }
        }

        self.registry.set_cleaned(rid);
        self.replica.forget_rid(rid);
        match self.changelog.purge_rid(rid) {
            Ok(removed) => info!(rid = %rid, removed, "purged changelog records"),
            Err(err) => warn!(rid = %rid, error = %err, "changelog purge failed"),
        }
        self.markers.remove_clean(rid);
        self.registry.release_clean_slot();
        info!(rid = %rid, "rid retired on read-only replica");
        CleanOutcome::Finished
    }

    fn stop_worker(&self, rid: ReplicaId) -> CleanOutcome {
        if self.registry.shutting_down() {
            warn!(rid = %rid, "shutting down, the clean task will resume at the next startup");
            self.registry.release_clean_slot();
            return CleanOutcome::Interrupted;
        }
        info!(rid = %rid, "clean task aborted");
        self.markers.remove_clean(rid);
        self.registry.remove_cleaned(rid);
        self.registry.release_clean_slot();
        CleanOutcome::Aborted
    }

    fn first_unreachable_peer(&self) -> Option<String> {
        self.enabled_agreements()
            .into_iter()
            .map(|a| a.consumer_purl().to_string())
            .find(|purl| !self.mesh.ping(purl))
    }

    async fn first_lagging_peer(&self, rid: ReplicaId, maxcsn: Csn) -> Option<String> {
        let payload = RidRootPayload {
            rid,
            root: self.replica.root().to_string(),
        }
        .render();
        for agmt in self.enabled_agreements() {
            let req = self.request(EXTOP_CLEANRUV_GET_MAXCSN_OID, agmt.bind_dn(), &payload);
            match self.mesh.send_extop(agmt.consumer_purl(), req).await {
                Ok(resp) if resp.code == ResponseCode::Ready => {
                    let text = resp.text();
                    if text == CLEANRUV_NO_MAXCSN {
                        continue;
                    }
                    match text.parse::<Csn>() {
                        Ok(peer_max) if peer_max >= maxcsn => continue,
                        _ => return Some(agmt.consumer_purl().to_string()),
                    }
                }
                _ => return Some(agmt.consumer_purl().to_string()),
            }
        }
        None
    }

    /// One propagation pass. Returns the purls that did not accept.
    ///
    /// A reachable peer that answers something other than "accepted" or
    /// a busy rejection is assumed not to understand the operation and
    /// is let through with a warning.
    async fn propagate_clean(&self, rid: ReplicaId, payload: &str) -> Vec<String> {
        let mut pending = Vec::new();
        for agmt in self.enabled_agreements() {
            let req = self.request(EXTOP_CLEANRUV_OID, agmt.bind_dn(), payload);
            match self.mesh.send_extop(agmt.consumer_purl(), req).await {
                Ok(resp)
                    if resp.code == ResponseCode::Ready && resp.text() == CLEANRUV_ACCEPTED => {}
                Ok(resp) if resp.code == ResponseCode::Busy => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), reply = %resp.text(),
                        "peer rejected the clean, retrying");
                    pending.push(agmt.consumer_purl().to_string());
                }
                Ok(resp) => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), code = ?resp.code,
                        "peer does not support rid retirement, continuing without it");
                }
                Err(err) => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), error = %err,
                        "clean propagation failed");
                    pending.push(agmt.consumer_purl().to_string());
                }
            }
        }
        pending
    }

    async fn peers_still_holding(&self, rid: ReplicaId, force: bool) -> Vec<String> {
        let payload = RidRootPayload {
            rid,
            root: self.replica.root().to_string(),
        }
        .render();
        let mut holding = Vec::new();
        for agmt in self.enabled_agreements() {
            let req = self.request(EXTOP_CLEANRUV_GET_MAXCSN_OID, agmt.bind_dn(), &payload);
            match self.mesh.send_extop(agmt.consumer_purl(), req).await {
                Ok(resp)
                    if resp.code == ResponseCode::Ready
                        && resp.text() == CLEANRUV_NO_MAXCSN => {}
                Err(err) if force => {
                    warn!(rid = %rid, peer = agmt.consumer_purl(), error = %err,
                        "unreachable peer skipped under force");
                }
                _ => holding.push(agmt.consumer_purl().to_string()),
            }
        }
        holding
    }

    async fn peers_still_cleaning(&self, rid: ReplicaId) -> Vec<String> {
        let payload = RidRootPayload {
            rid,
            root: self.replica.root().to_string(),
        }
        .render();
        let mut cleaning = Vec::new();
        for agmt in self.enabled_agreements() {
            let req = self.request(EXTOP_CLEANRUV_CHECK_STATUS_OID, agmt.bind_dn(), &payload);
            match self.mesh.send_extop(agmt.consumer_purl(), req).await {
                Ok(resp)
                    if resp.code == ResponseCode::Ready
                        && resp.text() == CLEANRUV_FINISHED => {}
                _ => cleaning.push(agmt.consumer_purl().to_string()),
            }
        }
        cleaning
    }
}
