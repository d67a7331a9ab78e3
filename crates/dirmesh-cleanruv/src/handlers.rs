//! Receiving-side handlers for the CleanAllRUV operation family.
//!
//! Peers admit an incoming clean or abort exactly like a locally
//! launched one: registry admission, persisted marker, spawned worker.
//! Repeat deliveries are answered as admitted so the originator's
//! retry rounds converge.

use std::sync::Arc;

use tracing::{info, warn};

use dirmesh_session::extop::{
    AbortRuvPayload, CleanRuvPayload, RidRootPayload, CLEANRUV_ABORTING, CLEANRUV_ACCEPTED,
    CLEANRUV_CLEANING, CLEANRUV_FINISHED, CLEANRUV_NO_MAXCSN, CLEANRUV_REJECTED,
    EXTOP_ABORT_CLEANRUV_OID, EXTOP_CLEANRUV_CHECK_STATUS_OID, EXTOP_CLEANRUV_GET_MAXCSN_OID,
    EXTOP_CLEANRUV_OID,
};
use dirmesh_session::{ExtopRequest, ExtopResponse, ResponseCode};

use crate::marker::{AbortMarker, CleanMarker};
use crate::task::CleanRunner;

/// Dispatches the four CleanAllRUV extended operations to a runner.
pub struct CleanExtopHandler {
    runner: Arc<CleanRunner>,
}

impl CleanExtopHandler {
    /// Wraps a runner for inbound dispatch.
    pub fn new(runner: Arc<CleanRunner>) -> Self {
        CleanExtopHandler { runner }
    }

    /// The runner behind this handler.
    pub fn runner(&self) -> &Arc<CleanRunner> {
        &self.runner
    }

    /// Routes a request by OID; `None` when the OID is not ours.
    pub fn handle(&self, req: &ExtopRequest) -> Option<ExtopResponse> {
        match req.oid.as_str() {
            EXTOP_CLEANRUV_OID => Some(self.handle_cleanruv(req)),
            EXTOP_ABORT_CLEANRUV_OID => Some(self.handle_abort(req)),
            EXTOP_CLEANRUV_GET_MAXCSN_OID => Some(self.handle_get_maxcsn(req)),
            EXTOP_CLEANRUV_CHECK_STATUS_OID => Some(self.handle_check_status(req)),
            _ => None,
        }
    }

    /// Admits a propagated clean and spawns the matching worker.
    ///
    /// Writable replicas run the full propagating worker so the clean
    /// cascades over their own agreements; read-only replicas run the
    /// wait-then-purge worker.
    pub fn handle_cleanruv(&self, req: &ExtopRequest) -> ExtopResponse {
        let payload = match CleanRuvPayload::parse(&req.text()) {
            Ok(p) => p,
            Err(_) => return ExtopResponse::new(ResponseCode::DecodingError),
        };
        if payload.root != self.runner.replica().root() {
            return ExtopResponse::new(ResponseCode::NoSuchReplica);
        }
        let rid = payload.rid;
        let registry = self.runner.registry();
        if registry.is_retiring(rid) || registry.is_aborted(rid) {
            return ExtopResponse::with_text(ResponseCode::Ready, CLEANRUV_ACCEPTED);
        }
        if let Err(err) = registry.admit_clean(rid, self.runner.config().max_tasks) {
            warn!(rid = %rid, error = %err, "clean extop refused");
            return ExtopResponse::with_text(ResponseCode::Busy, CLEANRUV_REJECTED);
        }
        self.runner.markers().add_clean(&CleanMarker {
            rid,
            force: payload.force,
            original: false,
            root: payload.root.clone(),
        });
        if self.runner.replica().is_updatable() {
            self.runner.spawn_worker(rid, payload.maxcsn, payload.force, false);
        } else {
            self.runner.spawn_consumer(rid, payload.maxcsn, payload.force);
        }
        info!(rid = %rid, force = payload.force, "clean extop admitted");
        ExtopResponse::with_text(ResponseCode::Ready, CLEANRUV_ACCEPTED)
    }

    /// Admits a propagated abort. A rid nobody is cleaning is already
    /// in the asked-for state, so that answers as admitted too.
    pub fn handle_abort(&self, req: &ExtopRequest) -> ExtopResponse {
        let payload = match AbortRuvPayload::parse(&req.text()) {
            Ok(p) => p,
            Err(_) => return ExtopResponse::new(ResponseCode::DecodingError),
        };
        if payload.root != self.runner.replica().root() {
            return ExtopResponse::new(ResponseCode::NoSuchReplica);
        }
        let rid = payload.rid;
        let registry = self.runner.registry();
        if !registry.is_retiring(rid) || registry.is_aborted(rid) {
            return ExtopResponse::with_text(ResponseCode::Ready, CLEANRUV_ACCEPTED);
        }
        if let Err(err) = registry.admit_abort(rid, self.runner.config().max_tasks) {
            warn!(rid = %rid, error = %err, "abort extop refused");
            return ExtopResponse::with_text(ResponseCode::Busy, CLEANRUV_REJECTED);
        }
        self.runner.markers().add_abort(&AbortMarker {
            rid,
            root: payload.root.clone(),
            certify: payload.certify,
            original: false,
        });
        registry.stop_ruv_cleaning();
        self.runner
            .spawn_abort_worker(rid, payload.root.clone(), payload.certify, false);
        info!(rid = %rid, certify = payload.certify, "abort extop admitted");
        ExtopResponse::with_text(ResponseCode::Ready, CLEANRUV_ACCEPTED)
    }

    /// Answers the rid's highest CSN in the local RUV.
    pub fn handle_get_maxcsn(&self, req: &ExtopRequest) -> ExtopResponse {
        let payload = match RidRootPayload::parse(&req.text()) {
            Ok(p) => p,
            Err(_) => return ExtopResponse::new(ResponseCode::DecodingError),
        };
        if payload.root != self.runner.replica().root() {
            return ExtopResponse::new(ResponseCode::NoSuchReplica);
        }
        match self.runner.replica().max_csn_for(payload.rid) {
            Some(csn) => ExtopResponse::with_text(ResponseCode::Ready, &csn.to_string()),
            None => ExtopResponse::with_text(ResponseCode::Ready, CLEANRUV_NO_MAXCSN),
        }
    }

    /// Answers from the persisted markers: a stored abort marker means
    /// aborting, a stored clean marker means cleaning, neither means
    /// finished.
    pub fn handle_check_status(&self, req: &ExtopRequest) -> ExtopResponse {
        let payload = match RidRootPayload::parse(&req.text()) {
            Ok(p) => p,
            Err(_) => return ExtopResponse::new(ResponseCode::DecodingError),
        };
        if payload.root != self.runner.replica().root() {
            return ExtopResponse::new(ResponseCode::NoSuchReplica);
        }
        let markers = self.runner.markers();
        let text = if markers.has_abort(payload.rid) {
            CLEANRUV_ABORTING
        } else if markers.has_clean(payload.rid) {
            CLEANRUV_CLEANING
        } else {
            CLEANRUV_FINISHED
        };
        ExtopResponse::with_text(ResponseCode::Ready, text)
    }
}
