//! Consumer-side session handling: start, update stream, end.
//!
//! `SessionEngine` owns the receiving end of the update protocols. The
//! start handler walks a fixed validation ladder before taking the
//! replica's exclusive token; every rejection maps to one response code
//! so the supplier can tell a retryable bounce from an operator error.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use dirmesh_changelog::{ChangeLog, ChangeOp, ChangeRecord};
use dirmesh_model::ruv::{replica_id_conflicts, Ruv};
use dirmesh_model::ModelError;

use crate::error::SessionError;
use crate::extop::{
    protocol_flavor, EndRequest, ExtopRequest, ExtopResponse, ResponseCode, SessionFlavor,
    StartRequest,
};
use crate::replica::Replica;
use crate::transport::UpdateBatch;

/// Receiving end of the replication session protocol for one replica.
pub struct SessionEngine {
    replica: Arc<Replica>,
    changelog: Arc<ChangeLog>,
    /// Connections currently mid-session, by connection id.
    connections: DashMap<u64, SessionFlavor>,
}

impl SessionEngine {
    /// Builds the engine for `replica`, journaling into `changelog`.
    pub fn new(replica: Arc<Replica>, changelog: Arc<ChangeLog>) -> Self {
        SessionEngine {
            replica,
            changelog,
            connections: DashMap::new(),
        }
    }

    /// The replica this engine answers for.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// The changelog updates are journaled into.
    pub fn changelog(&self) -> &Arc<ChangeLog> {
        &self.changelog
    }

    /// Handles a session-start extended operation.
    ///
    /// The checks run in a fixed order; the first failure wins. A ready
    /// reply carries the local RUV so the supplier can position its
    /// changelog iterator.
    pub fn handle_start(&self, req: &ExtopRequest) -> ExtopResponse {
        let start = match StartRequest::decode(&req.payload) {
            Ok(s) => s,
            Err(e) => {
                warn!(conn = req.conn_id, error = %e, "malformed session start");
                return ExtopResponse::new(ResponseCode::DecodingError);
            }
        };

        if self.connections.contains_key(&req.conn_id) {
            return ExtopResponse::new(ResponseCode::Busy);
        }

        let flavor = match protocol_flavor(&start.protocol_oid) {
            Some(f) => f,
            None => return ExtopResponse::new(ResponseCode::UnknownUpdateProtocol),
        };

        if !root_is_well_formed(&start.root) {
            return ExtopResponse::new(ResponseCode::InternalError);
        }

        // Mid-configuration answers busy before existence is checked, so
        // a replica being added bounces suppliers instead of 404ing them.
        if start.root == self.replica.root() && self.replica.is_being_configured() {
            return ExtopResponse::new(ResponseCode::Busy);
        }

        if start.root != self.replica.root() {
            return ExtopResponse::new(ResponseCode::NoSuchReplica);
        }

        if flavor == SessionFlavor::Total && self.replica.is_total_excluded() {
            return ExtopResponse::new(ResponseCode::Busy);
        }

        if !self.replica.can_update(&req.bind_dn) {
            return ExtopResponse::new(ResponseCode::PermissionDenied);
        }

        if self.replica.is_legacy_consumer() {
            return ExtopResponse::new(ResponseCode::LegacyConsumer);
        }

        if let Err(e) = self.replica.adjust_time(&start.csn) {
            return match e {
                ModelError::SkewLimitExceeded { .. } => {
                    ExtopResponse::new(ResponseCode::ExcessiveClockSkew)
                }
                _ => ExtopResponse::new(ResponseCode::InternalError),
            };
        }

        if replica_id_conflicts(
            &start.supplier_ruv,
            self.replica.rid(),
            self.replica.is_updatable(),
        ) {
            warn!(
                rid = %self.replica.rid(),
                root = %start.root,
                "supplier advertises our own replica id"
            );
            return ExtopResponse::new(ResponseCode::ReplicaIdError);
        }

        // The supplier's identity is the owner element of the RUV it sends.
        let supplier_purl = start
            .supplier_ruv
            .elements()
            .first()
            .map(|e| e.purl.clone())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| req.bind_dn.clone());

        if let Err(e) =
            self.replica
                .get_exclusive_access(req.conn_id, req.op_id, &supplier_purl, flavor)
        {
            return ExtopResponse::with_text(ResponseCode::Busy, &e.to_string());
        }

        if flavor == SessionFlavor::Total {
            self.replica.suspend_tombstone_reap();
            self.replica.set_referral(true);
            if self.replica.is_bulk_importing() {
                // A previous import never wound down; refuse rather than
                // interleave two reseeds.
                self.replica.set_referral(false);
                self.replica.resume_tombstone_reap();
                self.replica.relinquish_exclusive_access(req.conn_id, req.op_id);
                return ExtopResponse::new(ResponseCode::InternalError);
            }
            self.replica.start_bulk_import();
        }

        let ruv_bytes = match bincode::serialize(&self.replica.ruv()) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "failed to frame local ruv");
                if flavor == SessionFlavor::Total {
                    self.replica.finish_bulk_import();
                    self.replica.set_referral(false);
                    self.replica.resume_tombstone_reap();
                }
                self.replica.relinquish_exclusive_access(req.conn_id, req.op_id);
                return ExtopResponse::new(ResponseCode::InternalError);
            }
        };

        self.connections.insert(req.conn_id, flavor);
        info!(
            conn = req.conn_id,
            root = %start.root,
            flavor = flavor.name(),
            "session started"
        );
        ExtopResponse::with_payload(ResponseCode::Ready, ruv_bytes)
    }

    /// Handles a session-end extended operation.
    pub fn handle_end(&self, req: &ExtopRequest) -> ExtopResponse {
        let end = match EndRequest::decode(&req.payload) {
            Ok(e) => e,
            Err(_) => return ExtopResponse::new(ResponseCode::DecodingError),
        };

        if end.root != self.replica.root() {
            return ExtopResponse::new(ResponseCode::NoSuchReplica);
        }

        let flavor = match self.connections.remove(&req.conn_id) {
            Some((_, f)) => f,
            None => {
                return ExtopResponse::with_text(
                    ResponseCode::InternalError,
                    "no replication session in progress",
                )
            }
        };

        let result = match flavor {
            SessionFlavor::Total => self.finish_total(&end),
            SessionFlavor::Incremental => {
                self.replica.merge_ruv(&end.supplier_ruv);
                Ok(())
            }
        };

        self.replica
            .relinquish_exclusive_access(req.conn_id, req.op_id);

        match result {
            Ok(()) => {
                debug!(conn = req.conn_id, root = %end.root, "session released");
                ExtopResponse::new(ResponseCode::ReplicaReleaseSucceeded)
            }
            Err(e) => {
                warn!(conn = req.conn_id, error = %e, "session end failed");
                ExtopResponse::with_text(ResponseCode::ChangelogError, &e.to_string())
            }
        }
    }

    /// Closes out a total update: the supplier's RUV becomes ours and
    /// the changelog is re-anchored with one floor record per rid so
    /// later incremental sessions can position against it.
    fn finish_total(&self, end: &EndRequest) -> Result<(), SessionError> {
        self.replica.set_referral(false);
        self.replica.finish_bulk_import();

        let mut ruv = Ruv::with_local(self.replica.rid(), self.replica.purl());
        ruv.merge(&end.supplier_ruv);
        self.replica.install_ruv(ruv);

        for el in end.supplier_ruv.elements() {
            if el.csn.is_zero() {
                continue;
            }
            let anchor = ChangeRecord::new(
                el.csn,
                ChangeOp::Modify,
                self.replica.root(),
                Vec::new(),
                el.csn.time(),
            );
            self.changelog.write(&anchor)?;
        }

        if self.replica.is_updatable() {
            self.replica.ensure_keep_alive(self.replica.rid());
        }
        self.replica.resume_tombstone_reap();
        info!(root = %self.replica.root(), "total update installed");
        Ok(())
    }

    /// Journals a batch of updates from the session holder and advances
    /// the RUV. Rejected when the batch does not come from the holder,
    /// or once a contender has asked the session to wind down.
    pub fn apply_updates(&self, batch: &UpdateBatch) -> Result<u64, SessionError> {
        if batch.root != self.replica.root()
            || self.replica.locking_conn() != Some(batch.conn_id)
        {
            return Err(SessionError::NoSession {
                root: batch.root.clone(),
            });
        }
        if self.replica.session_abort_requested() {
            return Err(SessionError::SessionAborted);
        }
        let mut applied = 0u64;
        for record in &batch.records {
            self.changelog.write(record)?;
            self.replica.update_ruv(record.csn, &batch.supplier_purl);
            applied += 1;
        }
        Ok(applied)
    }
}

fn root_is_well_formed(root: &str) -> bool {
    !root.is_empty() && root.contains('=')
}
