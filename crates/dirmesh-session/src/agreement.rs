//! Replication agreements and the supplier-side session driver.
//!
//! An agreement is one directed supplier→consumer edge. The driver runs
//! a full protocol cycle against it: acquire the consumer with a start
//! extop, ship changes positioned by the consumer's RUV, then release
//! with an end extop. One driver per node; every session it opens shares
//! the node's connection id so the consumer can tell a reconnect from a
//! contender.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, info, warn};

use dirmesh_changelog::{ChangeLog, ChangelogError, ReplayCursor};
use dirmesh_model::csn::ReplicaId;
use dirmesh_model::ruv::Ruv;

use crate::error::SessionError;
use crate::extop::{
    EndRequest, ExtopRequest, ExtopResponse, ResponseCode, SessionFlavor, StartRequest,
    EXTOP_END_OID, EXTOP_START_OID, PROTO_NSDS50_INCREMENTAL_OID, PROTO_NSDS50_TOTAL_OID,
};
use crate::replica::Replica;
use crate::transport::{Mesh, UpdateBatch};

/// Records shipped per update batch; an abort lands between batches.
const UPDATE_BATCH: usize = 100;

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// One supplier→consumer replication edge.
pub struct Agreement {
    name: String,
    root: String,
    consumer_purl: String,
    bind_dn: String,
    enabled: AtomicBool,
    paused: AtomicBool,
    consumer_ruv: Mutex<Option<Ruv>>,
}

impl Agreement {
    /// Creates an enabled agreement.
    pub fn new(name: &str, root: &str, consumer_purl: &str, bind_dn: &str) -> Self {
        Agreement {
            name: name.to_string(),
            root: root.to_string(),
            consumer_purl: consumer_purl.to_string(),
            bind_dn: bind_dn.to_string(),
            enabled: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            consumer_ruv: Mutex::new(None),
        }
    }

    /// Administrative name of the agreement.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Replicated subtree root.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// Purl of the consumer end.
    pub fn consumer_purl(&self) -> &str {
        &self.consumer_purl
    }

    /// Identity the supplier binds as.
    pub fn bind_dn(&self) -> &str {
        &self.bind_dn
    }

    /// Enables the agreement.
    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    /// Disables the agreement; sessions refuse to run.
    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    /// Whether the agreement is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Pauses update sessions without forgetting state.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    /// Resumes a paused agreement.
    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    /// Whether the agreement is paused.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Whether sessions may run right now.
    pub fn is_active(&self) -> bool {
        self.is_enabled() && !self.is_paused()
    }

    /// Drops cached session state and resumes. Used after a rid retirement
    /// so stale consumer watermarks for the cleaned rid disappear.
    pub fn restart(&self) {
        *self.consumer_ruv.lock().expect("lock poisoned") = None;
        self.paused.store(false, Ordering::SeqCst);
        info!(agreement = %self.name, "agreement restarted");
    }

    /// Last consumer RUV learned from a ready reply, if any.
    pub fn consumer_ruv(&self) -> Option<Ruv> {
        self.consumer_ruv.lock().expect("lock poisoned").clone()
    }

    /// Caches the consumer's RUV.
    pub fn set_consumer_ruv(&self, ruv: Ruv) {
        *self.consumer_ruv.lock().expect("lock poisoned") = Some(ruv);
    }

    /// Drops one rid from the cached consumer RUV.
    pub fn forget_rid(&self, rid: ReplicaId) {
        if let Some(ruv) = self.consumer_ruv.lock().expect("lock poisoned").as_mut() {
            ruv.forget(rid);
        }
    }
}

impl std::fmt::Debug for Agreement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agreement")
            .field("name", &self.name)
            .field("consumer_purl", &self.consumer_purl)
            .field("enabled", &self.is_enabled())
            .field("paused", &self.is_paused())
            .finish()
    }
}

/// How one driver cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The consumer was acquired, fed, and released.
    Completed {
        /// Change records shipped this cycle.
        sent: u64,
    },
    /// The consumer is held by another supplier.
    Busy {
        /// The holder's identity, from the busy diagnostic.
        holder: String,
    },
    /// The cycle failed with a protocol response code.
    Failed(ResponseCode),
    /// The agreement is disabled or paused.
    Disabled,
}

impl SessionOutcome {
    /// True for a completed cycle.
    pub fn is_success(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }
}

/// Runs protocol cycles for one supplier node.
pub struct SessionDriver {
    replica: Arc<Replica>,
    changelog: Arc<ChangeLog>,
    mesh: Arc<Mesh>,
    conn_id: u64,
    next_op: AtomicU64,
}

impl SessionDriver {
    /// Builds a driver with a process-unique connection id.
    pub fn new(replica: Arc<Replica>, changelog: Arc<ChangeLog>, mesh: Arc<Mesh>) -> Self {
        SessionDriver {
            replica,
            changelog,
            mesh,
            conn_id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            next_op: AtomicU64::new(1),
        }
    }

    /// The connection id this driver's sessions run on.
    pub fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Runs one incremental cycle against `agmt`. Rids in `exclude` are
    /// withheld from the stream; callers pass rids that are being cleaned.
    pub async fn run_incremental(
        &self,
        agmt: &Agreement,
        exclude: &[ReplicaId],
    ) -> SessionOutcome {
        if !agmt.is_active() {
            return SessionOutcome::Disabled;
        }
        let local_ruv = self.replica.ruv();
        let consumer_ruv = match self
            .acquire(agmt, SessionFlavor::Incremental, &local_ruv)
            .await
        {
            Ok(acquired) => acquired,
            Err(outcome) => return outcome,
        };
        agmt.set_consumer_ruv(consumer_ruv.clone());

        let cursor = match self.changelog.replay_for(&consumer_ruv, exclude) {
            Ok(c) => c,
            Err(e) => {
                let code = match &e {
                    ChangelogError::PurgedData { rid, .. } => {
                        warn!(
                            agreement = %agmt.name(),
                            rid = %rid,
                            "consumer resume point was trimmed; it needs a total update"
                        );
                        ResponseCode::BelowPurgePoint
                    }
                    _ => ResponseCode::ChangelogError,
                };
                self.release(agmt, &local_ruv).await;
                return SessionOutcome::Failed(code);
            }
        };

        let sent = match self.ship(agmt, cursor).await {
            Ok(n) => n,
            Err(outcome) => {
                self.release(agmt, &local_ruv).await;
                return outcome;
            }
        };

        let end = match self.release(agmt, &local_ruv).await {
            Some(resp) => resp,
            None => return SessionOutcome::Failed(ResponseCode::NoResponse),
        };
        if end.code != ResponseCode::ReplicaReleaseSucceeded {
            return SessionOutcome::Failed(end.code);
        }

        // The consumer merged our vector at release; fold the same merge
        // into the cache so the next cycle positions correctly.
        let mut merged = consumer_ruv;
        merged.merge(&local_ruv);
        agmt.set_consumer_ruv(merged);

        info!(agreement = %agmt.name(), sent, "incremental cycle complete");
        SessionOutcome::Completed { sent }
    }

    /// Runs one total-update cycle against `agmt`, reseeding the consumer
    /// with everything in the changelog except `exclude` rids.
    pub async fn run_total(&self, agmt: &Agreement, exclude: &[ReplicaId]) -> SessionOutcome {
        if !agmt.is_active() {
            return SessionOutcome::Disabled;
        }
        let local_ruv = self.replica.ruv();
        if let Err(outcome) = self.acquire(agmt, SessionFlavor::Total, &local_ruv).await {
            return outcome;
        }

        let cursor = match self.changelog.replay_all(exclude) {
            Ok(c) => c,
            Err(e) => {
                warn!(agreement = %agmt.name(), error = %e, "total replay failed");
                self.release(agmt, &local_ruv).await;
                return SessionOutcome::Failed(ResponseCode::ChangelogError);
            }
        };

        let sent = match self.ship(agmt, cursor).await {
            Ok(n) => n,
            Err(outcome) => {
                self.release(agmt, &local_ruv).await;
                return outcome;
            }
        };

        let end = match self.release(agmt, &local_ruv).await {
            Some(resp) => resp,
            None => return SessionOutcome::Failed(ResponseCode::NoResponse),
        };
        if end.code != ResponseCode::ReplicaReleaseSucceeded {
            return SessionOutcome::Failed(end.code);
        }

        agmt.set_consumer_ruv(local_ruv);
        info!(agreement = %agmt.name(), sent, "total update complete");
        SessionOutcome::Completed { sent }
    }

    /// Sends the start extop and decodes the ready reply's consumer RUV.
    async fn acquire(
        &self,
        agmt: &Agreement,
        flavor: SessionFlavor,
        local_ruv: &Ruv,
    ) -> Result<Ruv, SessionOutcome> {
        let csn = match self.replica.new_csn() {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "could not mint session csn");
                return Err(SessionOutcome::Failed(ResponseCode::InternalError));
            }
        };
        let start = StartRequest {
            protocol_oid: match flavor {
                SessionFlavor::Incremental => PROTO_NSDS50_INCREMENTAL_OID.to_string(),
                SessionFlavor::Total => PROTO_NSDS50_TOTAL_OID.to_string(),
            },
            root: agmt.root().to_string(),
            supplier_ruv: local_ruv.clone(),
            referrals: vec![self.replica.purl().to_string()],
            csn,
        };
        let payload = match start.encode() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not frame session start");
                return Err(SessionOutcome::Failed(ResponseCode::InternalError));
            }
        };
        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let req = ExtopRequest::new(
            EXTOP_START_OID,
            self.conn_id,
            op_id,
            agmt.bind_dn(),
            payload,
        );
        let resp = match self.mesh.send_extop(agmt.consumer_purl(), req).await {
            Ok(r) => r,
            Err(e) => return Err(SessionOutcome::Failed(transport_code(&e))),
        };
        match resp.code {
            ResponseCode::Ready => {
                debug!(agreement = %agmt.name(), flavor = flavor.name(), "consumer acquired");
                Ok(resp.ruv().unwrap_or_default())
            }
            ResponseCode::Busy => Err(SessionOutcome::Busy {
                holder: resp.text(),
            }),
            code => Err(SessionOutcome::Failed(code)),
        }
    }

    /// Ships the cursor's records in batches.
    async fn ship(
        &self,
        agmt: &Agreement,
        mut cursor: ReplayCursor,
    ) -> Result<u64, SessionOutcome> {
        let mut sent = 0u64;
        loop {
            let mut records = Vec::with_capacity(UPDATE_BATCH);
            while records.len() < UPDATE_BATCH {
                match cursor.next() {
                    Some(rec) => records.push(rec),
                    None => break,
                }
            }
            if records.is_empty() {
                return Ok(sent);
            }
            let count = records.len() as u64;
            let batch = UpdateBatch {
                root: agmt.root().to_string(),
                supplier_purl: self.replica.purl().to_string(),
                conn_id: self.conn_id,
                records,
            };
            match self.mesh.send_updates(agmt.consumer_purl(), batch).await {
                Ok(()) => sent += count,
                Err(SessionError::SessionAborted) => {
                    warn!(agreement = %agmt.name(), "consumer asked the session to wind down");
                    return Err(SessionOutcome::Failed(ResponseCode::TransientError));
                }
                Err(e @ SessionError::Unreachable { .. })
                | Err(e @ SessionError::Timeout { .. }) => {
                    return Err(SessionOutcome::Failed(transport_code(&e)));
                }
                Err(e) => {
                    warn!(agreement = %agmt.name(), error = %e, "consumer refused updates");
                    return Err(SessionOutcome::Failed(ResponseCode::ChangelogError));
                }
            }
        }
    }

    /// Sends the end extop; best effort, None when the peer was unreachable.
    async fn release(&self, agmt: &Agreement, local_ruv: &Ruv) -> Option<ExtopResponse> {
        let end = EndRequest {
            root: agmt.root().to_string(),
            supplier_ruv: local_ruv.clone(),
        };
        let payload = match end.encode() {
            Ok(p) => p,
            Err(_) => return None,
        };
        let op_id = self.next_op.fetch_add(1, Ordering::Relaxed);
        let req = ExtopRequest::new(EXTOP_END_OID, self.conn_id, op_id, agmt.bind_dn(), payload);
        match self.mesh.send_extop(agmt.consumer_purl(), req).await {
            Ok(resp) => Some(resp),
            Err(e) => {
                warn!(agreement = %agmt.name(), error = %e, "session release failed");
                None
            }
        }
    }
}

fn transport_code(e: &SessionError) -> ResponseCode {
    match e {
        SessionError::Unreachable { .. } => ResponseCode::ConnectionError,
        SessionError::Timeout { .. } => ResponseCode::ConnectionTimeout,
        _ => ResponseCode::NoResponse,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extop::{PROTO_NSDS50_INCREMENTAL_OID, EXTOP_START_OID};
    use crate::protocol::SessionEngine;
    use crate::transport::PeerNode;
    use dirmesh_changelog::{ChangeOp, ChangeRecord, ChangelogConfig, MemoryLogStore};
    use dirmesh_model::csn::Csn;

    const ROOT: &str = "dc=example,dc=com";

    fn now() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs()
    }

    struct TestNode {
        engine: SessionEngine,
    }

    impl TestNode {
        fn consumer(rid: u16, purl: &str) -> (Arc<Self>, Arc<Replica>, Arc<ChangeLog>) {
            Self::with_config(rid, purl, ChangelogConfig::default())
        }

        fn with_config(
            rid: u16,
            purl: &str,
            config: ChangelogConfig,
        ) -> (Arc<Self>, Arc<Replica>, Arc<ChangeLog>) {
            let replica = Arc::new(Replica::new(ReplicaId::new(rid), ROOT, purl, now()));
            let log = Arc::new(ChangeLog::new(Arc::new(MemoryLogStore::new()), config));
            log.open().unwrap();
            let node = Arc::new(TestNode {
                engine: SessionEngine::new(replica.clone(), log.clone()),
            });
            (node, replica, log)
        }
    }

    impl PeerNode for TestNode {
        fn handle_extop(&self, req: ExtopRequest) -> ExtopResponse {
            match req.oid.as_str() {
                EXTOP_START_OID => self.engine.handle_start(&req),
                EXTOP_END_OID => self.engine.handle_end(&req),
                _ => ExtopResponse::new(ResponseCode::UnknownUpdateProtocol),
            }
        }

        fn apply_updates(&self, batch: UpdateBatch) -> Result<(), SessionError> {
            self.engine.apply_updates(&batch).map(|_| ())
        }
    }

    struct Supplier {
        replica: Arc<Replica>,
        changelog: Arc<ChangeLog>,
        driver: SessionDriver,
    }

    fn supplier(mesh: &Arc<Mesh>) -> Supplier {
        let replica = Arc::new(Replica::new(ReplicaId::new(1), ROOT, "ldap://a:389", now()));
        let log = Arc::new(ChangeLog::new(
            Arc::new(MemoryLogStore::new()),
            ChangelogConfig::default(),
        ));
        log.open().unwrap();
        let driver = SessionDriver::new(replica.clone(), log.clone(), mesh.clone());
        Supplier {
            replica,
            changelog: log,
            driver,
        }
    }

    /// Writes `n` local changes to the supplier, journal and RUV both.
    fn seed(s: &Supplier, n: u16) {
        let base = now() - 500;
        for i in 0..n {
            let csn = Csn::new(base, i, ReplicaId::new(1), 0);
            let rec = ChangeRecord::new(
                csn,
                ChangeOp::Add,
                "cn=x,dc=example,dc=com",
                vec![i as u8],
                base,
            );
            s.changelog.write(&rec).unwrap();
            s.replica.update_ruv(csn, "ldap://a:389");
        }
    }

    #[tokio::test]
    async fn test_incremental_converges_consumer() {
        let mesh = Arc::new(Mesh::new());
        let s = supplier(&mesh);
        seed(&s, 3);
        let (node, consumer_replica, consumer_log) = TestNode::consumer(2, "ldap://b:389");
        mesh.register("ldap://b:389", node);

        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        let outcome = s.driver.run_incremental(&agmt, &[]).await;
        assert_eq!(outcome, SessionOutcome::Completed { sent: 3 });
        assert_eq!(consumer_log.entry_count(), 3);
        let got = consumer_replica.max_csn_for(ReplicaId::new(1)).unwrap();
        assert_eq!(got, s.replica.max_csn_for(ReplicaId::new(1)).unwrap());
        // Token released.
        assert!(!consumer_replica.is_in_use());
    }

    #[tokio::test]
    async fn test_second_cycle_is_up_to_date() {
        let mesh = Arc::new(Mesh::new());
        let s = supplier(&mesh);
        seed(&s, 2);
        let (node, _, _) = TestNode::consumer(2, "ldap://b:389");
        mesh.register("ldap://b:389", node);

        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        assert_eq!(
            s.driver.run_incremental(&agmt, &[]).await,
            SessionOutcome::Completed { sent: 2 }
        );
        assert_eq!(
            s.driver.run_incremental(&agmt, &[]).await,
            SessionOutcome::Completed { sent: 0 }
        );
    }

    #[tokio::test]
    async fn test_disabled_agreement_refuses() {
        let mesh = Arc::new(Mesh::new());
        let s = supplier(&mesh);
        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        agmt.disable();
        assert_eq!(
            s.driver.run_incremental(&agmt, &[]).await,
            SessionOutcome::Disabled
        );
        agmt.enable();
        agmt.pause();
        assert_eq!(
            s.driver.run_incremental(&agmt, &[]).await,
            SessionOutcome::Disabled
        );
    }

    #[tokio::test]
    async fn test_unreachable_consumer() {
        let mesh = Arc::new(Mesh::new());
        let s = supplier(&mesh);
        seed(&s, 1);
        let (node, _, _) = TestNode::consumer(2, "ldap://b:389");
        mesh.register("ldap://b:389", node);
        mesh.set_unreachable("ldap://b:389", true);

        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        assert_eq!(
            s.driver.run_incremental(&agmt, &[]).await,
            SessionOutcome::Failed(ResponseCode::ConnectionError)
        );
    }

    #[tokio::test]
    async fn test_busy_consumer_names_holder() {
        let mesh = Arc::new(Mesh::new());
        let s = supplier(&mesh);
        seed(&s, 1);
        let (node, _, _) = TestNode::consumer(2, "ldap://b:389");
        mesh.register("ldap://b:389", node.clone());

        // Another supplier holds the consumer.
        let mut holder_ruv = Ruv::with_local(ReplicaId::new(9), "ldap://c:389");
        holder_ruv.update(Csn::new(now(), 0, ReplicaId::new(9), 0), "ldap://c:389");
        let start = StartRequest {
            protocol_oid: PROTO_NSDS50_INCREMENTAL_OID.to_string(),
            root: ROOT.to_string(),
            supplier_ruv: holder_ruv,
            referrals: vec![],
            csn: Csn::new(now(), 0, ReplicaId::new(9), 0),
        };
        let req = ExtopRequest::new(
            EXTOP_START_OID,
            777,
            1,
            "cn=other",
            start.encode().unwrap(),
        );
        assert_eq!(node.handle_extop(req).code, ResponseCode::Ready);

        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        match s.driver.run_incremental(&agmt, &[]).await {
            SessionOutcome::Busy { holder } => {
                assert_eq!(holder, "locked by ldap://c:389 for incremental update");
            }
            other => panic!("expected busy, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_trimmed_supplier_reports_below_purge_point() {
        let mesh = Arc::new(Mesh::new());
        let replica = Arc::new(Replica::new(ReplicaId::new(1), ROOT, "ldap://a:389", now()));
        let log = Arc::new(ChangeLog::new(
            Arc::new(MemoryLogStore::new()),
            ChangelogConfig {
                max_entries: 1,
                ..Default::default()
            },
        ));
        log.open().unwrap();
        let s = Supplier {
            driver: SessionDriver::new(replica.clone(), log.clone(), mesh.clone()),
            replica,
            changelog: log,
        };
        seed(&s, 4);
        let floor = s.replica.ruv();
        s.changelog.trim(&floor, now() + 10_000).unwrap();

        let (node, consumer_replica, _) = TestNode::consumer(2, "ldap://b:389");
        mesh.register("ldap://b:389", node);

        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        assert_eq!(
            s.driver.run_incremental(&agmt, &[]).await,
            SessionOutcome::Failed(ResponseCode::BelowPurgePoint)
        );
        // The consumer was still released.
        assert!(!consumer_replica.is_in_use());
    }

    #[tokio::test]
    async fn test_total_reseeds_trimmed_consumer() {
        let mesh = Arc::new(Mesh::new());
        let replica = Arc::new(Replica::new(ReplicaId::new(1), ROOT, "ldap://a:389", now()));
        let log = Arc::new(ChangeLog::new(
            Arc::new(MemoryLogStore::new()),
            ChangelogConfig {
                max_entries: 1,
                ..Default::default()
            },
        ));
        log.open().unwrap();
        let s = Supplier {
            driver: SessionDriver::new(replica.clone(), log.clone(), mesh.clone()),
            replica,
            changelog: log,
        };
        seed(&s, 4);
        let floor = s.replica.ruv();
        s.changelog.trim(&floor, now() + 10_000).unwrap();

        let (node, consumer_replica, consumer_log) = TestNode::consumer(2, "ldap://b:389");
        mesh.register("ldap://b:389", node);

        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        match s.driver.run_total(&agmt, &[]).await {
            SessionOutcome::Completed { sent } => assert_eq!(sent, 1),
            other => panic!("expected completion, got {other:?}"),
        }
        // Consumer owns its vector again and covers the supplier.
        let ruv = consumer_replica.ruv();
        assert_eq!(ruv.local_rid(), Some(ReplicaId::new(2)));
        assert!(ruv.contains(ReplicaId::new(1)));
        assert!(consumer_log.entry_count() >= 1);
        // Incremental picks up cleanly afterwards.
        assert_eq!(
            s.driver.run_incremental(&agmt, &[]).await,
            SessionOutcome::Completed { sent: 0 }
        );
    }

    #[tokio::test]
    async fn test_excluded_rid_withheld_from_stream() {
        let mesh = Arc::new(Mesh::new());
        let s = supplier(&mesh);
        seed(&s, 2);
        // A change that arrived from rid 7, now being cleaned.
        let foreign = Csn::new(now() - 400, 0, ReplicaId::new(7), 0);
        s.changelog
            .write(&ChangeRecord::new(
                foreign,
                ChangeOp::Add,
                "cn=y,dc=example,dc=com",
                vec![],
                now() - 400,
            ))
            .unwrap();
        s.replica.update_ruv(foreign, "");

        let (node, consumer_replica, consumer_log) = TestNode::consumer(2, "ldap://b:389");
        mesh.register("ldap://b:389", node);

        let agmt = Agreement::new("to-b", ROOT, "ldap://b:389", "cn=supplier");
        assert_eq!(
            s.driver
                .run_incremental(&agmt, &[ReplicaId::new(7)])
                .await,
            SessionOutcome::Completed { sent: 2 }
        );
        assert_eq!(consumer_log.entry_count(), 2);
        // The end-of-session merge still advertises rid 7 from our vector,
        // but no rid-7 change was shipped.
        assert_eq!(
            consumer_log.max_ruv().max_csn_for(ReplicaId::new(7)),
            None
        );
        assert!(consumer_replica.max_csn_for(ReplicaId::new(1)).is_some());
    }
}
