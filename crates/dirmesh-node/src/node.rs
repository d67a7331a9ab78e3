//! Assembles one replication node and routes its extended operations.

use std::sync::Arc;

use tracing::{debug, info, warn};

use dirmesh_changelog::{ChangeLog, MemoryLogStore};
use dirmesh_cleanruv::{
    CleanExtopHandler, CleanRunner, MarkerStore, RidRegistry, TaskDispatcher,
};
use dirmesh_model::csn::ReplicaId;
use dirmesh_session::extop::{EXTOP_END_OID, EXTOP_START_OID};
use dirmesh_session::{
    Agreement, ExtopRequest, ExtopResponse, Mesh, PeerNode, Replica, ResponseCode, SessionDriver,
    SessionEngine, SessionError, SessionOutcome, UpdateBatch,
};

use crate::config::NodeConfig;

/// One running replica node: the replica object, its changelog, the
/// session engine answering inbound operations, the driver running
/// outbound agreements, and the rid-retirement machinery.
pub struct Node {
    replica: Arc<Replica>,
    changelog: Arc<ChangeLog>,
    mesh: Arc<Mesh>,
    engine: SessionEngine,
    driver: SessionDriver,
    cleaner: CleanExtopHandler,
    dispatcher: TaskDispatcher,
}

impl Node {
    /// Builds a node from its configuration and registers it in the mesh.
    pub fn build(config: &NodeConfig, mesh: Arc<Mesh>) -> anyhow::Result<Arc<Self>> {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let mut replica = Replica::new(
            ReplicaId::new(config.replica.rid),
            &config.replica.root,
            &config.replica.purl,
            now,
        );
        replica.set_updatable(config.replica.updatable);
        replica.set_release_timeout(config.replica.release_timeout_secs);
        replica.set_update_dns(config.replica.update_dns.clone());
        let replica = Arc::new(replica);
        replica.set_ignore_time_skew(config.replica.ignore_time_skew);

        let changelog = Arc::new(ChangeLog::new(
            Arc::new(MemoryLogStore::new()),
            config.changelog.clone(),
        ));
        changelog.open()?;

        let runner = Arc::new(CleanRunner::new(
            replica.clone(),
            changelog.clone(),
            mesh.clone(),
            Arc::new(RidRegistry::new()),
            Arc::new(MarkerStore::new()),
            config.clean.clone(),
        ));
        for agmt in &config.agreements {
            let built = Agreement::new(
                &agmt.name,
                &config.replica.root,
                &agmt.consumer_purl,
                &agmt.bind_dn,
            );
            if !agmt.enabled {
                built.disable();
            }
            runner.add_agreement(Arc::new(built));
        }

        let node = Arc::new(Node {
            replica: replica.clone(),
            changelog: changelog.clone(),
            mesh: mesh.clone(),
            engine: SessionEngine::new(replica.clone(), changelog.clone()),
            driver: SessionDriver::new(replica, changelog, mesh.clone()),
            cleaner: CleanExtopHandler::new(runner.clone()),
            dispatcher: TaskDispatcher::new(runner),
        });
        mesh.register(&config.replica.purl, node.clone());
        info!(purl = %config.replica.purl, rid = config.replica.rid, "node registered");
        Ok(node)
    }

    /// The local replica.
    pub fn replica(&self) -> &Arc<Replica> {
        &self.replica
    }

    /// The local changelog.
    pub fn changelog(&self) -> &Arc<ChangeLog> {
        &self.changelog
    }

    /// The mesh this node lives in.
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// The retirement runner.
    pub fn runner(&self) -> &Arc<CleanRunner> {
        self.dispatcher.runner()
    }

    /// The admin-task dispatcher.
    pub fn dispatcher(&self) -> &TaskDispatcher {
        &self.dispatcher
    }

    /// The outbound session driver.
    pub fn driver(&self) -> &SessionDriver {
        &self.driver
    }

    /// Resumes tasks whose persisted markers survived the last shutdown.
    pub async fn start(&self) {
        self.dispatcher.resume().await;
    }

    /// Stops the background loops and every retirement worker.
    pub fn begin_shutdown(&self) {
        self.runner().registry().begin_shutdown();
    }

    /// Runs one incremental pass over every active agreement. Returns
    /// the number of change records shipped.
    pub async fn replicate_once(&self) -> u64 {
        let exclude = self.runner().registry().retiring_rids();
        let mut shipped = 0;
        for agmt in self.runner().agreements() {
            match self.driver.run_incremental(&agmt, &exclude).await {
                SessionOutcome::Completed { sent } => shipped += sent,
                SessionOutcome::Disabled => {}
                SessionOutcome::Busy { holder } => {
                    debug!(agreement = agmt.name(), holder = %holder, "consumer busy")
                }
                SessionOutcome::Failed(code) => {
                    warn!(agreement = agmt.name(), code = ?code, "incremental pass failed")
                }
            }
        }
        shipped
    }
}

impl PeerNode for Node {
    fn handle_extop(&self, req: ExtopRequest) -> ExtopResponse {
        if let Some(resp) = self.cleaner.handle(&req) {
            return resp;
        }
        match req.oid.as_str() {
            EXTOP_START_OID => self.engine.handle_start(&req),
            EXTOP_END_OID => self.engine.handle_end(&req),
            _ => ExtopResponse::new(ResponseCode::UnknownUpdateProtocol),
        }
    }

    fn apply_updates(&self, mut batch: UpdateBatch) -> Result<(), SessionError> {
        // A rid this node already cleaned stays dead until restart; late
        // records from it are dropped rather than re-journaled.
        let registry = self.runner().registry();
        let before = batch.records.len();
        batch
            .records
            .retain(|rec| !registry.is_cleaned(rec.csn.rid));
        if batch.records.len() < before {
            warn!(
                supplier = %batch.supplier_purl,
                dropped = before - batch.records.len(),
                "dropped records from cleaned rids"
            );
        }
        self.engine.apply_updates(&batch).map(|_| ())
    }
}
