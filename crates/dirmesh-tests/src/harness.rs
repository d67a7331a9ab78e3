//! In-process cluster fixture shared by the scenario modules.

use std::sync::Arc;
use std::time::Duration;

use dirmesh_changelog::{ChangeOp, ChangeRecord};
use dirmesh_cleanruv::admin::{ATTR_BASE_DN, ATTR_CERTIFY, ATTR_FORCE, ATTR_RID};
use dirmesh_cleanruv::{CleanConfig, TaskEntry};
use dirmesh_model::csn::{Csn, ReplicaId};
use dirmesh_node::{AgreementConfig, Node, NodeConfig};
use dirmesh_session::Mesh;

/// Subtree every scenario replicates.
pub const ROOT: &str = "dc=example,dc=com";

/// Fixed CSN epoch. Seeding from one base keeps CSNs identical across
/// nodes, so one node's retirement point is exactly coverable by another.
pub const SEED_BASE: u64 = 1_700_000_000;

/// The purl a node with `rid` listens on.
pub fn purl(rid: u16) -> String {
    format!("ldap://node{rid}:389")
}

fn node_config(rid: u16) -> NodeConfig {
    let mut config = NodeConfig::default();
    config.replica.rid = rid;
    config.replica.purl = purl(rid);
    config.clean = CleanConfig::fast();
    config
}

fn agreement(from: u16, to: u16) -> AgreementConfig {
    AgreementConfig {
        name: format!("{from}-to-{to}"),
        consumer_purl: purl(to),
        bind_dn: String::from("cn=replication manager"),
        enabled: true,
    }
}

/// A set of nodes sharing one in-process mesh.
pub struct TestMesh {
    mesh: Arc<Mesh>,
    nodes: Vec<Arc<Node>>,
}

impl TestMesh {
    /// Writable nodes with the given rids, each supplying every other.
    pub fn fully_meshed(rids: &[u16]) -> Self {
        Self::build(rids, |rid| {
            rids.iter()
                .filter(|&&other| other != rid)
                .map(|&other| agreement(rid, other))
                .collect()
        })
    }

    /// Nodes in a supply chain: the first feeds the second, and so on.
    pub fn chained(rids: &[u16]) -> Self {
        Self::build(rids, |rid| {
            rids.iter()
                .skip_while(|&&r| r != rid)
                .nth(1)
                .map(|&next| agreement(rid, next))
                .into_iter()
                .collect()
        })
    }

    fn build(rids: &[u16], links: impl Fn(u16) -> Vec<AgreementConfig>) -> Self {
        let mesh = Arc::new(Mesh::new());
        let nodes = rids
            .iter()
            .map(|&rid| {
                let mut config = node_config(rid);
                config.agreements = links(rid);
                Node::build(&config, mesh.clone()).expect("node build")
            })
            .collect();
        TestMesh { mesh, nodes }
    }

    /// The shared mesh.
    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    /// The `i`th node, in constructor order.
    pub fn node(&self, i: usize) -> &Arc<Node> {
        &self.nodes[i]
    }

    /// All nodes.
    pub fn nodes(&self) -> &[Arc<Node>] {
        &self.nodes
    }

    /// Journals `n` changes originated by `from` on node `i`.
    pub fn seed(&self, i: usize, from: u16, n: u16) {
        self.seed_range(i, from, 0, n);
    }

    /// Journals changes with seqnums `start..start + n`, for scenarios
    /// where one node deliberately lags behind another.
    pub fn seed_range(&self, i: usize, from: u16, start: u16, n: u16) {
        let node = &self.nodes[i];
        for seq in start..start + n {
            let csn = Csn::new(SEED_BASE, seq, ReplicaId::new(from), 0);
            let rec = ChangeRecord::new(
                csn,
                ChangeOp::Add,
                "cn=x,dc=example,dc=com",
                vec![seq as u8],
                SEED_BASE,
            );
            node.changelog().write(&rec).expect("seed write");
            node.replica().update_ruv(csn, "ldap://origin:389");
        }
    }

    /// Runs incremental passes on every node until a full round ships
    /// nothing.
    pub async fn converge(&self) {
        for _ in 0..50 {
            let mut shipped = 0;
            for node in &self.nodes {
                shipped += node.replicate_once().await;
            }
            if shipped == 0 {
                return;
            }
        }
        panic!("mesh did not converge in 50 rounds");
    }
}

/// Polls `cond` until it holds, panicking after five seconds.
pub async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A CleanAllRUV task entry for `rid`.
pub fn clean_entry(name: &str, rid: u16, force: bool) -> TaskEntry {
    let entry = TaskEntry::new(name)
        .with(ATTR_RID, &rid.to_string())
        .with(ATTR_BASE_DN, ROOT);
    if force {
        entry.with(ATTR_FORCE, "yes")
    } else {
        entry
    }
}

/// An AbortCleanAllRUV task entry for `rid`.
pub fn abort_entry(name: &str, rid: u16, certify: bool) -> TaskEntry {
    TaskEntry::new(name)
        .with(ATTR_RID, &rid.to_string())
        .with(ATTR_BASE_DN, ROOT)
        .with(ATTR_CERTIFY, if certify { "yes" } else { "no" })
}
