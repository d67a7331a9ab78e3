//! Background loops: periodic changelog trimming and incremental
//! replication. Both park on the registry's stop signal so shutdown
//! ends them without waiting out the interval.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use dirmesh_changelog::purge_floor;
use dirmesh_model::ruv::Ruv;

use crate::node::Node;

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// The lowest CSN per rid that trimming must preserve: the local RUV
/// folded with every configured agreement's last known consumer RUV,
/// disabled agreements included.
pub fn trim_floor(node: &Node) -> Ruv {
    let consumers: Vec<Ruv> = node
        .runner()
        .agreements()
        .iter()
        .filter_map(|agmt| agmt.consumer_ruv())
        .collect();
    purge_floor(&node.replica().ruv(), &consumers)
}

/// Trims the changelog every `interval` until shutdown.
pub async fn run_trim_loop(node: Arc<Node>, interval: Duration) {
    let registry = node.runner().registry().clone();
    loop {
        registry.wait_or_stop(interval).await;
        if registry.shutting_down() {
            info!("trim loop stopping");
            return;
        }
        let floor = trim_floor(&node);
        match node.changelog().trim(&floor, unix_now()) {
            Ok(0) => {}
            Ok(trimmed) => info!(trimmed, "changelog trimmed"),
            Err(err) => warn!(error = %err, "changelog trim failed"),
        }
    }
}

/// Runs an incremental pass over every agreement each `interval` until
/// shutdown.
pub async fn run_replication_loop(node: Arc<Node>, interval: Duration) {
    let registry = node.runner().registry().clone();
    loop {
        registry.wait_or_stop(interval).await;
        if registry.shutting_down() {
            info!("replication loop stopping");
            return;
        }
        node.replicate_once().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AgreementConfig, NodeConfig};
    use dirmesh_changelog::{ChangeOp, ChangeRecord};
    use dirmesh_cleanruv::CleanConfig;
    use dirmesh_model::csn::{Csn, ReplicaId};
    use dirmesh_session::Mesh;

    fn rid(id: u16) -> ReplicaId {
        ReplicaId::new(id)
    }

    fn trimming_node(max_entries: u64) -> Arc<Node> {
        let mut config = NodeConfig::default();
        config.replica.purl = format!("ldap://trim-{max_entries}:389");
        config.changelog.max_entries = max_entries;
        config.clean = CleanConfig::fast();
        Node::build(&config, Arc::new(Mesh::new())).unwrap()
    }

    fn seed(node: &Node, n: u16) {
        let base = unix_now() - 500;
        for i in 0..n {
            let csn = Csn::new(base, i, rid(1), 0);
            let rec = ChangeRecord::new(csn, ChangeOp::Add, "cn=x,dc=example,dc=com", vec![], base);
            node.changelog().write(&rec).unwrap();
            node.replica().update_ruv(csn, "ldap://trim:389");
        }
    }

    #[test]
    fn test_trim_floor_respects_lagging_consumer() {
        let mut config = NodeConfig::default();
        config.replica.purl = String::from("ldap://floor:389");
        config.agreements.push(AgreementConfig {
            name: String::from("to-slow"),
            consumer_purl: String::from("ldap://slow:389"),
            bind_dn: String::from("cn=replication manager"),
            enabled: true,
        });
        let node = Node::build(&config, Arc::new(Mesh::new())).unwrap();
        seed(&node, 5);

        let lagging = Csn::new(unix_now() - 500, 1, rid(1), 0);
        let mut consumer_ruv = Ruv::new();
        consumer_ruv.update(lagging, "ldap://slow:389");
        node.runner().agreements()[0].set_consumer_ruv(consumer_ruv);

        let floor = trim_floor(&node);
        assert_eq!(floor.max_csn_for(rid(1)), Some(lagging));
    }

    #[tokio::test]
    async fn test_trim_loop_trims_and_stops_on_shutdown() {
        let node = trimming_node(2);
        seed(&node, 5);
        assert_eq!(node.changelog().entry_count(), 5);

        let handle = tokio::spawn(run_trim_loop(node.clone(), Duration::from_millis(2)));
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while node.changelog().entry_count() > 2 {
            assert!(tokio::time::Instant::now() < deadline, "trim never ran");
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        node.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_replication_loop_stops_on_shutdown() {
        let node = trimming_node(0);
        let handle = tokio::spawn(run_replication_loop(
            node.clone(),
            Duration::from_millis(2),
        ));
        tokio::time::sleep(Duration::from_millis(5)).await;
        node.begin_shutdown();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop did not stop")
            .unwrap();
    }
}
