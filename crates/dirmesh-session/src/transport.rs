//! In-process mesh: request/response delivery between replica nodes.
//!
//! Nodes register under their purl and answer extended operations
//! synchronously; the mesh runs each call on the blocking pool under a
//! deadline. Reachability can be faulted per peer, which is how tests
//! exercise the unreachable-peer paths without a network.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tracing::debug;

use dirmesh_changelog::ChangeRecord;

use crate::error::SessionError;
use crate::extop::{ExtopRequest, ExtopResponse};

/// A node reachable through the mesh.
pub trait PeerNode: Send + Sync + 'static {
    /// Answers one extended operation.
    fn handle_extop(&self, req: ExtopRequest) -> ExtopResponse;

    /// Applies a batch of updates from the session holder.
    fn apply_updates(&self, batch: UpdateBatch) -> Result<(), SessionError>;
}

/// One batch of change records shipped inside a session.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    /// Replicated subtree root.
    pub root: String,
    /// Purl of the supplier shipping the batch.
    pub supplier_purl: String,
    /// Connection the session runs on; must match the token holder.
    pub conn_id: u64,
    /// The change records, in CSN order.
    pub records: Vec<ChangeRecord>,
}

/// Mesh delivery tuning.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Peer call deadline in milliseconds (default: 5000).
    pub response_timeout_ms: u64,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: 5000,
        }
    }
}

struct PeerEntry {
    node: Arc<dyn PeerNode>,
    reachable: bool,
}

/// Registry of nodes keyed by purl.
pub struct Mesh {
    peers: DashMap<String, PeerEntry>,
    config: MeshConfig,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesh {
    /// A mesh with default delivery tuning.
    pub fn new() -> Self {
        Self::with_config(MeshConfig::default())
    }

    /// A mesh with explicit delivery tuning.
    pub fn with_config(config: MeshConfig) -> Self {
        Mesh {
            peers: DashMap::new(),
            config,
        }
    }

    /// Registers `node` under `purl`, replacing any previous entry.
    pub fn register(&self, purl: &str, node: Arc<dyn PeerNode>) {
        debug!(purl = %purl, "peer registered");
        self.peers.insert(
            purl.to_string(),
            PeerEntry {
                node,
                reachable: true,
            },
        );
    }

    /// Removes the node registered under `purl`.
    pub fn unregister(&self, purl: &str) -> bool {
        self.peers.remove(purl).is_some()
    }

    /// Faults or restores delivery to one peer.
    pub fn set_unreachable(&self, purl: &str, unreachable: bool) {
        if let Some(mut entry) = self.peers.get_mut(purl) {
            entry.reachable = !unreachable;
        }
    }

    /// Liveness probe: the peer is registered and reachable.
    pub fn ping(&self, purl: &str) -> bool {
        self.peers.get(purl).map(|e| e.reachable).unwrap_or(false)
    }

    /// Purls of every registered peer.
    pub fn peers(&self) -> Vec<String> {
        self.peers.iter().map(|e| e.key().clone()).collect()
    }

    fn node_for(&self, purl: &str) -> Result<Arc<dyn PeerNode>, SessionError> {
        let entry = self.peers.get(purl).ok_or_else(|| SessionError::Unreachable {
            purl: purl.to_string(),
        })?;
        if !entry.reachable {
            return Err(SessionError::Unreachable {
                purl: purl.to_string(),
            });
        }
        Ok(entry.node.clone())
    }

    /// Delivers an extended operation to `purl` and waits for the answer.
    pub async fn send_extop(
        &self,
        purl: &str,
        req: ExtopRequest,
    ) -> Result<ExtopResponse, SessionError> {
        let node = self.node_for(purl)?;
        let handle = tokio::task::spawn_blocking(move || node.handle_extop(req));
        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(join)) => Err(SessionError::Internal(join.to_string())),
            Err(_) => Err(SessionError::Timeout {
                purl: purl.to_string(),
            }),
        }
    }

    /// Delivers a batch of session updates to `purl`.
    pub async fn send_updates(
        &self,
        purl: &str,
        batch: UpdateBatch,
    ) -> Result<(), SessionError> {
        let node = self.node_for(purl)?;
        let handle = tokio::task::spawn_blocking(move || node.apply_updates(batch));
        let timeout = Duration::from_millis(self.config.response_timeout_ms);
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join)) => Err(SessionError::Internal(join.to_string())),
            Err(_) => Err(SessionError::Timeout {
                purl: purl.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extop::ResponseCode;

    struct EchoPeer {
        delay_ms: u64,
    }

    impl PeerNode for EchoPeer {
        fn handle_extop(&self, req: ExtopRequest) -> ExtopResponse {
            if self.delay_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.delay_ms));
            }
            ExtopResponse::with_payload(ResponseCode::Ready, req.payload)
        }

        fn apply_updates(&self, _batch: UpdateBatch) -> Result<(), SessionError> {
            Ok(())
        }
    }

    fn req() -> ExtopRequest {
        ExtopRequest::new("1.2.3", 1, 1, "cn=s", b"ping".to_vec())
    }

    #[tokio::test]
    async fn test_roundtrip() {
        let mesh = Mesh::new();
        mesh.register("ldap://a:389", Arc::new(EchoPeer { delay_ms: 0 }));
        let resp = mesh.send_extop("ldap://a:389", req()).await.unwrap();
        assert_eq!(resp.code, ResponseCode::Ready);
        assert_eq!(resp.payload, b"ping");
    }

    #[tokio::test]
    async fn test_unknown_peer_is_unreachable() {
        let mesh = Mesh::new();
        let err = mesh.send_extop("ldap://nowhere:389", req()).await.unwrap_err();
        assert!(matches!(err, SessionError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn test_faulted_peer_is_unreachable() {
        let mesh = Mesh::new();
        mesh.register("ldap://a:389", Arc::new(EchoPeer { delay_ms: 0 }));
        mesh.set_unreachable("ldap://a:389", true);
        assert!(!mesh.ping("ldap://a:389"));
        let err = mesh.send_extop("ldap://a:389", req()).await.unwrap_err();
        assert!(matches!(err, SessionError::Unreachable { .. }));
        // And back.
        mesh.set_unreachable("ldap://a:389", false);
        assert!(mesh.ping("ldap://a:389"));
        assert!(mesh.send_extop("ldap://a:389", req()).await.is_ok());
    }

    #[tokio::test]
    async fn test_slow_peer_times_out() {
        let mesh = Mesh::with_config(MeshConfig {
            response_timeout_ms: 20,
        });
        mesh.register("ldap://slow:389", Arc::new(EchoPeer { delay_ms: 500 }));
        let err = mesh.send_extop("ldap://slow:389", req()).await.unwrap_err();
        assert!(matches!(err, SessionError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_unregister() {
        let mesh = Mesh::new();
        mesh.register("ldap://a:389", Arc::new(EchoPeer { delay_ms: 0 }));
        assert!(mesh.unregister("ldap://a:389"));
        assert!(!mesh.unregister("ldap://a:389"));
        assert!(!mesh.ping("ldap://a:389"));
    }
}
