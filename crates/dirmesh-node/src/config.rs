//! Node configuration: replica identity, changelog trim policy, session
//! and retirement tuning, and the outbound agreements. Loaded from a
//! JSON file whose path the binary takes from argv.

use std::path::Path;

use serde::{Deserialize, Serialize};

use dirmesh_changelog::ChangelogConfig;
use dirmesh_cleanruv::CleanConfig;

/// Identity and policy of the local replica.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Replica id; writable replicas use 1..=65534.
    pub rid: u16,
    /// Replicated subtree root.
    pub root: String,
    /// This node's purl, also its key in the mesh.
    pub purl: String,
    /// Whether the replica accepts local writes.
    pub updatable: bool,
    /// Disables the clock-skew ceiling in the CSN generator.
    pub ignore_time_skew: bool,
    /// Seconds after which a session holder is asked to yield; 0 disables.
    pub release_timeout_secs: u64,
    /// Identities allowed to start sessions; empty allows any.
    pub update_dns: Vec<String>,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        ReplicaConfig {
            rid: 1,
            root: String::from("dc=example,dc=com"),
            purl: String::from("ldap://localhost:389"),
            updatable: true,
            ignore_time_skew: false,
            release_timeout_secs: 0,
            update_dns: Vec::new(),
        }
    }
}

/// One outbound replication agreement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgreementConfig {
    /// Agreement name, used in logs.
    pub name: String,
    /// The consumer's purl.
    pub consumer_purl: String,
    /// Identity this node binds as when supplying.
    pub bind_dn: String,
    /// Disabled agreements are configured but never scheduled.
    pub enabled: bool,
}

/// Everything one node needs to run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeConfig {
    /// Local replica identity and policy.
    pub replica: ReplicaConfig,
    /// Changelog trim policy.
    pub changelog: ChangelogConfig,
    /// Clean and abort task tuning.
    pub clean: CleanConfig,
    /// Outbound agreements.
    pub agreements: Vec<AgreementConfig>,
    /// Seconds between incremental replication passes; 0 disables the loop.
    pub replicate_interval_secs: u64,
}

impl NodeConfig {
    /// Loads a configuration from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: NodeConfig = serde_json::from_str(&contents)?;
        Ok(config)
    }
}
