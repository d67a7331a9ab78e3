#![warn(missing_docs)]

//! DirMesh node assembly: configuration, the extended-operation router
//! wiring the session engine and the rid-retirement handlers together,
//! and the background maintenance loops

pub mod config;
pub mod maintenance;
pub mod node;

pub use config::{AgreementConfig, NodeConfig, ReplicaConfig};
pub use node::Node;
