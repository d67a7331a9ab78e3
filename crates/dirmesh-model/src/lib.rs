#![warn(missing_docs)]

//! DirMesh replication model: change sequence numbers, CSN generation, replica update vectors

pub mod csn;
pub mod csngen;
pub mod error;
pub mod ruv;

pub use csn::{Csn, ReplicaId};
pub use csngen::CsnGenerator;
pub use error::ModelError;
pub use ruv::Ruv;
