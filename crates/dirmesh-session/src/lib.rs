#![warn(missing_docs)]

//! DirMesh session layer: replica objects with exclusive session access,
//! the start/update/end extended-operation protocol, replication
//! agreements, and the in-process delivery mesh

pub mod agreement;
pub mod error;
pub mod extop;
pub mod protocol;
pub mod replica;
pub mod transport;

pub use agreement::{Agreement, SessionDriver, SessionOutcome};
pub use error::SessionError;
pub use extop::{ExtopRequest, ExtopResponse, ResponseCode, SessionFlavor};
pub use protocol::SessionEngine;
pub use replica::Replica;
pub use transport::{Mesh, MeshConfig, PeerNode, UpdateBatch};
