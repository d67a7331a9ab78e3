#![warn(missing_docs)]

//! DirMesh changelog subsystem: append-mostly per-operation log keyed by CSN,
//! replay iteration for peers, age/count trimming, LDIF import/export

pub mod error;
pub mod iter;
pub mod kv;
pub mod ldif;
pub mod record;
pub mod store;
pub mod trim;

pub use error::ChangelogError;
pub use iter::ReplayCursor;
pub use kv::{LogStore, MemoryLogStore};
pub use record::{ChangeOp, ChangeRecord};
pub use store::{ChangeLog, ChangelogConfig, LogState};
pub use trim::purge_floor;
