#![warn(missing_docs)]

//! DirMesh rid retirement: distributed CleanAllRUV and abort tasks that
//! remove a decommissioned replica's id from every RUV and changelog in
//! the mesh, with persisted markers so interrupted tasks resume after a
//! restart

pub mod abort;
pub mod admin;
pub mod config;
pub mod error;
pub mod handlers;
pub mod marker;
pub mod registry;
pub mod task;

pub use admin::{TaskDispatcher, TaskEntry, TaskHandle, TaskKind, TaskStatus};
pub use config::CleanConfig;
pub use error::CleanError;
pub use handlers::CleanExtopHandler;
pub use marker::{AbortMarker, CleanMarker, MarkerStore};
pub use registry::RidRegistry;
pub use task::{CleanOutcome, CleanRunner};
