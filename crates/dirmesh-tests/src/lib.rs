//! DirMesh cross-crate scenarios.
//!
//! This crate holds the tests that need more than one DirMesh crate at
//! once: ordering and merge laws over CSNs and RUVs, changelog replay
//! and export round-trips, session mutual exclusion, and mesh-wide rid
//! retirement with aborts and restart resume. The harness assembles
//! real nodes over the in-process mesh.

pub mod changelog_flows;
pub mod cleanruv_flows;
pub mod harness;
pub mod model_laws;
pub mod session_flows;

pub use harness::{abort_entry, clean_entry, purl, wait_until, TestMesh, ROOT, SEED_BASE};
