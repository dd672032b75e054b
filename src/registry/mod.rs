// src/registry/mod.rs
//! Shared fleet registry
//!
//! One flat key/value namespace holding the two fleet record kinds:
//!
//! - **record**: tagged record types and key-prefix helpers
//! - **store**: the `Registry` contract plus SQLite and in-memory stores

pub mod record;
pub mod store;

pub use record::{
    instance_key, simulation_key, FleetRecord, InstanceRecord, InstanceStatus, SimulationRecord,
    SimulationStatus,
};
pub use store::{MemoryRegistry, Registry, SqliteRegistry};
