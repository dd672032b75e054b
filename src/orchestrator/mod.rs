// src/orchestrator/mod.rs
//! Load-balancing control plane
//!
//! Partitions a simulation graph across the fleet's IDLE workers and
//! runs the multi-attempt creation/deletion protocol around it:
//!
//! - **partition**: near-equal shard math
//! - **creator**: creation/restart with quarantine and rollback
//! - **fleet**: deletion, self-report ingestion, degradation, snapshot
//! - **client**: per-instance HTTP calls with outcome classification
//! - **backup**: graph backup collaborator seam
//! - **server**: the REST surface

pub mod backup;
pub mod client;
pub mod creator;
pub mod fleet;
pub mod partition;
pub mod server;

#[cfg(test)]
pub(crate) mod test_api;

pub use backup::{BackupStore, HttpBackupStore, MemoryBackupStore};
pub use client::{HttpInstanceClient, InstanceApi, InstanceErrorData, ProbeOutcome};
pub use creator::SimulationCreator;
pub use fleet::FleetService;
pub use partition::partition;
pub use server::OrchestratorServer;
