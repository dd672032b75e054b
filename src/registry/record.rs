// src/registry/record.rs
//! Registry record types
//!
//! The registry holds exactly two record kinds under one namespace.
//! They are kept distinguishable two ways: a `kind` discriminator in
//! the encoded payload, and disjoint key prefixes (`instance/`,
//! `simulation/`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Key prefix for instance records
pub const INSTANCE_PREFIX: &str = "instance/";

/// Key prefix for simulation records
pub const SIMULATION_PREFIX: &str = "simulation/";

/// Registry key for an instance identity
pub fn instance_key(key: &str) -> String {
    format!("{}{}", INSTANCE_PREFIX, key)
}

/// Registry key for a simulation id
pub fn simulation_key(id: &str) -> String {
    format!("{}{}", SIMULATION_PREFIX, id)
}

/// Lifecycle status of a worker instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceStatus {
    Idle,
    Starting,
    Running,
    Dead,
}

impl InstanceStatus {
    /// DEAD behaves like IDLE for scheduling purposes but is reported
    /// distinctly for observability.
    pub fn can_start(&self) -> bool {
        matches!(self, InstanceStatus::Idle | InstanceStatus::Dead)
    }
}

/// Lifecycle status of a simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SimulationStatus {
    Active,
    Broken,
    Deactivated,
}

/// Self-reported state of one worker instance
///
/// Written by the instance on every announcement tick, read by the
/// orchestrator. Deleted only when the orchestrator judges the instance
/// unreachable during a creation attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceRecord {
    /// Stable worker identity
    pub key: String,
    pub status: InstanceStatus,
    pub simulation_id: Option<String>,
    pub num_agents: u32,
    pub broken_agents: BTreeSet<String>,
    pub api_memory_usage_mib: f64,
    pub simulation_memory_usage_mib: f64,
    #[serde(default = "Utc::now")]
    pub reported_at: DateTime<Utc>,
}

impl InstanceRecord {
    /// Fresh record for a worker that has not run anything yet
    pub fn idle(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            status: InstanceStatus::Idle,
            simulation_id: None,
            num_agents: 0,
            broken_agents: BTreeSet::new(),
            api_memory_usage_mib: 0.0,
            simulation_memory_usage_mib: 0.0,
            reported_at: Utc::now(),
        }
    }
}

/// Control-plane record of one simulation
///
/// Created by the orchestrator on a successful create; transitions to
/// BROKEN instead of being removed when self-healing fails, so the
/// failure history stays inspectable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationRecord {
    /// Simulation identifier (opaque short string)
    pub key: String,
    pub status: SimulationStatus,
    /// Instance keys holding a shard, in placement order
    pub available_instances: Vec<String>,
    /// Opaque agent code blob, passed through unchanged
    pub agent_code_lines: Vec<String>,
}

/// Tagged union stored in the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FleetRecord {
    Instance(InstanceRecord),
    Simulation(SimulationRecord),
}

impl FleetRecord {
    /// Registry key this record lives under
    pub fn registry_key(&self) -> String {
        match self {
            FleetRecord::Instance(r) => instance_key(&r.key),
            FleetRecord::Simulation(r) => simulation_key(&r.key),
        }
    }
}
