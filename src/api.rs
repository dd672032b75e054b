// src/api.rs
//! HTTP wire types shared by the orchestrator and instance services
//!
//! The wire format is JSON throughout; none of these shapes are a
//! compatibility contract, they just have to agree between the two
//! sides of the orchestrator/instance boundary.

use crate::registry::record::{InstanceRecord, InstanceStatus, SimulationRecord};
use serde::{Deserialize, Serialize};

/// One node of the initial social graph
///
/// `agent_type` is an opaque discriminator resolved by the simulation
/// model's agent factory; the control plane passes it through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateAgent {
    pub jid: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub connections: Vec<String>,
}

/// `POST /simulations` request body (client → orchestrator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateSimulationData {
    pub agent_code_lines: Vec<String>,
    pub graph: Vec<CreateAgent>,
}

/// `POST /simulations` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatedSimulation {
    pub simulation_id: String,
}

/// `POST /simulation` request body (orchestrator → instance)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShardData {
    pub simulation_id: String,
    pub agent_code_lines: Vec<String>,
    pub agent_data: Vec<CreateAgent>,
}

/// `DELETE /simulation` response body (instance → orchestrator)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletedShard {
    pub simulation_id: String,
}

/// `GET /healthcheck` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Healthcheck {
    pub status: InstanceStatus,
}

/// `GET /simulations` response body: a point-in-time view of the fleet
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetSnapshot {
    pub instances: Vec<InstanceRecord>,
    pub simulations: Vec<SimulationRecord>,
}

/// Error body returned by both services
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub detail: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_agent_type_field() {
        let agent = CreateAgent {
            jid: "agent_1".into(),
            agent_type: "common".into(),
            connections: vec!["agent_2".into()],
        };
        let json = serde_json::to_value(&agent).unwrap();
        // The discriminator travels as "type" on the wire
        assert_eq!(json["type"], "common");

        let back: CreateAgent = serde_json::from_value(json).unwrap();
        assert_eq!(back, agent);
    }

    #[test]
    fn test_shard_payload_roundtrip() {
        let data = CreateShardData {
            simulation_id: "abc123".into(),
            agent_code_lines: vec!["line".into()],
            agent_data: vec![],
        };
        let json = serde_json::to_string(&data).unwrap();
        let back: CreateShardData = serde_json::from_str(&json).unwrap();
        assert_eq!(back.simulation_id, "abc123");
    }
}
