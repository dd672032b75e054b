// src/orchestrator/fleet.rs
//! Fleet-level simulation operations
//!
//! Everything the orchestrator exposes besides creation: deletion with
//! its own bounded retry, self-report ingestion with degradation
//! handling, and the fleet snapshot.

use crate::api::{CreateSimulationData, FleetSnapshot};
use crate::orchestrator::backup::BackupStore;
use crate::orchestrator::client::InstanceApi;
use crate::orchestrator::creator::SimulationCreator;
use crate::registry::record::{
    instance_key, simulation_key, FleetRecord, InstanceRecord, InstanceStatus, SimulationStatus,
};
use crate::registry::store::Registry;
use crate::utils::errors::{FleetError, Result};
use futures::future::join_all;
use metrics::{counter, gauge};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The orchestrator's service layer
pub struct FleetService {
    registry: Arc<dyn Registry>,
    instances: Arc<dyn InstanceApi>,
    creator: SimulationCreator,
    max_attempts: u32,
}

impl FleetService {
    pub fn new(
        registry: Arc<dyn Registry>,
        backup: Arc<dyn BackupStore>,
        instances: Arc<dyn InstanceApi>,
        max_attempts: u32,
    ) -> Self {
        let creator = SimulationCreator::new(
            Arc::clone(&registry),
            backup,
            Arc::clone(&instances),
            max_attempts,
        );
        Self {
            registry,
            instances,
            creator,
            max_attempts,
        }
    }

    pub async fn create_simulation(&self, data: CreateSimulationData) -> Result<String> {
        self.creator.create(data.agent_code_lines, data.graph).await
    }

    pub async fn restart_simulation(&self, simulation_id: &str) -> Result<String> {
        self.creator.restart_from_backup(simulation_id).await
    }

    /// Stop a simulation on every instance that holds a shard of it
    ///
    /// Only the failed subset is retried. If any instance still fails
    /// after the attempt budget, the record is marked BROKEN and the
    /// error is retryable; otherwise the record becomes DEACTIVATED.
    pub async fn delete_simulation(&self, simulation_id: &str) -> Result<()> {
        let key = simulation_key(simulation_id);
        let mut record = match self.registry.get(&key).await? {
            Some(FleetRecord::Simulation(record)) => record,
            _ => return Err(FleetError::SimulationNotFound(simulation_id.to_string())),
        };

        if record.status == SimulationStatus::Deactivated {
            debug!("Simulation '{}' already deactivated", simulation_id);
            return Ok(());
        }

        let mut pending = record.available_instances.clone();
        for attempt in 1..=self.max_attempts {
            if pending.is_empty() {
                break;
            }
            debug!(
                "Deletion attempt {}/{} over {} instances",
                attempt,
                self.max_attempts,
                pending.len()
            );

            let calls = pending.iter().cloned().map(|key| {
                let api = Arc::clone(&self.instances);
                async move { (key.clone(), api.delete_shard(&key).await) }
            });

            pending = join_all(calls)
                .await
                .into_iter()
                .filter_map(|(key, result)| match result {
                    Ok(_) => None,
                    Err(err) => {
                        warn!("Delete on '{}' failed: {}", key, err.info);
                        Some(key)
                    }
                })
                .collect();
        }

        if pending.is_empty() {
            record.status = SimulationStatus::Deactivated;
            self.registry
                .put(&key, &FleetRecord::Simulation(record))
                .await?;
            info!("Simulation '{}' deactivated", simulation_id);
            Ok(())
        } else {
            warn!(
                "Simulation '{}' still held by {:?} after {} attempts, marking broken",
                simulation_id, pending, self.max_attempts
            );
            record.status = SimulationStatus::Broken;
            record.available_instances.clear();
            self.registry
                .put(&key, &FleetRecord::Simulation(record))
                .await?;
            Err(FleetError::DeletionIncomplete {
                attempts: self.max_attempts,
            })
        }
    }

    /// Ingest a worker self-report
    ///
    /// The record is persisted verbatim. A report carrying broken
    /// agents while the worker claims STARTING/RUNNING degrades the
    /// whole simulation it belongs to.
    pub async fn handle_instance_report(&self, record: InstanceRecord) -> Result<()> {
        let degraded = !record.broken_agents.is_empty()
            && matches!(
                record.status,
                InstanceStatus::Starting | InstanceStatus::Running
            );

        self.registry
            .put(
                &instance_key(&record.key),
                &FleetRecord::Instance(record.clone()),
            )
            .await?;

        if degraded {
            if let Some(simulation_id) = record.simulation_id.as_deref() {
                warn!(
                    "Instance '{}' reports {} broken agents, degrading simulation '{}'",
                    record.key,
                    record.broken_agents.len(),
                    simulation_id
                );
                self.degrade_simulation(simulation_id).await?;
            }
        }

        Ok(())
    }

    /// Tear down every shard of a degraded simulation and mark the
    /// record BROKEN. Instance deletes are best-effort; failures are
    /// logged, not retried.
    async fn degrade_simulation(&self, simulation_id: &str) -> Result<()> {
        counter!("simfleet_degraded_simulations_total").increment(1);

        let holders: Vec<String> = self
            .registry
            .scan_instances()
            .await?
            .into_iter()
            .filter(|record| record.simulation_id.as_deref() == Some(simulation_id))
            .map(|record| record.key)
            .collect();

        let calls = holders.iter().cloned().map(|key| {
            let api = Arc::clone(&self.instances);
            async move { (key.clone(), api.delete_shard(&key).await) }
        });
        for (key, result) in join_all(calls).await {
            if let Err(err) = result {
                warn!("Degradation delete on '{}' failed: {}", key, err.info);
            }
        }

        let key = simulation_key(simulation_id);
        if let Some(FleetRecord::Simulation(mut record)) = self.registry.get(&key).await? {
            record.status = SimulationStatus::Broken;
            record.available_instances.clear();
            self.registry
                .put(&key, &FleetRecord::Simulation(record))
                .await?;
        }

        Ok(())
    }

    /// Point-in-time view of every instance and simulation
    pub async fn snapshot(&self) -> Result<FleetSnapshot> {
        let mut instances = Vec::new();
        let mut simulations = Vec::new();
        for (_, record) in self.registry.scan().await? {
            match record {
                FleetRecord::Instance(r) => instances.push(r),
                FleetRecord::Simulation(r) => simulations.push(r),
            }
        }

        gauge!("simfleet_registered_instances").set(instances.len() as f64);
        gauge!("simfleet_registered_simulations").set(simulations.len() as f64);

        Ok(FleetSnapshot {
            instances,
            simulations,
        })
    }
}
