// src/orchestrator/creator.rs
//! Simulation creation protocol
//!
//! Placement is a bounded retry loop: partition the graph over the IDLE
//! instances, fan out the shards, then on partial failure probe the
//! failed instances, quarantine the unavailable ones, roll back the
//! successful placements, and retry over the shrunken set. A
//! quarantined instance is never contacted again within the same call.

use crate::api::{CreateAgent, CreateShardData};
use crate::orchestrator::backup::{restore_graph, BackupStore};
use crate::orchestrator::client::{InstanceApi, InstanceErrorData};
use crate::orchestrator::partition::partition;
use crate::registry::record::{
    instance_key, simulation_key, FleetRecord, InstanceStatus, SimulationRecord, SimulationStatus,
};
use crate::registry::store::Registry;
use crate::utils::errors::{FleetError, Result};
use futures::future::join_all;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, info, warn};
use ulid::Ulid;

/// Generate a fresh simulation identifier
///
/// The random tail of a ulid, so two ids minted in the same millisecond
/// still differ.
pub fn new_simulation_id() -> String {
    let ulid = Ulid::new().to_string().to_lowercase();
    ulid[ulid.len() - 10..].to_string()
}

/// Runs the quarantine-aware creation protocol
pub struct SimulationCreator {
    registry: Arc<dyn Registry>,
    backup: Arc<dyn BackupStore>,
    instances: Arc<dyn InstanceApi>,
    max_attempts: u32,
}

impl SimulationCreator {
    pub fn new(
        registry: Arc<dyn Registry>,
        backup: Arc<dyn BackupStore>,
        instances: Arc<dyn InstanceApi>,
        max_attempts: u32,
    ) -> Self {
        Self {
            registry,
            backup,
            instances,
            max_attempts,
        }
    }

    /// Create a new simulation from an initial graph
    ///
    /// Either returns a usable simulation id with an ACTIVE record, or
    /// an error with no record written.
    pub async fn create(
        &self,
        agent_code_lines: Vec<String>,
        graph: Vec<CreateAgent>,
    ) -> Result<String> {
        let simulation_id = new_simulation_id();
        info!(
            "Creating simulation '{}' with {} agents",
            simulation_id,
            graph.len()
        );

        // Backup failure aborts before any instance is touched
        self.backup.save(&simulation_id, &graph).await?;

        let available = self.idle_instances().await?;
        self.place(&simulation_id, &agent_code_lines, &graph, available)
            .await?;

        Ok(simulation_id)
    }

    /// Re-create a stopped or broken simulation from its backup
    ///
    /// Runs the same placement protocol under a fresh id; only
    /// identity, type, and connections are restored from the backup.
    pub async fn restart_from_backup(&self, simulation_id: &str) -> Result<String> {
        let record = match self.registry.get(&simulation_key(simulation_id)).await? {
            Some(FleetRecord::Simulation(record)) => record,
            _ => return Err(FleetError::SimulationNotFound(simulation_id.to_string())),
        };

        if record.status == SimulationStatus::Active {
            return Err(FleetError::SimulationException(format!(
                "simulation '{}' is still active",
                simulation_id
            )));
        }

        let backup = self.backup.fetch(simulation_id).await?;
        let graph = restore_graph(&backup)?;

        let new_id = new_simulation_id();
        info!(
            "Restarting simulation '{}' as '{}' with {} agents",
            simulation_id,
            new_id,
            graph.len()
        );

        self.backup.save(&new_id, &graph).await?;
        let available = self.idle_instances().await?;
        self.place(&new_id, &record.agent_code_lines, &graph, available)
            .await?;

        Ok(new_id)
    }

    /// IDLE instance keys, in registry iteration order
    async fn idle_instances(&self) -> Result<Vec<String>> {
        Ok(self
            .registry
            .scan_instances()
            .await?
            .into_iter()
            .filter(|record| record.status == InstanceStatus::Idle)
            .map(|record| record.key)
            .collect())
    }

    /// The bounded placement loop
    async fn place(
        &self,
        simulation_id: &str,
        agent_code_lines: &[String],
        graph: &[CreateAgent],
        mut available: Vec<String>,
    ) -> Result<()> {
        if available.is_empty() {
            return Err(FleetError::NoIdleInstances);
        }

        for attempt in 1..=self.max_attempts {
            counter!("simfleet_create_attempts_total").increment(1);
            debug!(
                "Placement attempt {}/{} over {} instances",
                attempt,
                self.max_attempts,
                available.len()
            );

            let shards = partition(graph, available.len());
            let (succeeded, failed) = self
                .fan_out(simulation_id, agent_code_lines, &available, shards)
                .await;

            if failed.is_empty() {
                let record = SimulationRecord {
                    key: simulation_id.to_string(),
                    status: SimulationStatus::Active,
                    available_instances: available,
                    agent_code_lines: agent_code_lines.to_vec(),
                };
                self.registry
                    .put(&simulation_key(simulation_id), &FleetRecord::Simulation(record))
                    .await?;
                info!("Simulation '{}' placed on attempt {}", simulation_id, attempt);
                return Ok(());
            }

            warn!(
                "Attempt {}: {} of {} placements failed",
                attempt,
                failed.len(),
                available.len()
            );

            self.quarantine_unavailable(&failed, &mut available).await?;
            self.rollback(&succeeded).await;

            if available.is_empty() {
                break;
            }
        }

        Err(FleetError::CreationExhausted {
            attempts: self.max_attempts,
        })
    }

    /// Send every shard to its instance; requests are issued
    /// concurrently within the attempt.
    async fn fan_out(
        &self,
        simulation_id: &str,
        agent_code_lines: &[String],
        available: &[String],
        shards: Vec<Vec<CreateAgent>>,
    ) -> (Vec<String>, Vec<InstanceErrorData>) {
        let mut calls = Vec::with_capacity(available.len());
        for (key, shard) in available.iter().cloned().zip(shards) {
            let payload = CreateShardData {
                simulation_id: simulation_id.to_string(),
                agent_code_lines: agent_code_lines.to_vec(),
                agent_data: shard,
            };
            let api = Arc::clone(&self.instances);
            calls.push(async move {
                let result = api.create_shard(&key, &payload).await;
                (key, result)
            });
        }

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for (key, result) in join_all(calls).await {
            match result {
                Ok(()) => succeeded.push(key),
                Err(err) => failed.push(err),
            }
        }
        (succeeded, failed)
    }

    /// Probe each failed instance; the unavailable ones are removed
    /// from the working set and their registry records deleted, so they
    /// cannot be selected again later in this call.
    async fn quarantine_unavailable(
        &self,
        failed: &[InstanceErrorData],
        available: &mut Vec<String>,
    ) -> Result<()> {
        for err in failed {
            let outcome = self.instances.probe_health(&err.key).await;
            if outcome.is_unavailable() {
                info!(
                    "Quarantining instance '{}' (create failed: {}; probe: {:?})",
                    err.key, err.info, outcome
                );
                counter!("simfleet_quarantined_instances_total").increment(1);
                self.registry.delete(&[instance_key(&err.key)]).await?;
                available.retain(|key| key != &err.key);
            } else {
                debug!(
                    "Instance '{}' failed create but probes healthy, keeping: {}",
                    err.key, err.info
                );
            }
        }
        Ok(())
    }

    /// Delete the shards accepted in a failed attempt so the next
    /// attempt starts from a clean fleet. Best-effort.
    async fn rollback(&self, succeeded: &[String]) {
        for key in succeeded {
            counter!("simfleet_rollback_deletes_total").increment(1);
            if let Err(err) = self.instances.delete_shard(key).await {
                warn!("Rollback delete on '{}' failed: {}", key, err.info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::backup::MemoryBackupStore;
    use crate::orchestrator::client::ProbeOutcome;
    use crate::orchestrator::test_api::{seed_idle_instances, test_graph, FakeCall, FakeInstanceApi};
    use crate::registry::store::MemoryRegistry;

    struct Fixture {
        registry: Arc<MemoryRegistry>,
        backup: Arc<MemoryBackupStore>,
        api: Arc<FakeInstanceApi>,
        creator: SimulationCreator,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(MemoryRegistry::new());
        let backup = Arc::new(MemoryBackupStore::new());
        let api = Arc::new(FakeInstanceApi::default());
        let creator = SimulationCreator::new(
            Arc::clone(&registry) as Arc<dyn Registry>,
            Arc::clone(&backup) as Arc<dyn BackupStore>,
            Arc::clone(&api) as Arc<dyn InstanceApi>,
            3,
        );
        Fixture {
            registry,
            backup,
            api,
            creator,
        }
    }

    async fn simulation_record(registry: &MemoryRegistry, id: &str) -> Option<SimulationRecord> {
        match registry.get(&simulation_key(id)).await.unwrap() {
            Some(FleetRecord::Simulation(record)) => Some(record),
            _ => None,
        }
    }

    #[test]
    fn test_simulation_ids_are_short_and_unique() {
        let a = new_simulation_id();
        let b = new_simulation_id();
        assert_eq!(a.len(), 10);
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_create_succeeds_on_first_attempt() {
        let f = fixture();
        let keys = seed_idle_instances(&f.registry, 10).await;

        let id = f
            .creator
            .create(vec!["code".into()], test_graph(97))
            .await
            .unwrap();

        let record = simulation_record(&f.registry, &id).await.unwrap();
        assert_eq!(record.status, SimulationStatus::Active);
        assert_eq!(record.available_instances, keys);
        assert_eq!(record.agent_code_lines, vec!["code".to_string()]);

        // 97 agents over 10 instances: seven 10s then three 9s
        let sizes: Vec<usize> = f.api.shard_sizes.lock().iter().map(|(_, n)| *n).collect();
        assert_eq!(sizes, vec![10, 10, 10, 10, 10, 10, 10, 9, 9, 9]);

        // One create per instance, no probes, no rollbacks
        for key in &keys {
            assert_eq!(f.api.create_count(key), 1);
            assert_eq!(f.api.delete_count(key), 0);
        }
    }

    #[tokio::test]
    async fn test_unavailable_instance_is_quarantined_and_repartitioned() {
        let f = fixture();
        let keys = seed_idle_instances(&f.registry, 3).await;
        let bad = keys[1].clone();

        f.api.fail_create_once(&bad, ProbeOutcome::Unreachable);
        f.api.set_probe(&bad, ProbeOutcome::Unreachable);

        let id = f
            .creator
            .create(vec!["code".into()], test_graph(97))
            .await
            .unwrap();

        // The quarantined instance is gone from the record and the registry
        let record = simulation_record(&f.registry, &id).await.unwrap();
        assert_eq!(record.available_instances, vec![keys[0].clone(), keys[2].clone()]);
        assert!(f
            .registry
            .get(&instance_key(&bad))
            .await
            .unwrap()
            .is_none());

        // Attempt 2 repartitions 97 agents over 2 instances
        let sizes: Vec<usize> = f
            .api
            .shard_sizes
            .lock()
            .iter()
            .skip(3)
            .map(|(_, n)| *n)
            .collect();
        assert_eq!(sizes, vec![49, 48]);

        // Never re-contacted after quarantine
        assert_eq!(f.api.create_count(&bad), 1);
    }

    #[tokio::test]
    async fn test_rollback_precedes_next_attempt() {
        let f = fixture();
        let keys = seed_idle_instances(&f.registry, 3).await;
        let bad = keys[1].clone();

        f.api.fail_create_once(&bad, ProbeOutcome::Timeout);
        f.api.set_probe(&bad, ProbeOutcome::Timeout);

        f.creator
            .create(vec!["code".into()], test_graph(12))
            .await
            .unwrap();

        // Every attempt-1 success was deleted before any attempt-2 create
        let calls = f.api.calls.lock().clone();
        let second_attempt_start = calls
            .iter()
            .enumerate()
            .filter(|(_, call)| matches!(call, FakeCall::Create(_)))
            .map(|(i, _)| i)
            .nth(3) // the 4th create opens attempt 2
            .expect("no second attempt was made");
        for key in [&keys[0], &keys[2]] {
            let delete_pos = calls
                .iter()
                .position(|call| call == &FakeCall::Delete((*key).clone()))
                .expect("rollback delete missing");
            assert!(delete_pos < second_attempt_start);
        }
    }

    #[tokio::test]
    async fn test_reachable_failure_is_not_excluded() {
        let f = fixture();
        let keys = seed_idle_instances(&f.registry, 2).await;
        let flaky = keys[0].clone();

        // Refuses once, probes healthy, accepts on the retry
        f.api.fail_create_once(&flaky, ProbeOutcome::Rejected);

        let id = f
            .creator
            .create(vec!["code".into()], test_graph(10))
            .await
            .unwrap();

        let record = simulation_record(&f.registry, &id).await.unwrap();
        assert_eq!(record.available_instances, keys);
        assert_eq!(f.api.create_count(&flaky), 2);
        assert!(f
            .registry
            .get(&instance_key(&flaky))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_retry_budget_is_bounded() {
        let f = fixture();
        let keys = seed_idle_instances(&f.registry, 2).await;
        f.api.fail_create_always(&keys[0]);

        let err = f
            .creator
            .create(vec!["code".into()], test_graph(10))
            .await
            .unwrap_err();

        assert!(matches!(err, FleetError::CreationExhausted { attempts: 3 }));
        assert_eq!(f.api.create_count(&keys[0]), 3);
        assert_eq!(f.api.create_count(&keys[1]), 3);

        // No partial simulation record survives
        assert!(f.registry.scan_simulations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_no_idle_instances() {
        let f = fixture();
        let err = f
            .creator
            .create(vec!["code".into()], test_graph(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::NoIdleInstances));
    }

    #[tokio::test]
    async fn test_backup_failure_aborts_before_any_instance_call() {
        struct RefusingBackup;

        #[async_trait::async_trait]
        impl BackupStore for RefusingBackup {
            async fn save(&self, _: &str, _: &[CreateAgent]) -> Result<()> {
                Err(FleetError::BackupPersistenceFailed("full".into()))
            }
            async fn fetch(&self, _: &str) -> Result<Vec<serde_json::Value>> {
                unreachable!()
            }
        }

        let registry = Arc::new(MemoryRegistry::new());
        let api = Arc::new(FakeInstanceApi::default());
        seed_idle_instances(&registry, 2).await;
        let creator = SimulationCreator::new(
            Arc::clone(&registry) as Arc<dyn Registry>,
            Arc::new(RefusingBackup),
            Arc::clone(&api) as Arc<dyn InstanceApi>,
            3,
        );

        let err = creator
            .create(vec!["code".into()], test_graph(5))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::BackupPersistenceFailed(_)));
        assert!(f_calls_empty(&api));
    }

    fn f_calls_empty(api: &FakeInstanceApi) -> bool {
        api.calls.lock().is_empty()
    }

    #[tokio::test]
    async fn test_restart_from_backup() {
        let f = fixture();
        seed_idle_instances(&f.registry, 2).await;

        // A deactivated simulation with a saved backup
        let graph = test_graph(8);
        f.backup.save("old-sim", &graph).await.unwrap();
        let old = SimulationRecord {
            key: "old-sim".into(),
            status: SimulationStatus::Deactivated,
            available_instances: vec![],
            agent_code_lines: vec!["code".into()],
        };
        f.registry
            .put(&simulation_key("old-sim"), &FleetRecord::Simulation(old))
            .await
            .unwrap();

        let new_id = f.creator.restart_from_backup("old-sim").await.unwrap();
        assert_ne!(new_id, "old-sim");

        let record = simulation_record(&f.registry, &new_id).await.unwrap();
        assert_eq!(record.status, SimulationStatus::Active);
        assert_eq!(record.agent_code_lines, vec!["code".to_string()]);
    }

    #[tokio::test]
    async fn test_restart_rejects_active_simulation() {
        let f = fixture();
        let record = SimulationRecord {
            key: "live".into(),
            status: SimulationStatus::Active,
            available_instances: vec!["worker-00".into()],
            agent_code_lines: vec![],
        };
        f.registry
            .put(&simulation_key("live"), &FleetRecord::Simulation(record))
            .await
            .unwrap();

        let err = f.creator.restart_from_backup("live").await.unwrap_err();
        assert!(matches!(err, FleetError::SimulationException(_)));
    }

    #[tokio::test]
    async fn test_restart_unknown_simulation() {
        let f = fixture();
        let err = f.creator.restart_from_backup("nope").await.unwrap_err();
        assert!(matches!(err, FleetError::SimulationNotFound(_)));
    }
}
