// src/orchestrator/test_api.rs
//! Scripted instance API for protocol tests

use crate::api::{CreateAgent, CreateShardData};
use crate::orchestrator::client::{InstanceApi, InstanceErrorData, ProbeOutcome};
use crate::registry::record::{instance_key, FleetRecord, InstanceRecord};
use crate::registry::store::{MemoryRegistry, Registry};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

/// One recorded call, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FakeCall {
    Create(String),
    Delete(String),
    Probe(String),
}

/// In-memory [`InstanceApi`] with scriptable failures
#[derive(Default)]
pub struct FakeInstanceApi {
    pub calls: Mutex<Vec<FakeCall>>,
    pub shard_sizes: Mutex<Vec<(String, usize)>>,
    create_failures: Mutex<HashMap<String, VecDeque<ProbeOutcome>>>,
    always_fail_create: Mutex<HashSet<String>>,
    probe_outcomes: Mutex<HashMap<String, ProbeOutcome>>,
    delete_failures: Mutex<HashMap<String, u32>>,
}

impl FakeInstanceApi {
    /// Script the next create on `key` to fail with `outcome`
    pub fn fail_create_once(&self, key: &str, outcome: ProbeOutcome) {
        self.create_failures
            .lock()
            .entry(key.to_string())
            .or_default()
            .push_back(outcome);
    }

    /// Script every create on `key` to fail
    pub fn fail_create_always(&self, key: &str) {
        self.always_fail_create.lock().insert(key.to_string());
    }

    /// Script the healthcheck outcome for `key` (default: Ok)
    pub fn set_probe(&self, key: &str, outcome: ProbeOutcome) {
        self.probe_outcomes.lock().insert(key.to_string(), outcome);
    }

    /// Script the next `times` deletes on `key` to fail
    pub fn fail_delete(&self, key: &str, times: u32) {
        self.delete_failures.lock().insert(key.to_string(), times);
    }

    pub fn create_count(&self, key: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, FakeCall::Create(k) if k == key))
            .count()
    }

    pub fn delete_count(&self, key: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|call| matches!(call, FakeCall::Delete(k) if k == key))
            .count()
    }
}

#[async_trait]
impl InstanceApi for FakeInstanceApi {
    async fn create_shard(
        &self,
        key: &str,
        shard: &CreateShardData,
    ) -> Result<(), InstanceErrorData> {
        self.calls.lock().push(FakeCall::Create(key.to_string()));
        self.shard_sizes
            .lock()
            .push((key.to_string(), shard.agent_data.len()));

        if self.always_fail_create.lock().contains(key) {
            return Err(InstanceErrorData {
                key: key.to_string(),
                outcome: ProbeOutcome::Rejected,
                info: "scripted permanent failure".into(),
            });
        }

        if let Some(outcome) = self
            .create_failures
            .lock()
            .get_mut(key)
            .and_then(|queue| queue.pop_front())
        {
            return Err(InstanceErrorData {
                key: key.to_string(),
                outcome,
                info: "scripted failure".into(),
            });
        }

        Ok(())
    }

    async fn delete_shard(&self, key: &str) -> Result<String, InstanceErrorData> {
        self.calls.lock().push(FakeCall::Delete(key.to_string()));

        if let Some(remaining) = self.delete_failures.lock().get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(InstanceErrorData {
                    key: key.to_string(),
                    outcome: ProbeOutcome::Unreachable,
                    info: "scripted delete failure".into(),
                });
            }
        }

        Ok("fake-simulation".to_string())
    }

    async fn probe_health(&self, key: &str) -> ProbeOutcome {
        self.calls.lock().push(FakeCall::Probe(key.to_string()));
        self.probe_outcomes
            .lock()
            .get(key)
            .copied()
            .unwrap_or(ProbeOutcome::Ok)
    }
}

/// Seed `n` IDLE instance records; keys sort in creation order
pub async fn seed_idle_instances(registry: &MemoryRegistry, n: usize) -> Vec<String> {
    let mut keys = Vec::with_capacity(n);
    for i in 0..n {
        let key = format!("worker-{:02}", i);
        registry
            .put(
                &instance_key(&key),
                &FleetRecord::Instance(InstanceRecord::idle(&key)),
            )
            .await
            .unwrap();
        keys.push(key);
    }
    keys
}

/// A graph of `n` minimally-connected agents
pub fn test_graph(n: usize) -> Vec<CreateAgent> {
    (0..n)
        .map(|i| CreateAgent {
            jid: format!("agent_{}", i),
            agent_type: "common".into(),
            connections: if i == 0 {
                vec![]
            } else {
                vec![format!("agent_{}", i - 1)]
            },
        })
        .collect()
}
