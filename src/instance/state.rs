// src/instance/state.rs
//! Per-worker instance state machine
//!
//! IDLE → STARTING (create accepted) → RUNNING (first subprocess
//! report) → IDLE (explicit delete) or DEAD (liveness probe found the
//! subprocess gone). DEAD schedules like IDLE but is reported
//! distinctly.
//!
//! Every mutating operation serializes on one mutex: this is a
//! single-writer state machine, transition correctness over throughput.

use crate::api::CreateAgent;
use crate::instance::pipeline::{
    self, AgentUpdate, QueueItem, StatusUpdate, UpdateBroker, UpdateQueue, UpdateQueueReceiver,
};
use crate::instance::supervisor::{resident_memory_mib, ProcessSupervisor, SimulationProcess};
use crate::registry::record::{InstanceRecord, InstanceStatus};
use crate::utils::errors::{FleetError, Result};
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long to wait for the killed subprocess to be reaped
const REAP_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll step while draining the update queues
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

struct StateFields {
    status: InstanceStatus,
    simulation_id: Option<String>,
    num_agents: u32,
    broken_agents: BTreeSet<String>,
    process: Option<SimulationProcess>,
    agent_queue: Option<UpdateQueue<AgentUpdate>>,
    status_queue: Option<UpdateQueue<StatusUpdate>>,
}

impl StateFields {
    fn reset(&mut self, status: InstanceStatus) {
        self.status = status;
        self.simulation_id = None;
        self.num_agents = 0;
        self.broken_agents.clear();
        self.process = None;
        self.agent_queue = None;
        self.status_queue = None;
    }
}

/// The instance's supervised simulation state
pub struct InstanceState {
    supervisor: ProcessSupervisor,
    broker: Arc<dyn UpdateBroker>,
    drain_grace: Duration,
    /// Handle to ourselves for the status reader task
    me: Weak<InstanceState>,
    inner: Mutex<StateFields>,
}

impl InstanceState {
    pub fn new(
        supervisor: ProcessSupervisor,
        broker: Arc<dyn UpdateBroker>,
        drain_grace: Duration,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            supervisor,
            broker,
            drain_grace,
            me: me.clone(),
            inner: Mutex::new(StateFields {
                status: InstanceStatus::Idle,
                simulation_id: None,
                num_agents: 0,
                broken_agents: BTreeSet::new(),
                process: None,
                agent_queue: None,
                status_queue: None,
            }),
        })
    }

    /// Accept a shard: spawn the subprocess and wire up the pipeline
    ///
    /// Allowed only from IDLE/DEAD.
    pub async fn start(
        &self,
        simulation_id: String,
        agent_code_lines: Vec<String>,
        agent_data: Vec<CreateAgent>,
    ) -> Result<()> {
        let mut fields = self.inner.lock().await;

        if !fields.status.can_start() {
            return Err(FleetError::SimulationException(format!(
                "simulation already running (status {:?})",
                fields.status
            )));
        }

        let mut process = self
            .supervisor
            .spawn(&simulation_id, &agent_code_lines, &agent_data)
            .await?;
        let stdout = process
            .child
            .stdout
            .take()
            .ok_or_else(|| FleetError::ProcessSpawnFailed("Runner stdout not captured".into()))?;

        let (agent_queue, agent_rx) = pipeline::update_queue();
        let (status_queue, status_rx) = pipeline::update_queue();

        pipeline::spawn_demux(stdout, agent_queue.clone(), status_queue.clone());
        pipeline::spawn_agent_reader(agent_rx, Arc::clone(&self.broker), simulation_id.clone());
        if let Some(state) = self.me.upgrade() {
            spawn_status_reader(status_rx, state);
        }

        info!(
            "Simulation '{}' starting with {} agents (PID {})",
            simulation_id,
            agent_data.len(),
            process.pid
        );

        fields.status = InstanceStatus::Starting;
        fields.simulation_id = Some(simulation_id);
        fields.num_agents = agent_data.len() as u32;
        fields.broken_agents.clear();
        fields.process = Some(process);
        fields.agent_queue = Some(agent_queue);
        fields.status_queue = Some(status_queue);

        Ok(())
    }

    /// Stop the simulation: hard-kill the subprocess, drain the queues,
    /// poison the readers, reset to IDLE
    ///
    /// Returns the simulation id that was running. Fails when no
    /// subprocess exists.
    pub async fn kill(&self) -> Result<String> {
        let mut fields = self.inner.lock().await;

        let mut process = fields
            .process
            .take()
            .ok_or_else(|| FleetError::SimulationException("no simulation subprocess to kill".into()))?;
        let simulation_id = fields.simulation_id.clone().unwrap_or_default();

        self.supervisor.terminate(process.pid);
        match tokio::time::timeout(REAP_TIMEOUT, process.child.wait()).await {
            Ok(Ok(status)) => debug!("Runner exited with {}", status),
            Ok(Err(e)) => error!("Error waiting for runner: {}", e),
            Err(_) => warn!("Runner did not exit within the reap timeout"),
        }

        // The subprocess may still have been flushing events when
        // killed; give the queues a bounded chance to empty before the
        // poison pills go in. Trailing events can still be lost.
        self.drain_queues(&fields).await;
        if let Some(queue) = &fields.agent_queue {
            queue.push_sentinel();
        }
        if let Some(queue) = &fields.status_queue {
            queue.push_sentinel();
        }

        fields.reset(InstanceStatus::Idle);
        info!("Simulation '{}' stopped", simulation_id);

        Ok(simulation_id)
    }

    async fn drain_queues(&self, fields: &StateFields) {
        let deadline = tokio::time::Instant::now() + self.drain_grace;
        loop {
            let empty = fields.agent_queue.as_ref().map_or(true, |q| q.is_empty())
                && fields.status_queue.as_ref().map_or(true, |q| q.is_empty());
            if empty {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!("Drain grace period elapsed, trailing events may be dropped");
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Apply a status report from the subprocess
    ///
    /// Rejected while IDLE; a report after kill is stale by definition.
    pub async fn update_active_state(
        &self,
        status: InstanceStatus,
        num_agents: u32,
        broken_agents: BTreeSet<String>,
    ) -> Result<()> {
        let mut fields = self.inner.lock().await;

        if fields.status == InstanceStatus::Idle {
            return Err(FleetError::SimulationException(
                "instance is idle, no active simulation".into(),
            ));
        }

        fields.status = status;
        fields.num_agents = num_agents;
        fields.broken_agents = broken_agents;
        Ok(())
    }

    /// Periodic probe: a subprocess that died without an explicit
    /// delete moves the instance to DEAD
    ///
    /// The only transition not driven by an API call; it is how silent
    /// crashes are surfaced. IDLE can never become DEAD because there
    /// is no subprocess handle to find dead.
    pub async fn verify_liveness(&self) {
        let mut fields = self.inner.lock().await;

        let Some(process) = fields.process.as_mut() else {
            return;
        };

        let exited = match process.child.try_wait() {
            Ok(Some(status)) => {
                warn!("Runner (PID {}) exited unexpectedly with {}", process.pid, status);
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Failed to poll runner: {}", e);
                false
            }
        };

        if exited {
            // Whatever the readers have not consumed dies with the
            // subprocess; stop them and surface DEAD
            if let Some(queue) = &fields.agent_queue {
                queue.push_sentinel();
            }
            if let Some(queue) = &fields.status_queue {
                queue.push_sentinel();
            }
            fields.reset(InstanceStatus::Dead);
        }
    }

    /// Resident memory of the simulation subprocess, 0.0 when none
    pub async fn memory_usage(&self) -> f64 {
        let fields = self.inner.lock().await;
        fields
            .process
            .as_ref()
            .map_or(0.0, |process| resident_memory_mib(process.pid))
    }

    pub async fn status(&self) -> InstanceStatus {
        self.inner.lock().await.status
    }

    /// Snapshot for the periodic self-report
    pub async fn current_record(&self, key: &str) -> InstanceRecord {
        let fields = self.inner.lock().await;
        InstanceRecord {
            key: key.to_string(),
            status: fields.status,
            simulation_id: fields.simulation_id.clone(),
            num_agents: fields.num_agents,
            broken_agents: fields.broken_agents.clone(),
            api_memory_usage_mib: resident_memory_mib(std::process::id()),
            simulation_memory_usage_mib: fields
                .process
                .as_ref()
                .map_or(0.0, |process| resident_memory_mib(process.pid)),
            reported_at: Utc::now(),
        }
    }
}

/// Drain the status queue into the state machine until the sentinel
fn spawn_status_reader(
    mut rx: UpdateQueueReceiver<StatusUpdate>,
    state: Arc<InstanceState>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Some(QueueItem::Data(update)) => {
                    if let Err(e) = state
                        .update_active_state(update.status, update.num_agents, update.broken_agents)
                        .await
                    {
                        debug!("Dropping stale status update: {}", e);
                    }
                }
                Some(QueueItem::Sentinel) | None => break,
            }
        }
        debug!("Status reader stopped");
    })
}
