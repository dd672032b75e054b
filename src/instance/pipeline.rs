// src/instance/pipeline.rs
//! Update pipeline between the simulation subprocess and the fleet
//!
//! The subprocess talks to its supervisor through two unidirectional,
//! unbounded queues: per-agent update events and aggregate status
//! events. A demultiplexer feeds them from the child's stdout, and two
//! independent reader tasks drain them until they see a sentinel.
//!
//! Per-agent ordering is preserved by the single agent-update reader;
//! there is no global ordering across agents, and delivery to the
//! broker is at-most-once.

use crate::registry::record::InstanceStatus;
use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// One queued element: real data, or the poison pill that stops a reader
#[derive(Debug, Clone, PartialEq)]
pub enum QueueItem<T> {
    Data(T),
    Sentinel,
}

/// Per-agent update event, opaque apart from the owning agent id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentUpdate {
    pub jid: String,
    pub payload: serde_json::Value,
}

/// Aggregate status event reported by the subprocess
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: InstanceStatus,
    pub num_agents: u32,
    #[serde(default)]
    pub broken_agents: BTreeSet<String>,
}

/// One line of subprocess output, routed by its channel tag
#[derive(Debug, Deserialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
enum RunnerEvent {
    AgentUpdate(AgentUpdate),
    Status(StatusUpdate),
}

/// Unbounded queue with observable depth
///
/// The send half; counters are shared with the receiver so the kill
/// drain can poll emptiness without consuming items.
pub struct UpdateQueue<T> {
    tx: mpsc::UnboundedSender<QueueItem<T>>,
    pushed: Arc<AtomicU64>,
    popped: Arc<AtomicU64>,
}

impl<T> Clone for UpdateQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            pushed: Arc::clone(&self.pushed),
            popped: Arc::clone(&self.popped),
        }
    }
}

/// The receive half of an [`UpdateQueue`]
pub struct UpdateQueueReceiver<T> {
    rx: mpsc::UnboundedReceiver<QueueItem<T>>,
    popped: Arc<AtomicU64>,
}

/// Create a connected queue pair
pub fn update_queue<T>() -> (UpdateQueue<T>, UpdateQueueReceiver<T>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let pushed = Arc::new(AtomicU64::new(0));
    let popped = Arc::new(AtomicU64::new(0));
    (
        UpdateQueue {
            tx,
            pushed: Arc::clone(&pushed),
            popped: Arc::clone(&popped),
        },
        UpdateQueueReceiver { rx, popped },
    )
}

impl<T> UpdateQueue<T> {
    pub fn push(&self, item: T) {
        if self.tx.send(QueueItem::Data(item)).is_ok() {
            self.pushed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Insert the poison pill that stops the reader task
    pub fn push_sentinel(&self) {
        if self.tx.send(QueueItem::Sentinel).is_ok() {
            self.pushed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn len(&self) -> u64 {
        self.pushed
            .load(Ordering::Relaxed)
            .saturating_sub(self.popped.load(Ordering::Relaxed))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> UpdateQueueReceiver<T> {
    pub async fn recv(&mut self) -> Option<QueueItem<T>> {
        let item = self.rx.recv().await;
        if item.is_some() {
            self.popped.fetch_add(1, Ordering::Relaxed);
        }
        item
    }
}

/// External message broker for per-agent update events
///
/// The real broker lives outside this crate; events are keyed by agent
/// identifier so per-key ordering survives downstream.
#[async_trait]
pub trait UpdateBroker: Send + Sync {
    async fn publish(&self, simulation_id: &str, update: AgentUpdate) -> Result<()>;
}

/// Broker that only logs, for development and tests
pub struct LogBroker;

#[async_trait]
impl UpdateBroker for LogBroker {
    async fn publish(&self, simulation_id: &str, update: AgentUpdate) -> Result<()> {
        debug!("[{}] update for agent '{}'", simulation_id, update.jid);
        Ok(())
    }
}

/// Route subprocess output lines into the two queues
///
/// Lines that do not parse as tagged events are runner chatter and are
/// ignored. The task ends at EOF, which follows the subprocess dying.
pub fn spawn_demux<R>(
    output: R,
    agent_queue: UpdateQueue<AgentUpdate>,
    status_queue: UpdateQueue<StatusUpdate>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match serde_json::from_str::<RunnerEvent>(&line) {
                    Ok(RunnerEvent::AgentUpdate(update)) => agent_queue.push(update),
                    Ok(RunnerEvent::Status(update)) => status_queue.push(update),
                    Err(_) => trace!("Ignoring runner output: {}", line),
                },
                Ok(None) => break,
                Err(e) => {
                    warn!("Error reading subprocess output: {}", e);
                    break;
                }
            }
        }
        debug!("Subprocess output demultiplexer finished");
    })
}

/// Drain the agent-update queue into the broker until the sentinel
pub fn spawn_agent_reader(
    mut rx: UpdateQueueReceiver<AgentUpdate>,
    broker: Arc<dyn UpdateBroker>,
    simulation_id: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Some(QueueItem::Data(update)) => {
                    if let Err(e) = broker.publish(&simulation_id, update).await {
                        warn!("Failed to publish agent update: {}", e);
                    }
                }
                Some(QueueItem::Sentinel) | None => break,
            }
        }
        debug!("Agent update reader stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingBroker {
        published: Mutex<Vec<(String, AgentUpdate)>>,
    }

    #[async_trait]
    impl UpdateBroker for RecordingBroker {
        async fn publish(&self, simulation_id: &str, update: AgentUpdate) -> Result<()> {
            self.published
                .lock()
                .push((simulation_id.to_string(), update));
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_queue_depth_tracking() {
        let (queue, mut rx) = update_queue::<u32>();
        assert!(queue.is_empty());

        queue.push(1);
        queue.push(2);
        assert_eq!(queue.len(), 2);

        assert_eq!(rx.recv().await, Some(QueueItem::Data(1)));
        assert_eq!(queue.len(), 1);
        assert_eq!(rx.recv().await, Some(QueueItem::Data(2)));
        assert!(queue.is_empty());

        queue.push_sentinel();
        assert!(!queue.is_empty());
        assert_eq!(rx.recv().await, Some(QueueItem::Sentinel));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_agent_reader_stops_at_sentinel() {
        let (queue, rx) = update_queue();
        let broker = Arc::new(RecordingBroker {
            published: Mutex::new(Vec::new()),
        });

        let handle = spawn_agent_reader(rx, Arc::clone(&broker) as Arc<dyn UpdateBroker>, "sim-1".into());

        queue.push(AgentUpdate {
            jid: "a1".into(),
            payload: serde_json::json!({"susceptibility": 61.5}),
        });
        queue.push(AgentUpdate {
            jid: "a2".into(),
            payload: serde_json::json!({}),
        });
        queue.push_sentinel();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("reader did not stop at sentinel")
            .unwrap();

        let published = broker.published.lock();
        assert_eq!(published.len(), 2);
        assert_eq!(published[0].0, "sim-1");
        assert_eq!(published[0].1.jid, "a1");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_demux_routes_tagged_lines() {
        let output: &[u8] = concat!(
            "{\"channel\":\"agent_update\",\"jid\":\"a1\",\"payload\":{\"state\":\"believer\"}}\n",
            "runner chatter that is not json\n",
            "{\"channel\":\"status\",\"status\":\"RUNNING\",\"num_agents\":12,\"broken_agents\":[]}\n",
        )
        .as_bytes();

        let (agent_queue, mut agent_rx) = update_queue();
        let (status_queue, mut status_rx) = update_queue();

        spawn_demux(output, agent_queue, status_queue)
            .await
            .unwrap();

        match agent_rx.recv().await {
            Some(QueueItem::Data(update)) => assert_eq!(update.jid, "a1"),
            other => panic!("unexpected item: {:?}", other),
        }
        match status_rx.recv().await {
            Some(QueueItem::Data(update)) => {
                assert_eq!(update.status, InstanceStatus::Running);
                assert_eq!(update.num_agents, 12);
            }
            other => panic!("unexpected item: {:?}", other),
        }
    }

    #[test]
    fn test_status_update_broken_agents_default() {
        let update: StatusUpdate =
            serde_json::from_str("{\"channel\":\"status\",\"status\":\"RUNNING\",\"num_agents\":3}")
                .unwrap();
        assert!(update.broken_agents.is_empty());
    }
}
