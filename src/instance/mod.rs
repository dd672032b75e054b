// src/instance/mod.rs
//! Per-worker instance service
//!
//! Supervises one simulation subprocess at a time:
//!
//! - **state**: the IDLE/STARTING/RUNNING/DEAD machine
//! - **supervisor**: subprocess spawn/terminate and memory probing
//! - **pipeline**: the two update queues, demultiplexer, and readers
//! - **reporter**: periodic self-report and liveness loops
//! - **server**: the worker's REST surface

pub mod pipeline;
pub mod reporter;
pub mod server;
pub mod state;
pub mod supervisor;

pub use pipeline::{AgentUpdate, LogBroker, StatusUpdate, UpdateBroker, UpdateQueue};
pub use reporter::{spawn_liveness_loop, spawn_report_loop, ReporterConfig};
pub use server::InstanceServer;
pub use state::InstanceState;
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
