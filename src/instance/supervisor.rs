// src/instance/supervisor.rs
//! Simulation subprocess supervision
//!
//! The shard of agents executes in a fully separate OS process so a
//! crash or CPU-bound stall in the simulation cannot block the
//! supervising control logic. The spawn handover is filesystem-based:
//! agent code and agent data are written to a per-simulation directory
//! and the runner finds them through environment variables.

use crate::api::CreateAgent;
use crate::utils::errors::{FleetError, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

/// Configuration for launching the simulation runner
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Runner executable
    pub command: String,

    /// Arguments passed before the environment handover
    pub args: Vec<String>,

    /// Root directory for per-simulation spawn files
    pub work_dir: PathBuf,
}

/// Handle to one running simulation subprocess
#[derive(Debug)]
pub struct SimulationProcess {
    pub pid: u32,
    pub child: Child,
}

/// Spawns and terminates simulation subprocesses
pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    /// Spawn the runner for one shard
    ///
    /// stdout is piped to the update pipeline; stderr stays attached to
    /// the service's own output.
    pub async fn spawn(
        &self,
        simulation_id: &str,
        agent_code_lines: &[String],
        agent_data: &[CreateAgent],
    ) -> Result<SimulationProcess> {
        let dir = self.config.work_dir.join(simulation_id);
        fs::create_dir_all(&dir).await.map_err(|e| {
            FleetError::ProcessSpawnFailed(format!("Failed to create spawn dir: {}", e))
        })?;

        let code_path = dir.join("agent_code.py");
        fs::write(&code_path, agent_code_lines.join("\n"))
            .await
            .map_err(|e| {
                FleetError::ProcessSpawnFailed(format!("Failed to write agent code: {}", e))
            })?;

        let data_path = dir.join("agent_data.json");
        let encoded = serde_json::to_vec(agent_data).map_err(|e| {
            FleetError::ProcessSpawnFailed(format!("Failed to encode agent data: {}", e))
        })?;
        fs::write(&data_path, encoded).await.map_err(|e| {
            FleetError::ProcessSpawnFailed(format!("Failed to write agent data: {}", e))
        })?;

        debug!(
            "Spawning runner '{}' for simulation '{}' ({} agents)",
            self.config.command,
            simulation_id,
            agent_data.len()
        );

        let child = Command::new(&self.config.command)
            .args(&self.config.args)
            .current_dir(&dir)
            .env("SIMFLEET_SIMULATION_ID", simulation_id)
            .env("SIMFLEET_AGENT_CODE", &code_path)
            .env("SIMFLEET_AGENT_DATA", &data_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| FleetError::ProcessSpawnFailed(format!("Failed to spawn runner: {}", e)))?;

        let pid = child
            .id()
            .ok_or_else(|| FleetError::ProcessSpawnFailed("Runner exited before start".into()))?;

        info!("Runner spawned with PID {}", pid);

        Ok(SimulationProcess { pid, child })
    }

    /// Forcefully terminate a subprocess
    ///
    /// SIGKILL, unconditional: from the supervisor's point of view this
    /// always succeeds. ESRCH just means the process is already gone.
    pub fn terminate(&self, pid: u32) {
        debug!("Sending SIGKILL to PID {}", pid);
        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
            if e != Errno::ESRCH {
                warn!("Failed to SIGKILL PID {}: {}", pid, e);
            }
        }
    }
}

/// Resident memory of a process in MiB, 0.0 when unreadable
pub fn resident_memory_mib(pid: u32) -> f64 {
    let status = match std::fs::read_to_string(format!("/proc/{}/status", pid)) {
        Ok(status) => status,
        Err(_) => return 0.0,
    };

    for line in status.lines() {
        if let Some(rest) = line.strip_prefix("VmRSS:") {
            let kb: f64 = rest
                .trim()
                .trim_end_matches("kB")
                .trim()
                .parse()
                .unwrap_or(0.0);
            return kb / 1024.0;
        }
    }

    0.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supervisor(dir: &tempfile::TempDir) -> ProcessSupervisor {
        ProcessSupervisor::new(SupervisorConfig {
            command: "sleep".into(),
            args: vec!["30".into()],
            work_dir: dir.path().to_path_buf(),
        })
    }

    #[tokio::test]
    async fn test_spawn_writes_handover_files() {
        let dir = tempfile::tempdir().unwrap();
        let agents = vec![CreateAgent {
            jid: "agent_0".into(),
            agent_type: "common".into(),
            connections: vec![],
        }];

        let mut process = supervisor(&dir)
            .spawn("sim-1", &["line1".into(), "line2".into()], &agents)
            .await
            .unwrap();

        let code = std::fs::read_to_string(dir.path().join("sim-1/agent_code.py")).unwrap();
        assert_eq!(code, "line1\nline2");
        let data = std::fs::read_to_string(dir.path().join("sim-1/agent_data.json")).unwrap();
        let parsed: Vec<CreateAgent> = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed, agents);

        process.child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn test_terminate_kills_the_runner() {
        let dir = tempfile::tempdir().unwrap();
        let sup = supervisor(&dir);
        let mut process = sup.spawn("sim-1", &[], &[]).await.unwrap();

        sup.terminate(process.pid);
        let status = process.child.wait().await.unwrap();
        assert!(!status.success());

        // Terminating again is harmless
        sup.terminate(process.pid);
    }

    #[tokio::test]
    async fn test_spawn_unknown_command() {
        let dir = tempfile::tempdir().unwrap();
        let sup = ProcessSupervisor::new(SupervisorConfig {
            command: "definitely-not-a-command".into(),
            args: vec![],
            work_dir: dir.path().to_path_buf(),
        });

        let err = sup.spawn("sim-1", &[], &[]).await.unwrap_err();
        assert!(matches!(err, FleetError::ProcessSpawnFailed(_)));
    }

    #[test]
    fn test_resident_memory_of_self() {
        let mib = resident_memory_mib(std::process::id());
        assert!(mib > 0.0);
    }

    #[test]
    fn test_resident_memory_of_missing_pid() {
        assert_eq!(resident_memory_mib(u32::MAX - 1), 0.0);
    }
}
