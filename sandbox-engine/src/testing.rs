//! In-memory container runtime used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::sandbox::container::{ContainerRuntime, ExecOutput, LineStream};
use crate::sandbox::policy::SecurityPolicy;

/// Scripted behavior of the fake
#[derive(Debug, Clone, Default)]
pub struct FakeBehavior {
    pub runtime_down: bool,
    pub image_missing: bool,
    pub fail_create: bool,
    pub fail_start: bool,
    pub fail_upload: bool,
    pub fail_seeding: bool,
    pub fail_detached: bool,
    /// Detached execs that succeed before the rest fail
    pub fail_detached_after: Option<usize>,
    pub fail_snapshots: bool,
    pub trace_lines: Vec<String>,
    pub packet_lines: Vec<String>,
    /// How long the sample command takes to finish
    pub sample_runtime: Duration,
    pub sample_exit: i32,
    pub stdout: String,
    pub stderr: String,
    /// Size the snapshot script reports before capping
    pub dump_size: u64,
    pub dump_bytes: Vec<u8>,
    pub maps: String,
    pub video_size: u64,
}

#[derive(Debug, Default)]
pub struct FakeState {
    pub live: HashSet<String>,
    pub created: Vec<String>,
    pub removed: Vec<String>,
    pub execs: Vec<String>,
    pub detached: Vec<String>,
    pub written: HashMap<String, Vec<u8>>,
    pub policies: Vec<SecurityPolicy>,
}

pub struct FakeRuntime {
    behavior: FakeBehavior,
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new(behavior: FakeBehavior) -> Self {
        Self {
            behavior,
            state: Mutex::new(FakeState::default()),
        }
    }

    pub fn state(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn snapshot_output(&self, script: &str) -> ExecOutput {
        if self.behavior.fail_snapshots {
            return ExecOutput {
                exit_code: Some(3),
                stdout: String::new(),
                stderr: "cannot read /proc/pid/maps".to_string(),
            };
        }
        let cap: u64 = script
            .split("cap=")
            .nth(1)
            .map(|rest| rest.chars().take_while(|c| c.is_ascii_digit()).collect::<String>())
            .and_then(|digits| digits.parse().ok())
            .unwrap_or(u64::MAX);
        let size = self.behavior.dump_size.min(cap);
        ExecOutput {
            exit_code: Some(0),
            stdout: format!("{} {}\n", size, self.behavior.dump_size),
            stderr: String::new(),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<()> {
        if self.behavior.runtime_down {
            return Err(anyhow!("Cannot connect to the Docker daemon"));
        }
        Ok(())
    }

    async fn image_exists(&self, _image: &str) -> Result<bool> {
        Ok(!self.behavior.image_missing)
    }

    async fn create_container(&self, name: &str, policy: &SecurityPolicy) -> Result<String> {
        if self.behavior.fail_create {
            return Err(anyhow!("Docker create failed: conflict"));
        }
        let mut state = self.state();
        let id = format!("fake-{}-{}", state.created.len(), name);
        state.live.insert(id.clone());
        state.created.push(id.clone());
        state.policies.push(policy.clone());
        Ok(id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        if self.behavior.fail_start {
            return Err(anyhow!("Failed to start container {}: OCI runtime error", container_id));
        }
        Ok(())
    }

    async fn exec(&self, _container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        let joined = cmd.join(" ");
        self.state().execs.push(joined.clone());

        if joined.contains("strace") {
            if !self.behavior.sample_runtime.is_zero() {
                tokio::time::sleep(self.behavior.sample_runtime).await;
            }
            return Ok(ExecOutput {
                exit_code: Some(self.behavior.sample_exit),
                ..Default::default()
            });
        }
        if joined.contains("/proc/$pid/mem") {
            return Ok(self.snapshot_output(&joined));
        }
        if joined.contains("nexus_seed") && self.behavior.fail_seeding {
            return Ok(ExecOutput {
                exit_code: Some(1),
                stderr: "read-only file system".to_string(),
                ..Default::default()
            });
        }
        if joined.contains("stat -c %s") && joined.contains("ffmpeg") {
            return Ok(ExecOutput {
                exit_code: Some(0),
                stdout: format!("{}\n", self.behavior.video_size),
                ..Default::default()
            });
        }

        Ok(ExecOutput {
            exit_code: Some(0),
            ..Default::default()
        })
    }

    async fn exec_detached(&self, _container_id: &str, cmd: &[String]) -> Result<()> {
        let mut state = self.state();
        let exhausted = self
            .behavior
            .fail_detached_after
            .map_or(false, |limit| state.detached.len() >= limit);
        if self.behavior.fail_detached || exhausted {
            return Err(anyhow!("Detached exec failed"));
        }
        state.detached.push(cmd.join(" "));
        Ok(())
    }

    async fn stream_lines(&self, _container_id: &str, cmd: &[String]) -> Result<LineStream> {
        let lines = if cmd.join(" ").contains("tcpdump") {
            self.behavior.packet_lines.clone()
        } else {
            self.behavior.trace_lines.clone()
        };
        let (tx, rx) = mpsc::channel(lines.len().max(1));
        for line in lines {
            tx.try_send(line)?;
        }
        Ok(LineStream::from_receiver(rx))
    }

    async fn write_file(&self, _container_id: &str, path: &str, data: &[u8], _mode: u32) -> Result<()> {
        if self.behavior.fail_upload && path.starts_with("/sandbox/input") {
            return Err(anyhow!("Failed to write {}: no space left on device", path));
        }
        self.state().written.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn read_file(&self, _container_id: &str, path: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let mut data = if path.ends_with("stdout.log") {
            self.behavior.stdout.clone().into_bytes()
        } else if path.ends_with("stderr.log") {
            self.behavior.stderr.clone().into_bytes()
        } else if path.contains("/maps_") {
            self.behavior.maps.clone().into_bytes()
        } else if path.ends_with(".raw") {
            self.behavior.dump_bytes.clone()
        } else {
            self.state()
                .written
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("No such file: {}", path))?
        };
        data.truncate(max_bytes as usize);
        Ok(data)
    }

    async fn kill_process_group(&self, _container_id: &str, pgid_file: &str) -> Result<()> {
        self.state().execs.push(format!("kill-group {}", pgid_file));
        Ok(())
    }

    async fn kill_processes(&self, _container_id: &str) -> Result<()> {
        self.state().execs.push("kill-all".to_string());
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        let mut state = self.state();
        state.live.remove(container_id);
        state.removed.push(container_id.to_string());
        Ok(())
    }
}
