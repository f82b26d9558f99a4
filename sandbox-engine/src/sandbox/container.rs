/// Container management for sandbox isolation
///
/// This module handles Docker container lifecycle management for secure execution
/// of potentially malicious samples in isolated environments. The orchestrator
/// talks to the runtime through [`ContainerRuntime`]; [`DockerCli`] implements it
/// by driving the `docker` binary.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::policy::SecurityPolicy;

/// Output of a command run inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Live line stream from a long-running command inside a container.
/// Dropping the stream stops the reader and kills the command.
pub struct LineStream {
    lines: mpsc::Receiver<String>,
    reader: Option<JoinHandle<()>>,
}

impl LineStream {
    pub fn from_receiver(lines: mpsc::Receiver<String>) -> Self {
        Self { lines, reader: None }
    }

    pub async fn next_line(&mut self) -> Option<String> {
        self.lines.recv().await
    }
}

impl Drop for LineStream {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Operations the orchestrator needs from a single-host container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check that the runtime daemon is reachable
    async fn ping(&self) -> Result<()>;

    async fn image_exists(&self, image: &str) -> Result<bool>;

    /// Create (but do not start) a container with the policy applied
    async fn create_container(&self, name: &str, policy: &SecurityPolicy) -> Result<String>;

    async fn start_container(&self, container_id: &str) -> Result<()>;

    /// Run a command to completion
    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput>;

    /// Start a command in the background without waiting for it
    async fn exec_detached(&self, container_id: &str, cmd: &[String]) -> Result<()>;

    /// Start a command and stream its stdout line by line
    async fn stream_lines(&self, container_id: &str, cmd: &[String]) -> Result<LineStream>;

    async fn write_file(&self, container_id: &str, path: &str, data: &[u8], mode: u32) -> Result<()>;

    /// Read at most `max_bytes` of a file
    async fn read_file(&self, container_id: &str, path: &str, max_bytes: u64) -> Result<Vec<u8>>;

    /// Kill the process group whose id is stored in `pgid_file`
    async fn kill_process_group(&self, container_id: &str, pgid_file: &str) -> Result<()>;

    /// Kill every process of the sandbox user except the container's init
    async fn kill_processes(&self, container_id: &str) -> Result<()>;

    /// Force-remove the container together with its tmpfs mounts
    async fn remove_container(&self, container_id: &str) -> Result<()>;
}

/// Drives the `docker` CLI
pub struct DockerCli {
    binary: String,
    work_dir: PathBuf,
    /// Seccomp profile written for each live container
    profiles: Mutex<HashMap<String, PathBuf>>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        std::fs::create_dir_all(&work_dir)
            .with_context(|| format!("Failed to create work dir {}", work_dir.display()))?;

        Ok(Self {
            binary: binary.into(),
            work_dir,
            profiles: Mutex::new(HashMap::new()),
        })
    }

    fn command(&self) -> Command {
        Command::new(&self.binary)
    }

    /// Arguments for `docker create`, excluding the binary itself
    pub fn create_args(name: &str, policy: &SecurityPolicy, seccomp_profile: &str) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "create".into(),
            "--name".into(),
            name.into(),
            "--hostname".into(),
            policy.hostname.clone(),
            "--user".into(),
            policy.user.clone(),
            "--label".into(),
            "nexus.sandbox=1".into(),
        ];

        if policy.read_only_rootfs {
            args.push("--read-only".into());
        }

        for mount in &policy.mounts {
            args.push("--tmpfs".into());
            args.push(mount.to_tmpfs_arg());
        }

        if policy.no_new_privileges {
            args.push("--security-opt".into());
            args.push("no-new-privileges:true".into());
        }
        args.push("--security-opt".into());
        args.push(format!("seccomp={}", seccomp_profile));

        if policy.cap_drop_all {
            args.push("--cap-drop".into());
            args.push("ALL".into());
        }
        for cap in &policy.cap_add {
            args.push("--cap-add".into());
            args.push(cap.as_docker_name().into());
        }

        args.push("--network".into());
        args.push(policy.network_mode.as_docker_name().into());

        args.push("--memory".into());
        args.push(policy.limits.memory_bytes.to_string());
        args.push("--memory-swap".into());
        args.push(policy.limits.memory_swap_bytes.to_string());
        args.push("--cpus".into());
        args.push(format!("{:.2}", policy.limits.nano_cpus as f64 / 1e9));
        args.push("--pids-limit".into());
        args.push(policy.limits.pids_limit.to_string());

        for (key, value) in &policy.env {
            args.push("--env".into());
            args.push(format!("{}={}", key, value));
        }

        // Keep the container alive; samples and helpers run through exec
        args.push(policy.image.clone());
        args.push("sleep".into());
        args.push("infinity".into());
        args
    }

    async fn run_checked(&self, args: &[&str], what: &str) -> Result<String> {
        let output = self
            .command()
            .args(args)
            .output()
            .await
            .with_context(|| format!("Failed to {}", what))?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Failed to {}: {}", what, error.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn ping(&self) -> Result<()> {
        let version = self
            .run_checked(&["version", "--format", "{{.Server.Version}}"], "reach docker daemon")
            .await?;
        debug!("Docker daemon version {}", version);
        Ok(())
    }

    async fn image_exists(&self, image: &str) -> Result<bool> {
        let output = self
            .command()
            .args(["image", "inspect", "--format", "{{.Id}}", image])
            .output()
            .await
            .context("Failed to inspect image")?;
        Ok(output.status.success())
    }

    async fn create_container(&self, name: &str, policy: &SecurityPolicy) -> Result<String> {
        info!("Creating sandbox container {} from image {}", name, policy.image);

        let profile_path = self.work_dir.join(format!("seccomp-{}.json", name));
        let profile = serde_json::to_vec_pretty(&policy.syscall_filter.to_profile())?;
        tokio::fs::write(&profile_path, profile)
            .await
            .with_context(|| format!("Failed to write seccomp profile {}", profile_path.display()))?;

        let args = Self::create_args(name, policy, &profile_path.to_string_lossy());
        debug!("Docker create args: {:?}", args);

        let output = self
            .command()
            .args(&args)
            .output()
            .await
            .context("Failed to create container")?;

        if !output.status.success() {
            let _ = tokio::fs::remove_file(&profile_path).await;
            let error = String::from_utf8_lossy(&output.stderr);
            error!("Failed to create container: {}", error);
            return Err(anyhow!("Docker create failed: {}", error.trim()));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        self.profiles
            .lock()
            .await
            .insert(container_id.clone(), profile_path);

        Ok(container_id)
    }

    async fn start_container(&self, container_id: &str) -> Result<()> {
        debug!("Starting container: {}", container_id);
        self.run_checked(&["start", container_id], "start container")
            .await
            .map(|_| ())
    }

    async fn exec(&self, container_id: &str, cmd: &[String]) -> Result<ExecOutput> {
        debug!("Executing in container {}: {:?}", container_id, cmd);

        let output = self
            .command()
            .arg("exec")
            .arg(container_id)
            .args(cmd)
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute command in container")?;

        Ok(ExecOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn exec_detached(&self, container_id: &str, cmd: &[String]) -> Result<()> {
        let output = self
            .command()
            .args(["exec", "-d", container_id])
            .args(cmd)
            .output()
            .await
            .context("Failed to start detached command")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Detached exec failed: {}", error.trim()));
        }
        Ok(())
    }

    async fn stream_lines(&self, container_id: &str, cmd: &[String]) -> Result<LineStream> {
        let mut child = self
            .command()
            .arg("exec")
            .arg(container_id)
            .args(cmd)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .context("Failed to start stream command")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("Stream command has no stdout"))?;

        let (tx, rx) = mpsc::channel(1024);
        let reader = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        if tx.send(line).await.is_err() {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Stream read failed: {}", e);
                        break;
                    }
                }
            }
            let _ = child.kill().await;
        });

        Ok(LineStream {
            lines: rx,
            reader: Some(reader),
        })
    }

    async fn write_file(&self, container_id: &str, path: &str, data: &[u8], mode: u32) -> Result<()> {
        let script = format!(
            "mkdir -p \"$(dirname \"$1\")\" && cat > \"$1\" && chmod {:o} \"$1\"",
            mode
        );
        let mut child = self
            .command()
            .args(["exec", "-i", container_id, "sh", "-c", script.as_str(), "write", path])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to start file upload")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Upload command has no stdin"))?;
        stdin
            .write_all(data)
            .await
            .context("Failed to stream file into container")?;
        drop(stdin);

        let output = child
            .wait_with_output()
            .await
            .context("Failed to finish file upload")?;
        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Failed to write {}: {}", path, error.trim()));
        }
        Ok(())
    }

    async fn read_file(&self, container_id: &str, path: &str, max_bytes: u64) -> Result<Vec<u8>> {
        let limit = max_bytes.to_string();
        let output = self
            .command()
            .args(["exec", container_id, "head", "-c", limit.as_str(), path])
            .output()
            .await
            .context("Failed to read file from container")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Failed to read {}: {}", path, error.trim()));
        }
        Ok(output.stdout)
    }

    async fn kill_process_group(&self, container_id: &str, pgid_file: &str) -> Result<()> {
        let output = self
            .command()
            .args([
                "exec",
                container_id,
                "sh",
                "-c",
                "kill -KILL -- -\"$(cat \"$1\")\"",
                "kill-group",
                pgid_file,
            ])
            .output()
            .await
            .context("Failed to kill sample process group")?;

        if !output.status.success() {
            let error = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Failed to kill process group from {}: {}", pgid_file, error.trim()));
        }
        Ok(())
    }

    async fn kill_processes(&self, container_id: &str) -> Result<()> {
        // kill -1 skips init, which keeps the container alive for collection
        let output = self
            .command()
            .args(["exec", container_id, "kill", "-KILL", "-1"])
            .output()
            .await
            .context("Failed to kill sandbox processes")?;

        if !output.status.success() {
            debug!(
                "kill -1 reported: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    async fn remove_container(&self, container_id: &str) -> Result<()> {
        info!("Removing container: {}", container_id);

        let result = self
            .run_checked(&["rm", "-f", "-v", container_id], "remove container")
            .await;

        if let Some(profile) = self.profiles.lock().await.remove(container_id) {
            if let Err(e) = tokio::fs::remove_file(&profile).await {
                warn!("Failed to remove seccomp profile {}: {}", profile.display(), e);
            }
        }

        result.map(|_| ())
    }
}

impl Drop for DockerCli {
    fn drop(&mut self) {
        if let Ok(profiles) = self.profiles.try_lock() {
            if !profiles.is_empty() {
                warn!("Docker runtime dropped with {} live containers", profiles.len());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::policy::SecurityPolicyBuilder;
    use crate::sandbox::SandboxConfig;

    fn policy(capture_network: bool) -> SecurityPolicy {
        let config = SandboxConfig {
            capture_network,
            memory_limit_bytes: 256 * 1024 * 1024,
            ..Default::default()
        };
        SecurityPolicyBuilder::new("sandbox-linux:test", "sandbox-windows:test")
            .build(&config)
            .unwrap()
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn test_create_args_apply_hardening() {
        let args = DockerCli::create_args("nexus-sandbox-test", &policy(false), "/tmp/seccomp.json");

        assert_eq!(args[0], "create");
        assert!(args.contains(&"--read-only".to_string()));
        assert!(has_pair(&args, "--cap-drop", "ALL"));
        assert!(has_pair(&args, "--cap-add", "SYS_PTRACE"));
        assert!(!has_pair(&args, "--cap-add", "NET_RAW"));
        assert!(has_pair(&args, "--network", "none"));
        assert!(has_pair(&args, "--security-opt", "no-new-privileges:true"));
        assert!(has_pair(&args, "--security-opt", "seccomp=/tmp/seccomp.json"));
        assert!(has_pair(&args, "--memory", "268435456"));
        assert!(has_pair(&args, "--pids-limit", "256"));
        assert!(has_pair(&args, "--user", "sandbox"));
        assert_eq!(args.iter().filter(|a| *a == "--tmpfs").count(), 5);
        assert_eq!(&args[args.len() - 3..], ["sandbox-linux:test", "sleep", "infinity"]);
    }

    #[test]
    fn test_create_args_with_capture() {
        let args = DockerCli::create_args("nexus-sandbox-test", &policy(true), "/tmp/seccomp.json");
        assert!(has_pair(&args, "--network", "bridge"));
        assert!(has_pair(&args, "--cap-add", "NET_RAW"));
        assert!(has_pair(&args, "--cap-add", "NET_ADMIN"));
    }

    #[tokio::test]
    async fn test_line_stream_from_receiver() {
        let (tx, rx) = mpsc::channel(4);
        let mut stream = LineStream::from_receiver(rx);
        tx.send("first".to_string()).await.unwrap();
        drop(tx);
        assert_eq!(stream.next_line().await.as_deref(), Some("first"));
        assert_eq!(stream.next_line().await, None);
    }
}
