/// Sandbox run coordination
///
/// [`SandboxOrchestrator::execute_sample`] drives one run end to end: policy,
/// container launch, anti-evasion seeding, sample staging, concurrent
/// monitoring, the exit/timeout race, collection and teardown. The container
/// is released on every exit path, including caller cancellation.

use chrono::{DateTime, Utc};
use futures::future::OptionFuture;
use futures::join;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::anti_evasion::{AntiEvasionEngine, AntiEvasionTier};
use super::container::{ContainerRuntime, ExecOutput, LineStream};
use super::mitre::MitreMapper;
use super::monitor::{BehaviorMonitor, MonitorOutput};
use super::policy::{SecurityPolicy, SecurityPolicyBuilder, SANDBOX_USER};
use super::trace::{StreamKind, TraceHub};
use super::video::{self, VideoRecorder};
use super::{BehaviorEvent, EventKind, ExecutionReport, OsType, SampleSource, SandboxConfig};
use crate::config::RuntimeConfig;
use crate::error::SandboxError;
use crate::memory::{MemoryCaptureController, MemoryDump};

/// Largest stdout/stderr capture kept in the report
const MAX_OUTPUT_BYTES: u64 = 1024 * 1024;
const MAX_SAMPLE_NAME_LEN: usize = 128;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    Provisioning,
    Seeding,
    Staging,
    Running,
    Collecting,
    TearingDown,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: Uuid,
    pub container_id: Option<String>,
    pub phase: SessionPhase,
    pub sample_name: String,
    pub started_at: DateTime<Utc>,
}

/// Runs in flight, keyed by session id. Owned by one orchestrator and shared
/// by handle.
#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, SessionInfo>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, session_id: Uuid, apply: impl FnOnce(&mut SessionInfo)) {
        let mut sessions = self.sessions.write().unwrap_or_else(|e| e.into_inner());
        if let Some(info) = sessions.get_mut(&session_id) {
            apply(info);
        }
    }

    /// Register a run; the entry is removed when the guard drops
    pub fn register(&self, session_id: Uuid, sample_name: &str) -> SessionGuard {
        let info = SessionInfo {
            session_id,
            container_id: None,
            phase: SessionPhase::Provisioning,
            sample_name: sample_name.to_string(),
            started_at: Utc::now(),
        };
        self.sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(session_id, info);

        SessionGuard {
            registry: self.clone(),
            session_id,
        }
    }

    pub fn set_phase(&self, session_id: Uuid, phase: SessionPhase) {
        debug!(session_id = %session_id, ?phase, "Session phase");
        self.update(session_id, |info| info.phase = phase);
    }

    pub fn set_container(&self, session_id: Uuid, container_id: &str) {
        self.update(session_id, |info| info.container_id = Some(container_id.to_string()));
    }

    pub fn get(&self, session_id: Uuid) -> Option<SessionInfo> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&session_id)
            .cloned()
    }

    /// Snapshot of active runs, oldest first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct SessionGuard {
    registry: SessionRegistry,
    session_id: Uuid,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.registry
            .sessions
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.session_id);
    }
}

/// Keep only characters that are safe inside a quoted shell word and a path
fn sanitize_sample_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .take(MAX_SAMPLE_NAME_LEN)
        .collect();
    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "sample".to_string()
    } else {
        cleaned.to_string()
    }
}

/// In-container paths for one run
#[derive(Debug, Clone)]
struct RunLayout {
    root: String,
    memory: String,
    screenshots: String,
    syscalls: String,
    stdout: String,
    stderr: String,
    video: String,
    stop_marker: String,
    /// Process group id of the launched sample
    pgid: String,
    sample: String,
}

impl RunLayout {
    fn new(session_id: Uuid, sample_name: &str) -> Self {
        let root = format!("/sandbox/output/{}", session_id);
        Self {
            memory: format!("/sandbox/output/memory/{}", session_id),
            screenshots: format!("/sandbox/output/screenshots/{}", session_id),
            syscalls: format!("{}/syscalls.log", root),
            stdout: format!("{}/stdout.log", root),
            stderr: format!("{}/stderr.log", root),
            video: format!("{}/recording.mp4", root),
            stop_marker: format!("{}/stop_simulation", root),
            pgid: format!("{}/sample.pgid", root),
            sample: format!("/sandbox/input/{}", sanitize_sample_name(sample_name)),
            root,
        }
    }

    /// Shell command that runs the sample under strace with output captured to files.
    /// The sample gets its own session so a timeout can kill it without touching
    /// the trace followers or the recorder.
    fn launch_command(&self, os_type: OsType, with_display: bool) -> Vec<String> {
        let target = match os_type {
            OsType::Linux => format!("'{}'", self.sample),
            OsType::Windows => format!("wine '{}'", self.sample),
        };
        let display = if with_display {
            format!("export DISPLAY={}; ", video::DISPLAY)
        } else {
            String::new()
        };
        let script = format!(
            "cd /sandbox/input && chmod +x '{sample}' && {display}exec setsid -w sh -c 'echo $$ > \"$0\" && exec \"$@\"' '{pgid}' \
             strace -f -ttt -s 256 -o '{trace}' {target} > '{stdout}' 2> '{stderr}'",
            sample = self.sample,
            display = display,
            pgid = self.pgid,
            trace = self.syscalls,
            target = target,
            stdout = self.stdout,
            stderr = self.stderr,
        );
        vec!["sh".to_string(), "-c".to_string(), script]
    }
}

async fn remove_with_timeout(
    runtime: &dyn ContainerRuntime,
    container_id: &str,
    timeout: Duration,
) {
    match tokio::time::timeout(timeout, runtime.remove_container(container_id)).await {
        Ok(Ok(())) => info!(container_id = %container_id, "Sandbox container released"),
        Ok(Err(e)) => error!(container_id = %container_id, "Failed to remove container: {:#}", e),
        Err(_) => error!(
            container_id = %container_id,
            "Container removal timed out after {}s",
            timeout.as_secs()
        ),
    }
}

/// Owns a created container until it is released. Dropping an unreleased
/// lease (caller cancellation) schedules removal on the current runtime.
struct ContainerLease {
    runtime: Arc<dyn ContainerRuntime>,
    container_id: Option<String>,
    timeout: Duration,
}

impl ContainerLease {
    fn new(runtime: Arc<dyn ContainerRuntime>, container_id: String, timeout: Duration) -> Self {
        Self {
            runtime,
            container_id: Some(container_id),
            timeout,
        }
    }

    async fn release(mut self) {
        if let Some(container_id) = self.container_id.take() {
            remove_with_timeout(self.runtime.as_ref(), &container_id, self.timeout).await;
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        let Some(container_id) = self.container_id.take() else {
            return;
        };
        warn!(container_id = %container_id, "Run abandoned, scheduling container removal");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let runtime = self.runtime.clone();
                let timeout = self.timeout;
                handle.spawn(async move {
                    remove_with_timeout(runtime.as_ref(), &container_id, timeout).await;
                });
            }
            Err(_) => error!(container_id = %container_id, "No runtime left to remove container"),
        }
    }
}

/// Background tasks of one run, aborted when the run ends on any path
#[derive(Default)]
struct RunTasks {
    handles: Vec<AbortHandle>,
}

impl RunTasks {
    fn track<T>(&mut self, handle: &JoinHandle<T>) {
        self.handles.push(handle.abort_handle());
    }
}

impl Drop for RunTasks {
    fn drop(&mut self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

pub struct SandboxOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    policies: SecurityPolicyBuilder,
    sessions: SessionRegistry,
    max_sample_size: u64,
    monitor_drain: Duration,
    teardown_timeout: Duration,
}

impl SandboxOrchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &RuntimeConfig) -> Self {
        Self {
            runtime,
            policies: SecurityPolicyBuilder::new(&config.linux_image, &config.windows_image),
            sessions: SessionRegistry::new(),
            max_sample_size: config.max_sample_size,
            monitor_drain: config.monitor_drain(),
            teardown_timeout: config.teardown_timeout(),
        }
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Run one sample and return its report. Exactly one report per
    /// successful call; a timeout yields a truncated report, not an error.
    pub async fn execute_sample(
        &self,
        sample: SampleSource,
        config: SandboxConfig,
    ) -> Result<ExecutionReport, SandboxError> {
        config.validate()?;
        let policy = self.policies.build(&config)?;
        let (sample_name, data) = sample.load(self.max_sample_size).await?;

        let session_id = Uuid::new_v4();
        let _session = self.sessions.register(session_id, &sample_name);
        info!(
            session_id = %session_id,
            sample = %sample_name,
            size = data.len(),
            os = ?config.os_type,
            "Starting sandbox run"
        );

        self.runtime
            .ping()
            .await
            .map_err(|e| SandboxError::RuntimeUnavailable(format!("{:#}", e)))?;
        match self.runtime.image_exists(&policy.image).await {
            Ok(true) => {}
            Ok(false) => {
                return Err(SandboxError::ImageNotFound {
                    image: policy.image.clone(),
                })
            }
            Err(e) => return Err(SandboxError::RuntimeUnavailable(format!("{:#}", e))),
        }

        let name = format!("nexus-sandbox-{}", session_id.simple());
        let container_id = self
            .runtime
            .create_container(&name, &policy)
            .await
            .map_err(|e| SandboxError::ContainerCreation(format!("{:#}", e)))?;
        self.sessions.set_container(session_id, &container_id);
        let lease = ContainerLease::new(self.runtime.clone(), container_id.clone(), self.teardown_timeout);

        let result = self
            .run_in_container(session_id, &container_id, &policy, &config, sample_name, data)
            .await;

        self.sessions.set_phase(session_id, SessionPhase::TearingDown);
        lease.release().await;

        match &result {
            Ok(report) => info!(
                session_id = %session_id,
                events = report.behavioral_events.len(),
                techniques = report.mitre_attacks.len(),
                truncated = report.truncated,
                "Sandbox run completed in {}ms",
                report.execution_time_ms
            ),
            Err(e) => error!(session_id = %session_id, kind = e.kind().as_str(), "Sandbox run failed: {}", e),
        }
        result
    }

    async fn run_in_container(
        &self,
        session_id: Uuid,
        container_id: &str,
        policy: &SecurityPolicy,
        config: &SandboxConfig,
        sample_name: String,
        data: Vec<u8>,
    ) -> Result<ExecutionReport, SandboxError> {
        let runtime = self.runtime.as_ref();
        let layout = RunLayout::new(session_id, &sample_name);
        let started_at = Utc::now();
        let sample_sha256 = hex::encode(Sha256::digest(&data));

        runtime
            .start_container(container_id)
            .await
            .map_err(|e| SandboxError::ContainerCreation(format!("{:#}", e)))?;

        let prepared = runtime
            .exec(
                container_id,
                &[
                    "mkdir".to_string(),
                    "-p".to_string(),
                    layout.root.clone(),
                    layout.memory.clone(),
                    layout.screenshots.clone(),
                ],
            )
            .await
            .map_err(|e| SandboxError::UploadFailed(format!("{:#}", e)))?;
        if !prepared.success() {
            return Err(SandboxError::UploadFailed(format!(
                "cannot create run directory {}: {}",
                layout.root,
                prepared.stderr.trim()
            )));
        }

        self.sessions.set_phase(session_id, SessionPhase::Seeding);
        let home = policy
            .env
            .get("HOME")
            .cloned()
            .unwrap_or_else(|| format!("/tmp/home/{}", SANDBOX_USER));
        let anti_evasion_tier = AntiEvasionEngine::new(home)
            .seed(runtime, container_id, policy.anti_evasion_tier, &layout.stop_marker)
            .await;

        self.sessions.set_phase(session_id, SessionPhase::Staging);
        runtime
            .write_file(container_id, &layout.sample, &data, 0o755)
            .await
            .map_err(|e| SandboxError::UploadFailed(format!("{:#}", e)))?;
        debug!(session_id = %session_id, path = %layout.sample, "Sample staged");

        let streams = self.open_streams(container_id, &layout, config).await?;

        let mut hub = TraceHub::new();
        let monitor_rx = hub.subscribe();
        let memory_config = config.memory_capture.clone().filter(|c| c.enabled);
        let memory_rx = memory_config.as_ref().map(|_| hub.subscribe());
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut tasks = RunTasks::default();
        for pump in hub.spawn(streams) {
            tasks.track(&pump);
        }
        let monitor: JoinHandle<MonitorOutput> =
            tokio::spawn(BehaviorMonitor::new().run(monitor_rx, stop_rx.clone()));
        tasks.track(&monitor);
        let memory: Option<JoinHandle<Vec<MemoryDump>>> = match (memory_config, memory_rx) {
            (Some(memory_config), Some(rx)) => {
                let controller = MemoryCaptureController::new(
                    memory_config,
                    self.runtime.clone(),
                    container_id,
                    layout.memory.clone(),
                );
                let handle = tokio::spawn(controller.run(rx, stop_rx.clone()));
                tasks.track(&handle);
                Some(handle)
            }
            _ => None,
        };

        let video_config = config.video_capture.clone().unwrap_or_default();
        let recorder = VideoRecorder::start(
            runtime,
            container_id,
            &video_config,
            &layout.video,
            &layout.screenshots,
            &layout.stop_marker,
        )
        .await;

        self.sessions.set_phase(session_id, SessionPhase::Running);
        let command = layout.launch_command(config.os_type, recorder.is_some());
        let clock = Instant::now();
        let (exit_code, truncated) = match self.wait_for_sample(container_id, &command, config).await {
            Ok(output) => (output.exit_code, false),
            Err(SandboxError::ExecutionTimeout { timeout_secs }) => {
                warn!(
                    session_id = %session_id,
                    "Sample exceeded {}s, terminating and keeping partial results",
                    timeout_secs
                );
                if let Err(e) = runtime.kill_process_group(container_id, &layout.pgid).await {
                    warn!(container_id = %container_id, "Failed to kill sample process group: {:#}", e);
                }
                (None, true)
            }
            Err(e) => return Err(e),
        };
        let execution_time_ms = clock.elapsed().as_millis() as u64;

        self.sessions.set_phase(session_id, SessionPhase::Collecting);
        self.signal_stop(container_id, &layout).await;
        let video = match recorder {
            Some(recorder) => recorder.stop(runtime, container_id).await,
            None => None,
        };

        tokio::time::sleep(self.monitor_drain).await;
        let _ = stop_tx.send(true);

        let (monitored, memory_dumps) = join!(monitor, OptionFuture::from(memory));
        drop(tasks);
        let monitored = monitored
            .map_err(|e| SandboxError::Execution(format!("behavior monitor failed: {}", e)))?;
        let memory_dumps = match memory_dumps {
            Some(Ok(dumps)) => dumps,
            Some(Err(e)) => {
                warn!(session_id = %session_id, "Memory capture task failed: {}", e);
                Vec::new()
            }
            None => Vec::new(),
        };

        if truncated {
            // Anything the sample detached from its group
            if let Err(e) = runtime.kill_processes(container_id).await {
                warn!(container_id = %container_id, "Failed to kill remaining processes: {:#}", e);
            }
        }

        let stdout = self.read_output(container_id, &layout.stdout).await;
        let stderr = self.read_output(container_id, &layout.stderr).await;

        let mut behavioral_events = monitored.events;
        behavioral_events.extend(memory_anomalies(&memory_dumps));
        let mitre_attacks = MitreMapper::map(&behavioral_events);
        debug!(
            session_id = %session_id,
            records = monitored.records_seen,
            "Collected run artifacts"
        );

        Ok(ExecutionReport {
            session_id,
            sample_name,
            sample_sha256,
            sample_size: data.len() as u64,
            os_type: config.os_type,
            exit_code,
            execution_time_ms,
            started_at,
            finished_at: Utc::now(),
            anti_evasion_tier,
            behavioral_events,
            file_operations: monitored.file_operations,
            network_connections: monitored.network_connections,
            processes: monitored.processes,
            syscall_summary: monitored.syscall_summary,
            stdout,
            stderr,
            mitre_attacks,
            memory_dumps,
            video,
            truncated,
        })
    }

    /// Syscall stream is required; packet capture is best effort
    async fn open_streams(
        &self,
        container_id: &str,
        layout: &RunLayout,
        config: &SandboxConfig,
    ) -> Result<Vec<(StreamKind, LineStream)>, SandboxError> {
        let follow = vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "touch '{log}' && exec tail -n +1 -F '{log}' 2>/dev/null",
                log = layout.syscalls
            ),
        ];
        let syscalls = self
            .runtime
            .stream_lines(container_id, &follow)
            .await
            .map_err(|e| SandboxError::Execution(format!("cannot follow syscall trace: {:#}", e)))?;
        let mut streams = vec![(StreamKind::Syscalls, syscalls)];

        if config.capture_network {
            let capture: Vec<String> = ["tcpdump", "-l", "-n", "-tt", "-q", "-i", "any"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            match self.runtime.stream_lines(container_id, &capture).await {
                Ok(packets) => streams.push((StreamKind::Packets, packets)),
                Err(e) => warn!(
                    container_id = %container_id,
                    "Packet capture unavailable, continuing without it: {:#}",
                    e
                ),
            }
        }

        Ok(streams)
    }

    /// Race the sample against the run timeout; the loser is dropped
    async fn wait_for_sample(
        &self,
        container_id: &str,
        command: &[String],
        config: &SandboxConfig,
    ) -> Result<ExecOutput, SandboxError> {
        tokio::select! {
            result = self.runtime.exec(container_id, command) => {
                result.map_err(|e| SandboxError::Execution(format!("{:#}", e)))
            }
            _ = tokio::time::sleep(config.timeout()) => Err(SandboxError::ExecutionTimeout {
                timeout_secs: config.timeout_secs,
            }),
        }
    }

    /// Tells seeded activity and the screenshot loop to wind down
    async fn signal_stop(&self, container_id: &str, layout: &RunLayout) {
        let cmd = vec!["touch".to_string(), layout.stop_marker.clone()];
        if let Err(e) = self.runtime.exec(container_id, &cmd).await {
            debug!(container_id = %container_id, "Failed to write stop marker: {:#}", e);
        }
    }

    async fn read_output(&self, container_id: &str, path: &str) -> String {
        match self.runtime.read_file(container_id, path, MAX_OUTPUT_BYTES).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).to_string(),
            Err(e) => {
                warn!(container_id = %container_id, "Failed to collect {}: {:#}", path, e);
                String::new()
            }
        }
    }
}

fn memory_anomalies(dumps: &[MemoryDump]) -> Vec<BehaviorEvent> {
    dumps
        .iter()
        .flat_map(|dump| {
            dump.findings.iter().map(move |finding| {
                BehaviorEvent::new(
                    dump.timestamp,
                    EventKind::MemoryAnomaly,
                    finding.kind.as_str(),
                    dump.pid,
                    format!(
                        "{:#x}-{:#x}: {}",
                        finding.start, finding.end, finding.description
                    ),
                )
            })
        })
        .collect()
}
