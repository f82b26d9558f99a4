/// Sandbox module for isolated dynamic analysis
///
/// This module runs untrusted samples inside hardened containers and turns what
/// they do into a structured execution report. It includes:
/// - Isolation policy construction (mounts, capabilities, syscall filter)
/// - Anti-evasion seeding of the execution environment
/// - Container lifecycle management (Docker-based isolation)
/// - Real-time monitoring of syscall and packet streams
/// - MITRE ATT&CK mapping and report assembly

pub mod anti_evasion;
pub mod container;
pub mod mitre;
pub mod monitor;
pub mod orchestrator;
pub mod policy;
pub mod seccomp;
pub mod trace;
pub mod video;

pub use anti_evasion::{AntiEvasionEngine, AntiEvasionTier};
pub use container::{ContainerRuntime, DockerCli};
pub use mitre::{MitreAttack, MitreMapper};
pub use monitor::BehaviorMonitor;
pub use orchestrator::{SandboxOrchestrator, SessionRegistry};
pub use policy::{SecurityPolicy, SecurityPolicyBuilder};
pub use video::{VideoCaptureConfig, VideoRecording};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

use crate::error::SandboxError;
use crate::memory::{MemoryCaptureConfig, MemoryDump};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Linux,
    Windows,
}

/// Run-scoped configuration, immutable once a run starts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub os_type: OsType,
    pub timeout_secs: u64,
    pub capture_network: bool,
    pub memory_limit_bytes: u64,
    /// `None`, `Some(1)` or `Some(2)`; anything else is rejected by the policy builder
    pub anti_evasion_tier: Option<u8>,
    pub memory_capture: Option<MemoryCaptureConfig>,
    pub video_capture: Option<VideoCaptureConfig>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            os_type: OsType::Linux,
            timeout_secs: 60,
            capture_network: false,
            memory_limit_bytes: 512 * 1024 * 1024,
            anti_evasion_tier: None,
            memory_capture: None,
            video_capture: None,
        }
    }
}

impl SandboxConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Reject configurations that cannot start a run. Memory limit and tier
    /// are checked by the policy builder so they surface as `PolicyError`.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.timeout_secs == 0 {
            return Err(SandboxError::InvalidConfig {
                field: "timeout_secs",
                reason: "timeout must be greater than 0".to_string(),
            });
        }

        if let Some(memory) = &self.memory_capture {
            memory.validate()?;
        }

        if let Some(video) = &self.video_capture {
            video.validate()?;
        }

        Ok(())
    }
}

/// Severity attached to every behavior event
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// Closed set of behaviors the monitor recognizes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProcessCreation,
    ProcessExecution,
    SocketCreation,
    NetworkConnect,
    SensitiveFileAccess,
    AutostartWrite,
    MemoryProtectionChange,
    ProcessTrace,
    FileDeletion,
    PermissionChange,
    PrivilegeChange,
    MemoryAnomaly,
    EvasionAttempt,
}

impl EventKind {
    pub fn severity(&self) -> Severity {
        match self {
            EventKind::PermissionChange => Severity::Low,
            EventKind::ProcessCreation | EventKind::SocketCreation | EventKind::FileDeletion => {
                Severity::Medium
            }
            EventKind::ProcessExecution
            | EventKind::NetworkConnect
            | EventKind::AutostartWrite
            | EventKind::MemoryProtectionChange
            | EventKind::PrivilegeChange
            | EventKind::MemoryAnomaly
            | EventKind::EvasionAttempt => Severity::High,
            EventKind::SensitiveFileAccess | EventKind::ProcessTrace => Severity::Critical,
        }
    }
}

/// One observed action attributed to the running sample
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BehaviorEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    /// Syscall or action name
    pub action: String,
    pub pid: u32,
    pub context: String,
    pub severity: Severity,
}

impl BehaviorEvent {
    pub fn new(
        timestamp: DateTime<Utc>,
        kind: EventKind,
        action: impl Into<String>,
        pid: u32,
        context: impl Into<String>,
    ) -> Self {
        Self {
            timestamp,
            kind,
            action: action.into(),
            pid,
            context: context.into(),
            severity: kind.severity(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FileOperationType {
    Open,
    Create,
    Delete,
    Rename,
    Chmod,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileOperation {
    pub operation: FileOperationType,
    pub path: String,
    pub target_path: Option<String>,
    pub pid: u32,
    pub timestamp: DateTime<Utc>,
    pub success: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    Dns,
    Http,
    Https,
    Ftp,
    Ssh,
    Smtp,
    Tcp,
    Udp,
    Icmp,
}

impl ConnectionType {
    /// Classify by well-known destination port, falling back to the transport
    pub fn from_port(protocol: &str, port: u16) -> Self {
        match port {
            53 => ConnectionType::Dns,
            80 | 8080 => ConnectionType::Http,
            443 => ConnectionType::Https,
            21 => ConnectionType::Ftp,
            22 => ConnectionType::Ssh,
            25 | 587 => ConnectionType::Smtp,
            _ => match protocol {
                "udp" => ConnectionType::Udp,
                "icmp" => ConnectionType::Icmp,
                _ => ConnectionType::Tcp,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionSource {
    Syscall,
    PacketCapture,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NetworkConnection {
    pub protocol: String,
    pub destination: String,
    pub port: u16,
    pub connection_type: ConnectionType,
    pub source: ConnectionSource,
    pub pid: Option<u32>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInfo {
    pub pid: u32,
    pub parent_pid: Option<u32>,
    pub name: String,
    pub command_line: String,
    pub started_at: DateTime<Utc>,
}

/// Terminal artifact of one `execute_sample` call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub session_id: Uuid,
    pub sample_name: String,
    pub sample_sha256: String,
    pub sample_size: u64,
    pub os_type: OsType,
    /// `None` when the sample was force-terminated
    pub exit_code: Option<i32>,
    pub execution_time_ms: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub anti_evasion_tier: AntiEvasionTier,
    pub behavioral_events: Vec<BehaviorEvent>,
    pub file_operations: Vec<FileOperation>,
    pub network_connections: Vec<NetworkConnection>,
    pub processes: Vec<ProcessInfo>,
    pub syscall_summary: BTreeMap<String, u64>,
    pub stdout: String,
    pub stderr: String,
    pub mitre_attacks: Vec<MitreAttack>,
    pub memory_dumps: Vec<MemoryDump>,
    pub video: Option<VideoRecording>,
    pub truncated: bool,
}

/// Where the sample bytes come from
#[derive(Debug, Clone)]
pub enum SampleSource {
    Bytes { name: String, data: Vec<u8> },
    Path(PathBuf),
}

impl SampleSource {
    /// Load the sample, enforcing the platform size ceiling
    pub async fn load(self, max_size: u64) -> Result<(String, Vec<u8>), SandboxError> {
        let (name, data) = match self {
            SampleSource::Bytes { name, data } => (name, data),
            SampleSource::Path(path) => {
                let metadata = tokio::fs::metadata(&path).await.map_err(|e| {
                    SandboxError::SampleUnavailable(format!("{}: {}", path.display(), e))
                })?;
                if metadata.len() > max_size {
                    return Err(SandboxError::SampleUnavailable(format!(
                        "{} is {} bytes (max: {})",
                        path.display(),
                        metadata.len(),
                        max_size
                    )));
                }
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    SandboxError::SampleUnavailable(format!("{}: {}", path.display(), e))
                })?;
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "sample".to_string());
                (name, data)
            }
        };

        if data.is_empty() {
            return Err(SandboxError::SampleUnavailable("sample is empty".to_string()));
        }
        if data.len() as u64 > max_size {
            return Err(SandboxError::SampleUnavailable(format!(
                "sample is {} bytes (max: {})",
                data.len(),
                max_size
            )));
        }

        Ok((name, data))
    }
}
