//! Trigger-driven memory acquisition for sandboxed processes.
//!
//! The controller runs as its own task next to the behavior monitor and sees
//! the same trace records. When a record matches a configured trigger it
//! snapshots the process through `/proc/<pid>/mem`, saves the map alongside
//! and, if enabled, extracts strings from the snapshot right away. The dump
//! budget is owned by this task alone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::regions::{analyze_regions, MemoryRegion, MemoryRegionParser, RegionFinding};
use super::strings::{ExtractedString, StringEncoding, StringExtractor};
use crate::error::SandboxError;
use crate::sandbox::container::ContainerRuntime;
use crate::sandbox::trace::TraceRecord;

/// Largest slice of a snapshot read back for string extraction
const STRING_SCAN_LIMIT: u64 = 64 * 1024 * 1024;
const MAPS_READ_LIMIT: u64 = 4 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(tag = "type", content = "syscall", rename_all = "snake_case")]
pub enum DumpTrigger {
    ProcessStart,
    ProcessExit,
    SuspiciousSyscall(String),
    /// Periodic timer wakeup
    Interval,
}

impl DumpTrigger {
    /// File-name-safe label
    pub fn label(&self) -> String {
        match self {
            DumpTrigger::ProcessStart => "start".to_string(),
            DumpTrigger::ProcessExit => "exit".to_string(),
            DumpTrigger::SuspiciousSyscall(name) => format!("syscall_{}", name),
            DumpTrigger::Interval => "interval".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryCaptureConfig {
    pub enabled: bool,
    pub triggers: Vec<DumpTrigger>,
    /// Per-snapshot ceiling; larger snapshots are truncated
    pub max_dump_size: u64,
    /// Period of the timer trigger, 0 disables it
    pub dump_interval_ms: u64,
    pub auto_dump_on_suspicious: bool,
    pub suspicious_syscalls: Vec<String>,
    pub extract_strings: bool,
    pub min_string_length: usize,
    /// Total bytes all snapshots of one run may occupy
    pub dump_budget_bytes: u64,
}

impl Default for MemoryCaptureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            triggers: vec![DumpTrigger::ProcessStart, DumpTrigger::ProcessExit],
            max_dump_size: 512 * 1024 * 1024,
            dump_interval_ms: 5000,
            auto_dump_on_suspicious: true,
            suspicious_syscalls: ["ptrace", "mprotect", "mmap", "execve"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            extract_strings: true,
            min_string_length: 4,
            dump_budget_bytes: 1024 * 1024 * 1024,
        }
    }
}

fn valid_syscall_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
}

impl MemoryCaptureConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.max_dump_size == 0 {
            return Err(SandboxError::InvalidConfig {
                field: "memory_capture.max_dump_size",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.dump_budget_bytes == 0 {
            return Err(SandboxError::InvalidConfig {
                field: "memory_capture.dump_budget_bytes",
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.min_string_length < 1 {
            return Err(SandboxError::InvalidConfig {
                field: "memory_capture.min_string_length",
                reason: "must be at least 1".to_string(),
            });
        }

        let trigger_names = self.triggers.iter().filter_map(|t| match t {
            DumpTrigger::SuspiciousSyscall(name) => Some(name),
            _ => None,
        });
        if let Some(bad) = self
            .suspicious_syscalls
            .iter()
            .chain(trigger_names)
            .find(|n| !valid_syscall_name(n))
        {
            return Err(SandboxError::InvalidConfig {
                field: "memory_capture.suspicious_syscalls",
                reason: format!("'{}' is not a syscall name", bad),
            });
        }

        Ok(())
    }

    fn wants(&self, trigger: &DumpTrigger) -> bool {
        self.triggers.contains(trigger)
    }

    fn is_suspicious(&self, syscall: &str) -> bool {
        self.triggers
            .iter()
            .any(|t| matches!(t, DumpTrigger::SuspiciousSyscall(n) if n == syscall))
            || (self.auto_dump_on_suspicious && self.suspicious_syscalls.iter().any(|s| s == syscall))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryDump {
    pub pid: u32,
    pub trigger: DumpTrigger,
    pub timestamp: DateTime<Utc>,
    pub size_bytes: u64,
    /// Snapshot hit its size cap
    pub truncated: bool,
    /// Location inside the container's memory mount
    pub storage_path: String,
    pub maps_path: Option<String>,
    pub regions: Vec<MemoryRegion>,
    pub findings: Vec<RegionFinding>,
    pub strings: Option<Vec<ExtractedString>>,
}

pub struct MemoryCaptureController {
    config: MemoryCaptureConfig,
    runtime: Arc<dyn ContainerRuntime>,
    container_id: String,
    memory_dir: String,
    budget_remaining: u64,
    fired: HashSet<(u32, String)>,
    last_pid: Option<u32>,
    dumps: Vec<MemoryDump>,
}

impl MemoryCaptureController {
    pub fn new(
        config: MemoryCaptureConfig,
        runtime: Arc<dyn ContainerRuntime>,
        container_id: impl Into<String>,
        memory_dir: impl Into<String>,
    ) -> Self {
        Self {
            budget_remaining: config.dump_budget_bytes,
            config,
            runtime,
            container_id: container_id.into(),
            memory_dir: memory_dir.into(),
            fired: HashSet::new(),
            last_pid: None,
            dumps: Vec::new(),
        }
    }

    /// Process records until the streams close or `stop` fires. Dumps are
    /// returned in acquisition order.
    pub async fn run(
        mut self,
        mut records: mpsc::UnboundedReceiver<TraceRecord>,
        mut stop: watch::Receiver<bool>,
    ) -> Vec<MemoryDump> {
        if !self.config.enabled {
            return Vec::new();
        }

        let timer_enabled = self.config.dump_interval_ms > 0;
        let period = Duration::from_millis(self.config.dump_interval_ms.max(1));
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                record = records.recv() => match record {
                    Some(record) => self.observe(&record).await,
                    None => break,
                },
                _ = ticker.tick(), if timer_enabled => {
                    if let Some(pid) = self.last_pid {
                        self.snapshot(pid, DumpTrigger::Interval).await;
                    }
                }
            }
        }

        info!(
            "Memory capture finished: {} dumps, {} bytes of budget left",
            self.dumps.len(),
            self.budget_remaining
        );
        self.dumps
    }

    pub async fn observe(&mut self, record: &TraceRecord) {
        let Some((pid, trigger)) = self.match_trigger(record) else {
            return;
        };
        if self.fired.insert((pid, trigger.label())) {
            self.snapshot(pid, trigger).await;
        }
    }

    fn match_trigger(&mut self, record: &TraceRecord) -> Option<(u32, DumpTrigger)> {
        match record {
            TraceRecord::Syscall(rec) => {
                if rec.pid != 0 {
                    self.last_pid = Some(rec.pid);
                }
                let started = matches!(rec.name.as_str(), "execve" | "execveat")
                    && (rec.result.is_none() || rec.succeeded());
                if started && self.config.wants(&DumpTrigger::ProcessStart) {
                    return Some((rec.pid, DumpTrigger::ProcessStart));
                }
                if rec.name == "exit_group" && self.config.wants(&DumpTrigger::ProcessExit) {
                    return Some((rec.pid, DumpTrigger::ProcessExit));
                }
                if self.config.is_suspicious(&rec.name) {
                    return Some((rec.pid, DumpTrigger::SuspiciousSyscall(rec.name.clone())));
                }
                None
            }
            TraceRecord::Exit { pid, .. } if self.config.wants(&DumpTrigger::ProcessExit) => {
                Some((*pid, DumpTrigger::ProcessExit))
            }
            _ => None,
        }
    }

    fn dump_script(pid: u32, dump_path: &str, maps_path: &str, cap: u64) -> String {
        format!(
            r#"pid={pid}; out='{dump}'; maps='{maps}'; cap={cap}
[ -r /proc/$pid/maps ] || exit 3
cp /proc/$pid/maps "$maps" || exit 4
: > "$out"
while read -r range perms rest; do
  case "$perms" in r*) ;; *) continue ;; esac
  case "$rest" in *'[vsyscall]'*|*'[vvar]'*) continue ;; esac
  start=$((0x${{range%-*}})); end=$((0x${{range#*-}}))
  dd if=/proc/$pid/mem bs=4096 skip=$((start / 4096)) count=$(((end - start) / 4096)) >> "$out" 2>/dev/null
  [ "$(stat -c %s "$out")" -ge "$cap" ] && break
done < "$maps"
written=$(stat -c %s "$out")
truncate -s "<$cap" "$out"
echo "$(stat -c %s "$out") $written""#,
            pid = pid,
            dump = dump_path,
            maps = maps_path,
            cap = cap,
        )
    }

    /// Best-effort snapshot; failures are logged and produce no dump
    async fn snapshot(&mut self, pid: u32, trigger: DumpTrigger) {
        if self.budget_remaining == 0 {
            debug!(pid, trigger = %trigger.label(), "Dump budget exhausted, skipping snapshot");
            return;
        }

        let cap = self.config.max_dump_size.min(self.budget_remaining);
        let timestamp = Utc::now();
        let millis = timestamp.timestamp_millis();
        let storage_path = format!(
            "{}/dump_{}_{}_{}.raw",
            self.memory_dir,
            pid,
            trigger.label(),
            millis
        );
        let maps_path = format!("{}/maps_{}_{}.txt", self.memory_dir, pid, millis);

        let script = Self::dump_script(pid, &storage_path, &maps_path, cap);
        let cmd = vec!["sh".to_string(), "-c".to_string(), script];
        let output = match self.runtime.exec(&self.container_id, &cmd).await {
            Ok(output) if output.success() => output,
            Ok(output) => {
                warn!(pid, exit_code = ?output.exit_code, "Memory snapshot failed: {}", output.stderr.trim());
                return;
            }
            Err(e) => {
                warn!(pid, "Memory snapshot failed: {:#}", e);
                return;
            }
        };

        let mut sizes = output.stdout.split_whitespace().filter_map(|s| s.parse::<u64>().ok());
        let size_bytes = sizes.next().unwrap_or(0);
        let written = sizes.next().unwrap_or(size_bytes);
        self.budget_remaining = self.budget_remaining.saturating_sub(size_bytes);

        let regions = match self
            .runtime
            .read_file(&self.container_id, &maps_path, MAPS_READ_LIMIT)
            .await
        {
            Ok(maps) => MemoryRegionParser::parse(&maps).unwrap_or_default(),
            Err(e) => {
                debug!(pid, "Could not read saved memory map: {:#}", e);
                Vec::new()
            }
        };
        let findings = analyze_regions(&regions);

        let strings = if self.config.extract_strings && size_bytes > 0 {
            self.extract_strings(&storage_path, size_bytes).await
        } else {
            None
        };

        info!(
            pid,
            trigger = %trigger.label(),
            size_bytes,
            regions = regions.len(),
            "Captured memory snapshot"
        );

        self.dumps.push(MemoryDump {
            pid,
            trigger,
            timestamp,
            size_bytes,
            truncated: written > size_bytes,
            storage_path,
            maps_path: Some(maps_path),
            regions,
            findings,
            strings,
        });
    }

    async fn extract_strings(&self, storage_path: &str, size: u64) -> Option<Vec<ExtractedString>> {
        let data = match self
            .runtime
            .read_file(&self.container_id, storage_path, size.min(STRING_SCAN_LIMIT))
            .await
        {
            Ok(data) => data,
            Err(e) => {
                warn!("Could not read snapshot {} for string extraction: {:#}", storage_path, e);
                return None;
            }
        };

        let min_length = self.config.min_string_length;
        tokio::task::spawn_blocking(move || {
            StringExtractor::extract_with(&data, min_length, StringEncoding::Both)
        })
        .await
        .map_err(|e| warn!("String extraction task failed: {}", e))
        .ok()
    }
}
