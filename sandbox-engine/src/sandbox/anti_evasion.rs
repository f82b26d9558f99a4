/// Anti-evasion countermeasures
///
/// Environment-aware malware checks for an empty home directory, missing
/// browser history or an idle desktop before it does anything interesting.
/// Tier 1 seeds plausible user artifacts into the writable mounts; tier 2
/// adds background processes that simulate an active user for the run's
/// duration. The engine never inspects the sample.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::container::ContainerRuntime;
use super::trace::{SyscallRecord, TraceRecord};
use crate::error::PolicyError;

/// Sleep requests at or above this many seconds count as stalling
const LONG_SLEEP_SECS: u64 = 60;

/// Paths sandbox-aware samples read to fingerprint the host
const FINGERPRINT_PATHS: &[&str] = &["/sys/class/dmi", "/proc/scsi", "/.dockerenv", "/proc/1/cgroup"];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Default)]
#[serde(rename_all = "snake_case")]
pub enum AntiEvasionTier {
    #[default]
    None,
    Tier1,
    Tier2,
}

impl AntiEvasionTier {
    /// Tier to fall back to when seeding this one fails
    pub fn lower(&self) -> Option<Self> {
        match self {
            AntiEvasionTier::Tier2 => Some(AntiEvasionTier::Tier1),
            AntiEvasionTier::Tier1 => Some(AntiEvasionTier::None),
            AntiEvasionTier::None => None,
        }
    }
}

impl TryFrom<Option<u8>> for AntiEvasionTier {
    type Error = PolicyError;

    fn try_from(value: Option<u8>) -> Result<Self, Self::Error> {
        match value {
            None | Some(0) => Ok(AntiEvasionTier::None),
            Some(1) => Ok(AntiEvasionTier::Tier1),
            Some(2) => Ok(AntiEvasionTier::Tier2),
            Some(other) => Err(PolicyError::InvalidAntiEvasionTier(other)),
        }
    }
}

/// File written into the sandbox before execution
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DecoyArtifact {
    pub path: String,
    pub contents: String,
}

/// Background process started for tier 2
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatedActivity {
    /// Process name visible to the sample
    pub name: String,
    pub script: String,
}

#[derive(Debug, Clone, Default)]
pub struct SeedPlan {
    pub artifacts: Vec<DecoyArtifact>,
    pub activities: Vec<SimulatedActivity>,
}

pub struct AntiEvasionEngine {
    home: String,
}

impl AntiEvasionEngine {
    /// `home` must live inside a writable mount
    pub fn new(home: impl Into<String>) -> Self {
        Self { home: home.into() }
    }

    fn artifact(&self, relative: &str, contents: &str) -> DecoyArtifact {
        DecoyArtifact {
            path: format!("{}/{}", self.home, relative),
            contents: contents.to_string(),
        }
    }

    fn tier1_artifacts(&self) -> Vec<DecoyArtifact> {
        vec![
            self.artifact(
                "Documents/Quarterly_Report_Q3.txt",
                "Q3 revenue summary\nRegion  Target  Actual\nEMEA    1.2M    1.31M\nAPAC    0.9M    0.87M\n",
            ),
            self.artifact(
                "Documents/meeting_notes.txt",
                "Standup 09:30\n- vendor contract renewal\n- follow up with finance on invoices\n",
            ),
            self.artifact("Pictures/IMG_20240612_184455.jpg", "\u{FFFD}JFIF placeholder"),
            self.artifact("Downloads/invoice_4471.pdf", "%PDF-1.4\n% invoice 4471\n%%EOF\n"),
            self.artifact(
                ".bash_history",
                "ls -la\ncd Documents\nvim meeting_notes.txt\ngit status\nssh deploy@10.0.4.12\nsudo apt update\n",
            ),
            self.artifact(
                ".config/google-chrome/Default/History",
                "https://mail.google.com/mail/u/0/#inbox\nhttps://www.linkedin.com/feed/\nhttps://github.com/\n",
            ),
        ]
    }

    fn tier2_artifacts(&self) -> Vec<DecoyArtifact> {
        vec![
            self.artifact(
                ".local/share/recently-used.xbel",
                "<?xml version=\"1.0\"?>\n<xbel version=\"1.0\">\n  <bookmark href=\"file:///home/sandbox/Documents/Quarterly_Report_Q3.txt\"/>\n</xbel>\n",
            ),
            self.artifact("Documents/Budget_2024.csv", "item,amount\nlicenses,12000\ntravel,4300\n"),
            self.artifact(".ssh/known_hosts", "10.0.4.12 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIK8\n"),
        ]
    }

    fn tier2_activities(&self, stop_marker: &str) -> Vec<SimulatedActivity> {
        let user_activity = format!(
            "while [ ! -e '{stop}' ]; do \
               touch '{home}/Documents/meeting_notes.txt'; \
               echo \"ls -la $(date +%s)\" >> '{home}/.bash_history'; \
               if [ -n \"$DISPLAY\" ] && command -v xdotool >/dev/null; then \
                 xdotool mousemove $((RANDOM % 1280)) $((RANDOM % 720)); \
               fi; \
               sleep $((RANDOM % 5 + 2)); \
             done",
            stop = stop_marker,
            home = self.home,
        );

        let mut activities = vec![SimulatedActivity {
            name: "user-activity".to_string(),
            script: user_activity,
        }];

        for name in ["chrome", "explorer.exe", "svchost.exe", "csrss.exe"] {
            activities.push(SimulatedActivity {
                name: name.to_string(),
                script: format!(
                    "exec -a '{name}' sh -c \"while [ ! -e '{stop}' ]; do sleep 5; done\"",
                    stop = stop_marker,
                    name = name,
                ),
            });
        }
        activities
    }

    /// Artifacts and background activity for a tier. Tier 2 is a strict superset of tier 1.
    pub fn plan(&self, tier: AntiEvasionTier, stop_marker: &str) -> SeedPlan {
        match tier {
            AntiEvasionTier::None => SeedPlan::default(),
            AntiEvasionTier::Tier1 => SeedPlan {
                artifacts: self.tier1_artifacts(),
                activities: Vec::new(),
            },
            AntiEvasionTier::Tier2 => {
                let mut artifacts = self.tier1_artifacts();
                artifacts.extend(self.tier2_artifacts());
                SeedPlan {
                    artifacts,
                    activities: self.tier2_activities(stop_marker),
                }
            }
        }
    }

    /// Shell script that writes every artifact of the plan
    pub fn render_script(plan: &SeedPlan) -> String {
        let mut script = String::from("set -e\n");
        for (idx, artifact) in plan.artifacts.iter().enumerate() {
            let delimiter = format!("NEXUS_DECOY_{}", idx);
            script.push_str(&format!(
                "mkdir -p \"$(dirname '{path}')\"\ncat > '{path}' <<'{delim}'\n{contents}\n{delim}\n",
                path = artifact.path,
                delim = delimiter,
                contents = artifact.contents.trim_end_matches('\n'),
            ));
        }
        script
    }

    async fn apply(
        &self,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        tier: AntiEvasionTier,
        stop_marker: &str,
    ) -> anyhow::Result<()> {
        let plan = self.plan(tier, stop_marker);
        if plan.artifacts.is_empty() && plan.activities.is_empty() {
            return Ok(());
        }

        let script_path = "/tmp/.nexus_seed.sh";
        runtime
            .write_file(container_id, script_path, Self::render_script(&plan).as_bytes(), 0o700)
            .await?;
        let output = runtime
            .exec(
                container_id,
                &[
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("sh {0}; status=$?; rm -f {0}; exit $status", script_path),
                ],
            )
            .await?;
        if !output.success() {
            anyhow::bail!("seed script exited with {:?}: {}", output.exit_code, output.stderr.trim());
        }

        for activity in &plan.activities {
            runtime
                .exec_detached(
                    container_id,
                    &["bash".to_string(), "-c".to_string(), activity.script.clone()],
                )
                .await?;
            debug!(activity = %activity.name, "Started simulated activity");
        }

        Ok(())
    }

    /// Kill simulated activity left behind by a failed tier. Every activity
    /// script names the stop marker, so it doubles as the match pattern.
    async fn stop_activities(&self, runtime: &dyn ContainerRuntime, container_id: &str, stop_marker: &str) {
        let cmd = [
            "pkill".to_string(),
            "-KILL".to_string(),
            "-f".to_string(),
            stop_marker.to_string(),
        ];
        match runtime.exec(container_id, &cmd).await {
            // pkill exits 1 when nothing matched
            Ok(output) if output.exit_code.map_or(false, |code| code > 1) => {
                warn!(container_id = %container_id, "Failed to stop simulated activity: {}", output.stderr.trim())
            }
            Ok(_) => {}
            Err(e) => warn!(container_id = %container_id, "Failed to stop simulated activity: {:#}", e),
        }
    }

    /// Seed the container, degrading to lower tiers on failure. Returns the
    /// tier that was actually applied.
    pub async fn seed(
        &self,
        runtime: &dyn ContainerRuntime,
        container_id: &str,
        requested: AntiEvasionTier,
        stop_marker: &str,
    ) -> AntiEvasionTier {
        let mut tier = requested;
        loop {
            match self.apply(runtime, container_id, tier, stop_marker).await {
                Ok(()) => {
                    if tier != AntiEvasionTier::None {
                        info!(container_id = %container_id, tier = ?tier, "Anti-evasion seeding applied");
                    }
                    return tier;
                }
                Err(e) => {
                    if !self.plan(tier, stop_marker).activities.is_empty() {
                        self.stop_activities(runtime, container_id, stop_marker).await;
                    }
                    let Some(lower) = tier.lower() else {
                        return AntiEvasionTier::None;
                    };
                    warn!(
                        container_id = %container_id,
                        "Anti-evasion tier {:?} failed, falling back to {:?}: {:#}",
                        tier,
                        lower,
                        e
                    );
                    tier = lower;
                }
            }
        }
    }
}

/// Leading seconds of a `{tv_sec=N, ...}` timespec argument
fn requested_sleep_secs(record: &SyscallRecord) -> Option<u64> {
    let start = record.args.find("tv_sec=")? + "tv_sec=".len();
    let digits: String = record.args[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Describe sandbox-probing behavior in a trace record, if any
pub fn detect_evasion_attempt(record: &TraceRecord) -> Option<String> {
    let TraceRecord::Syscall(rec) = record else {
        return None;
    };

    match rec.name.as_str() {
        "open" | "openat" | "openat2" | "stat" | "newfstatat" | "access" | "faccessat" => {
            let path = rec.first_path()?;
            FINGERPRINT_PATHS
                .iter()
                .find(|prefix| path.starts_with(*prefix))
                .map(|prefix| format!("environment fingerprinting via {}", prefix))
        }
        "ptrace" if rec.args.starts_with("PTRACE_TRACEME") => {
            Some("debugger check via PTRACE_TRACEME".to_string())
        }
        "nanosleep" | "clock_nanosleep" => requested_sleep_secs(rec)
            .filter(|secs| *secs >= LONG_SLEEP_SECS)
            .map(|secs| format!("stalling sleep of {}s", secs)),
        _ => None,
    }
}
