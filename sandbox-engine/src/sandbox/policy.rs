/// Isolation policy construction
///
/// Turns a declarative `SandboxConfig` into the concrete parameters a
/// container is created with. The root filesystem is always read-only and
/// the only writable paths are the purpose-scoped tmpfs mounts listed in
/// [`MountPurpose`].

use serde::Serialize;
use std::collections::BTreeMap;

use super::anti_evasion::AntiEvasionTier;
use super::seccomp::SyscallFilter;
use super::{OsType, SandboxConfig};
use crate::error::PolicyError;

const MIB: u64 = 1024 * 1024;

/// Execution identity inside the container, created by the hardened image
pub const SANDBOX_USER: &str = "sandbox";

/// Hostname presented to the sample
pub const SANDBOX_HOSTNAME: &str = "DESKTOP-7F3K2L9";

const PIDS_LIMIT: u32 = 256;
const NANO_CPUS: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MountPurpose {
    Scratch,
    SampleInput,
    ResultOutput,
    MemoryDump,
    ScreenshotStaging,
}

impl MountPurpose {
    pub const ALL: [MountPurpose; 5] = [
        MountPurpose::Scratch,
        MountPurpose::SampleInput,
        MountPurpose::ResultOutput,
        MountPurpose::MemoryDump,
        MountPurpose::ScreenshotStaging,
    ];

    pub fn target(&self) -> &'static str {
        match self {
            MountPurpose::Scratch => "/tmp",
            MountPurpose::SampleInput => "/sandbox/input",
            MountPurpose::ResultOutput => "/sandbox/output",
            MountPurpose::MemoryDump => "/sandbox/output/memory",
            MountPurpose::ScreenshotStaging => "/sandbox/output/screenshots",
        }
    }

    pub fn size_bytes(&self) -> u64 {
        match self {
            MountPurpose::Scratch => 64 * MIB,
            MountPurpose::SampleInput => 128 * MIB,
            MountPurpose::ResultOutput => 512 * MIB,
            MountPurpose::MemoryDump => 256 * MIB,
            MountPurpose::ScreenshotStaging => 128 * MIB,
        }
    }

    /// Samples run from the input mount and may drop executables to scratch
    pub fn allows_exec(&self) -> bool {
        matches!(self, MountPurpose::Scratch | MountPurpose::SampleInput)
    }
}

/// Size-capped tmpfs mount owned by one container
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MountSpec {
    pub purpose: MountPurpose,
    pub target: String,
    pub size_bytes: u64,
    pub mode: u32,
    pub exec: bool,
}

impl MountSpec {
    fn tmpfs(purpose: MountPurpose) -> Self {
        Self {
            purpose,
            target: purpose.target().to_string(),
            size_bytes: purpose.size_bytes(),
            mode: 0o1777,
            exec: purpose.allows_exec(),
        }
    }

    /// `--tmpfs` argument value
    pub fn to_tmpfs_arg(&self) -> String {
        format!(
            "{}:rw,{},nosuid,nodev,size={},mode={:o}",
            self.target,
            if self.exec { "exec" } else { "noexec" },
            self.size_bytes,
            self.mode
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub enum Capability {
    SysPtrace,
    NetRaw,
    NetAdmin,
}

impl Capability {
    pub fn as_docker_name(&self) -> &'static str {
        match self {
            Capability::SysPtrace => "SYS_PTRACE",
            Capability::NetRaw => "NET_RAW",
            Capability::NetAdmin => "NET_ADMIN",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// Bridge network whose traffic is captured
    IsolatedBridge,
    /// No network interfaces besides loopback
    Disconnected,
}

impl NetworkMode {
    pub fn as_docker_name(&self) -> &'static str {
        match self {
            NetworkMode::IsolatedBridge => "bridge",
            NetworkMode::Disconnected => "none",
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResourceLimits {
    pub memory_bytes: u64,
    pub memory_swap_bytes: u64,
    pub nano_cpus: u64,
    pub pids_limit: u32,
}

/// Concrete isolation parameters for one run
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct SecurityPolicy {
    pub image: String,
    pub os_type: OsType,
    pub hostname: String,
    pub user: String,
    pub read_only_rootfs: bool,
    pub no_new_privileges: bool,
    pub mounts: Vec<MountSpec>,
    pub syscall_filter: SyscallFilter,
    pub cap_drop_all: bool,
    pub cap_add: Vec<Capability>,
    pub network_mode: NetworkMode,
    pub limits: ResourceLimits,
    pub env: BTreeMap<String, String>,
    pub anti_evasion_tier: AntiEvasionTier,
}

impl SecurityPolicy {
    pub fn writable_paths(&self) -> Vec<&str> {
        self.mounts.iter().map(|m| m.target.as_str()).collect()
    }

    pub fn mount(&self, purpose: MountPurpose) -> Option<&MountSpec> {
        self.mounts.iter().find(|m| m.purpose == purpose)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.cap_add.contains(&cap)
    }
}

/// Builds [`SecurityPolicy`] values from run configuration
#[derive(Debug, Clone)]
pub struct SecurityPolicyBuilder {
    linux_image: String,
    windows_image: String,
}

impl SecurityPolicyBuilder {
    pub fn new(linux_image: impl Into<String>, windows_image: impl Into<String>) -> Self {
        Self {
            linux_image: linux_image.into(),
            windows_image: windows_image.into(),
        }
    }

    pub fn build(&self, config: &SandboxConfig) -> Result<SecurityPolicy, PolicyError> {
        if config.memory_limit_bytes == 0 {
            return Err(PolicyError::NonPositiveMemoryLimit(config.memory_limit_bytes));
        }
        let anti_evasion_tier = AntiEvasionTier::try_from(config.anti_evasion_tier)?;

        let image = match config.os_type {
            OsType::Linux => self.linux_image.clone(),
            OsType::Windows => self.windows_image.clone(),
        };

        let mut cap_add = vec![Capability::SysPtrace];
        let network_mode = if config.capture_network {
            cap_add.push(Capability::NetRaw);
            cap_add.push(Capability::NetAdmin);
            NetworkMode::IsolatedBridge
        } else {
            NetworkMode::Disconnected
        };

        let mut env = BTreeMap::new();
        env.insert("HOME".to_string(), format!("/tmp/home/{}", SANDBOX_USER));
        env.insert("USER".to_string(), SANDBOX_USER.to_string());
        env.insert("LANG".to_string(), "en_US.UTF-8".to_string());
        env.insert("TZ".to_string(), "UTC".to_string());
        if config.os_type == OsType::Windows {
            env.insert("WINEPREFIX".to_string(), format!("/tmp/home/{}/.wine", SANDBOX_USER));
            env.insert("WINEDEBUG".to_string(), "-all".to_string());
        }

        Ok(SecurityPolicy {
            image,
            os_type: config.os_type,
            hostname: SANDBOX_HOSTNAME.to_string(),
            user: SANDBOX_USER.to_string(),
            read_only_rootfs: true,
            no_new_privileges: true,
            mounts: MountPurpose::ALL.iter().copied().map(MountSpec::tmpfs).collect(),
            syscall_filter: SyscallFilter::hardened(),
            cap_drop_all: true,
            cap_add,
            network_mode,
            limits: ResourceLimits {
                memory_bytes: config.memory_limit_bytes,
                memory_swap_bytes: config.memory_limit_bytes,
                nano_cpus: NANO_CPUS,
                pids_limit: PIDS_LIMIT,
            },
            env,
            anti_evasion_tier,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn builder() -> SecurityPolicyBuilder {
        SecurityPolicyBuilder::new("sandbox-linux:test", "sandbox-windows:test")
    }

    #[test]
    fn test_rootfs_read_only_for_every_variant() {
        for os_type in [OsType::Linux, OsType::Windows] {
            for capture_network in [false, true] {
                for tier in [None, Some(1), Some(2)] {
                    let config = SandboxConfig {
                        os_type,
                        capture_network,
                        anti_evasion_tier: tier,
                        ..Default::default()
                    };
                    let policy = builder().build(&config).unwrap();
                    assert!(policy.read_only_rootfs);
                    assert_eq!(
                        policy.writable_paths(),
                        vec![
                            "/tmp",
                            "/sandbox/input",
                            "/sandbox/output",
                            "/sandbox/output/memory",
                            "/sandbox/output/screenshots",
                        ]
                    );
                }
            }
        }
    }

    #[test]
    fn test_network_capabilities_follow_capture_flag() {
        let policy = builder().build(&SandboxConfig::default()).unwrap();
        assert_eq!(policy.cap_add, vec![Capability::SysPtrace]);
        assert_eq!(policy.network_mode, NetworkMode::Disconnected);

        let config = SandboxConfig {
            capture_network: true,
            ..Default::default()
        };
        let policy = builder().build(&config).unwrap();
        assert!(policy.has_capability(Capability::NetRaw));
        assert!(policy.has_capability(Capability::NetAdmin));
        assert_eq!(policy.network_mode.as_docker_name(), "bridge");
    }

    #[test]
    fn test_build_is_deterministic() {
        let config = SandboxConfig {
            os_type: OsType::Windows,
            anti_evasion_tier: Some(2),
            ..Default::default()
        };
        assert_eq!(builder().build(&config).unwrap(), builder().build(&config).unwrap());
    }

    #[test]
    fn test_rejects_zero_memory_and_bad_tier() {
        let config = SandboxConfig {
            memory_limit_bytes: 0,
            ..Default::default()
        };
        assert_eq!(
            builder().build(&config),
            Err(PolicyError::NonPositiveMemoryLimit(0))
        );

        let config = SandboxConfig {
            anti_evasion_tier: Some(3),
            ..Default::default()
        };
        assert_eq!(
            builder().build(&config),
            Err(PolicyError::InvalidAntiEvasionTier(3))
        );
    }

    #[test]
    fn test_limits_and_identity() {
        let policy = builder().build(&SandboxConfig::default()).unwrap();
        assert_eq!(policy.user, "sandbox");
        assert_eq!(policy.limits.pids_limit, 256);
        assert_eq!(policy.limits.memory_swap_bytes, policy.limits.memory_bytes);
        assert_eq!(
            policy.mount(MountPurpose::Scratch).unwrap().to_tmpfs_arg(),
            "/tmp:rw,exec,nosuid,nodev,size=67108864,mode=1777"
        );
        assert_eq!(
            policy.mount(MountPurpose::ResultOutput).unwrap().to_tmpfs_arg(),
            "/sandbox/output:rw,noexec,nosuid,nodev,size=536870912,mode=1777"
        );
    }
}
