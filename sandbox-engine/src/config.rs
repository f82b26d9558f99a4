/// Configuration module for the Sandbox Engine
///
/// This module provides centralized configuration management with support for:
/// - Environment variable loading (`.env` honored through dotenvy)
/// - Default values
/// - Configuration validation
///
/// Per-run settings are not part of this; they arrive with each request as a
/// `SandboxConfig`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure for the Sandbox Engine
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    pub server: ServerConfig,
    pub runtime: RuntimeConfig,
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        Ok(Self {
            server: ServerConfig::from_env()?,
            runtime: RuntimeConfig::from_env()?,
            logging: LoggingConfig::from_env()?,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;
        self.runtime.validate()?;
        Ok(())
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub enable_cors: bool,
}

impl ServerConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("SERVER_PORT")
                .unwrap_or_else(|_| "8004".to_string())
                .parse()
                .context("Invalid SERVER_PORT")?,
            enable_cors: env::var("ENABLE_CORS")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .context("Invalid ENABLE_CORS")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("Server port cannot be 0");
        }
        Ok(())
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8004,
            enable_cors: true,
        }
    }
}

/// Container runtime and run-lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub docker_binary: String,
    pub linux_image: String,
    pub windows_image: String,
    /// Host directory for per-container seccomp profiles
    pub work_dir: PathBuf,
    /// Only files under this directory are served by the memory commands
    pub dumps_dir: PathBuf,
    pub max_sample_size: u64,
    /// Grace period for trace streams to drain after the sample exits
    pub monitor_drain_ms: u64,
    pub teardown_timeout_secs: u64,
    pub volatility_binary: String,
    pub volatility_timeout_secs: u64,
}

impl RuntimeConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            docker_binary: env::var("DOCKER_BINARY").unwrap_or(defaults.docker_binary),
            linux_image: env::var("SANDBOX_LINUX_IMAGE").unwrap_or(defaults.linux_image),
            windows_image: env::var("SANDBOX_WINDOWS_IMAGE").unwrap_or(defaults.windows_image),
            work_dir: env::var("SANDBOX_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            dumps_dir: env::var("SANDBOX_DUMPS_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.dumps_dir),
            max_sample_size: env::var("SANDBOX_MAX_SAMPLE_SIZE")
                .unwrap_or_else(|_| defaults.max_sample_size.to_string())
                .parse()
                .context("Invalid SANDBOX_MAX_SAMPLE_SIZE")?,
            monitor_drain_ms: env::var("SANDBOX_MONITOR_DRAIN_MS")
                .unwrap_or_else(|_| defaults.monitor_drain_ms.to_string())
                .parse()
                .context("Invalid SANDBOX_MONITOR_DRAIN_MS")?,
            teardown_timeout_secs: env::var("SANDBOX_TEARDOWN_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.teardown_timeout_secs.to_string())
                .parse()
                .context("Invalid SANDBOX_TEARDOWN_TIMEOUT_SECS")?,
            volatility_binary: env::var("VOLATILITY_BINARY").unwrap_or(defaults.volatility_binary),
            volatility_timeout_secs: env::var("VOLATILITY_TIMEOUT_SECS")
                .unwrap_or_else(|_| defaults.volatility_timeout_secs.to_string())
                .parse()
                .context("Invalid VOLATILITY_TIMEOUT_SECS")?,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.docker_binary.is_empty() {
            anyhow::bail!("Docker binary cannot be empty");
        }
        if self.linux_image.is_empty() || self.windows_image.is_empty() {
            anyhow::bail!("Sandbox images cannot be empty");
        }
        if self.max_sample_size == 0 {
            anyhow::bail!("Max sample size must be greater than 0");
        }
        if self.teardown_timeout_secs == 0 {
            anyhow::bail!("Teardown timeout must be at least 1 second");
        }
        if self.dumps_dir.as_os_str().is_empty() {
            anyhow::bail!("Dumps directory cannot be empty");
        }
        if self.volatility_timeout_secs == 0 {
            anyhow::bail!("Volatility timeout must be at least 1 second");
        }
        Ok(())
    }

    pub fn monitor_drain(&self) -> Duration {
        Duration::from_millis(self.monitor_drain_ms)
    }

    pub fn teardown_timeout(&self) -> Duration {
        Duration::from_secs(self.teardown_timeout_secs)
    }

    pub fn volatility_timeout(&self) -> Duration {
        Duration::from_secs(self.volatility_timeout_secs)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_binary: "docker".to_string(),
            linux_image: "nexus-security/sandbox-linux:latest".to_string(),
            windows_image: "nexus-security/sandbox-windows:latest".to_string(),
            work_dir: env::temp_dir().join("nexus-sandbox"),
            dumps_dir: env::temp_dir().join("nexus-sandbox").join("dumps"),
            max_sample_size: 100 * 1024 * 1024,
            monitor_drain_ms: 500,
            teardown_timeout_secs: 10,
            volatility_binary: "vol".to_string(),
            volatility_timeout_secs: 300,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Pretty,
    Compact,
}

impl LoggingConfig {
    pub fn from_env() -> Result<Self> {
        let format = match env::var("LOG_FORMAT")
            .unwrap_or_else(|_| "pretty".to_string())
            .to_lowercase()
            .as_str()
        {
            "json" => LogFormat::Json,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Pretty,
        };

        Ok(Self {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format,
        })
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_default_config_creation() {
        let config = EngineConfig::default();
        assert_eq!(config.server.port, 8004);
        assert_eq!(config.server.bind_address(), "0.0.0.0:8004");
        assert_eq!(config.runtime.linux_image, "nexus-security/sandbox-linux:latest");
        assert_eq!(config.runtime.monitor_drain(), Duration::from_millis(500));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_server_config_validation() {
        let mut config = ServerConfig::default();
        assert_ok!(config.validate());

        config.port = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn test_runtime_config_validation() {
        let mut config = RuntimeConfig::default();
        assert_ok!(config.validate());

        config.max_sample_size = 0;
        assert_err!(config.validate());

        config.max_sample_size = 1024;
        config.windows_image = String::new();
        assert_err!(config.validate());

        config.windows_image = "sandbox-windows:test".to_string();
        config.teardown_timeout_secs = 0;
        assert_err!(config.validate());

        config.teardown_timeout_secs = 10;
        config.volatility_timeout_secs = 0;
        assert_err!(config.validate());
    }

    #[test]
    fn test_invalid_enable_cors_rejected() {
        env::set_var("ENABLE_CORS", "maybe");
        let result = ServerConfig::from_env();
        env::set_var("ENABLE_CORS", "false");
        let disabled = ServerConfig::from_env();
        env::remove_var("ENABLE_CORS");

        let err = result.unwrap_err();
        assert!(err.to_string().contains("ENABLE_CORS"));
        assert!(!disabled.unwrap().enable_cors);
    }
}
