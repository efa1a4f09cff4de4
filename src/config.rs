//! TOML configuration for the gateway

use crate::artifacts::HostLayout;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// On-demand host provisioning settings
    #[serde(default)]
    pub provisioning: ProvisioningConfig,

    /// Layout of the host runtime
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8888)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Path to PID file (optional)
    pub pid_file: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            pid_file: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProvisioningConfig {
    /// Log per-request provisioning diagnostics (default: false)
    #[serde(default)]
    pub logging_enabled: bool,

    /// Seconds to wait for the runtime to deploy a new host, 0 disables (default: 3)
    #[serde(default = "default_wait_for_context")]
    pub wait_for_context_secs: u64,

    /// Interval between deployment checks in milliseconds (default: 1000)
    #[serde(default = "default_wait_poll_interval")]
    pub wait_poll_interval_ms: u64,

    /// Minimum spacing between host creations in milliseconds (default: 30000)
    #[serde(default = "default_time_between_creations")]
    pub time_between_creations_ms: u64,

    /// Maximum hosts created per process lifetime (default: 10)
    #[serde(default = "default_max_creations")]
    pub max_creations: u32,

    /// Let new hosts scan their dependency paths on deploy (default: false)
    #[serde(default)]
    pub scan_dependency_paths: bool,

    /// Key the front-end web server must send along; unset disables the check
    pub shared_key: Option<String>,
}

impl Default for ProvisioningConfig {
    fn default() -> Self {
        Self {
            logging_enabled: false,
            wait_for_context_secs: default_wait_for_context(),
            wait_poll_interval_ms: default_wait_poll_interval(),
            time_between_creations_ms: default_time_between_creations(),
            max_creations: default_max_creations(),
            scan_dependency_paths: false,
            shared_key: None,
        }
    }
}

impl ProvisioningConfig {
    pub fn wait_for_context(&self) -> Duration {
        Duration::from_secs(self.wait_for_context_secs)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }

    pub fn time_between_creations(&self) -> Duration {
        Duration::from_millis(self.time_between_creations_ms)
    }

    /// Configured shared key, treating an empty string as unset
    pub fn shared_key(&self) -> Option<&str> {
        self.shared_key.as_deref().filter(|key| !key.is_empty())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Runtime base directory holding `conf/` and `work/` (default: .)
    #[serde(default = "default_base_dir")]
    pub base_dir: String,

    /// Engine name used in the per-host directory layout (default: Catalina)
    #[serde(default = "default_engine_name")]
    pub engine_name: String,

    /// Application base directory for new hosts (default: webapps)
    #[serde(default = "default_app_base")]
    pub app_base: String,

    /// Host registered at startup that receives unprovisioned traffic (default: localhost)
    #[serde(default = "default_host")]
    pub default_host: String,

    /// Deployment scan interval in milliseconds (default: 500)
    #[serde(default = "default_scan_interval")]
    pub scan_interval_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            base_dir: default_base_dir(),
            engine_name: default_engine_name(),
            app_base: default_app_base(),
            default_host: default_host(),
            scan_interval_ms: default_scan_interval(),
        }
    }
}

impl RuntimeConfig {
    pub fn base_dir(&self) -> PathBuf {
        PathBuf::from(&self.base_dir)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }
}

/// Upper bound for the deployment wait, one hour
const MAX_WAIT_FOR_CONTEXT_SECS: u64 = 3600;

// Default value functions
fn default_listen_port() -> u16 {
    8888
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_wait_for_context() -> u64 {
    3 // 3 seconds
}

fn default_wait_poll_interval() -> u64 {
    1000 // 1 second
}

fn default_time_between_creations() -> u64 {
    30000 // 30 seconds
}

fn default_max_creations() -> u32 {
    10
}

fn default_base_dir() -> String {
    ".".to_string()
}

fn default_engine_name() -> String {
    "Catalina".to_string()
}

fn default_app_base() -> String {
    "webapps".to_string()
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_scan_interval() -> u64 {
    500 // 500ms
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.provisioning.wait_for_context_secs > MAX_WAIT_FOR_CONTEXT_SECS {
            errors.push(format!(
                "provisioning.wait_for_context_secs must be at most {}",
                MAX_WAIT_FOR_CONTEXT_SECS
            ));
        }

        if self.provisioning.wait_poll_interval_ms == 0 {
            errors.push("provisioning.wait_poll_interval_ms must be greater than 0".to_string());
        }

        if matches!(self.provisioning.shared_key.as_deref(), Some("")) {
            errors.push("provisioning.shared_key must not be empty when set".to_string());
        }

        let engine = &self.runtime.engine_name;
        if !HostLayout::is_host_segment(engine) || engine.contains('\\') {
            errors.push(format!(
                "runtime.engine_name '{}' must be a single path segment",
                engine
            ));
        }

        if self.runtime.default_host.trim().is_empty() {
            errors.push("runtime.default_host must not be empty".to_string());
        }

        if self.runtime.app_base.is_empty() {
            errors.push("runtime.app_base must not be empty".to_string());
        }

        if self.runtime.scan_interval_ms == 0 {
            errors.push("runtime.scan_interval_ms must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"

[provisioning]
logging_enabled = true
wait_for_context_secs = 5
time_between_creations_ms = 1000
max_creations = 50
scan_dependency_paths = true
shared_key = "s3cret"

[runtime]
base_dir = "/opt/runtime"
engine_name = "Main"
default_host = "default.local"
"#;

        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.provisioning.logging_enabled);
        assert_eq!(config.provisioning.wait_for_context(), Duration::from_secs(5));
        assert_eq!(
            config.provisioning.time_between_creations(),
            Duration::from_millis(1000)
        );
        assert_eq!(config.provisioning.max_creations, 50);
        assert!(config.provisioning.scan_dependency_paths);
        assert_eq!(config.provisioning.shared_key(), Some("s3cret"));
        assert_eq!(config.runtime.base_dir(), PathBuf::from("/opt/runtime"));
        assert_eq!(config.runtime.engine_name, "Main");
        assert_eq!(config.runtime.app_base, "webapps");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_provisioning_config() {
        let config = ProvisioningConfig::default();
        assert!(!config.logging_enabled);
        assert_eq!(config.wait_for_context_secs, 3);
        assert_eq!(config.wait_poll_interval_ms, 1000);
        assert_eq!(config.time_between_creations_ms, 30000);
        assert_eq!(config.max_creations, 10);
        assert!(!config.scan_dependency_paths);
        assert_eq!(config.shared_key(), None);
    }

    #[test]
    fn test_empty_config() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.runtime.engine_name, "Catalina");
        assert_eq!(config.runtime.default_host, "localhost");
        assert_eq!(config.runtime.scan_interval(), Duration::from_millis(500));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_negative_wait_rejected_by_parser() {
        let toml = r#"
[provisioning]
wait_for_context_secs = -1
"#;
        assert!(toml::from_str::<Config>(toml).is_err());
    }

    #[test]
    fn test_validate_multiple_errors() {
        let mut config = Config::default();
        config.provisioning.wait_poll_interval_ms = 0;
        config.provisioning.shared_key = Some(String::new());
        config.runtime.engine_name = "../escape".to_string();
        config.runtime.scan_interval_ms = 0;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("wait_poll_interval_ms"));
        assert!(err.contains("shared_key"));
        assert!(err.contains("engine_name"));
        assert!(err.contains("scan_interval_ms"));
    }

    #[test]
    fn test_validate_wait_for_context_bound() {
        let mut config = Config::default();
        config.provisioning.wait_for_context_secs = MAX_WAIT_FOR_CONTEXT_SECS;
        assert!(config.validate().is_ok());

        config.provisioning.wait_for_context_secs = u64::MAX;
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("wait_for_context_secs"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[provisioning]\nmax_creations = 2\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.provisioning.max_creations, 2);

        std::fs::write(&path, "[runtime]\ndefault_host = \"\"\n").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
