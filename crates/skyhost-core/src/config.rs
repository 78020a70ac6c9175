//! Daemon configuration
//!
//! Supports multiple configuration file formats:
//! - TOML (.toml)
//! - YAML (.yaml, .yml)
//! - JSON (.json)
//!
//! Every field has a default so an absent or partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Supported configuration file formats
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Toml,
    Yaml,
    Json,
}

impl ConfigFormat {
    /// Detect format from file extension
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "toml" => Some(ConfigFormat::Toml),
            "yaml" | "yml" => Some(ConfigFormat::Yaml),
            "json" => Some(ConfigFormat::Json),
            _ => None,
        }
    }

    /// Detect format from file path
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|e| e.to_str())
            .and_then(Self::from_extension)
    }
}

/// Sandboxing and stats switches for the process backend
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityConfig {
    /// Run processes directly instead of inside the namespace sandbox
    pub disable_unshare: bool,
    /// Extra host paths bind-mounted into every sandbox
    pub extra_mounts: Vec<String>,
    /// Parent of the per-process sandbox roots; the system temp dir when unset
    pub sandbox_dir: Option<PathBuf>,
    /// Skip stats collection entirely
    pub stats_disabled: bool,
    /// Skip the JVM heap enrichment
    pub jvm_stats_disabled: bool,
}

/// Container runtime settings
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DockerConfig {
    /// Host-visible path of the data dir when the daemon itself runs in a container
    pub root: Option<PathBuf>,
    /// Reject `host` network mode in server definitions
    pub disallow_host: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Console ring buffer size in bytes
    pub buffer_size: usize,
    /// Mirror server output into the daemon log at debug level
    pub forward: bool,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_CONSOLE_BUFFER_SIZE,
            forward: false,
        }
    }
}

/// Background ticker settings for the server service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    pub start_interval_ms: u64,
    pub stats_interval_secs: u64,
    pub cpu_alert_threshold: f64,
    pub memory_alert_threshold: f64,
    pub alert_cooldown_secs: u64,
    pub stop_timeout_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            start_interval_ms: DEFAULT_START_INTERVAL_MS,
            stats_interval_secs: DEFAULT_STATS_INTERVAL_SECS,
            cpu_alert_threshold: DEFAULT_CPU_ALERT_THRESHOLD,
            memory_alert_threshold: DEFAULT_MEMORY_ALERT_THRESHOLD,
            alert_cooldown_secs: DEFAULT_ALERT_COOLDOWN_SECS,
            stop_timeout_secs: DEFAULT_STOP_TIMEOUT_SECS,
        }
    }
}

impl ServiceConfig {
    pub fn start_interval(&self) -> Duration {
        Duration::from_millis(self.start_interval_ms.max(1))
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval_secs.max(1))
    }

    pub fn alert_cooldown(&self) -> Duration {
        Duration::from_secs(self.alert_cooldown_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }
}

/// Daemon configuration file (skyhost.toml/yaml/json)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Parent of every server root (`<data_dir>/<id>`)
    pub data_dir: PathBuf,
    pub servers_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub binaries_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub socket_path: PathBuf,
    /// Write a daily rolling daemon log here when set
    pub log_dir: Option<PathBuf>,
    pub crash_limit: u32,
    pub security: SecurityConfig,
    pub docker: DockerConfig,
    pub console: ConsoleConfig,
    pub service: ServiceConfig,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir(),
            servers_dir: servers_dir(),
            backups_dir: backups_dir(),
            binaries_dir: binaries_dir(),
            cache_dir: cache_dir(),
            socket_path: socket_path(),
            log_dir: None,
            crash_limit: DEFAULT_CRASH_LIMIT,
            security: SecurityConfig::default(),
            docker: DockerConfig::default(),
            console: ConsoleConfig::default(),
            service: ServiceConfig::default(),
        }
    }
}

impl DaemonConfig {
    /// Config rooted at a single directory, used by tests and portable installs
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            data_dir: base.join("data"),
            servers_dir: base.join(SERVERS_DIR),
            backups_dir: base.join(BACKUPS_DIR),
            binaries_dir: base.join(BINARIES_DIR),
            cache_dir: base.join(CACHE_DIR),
            socket_path: base.join(SOCKET_FILE),
            ..Self::default()
        }
    }

    /// Load config from file, automatically detecting format from extension
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::ConfigNotFound(path.to_path_buf()));
        }

        let format = ConfigFormat::from_path(path).ok_or_else(|| {
            Error::ConfigError(format!(
                "Unsupported config file extension: {}. Expected .toml, .yaml, .yml, or .json",
                path.display()
            ))
        })?;

        let content = std::fs::read_to_string(path)?;
        Self::parse(&content, format)
    }

    /// Parse config content with specified format
    pub fn parse(content: &str, format: ConfigFormat) -> Result<Self> {
        let config: DaemonConfig = match format {
            ConfigFormat::Toml => toml::from_str(content)?,
            ConfigFormat::Yaml => serde_yaml::from_str(content)?,
            ConfigFormat::Json => serde_json::from_str(content)?,
        };
        Ok(config)
    }

    /// Resolve the config: explicit path, then `SKYHOST_CONFIG`, then the
    /// first known file name under the skyhost home. Falls back to defaults.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }

        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            return Ok((Self::load(&path)?, Some(path)));
        }

        let home = skyhost_home();
        for name in CONFIG_FILES {
            let path = home.join(name);
            if path.exists() {
                return Ok((Self::load(&path)?, Some(path)));
            }
        }

        Ok((Self::default(), None))
    }

    /// Root directory of a server
    pub fn server_root(&self, id: &str) -> PathBuf {
        self.data_dir.join(id)
    }

    /// Backup directory of a server
    pub fn server_backups(&self, id: &str) -> PathBuf {
        self.backups_dir.join(id)
    }

    /// Definition file of a server
    pub fn server_file(&self, id: &str) -> PathBuf {
        self.servers_dir.join(format!("{}.json", id))
    }

    /// Schedule file of a server
    pub fn schedule_file(&self, id: &str) -> PathBuf {
        self.servers_dir.join(format!("{}.cron", id))
    }

    /// Create every directory the daemon writes into
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.data_dir,
            &self.servers_dir,
            &self.backups_dir,
            &self.binaries_dir,
            &self.cache_dir,
        ] {
            std::fs::create_dir_all(dir)?;
        }
        if let Some(parent) = self.socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_format_detection() {
        assert_eq!(ConfigFormat::from_extension("toml"), Some(ConfigFormat::Toml));
        assert_eq!(ConfigFormat::from_extension("yaml"), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_extension("yml"), Some(ConfigFormat::Yaml));
        assert_eq!(ConfigFormat::from_extension("json"), Some(ConfigFormat::Json));
        assert_eq!(ConfigFormat::from_extension("txt"), None);
    }

    #[test]
    fn test_config_parse_toml() {
        let config_content = r#"
data_dir = "/srv/skyhost/data"
crash_limit = 5

[security]
disable_unshare = true
extra_mounts = ["/opt/java"]

[service]
stats_interval_secs = 10
"#;
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        file.write_all(config_content.as_bytes()).unwrap();

        let config = DaemonConfig::load(file.path()).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/srv/skyhost/data"));
        assert_eq!(config.crash_limit, 5);
        assert!(config.security.disable_unshare);
        assert_eq!(config.security.extra_mounts, vec!["/opt/java".to_string()]);
        assert_eq!(config.service.stats_interval_secs, 10);
        assert_eq!(config.service.start_interval_ms, DEFAULT_START_INTERVAL_MS);
    }

    #[test]
    fn test_config_parse_yaml() {
        let config_content = r#"
crash_limit: 1
docker:
  root: /var/lib/skyhost
console:
  buffer_size: 1024
"#;
        let config = DaemonConfig::parse(config_content, ConfigFormat::Yaml).unwrap();
        assert_eq!(config.crash_limit, 1);
        assert_eq!(config.docker.root, Some(PathBuf::from("/var/lib/skyhost")));
        assert_eq!(config.console.buffer_size, 1024);
    }

    #[test]
    fn test_config_parse_json() {
        let config = DaemonConfig::parse(r#"{"crash_limit": 0}"#, ConfigFormat::Json).unwrap();
        assert_eq!(config.crash_limit, 0);
        assert_eq!(config.console.buffer_size, DEFAULT_CONSOLE_BUFFER_SIZE);
    }

    #[test]
    fn test_config_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".ini").unwrap();
        let result = DaemonConfig::load(file.path());
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_config_not_found() {
        let result = DaemonConfig::load(Path::new("/nonexistent/skyhost.toml"));
        assert!(matches!(result, Err(Error::ConfigNotFound(_))));
    }

    #[test]
    fn test_server_paths() {
        let config = DaemonConfig::rooted_at(Path::new("/tmp/sky"));
        assert_eq!(config.server_root("abc"), PathBuf::from("/tmp/sky/data/abc"));
        assert_eq!(
            config.server_file("abc"),
            PathBuf::from("/tmp/sky/servers/abc.json")
        );
        assert_eq!(
            config.schedule_file("abc"),
            PathBuf::from("/tmp/sky/servers/abc.cron")
        );
        assert_eq!(config.server_backups("abc"), PathBuf::from("/tmp/sky/backups/abc"));
    }
}
