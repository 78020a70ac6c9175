//! Constants and default values for skyhost

use std::path::PathBuf;

/// Default skyhost home directory name
pub const SKYHOST_DIR: &str = ".skyhost";

/// Default socket file name
pub const SOCKET_FILE: &str = "daemon.sock";

/// Directory holding server definitions (`<id>.json`) and schedules (`<id>.cron`)
pub const SERVERS_DIR: &str = "servers";

/// Directory holding per-server backups
pub const BACKUPS_DIR: &str = "backups";

/// Shared binaries folder mounted into every server
pub const BINARIES_DIR: &str = "binaries";

/// Shared download cache mounted into sandboxed processes
pub const CACHE_DIR: &str = "cache";

/// Default log directory name
pub const LOGS_DIR: &str = "logs";

/// Environment variable pointing at an explicit config file
pub const CONFIG_ENV: &str = "SKYHOST_CONFIG";

/// Default config file names to search for (in priority order)
pub const CONFIG_FILES: &[&str] = &[
    "skyhost.toml",
    "skyhost.yaml",
    "skyhost.yml",
    "skyhost.json",
];

/// Host environment variables with this prefix never reach a server process
pub const STRIPPED_ENV_PREFIX: &str = "SKYHOST_";

/// Prefix for daemon generated console lines
pub const CONSOLE_PREFIX: &str = "[DAEMON] ";

/// Default number of consecutive crashes that are auto-restarted
pub const DEFAULT_CRASH_LIMIT: u32 = 3;

/// Seconds a stats sample stays valid
pub const STATS_CACHE_SECS: u64 = 5;

/// Default console ring buffer capacity in bytes
pub const DEFAULT_CONSOLE_BUFFER_SIZE: usize = 256 * 1024;

/// Default capacity of each tracker broadcast channel
pub const DEFAULT_TRACKER_CAPACITY: usize = 256;

/// Interval between two queued server starts
pub const DEFAULT_START_INTERVAL_MS: u64 = 1000;

/// Interval between two stats broadcasts
pub const DEFAULT_STATS_INTERVAL_SECS: u64 = 5;

/// CPU percentage above which a server raises an alert
pub const DEFAULT_CPU_ALERT_THRESHOLD: f64 = 80.0;

/// Memory percentage above which a server raises an alert
pub const DEFAULT_MEMORY_ALERT_THRESHOLD: f64 = 90.0;

/// Minimum seconds between two alerts of the same kind
pub const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 300;

/// Time granted to a server for a graceful stop on daemon shutdown
pub const DEFAULT_STOP_TIMEOUT_SECS: u64 = 30;

/// Default scheduler concurrency limit
pub const DEFAULT_CONCURRENT_LIMIT: usize = 5;

/// Default scheduler timezone, the host local time
pub const DEFAULT_TIMEZONE: &str = "Local";

/// Default working directory inside a container
pub const DEFAULT_CONTAINER_ROOT: &str = "/skyhost";

/// Where the shared binaries folder is mounted inside a container
pub const CONTAINER_BINARIES_DIR: &str = "/var/lib/skyhost/binaries";

/// Label identifying the owning server on a container
pub const SERVER_LABEL: &str = "skyhost.server";

/// Image used when a container environment names none
pub const DEFAULT_CONTAINER_IMAGE: &str = "debian:stable-slim";

/// Get the skyhost home directory
pub fn skyhost_home() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(SKYHOST_DIR))
        .unwrap_or_else(|| PathBuf::from(SKYHOST_DIR))
}

/// Get the socket path
pub fn socket_path() -> PathBuf {
    skyhost_home().join(SOCKET_FILE)
}

/// Get the default data directory (server roots live here)
pub fn data_dir() -> PathBuf {
    skyhost_home().join("data")
}

/// Get the default servers directory
pub fn servers_dir() -> PathBuf {
    skyhost_home().join(SERVERS_DIR)
}

/// Get the default backups directory
pub fn backups_dir() -> PathBuf {
    skyhost_home().join(BACKUPS_DIR)
}

/// Get the default shared binaries directory
pub fn binaries_dir() -> PathBuf {
    skyhost_home().join(BINARIES_DIR)
}

/// Get the default cache directory
pub fn cache_dir() -> PathBuf {
    skyhost_home().join(CACHE_DIR)
}

/// Get the logs directory
pub fn logs_dir() -> PathBuf {
    skyhost_home().join(LOGS_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skyhost_home() {
        let home = skyhost_home();
        assert!(home.to_string_lossy().contains(".skyhost"));
    }

    #[test]
    fn test_socket_path() {
        let path = socket_path();
        assert!(path.to_string_lossy().contains("daemon.sock"));
    }

    #[test]
    fn test_dirs_live_under_home() {
        let home = skyhost_home();
        assert!(servers_dir().starts_with(&home));
        assert!(backups_dir().starts_with(&home));
        assert!(binaries_dir().ends_with(BINARIES_DIR));
    }
}
