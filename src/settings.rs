use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use eyre::{Result, WrapErr};
use serde::{Deserialize, Serialize};

const SETTINGS_FILE: &str = "settings.json";
const CONNECTIONS_FILE: &str = "connections.json";
const LOG_FILE: &str = "dockmate.log";

/// Runtime preferences shared by every connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Prefix each streamed log line with the daemon timestamp.
    pub log_timestamps: bool,
    /// Start a log worker when a non-tty container is started with a sink.
    pub auto_log_on_start: bool,
    pub log_retry_limit: u32,
    pub attach_reattach_limit: u32,
    pub log_initial_delay_ms: u64,
    pub log_poll_delay_ms: u64,
    pub stop_poll_interval_ms: u64,
    pub request_timeout_secs: u64,
    pub stop_timeout_secs: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_timestamps: true,
            auto_log_on_start: true,
            log_retry_limit: 5,
            attach_reattach_limit: 1,
            log_initial_delay_ms: 100,
            log_poll_delay_ms: 1000,
            stop_poll_interval_ms: 1000,
            request_timeout_secs: 120,
            stop_timeout_secs: 10,
        }
    }
}

impl Settings {
    /// Reads `settings.json` from `dir`, falling back to defaults when the
    /// file does not exist.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(SETTINGS_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(&path)
            .wrap_err_with(|| format!("reading {}", path.display()))?;
        serde_json::from_str(&raw).wrap_err_with(|| format!("parsing {}", path.display()))
    }

    pub fn log_initial_delay(&self) -> Duration {
        Duration::from_millis(self.log_initial_delay_ms)
    }

    pub fn log_poll_delay(&self) -> Duration {
        Duration::from_millis(self.log_poll_delay_ms)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }
}

/// Where dockmate keeps its files.
#[derive(Debug, Clone)]
pub struct Paths {
    pub config_dir: PathBuf,
    pub data_dir: PathBuf,
}

impl Paths {
    pub fn discover(config_override: Option<PathBuf>) -> Result<Self> {
        let dirs = ProjectDirs::from("org", "dockmate", "dockmate")
            .ok_or_else(|| eyre::eyre!("unable to determine a home directory"))?;
        let config_dir = config_override.unwrap_or_else(|| dirs.config_dir().to_path_buf());
        let data_dir = dirs.data_dir().to_path_buf();
        Ok(Self {
            config_dir,
            data_dir,
        })
    }

    pub fn connections_file(&self) -> PathBuf {
        self.config_dir.join(CONNECTIONS_FILE)
    }

    pub fn log_file(&self) -> PathBuf {
        self.data_dir.join(LOG_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(SETTINGS_FILE),
            r#"{ "log_timestamps": false, "log_retry_limit": 2 }"#,
        )
        .unwrap();

        let settings = Settings::load(dir.path()).unwrap();
        assert!(!settings.log_timestamps);
        assert_eq!(settings.log_retry_limit, 2);
        assert!(settings.auto_log_on_start);
        assert_eq!(settings.stop_poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(SETTINGS_FILE), "{ nope").unwrap();
        assert!(Settings::load(dir.path()).is_err());
    }
}
