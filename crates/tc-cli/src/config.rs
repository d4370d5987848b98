//! Configuration loading and management.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};

/// Application configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Per-request meeting probe timeout, clamped to 5-8 seconds.
    pub probe_timeout_secs: u64,
    /// Meeting URLs probed at once during detection.
    pub probe_concurrency: usize,
    /// Probe the meeting URL before a manual or extension start.
    pub verify_meeting_url: bool,
    /// How far ahead `slots remind` looks.
    pub reminder_lead_minutes: i64,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_path", &self.database_path)
            .field("probe_timeout_secs", &self.probe_timeout_secs)
            .field("probe_concurrency", &self.probe_concurrency)
            .field("verify_meeting_url", &self.verify_meeting_url)
            .field("reminder_lead_minutes", &self.reminder_lead_minutes)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("tc.db"),
            probe_timeout_secs: 8,
            probe_concurrency: 8,
            verify_meeting_url: true,
            reminder_lead_minutes: 60,
        }
    }
}

impl Config {
    /// Config for a database at `path` with every other key at its default.
    pub fn with_database(path: impl Into<PathBuf>) -> Self {
        Self {
            database_path: path.into(),
            ..Self::default()
        }
    }

    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // TC_DATABASE_PATH, TC_PROBE_TIMEOUT_SECS, ...
        figment = figment.merge(Env::prefixed("TC_"));

        figment.extract()
    }

    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    /// Concurrency of at least one.
    pub fn probe_concurrency(&self) -> usize {
        self.probe_concurrency.max(1)
    }
}

/// Returns the platform-specific config directory for tc.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("tc"))
}

/// Returns the platform-specific data directory for tc.
///
/// On Linux: `~/.local/share/tc`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("tc"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_path_ends_with_tc() {
        let path = dirs_data_path().unwrap();
        assert_eq!(path.file_name().unwrap(), "tc");
    }

    #[test]
    fn default_config_uses_data_dir_for_db() {
        let config = Config::default();
        assert_eq!(config.database_path, dirs_data_path().unwrap().join("tc.db"));
        assert_eq!(config.probe_timeout(), Duration::from_secs(8));
        assert!(config.verify_meeting_url);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "database_path = \"/tmp/other.db\"\nprobe_concurrency = 0\nverify_meeting_url = false\n",
        )
        .unwrap();
        let config = Config::load_from(Some(&path)).unwrap();
        assert_eq!(config.database_path, PathBuf::from("/tmp/other.db"));
        assert_eq!(config.probe_concurrency(), 1);
        assert!(!config.verify_meeting_url);
        assert_eq!(config.reminder_lead_minutes, 60);
    }
}
