use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{ConfigError, Result};

/// The web application the export run drives. Overridable for testing
/// against a local fixture server.
pub const DEFAULT_TARGET_URL: &str = "https://app.plaud.ai";

pub const DEFAULT_DELAY_MS: u64 = 1000;

/// Immutable-for-the-run configuration handed to the export engine.
///
/// The host (CLI or any other embedder) owns persistence; the engine only
/// ever sees the materialized value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct ExportSettings {
    /// Where exported recordings land. Also hosts the temporary browser
    /// profile directories for persistent sessions.
    pub download_dir: PathBuf,
    /// Inter-step delay in milliseconds. Values below 500 are prone to
    /// missed UI transitions.
    pub delay_ms: u64,
    /// Maximum recordings to export; -1 exports everything discovered.
    pub max_recordings: i64,
    pub headless: bool,
    /// Launch a persistent session when a desktop browser profile exists on
    /// the host, which keeps passkey logins working.
    pub use_existing_profile: bool,
    pub target_url: String,
}

impl Default for ExportSettings {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            delay_ms: DEFAULT_DELAY_MS,
            max_recordings: -1,
            headless: false,
            use_existing_profile: true,
            target_url: DEFAULT_TARGET_URL.to_string(),
        }
    }
}

impl ExportSettings {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.delay_ms == 0 {
            return Err(ConfigError::Invalid(
                "delay_ms must be greater than zero".into(),
            ));
        }
        if self.delay_ms < 500 {
            warn!(
                delay_ms = self.delay_ms,
                "delay below 500ms is prone to missed UI transitions"
            );
        }
        if self.download_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("download_dir must not be empty".into()));
        }
        url::Url::parse(&self.target_url)
            .map_err(|err| ConfigError::Invalid(format!("invalid target_url: {err}")))?;
        Ok(())
    }
}

pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("PlaudAudio")
}

pub fn load_settings<P: AsRef<Path>>(path: P) -> Result<ExportSettings> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

pub fn save_settings<P: AsRef<Path>>(path: P, settings: &ExportSettings) -> Result<()> {
    let path = path.as_ref();
    let content = toml::to_string_pretty(settings).map_err(|source| ConfigError::Serialize {
        source,
        path: path.to_path_buf(),
    })?;
    std::fs::write(path, content).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_export_everything() {
        let settings = ExportSettings::default();
        assert_eq!(settings.max_recordings, -1);
        assert_eq!(settings.delay_ms, DEFAULT_DELAY_MS);
        assert!(settings.use_existing_profile);
        assert!(!settings.headless);
        assert_eq!(settings.target_url, DEFAULT_TARGET_URL);
    }

    #[test]
    fn settings_round_trip_through_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let mut settings = ExportSettings::default();
        settings.delay_ms = 750;
        settings.max_recordings = 5;
        settings.headless = true;

        save_settings(&path, &settings).unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.delay_ms, 750);
        assert_eq!(loaded.max_recordings, 5);
        assert!(loaded.headless);
        assert_eq!(loaded.download_dir, settings.download_dir);
    }

    #[test]
    fn partial_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        std::fs::write(&path, "delay_ms = 2000\n").unwrap();
        let loaded = load_settings(&path).unwrap();
        assert_eq!(loaded.delay_ms, 2000);
        assert_eq!(loaded.max_recordings, -1);
        assert_eq!(loaded.target_url, DEFAULT_TARGET_URL);
    }

    #[test]
    fn validate_rejects_zero_delay_and_bad_url() {
        let mut settings = ExportSettings::default();
        settings.delay_ms = 0;
        assert!(settings.validate().is_err());

        settings.delay_ms = 1000;
        settings.target_url = "not a url".into();
        assert!(settings.validate().is_err());
    }
}
