// SPDX-FileCopyrightText: © 2026 TSRec Contributors
//
// SPDX-License-Identifier: MPL-2.0

use std::path::{Path, PathBuf};

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::Level;

use tsrec_core::units::{parse_byte_size, parse_duration};
use tsrec_core::{RecError, Result};
use tsrec_engine::RecorderConfig;

/// Log level for filtering messages.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Debug => Self::DEBUG,
            LogLevel::Info => Self::INFO,
            LogLevel::Warn => Self::WARN,
            LogLevel::Error => Self::ERROR,
        }
    }
}

/// Logging configuration for console and file output.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LogConfig {
    #[serde(default)]
    pub console_enable: bool,
    #[serde(default)]
    pub file_enable: bool,
    #[serde(default)]
    pub console_level: LogLevel,
    #[serde(default)]
    pub file_level: LogLevel,
    #[serde(default)]
    pub file_path: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            console_enable: true,
            file_enable: false,
            console_level: LogLevel::default(),
            file_level: LogLevel::Info,
            file_path: "./tsrecd.log".to_string(),
        }
    }
}

/// HTTP server configuration.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    pub address: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { address: "127.0.0.1:4646".to_string() }
    }
}

/// Identity of the bot this recorder belongs to.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct BotConfig {
    pub id: i64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self { id: 0 }
    }
}

fn default_stop_delay() -> String {
    "30s".to_string()
}

fn default_min_duration() -> String {
    "1s".to_string()
}

const fn default_bitrate() -> i32 {
    48
}

/// Channel recording options.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct RecordingConfig {
    /// Gate for all recording.
    #[serde(default)]
    pub enabled: bool,
    /// Recording root, absolute or relative to the config file's directory.
    #[serde(default = "default_recording_path")]
    pub path: String,
    /// Total-size quota with a K/M/G/T suffix; empty, zero or unparseable
    /// disables eviction.
    #[serde(default)]
    pub max_total_size: String,
    /// How long to keep recording while the channel is empty.
    #[serde(default = "default_stop_delay")]
    pub stop_delay: String,
    /// Recordings shorter than this are discarded.
    #[serde(default = "default_min_duration")]
    pub min_duration: String,
    /// Opus encoder bitrate in kbps.
    #[serde(default = "default_bitrate")]
    pub bitrate: i32,
    /// Uids that do not count when deciding whether the channel is empty.
    #[serde(default)]
    pub exclude_uids: Vec<String>,
}

fn default_recording_path() -> String {
    "recordings".to_string()
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: default_recording_path(),
            max_total_size: String::new(),
            stop_delay: default_stop_delay(),
            min_duration: default_min_duration(),
            bitrate: default_bitrate(),
            exclude_uids: Vec::new(),
        }
    }
}

impl RecordingConfig {
    /// Resolves the recording root against the config file's directory.
    pub fn resolved_root(&self, config_dir: &Path) -> PathBuf {
        let path = Path::new(&self.path);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            config_dir.join(path)
        }
    }

    /// Builds the engine configuration, parsing the human-readable fields.
    ///
    /// # Errors
    ///
    /// Returns [`RecError::Config`] when a duration does not parse.
    pub fn recorder_config(&self, bot_id: i64, config_dir: &Path) -> Result<RecorderConfig> {
        Ok(RecorderConfig {
            bot_id,
            root: self.resolved_root(config_dir),
            enabled: self.enabled,
            bitrate_kbps: self.bitrate,
            stop_delay: parse_duration(&self.stop_delay)?,
            min_duration: parse_duration(&self.min_duration)?,
            max_total_size: parse_byte_size(&self.max_total_size),
            exclude_uids: self.exclude_uids.clone(),
        })
    }
}

/// Root configuration for the tsrecd server.
#[derive(Deserialize, Serialize, Default, Debug, Clone)]
pub struct Config {
    #[serde(default)]
    pub bot: BotConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub log: LogConfig,

    #[serde(default)]
    pub recording: RecordingConfig,
}

#[derive(Debug)]
pub struct ConfigLoadResult {
    pub config: Config,
    pub file_missing: Option<String>,
}

/// Loads the configuration from defaults, a TOML file, and environment
/// variables (`TSREC_` prefix, `__` section separator).
///
/// # Errors
///
/// Returns an error when the file or environment contains invalid values.
pub fn load(config_path: &str) -> Result<ConfigLoadResult> {
    let mut figment =
        Figment::new().merge(figment::providers::Serialized::defaults(Config::default()));

    let mut file_missing = None;

    // A missing config file is fine; defaults and env carry the setup.
    if std::path::Path::new(config_path).exists() {
        figment = figment.merge(Toml::file(config_path));
    } else {
        file_missing = Some(config_path.to_string());
    }

    let config: Config = figment
        .merge(Env::prefixed("TSREC_").split("__"))
        .extract()
        .map_err(|e| RecError::Config(e.to_string()))?;

    Ok(ConfigLoadResult { config, file_missing })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(!config.recording.enabled);
        assert_eq!(config.recording.bitrate, 48);
        assert_eq!(config.recording.stop_delay, "30s");
    }

    #[test]
    fn test_recorder_config_parses_units() {
        let mut recording = RecordingConfig::default();
        recording.max_total_size = "7M".to_string();
        recording.stop_delay = "45s".to_string();
        let rc = recording.recorder_config(3, Path::new("/etc/tsrec")).unwrap();
        assert_eq!(rc.bot_id, 3);
        assert_eq!(rc.max_total_size, Some(7 * 1024 * 1024));
        assert_eq!(rc.stop_delay.as_secs(), 45);
        assert_eq!(rc.root, Path::new("/etc/tsrec/recordings"));
    }

    #[test]
    fn test_invalid_duration_is_config_error() {
        let mut recording = RecordingConfig::default();
        recording.min_duration = "often".to_string();
        assert!(recording.recorder_config(1, Path::new("/tmp")).is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tsrec.toml");
        std::fs::write(
            &path,
            "[bot]\nid = 7\n\n[recording]\nenabled = true\npath = \"rec\"\nbitrate = 96\n",
        )
        .unwrap();

        let loaded = load(path.to_str().unwrap()).unwrap();
        assert!(loaded.file_missing.is_none());
        assert_eq!(loaded.config.bot.id, 7);
        assert!(loaded.config.recording.enabled);
        assert_eq!(loaded.config.recording.bitrate, 96);
    }
}
