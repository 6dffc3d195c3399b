use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, VoxError};
use crate::orchestrator::{AfterInterrupt, LoopConfig};
use crate::playback::TextPacing;

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}

fn default_chat_path() -> String {
    "/chat".to_string()
}

fn default_upload_path() -> String {
    "/upload-audio".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

const fn default_timeout_secs() -> u64 {
    30
}

const fn default_health_interval_secs() -> u64 {
    30
}

const fn default_min_capture_bytes() -> usize {
    8000
}

const fn default_sample_tick_ms() -> u64 {
    16
}

const fn default_text_ms_per_char() -> u64 {
    50
}

const fn default_text_min_ms() -> u64 {
    3000
}

const fn default_true() -> bool {
    true
}

fn default_history_path() -> String {
    let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".local/share"));
    data_dir
        .join("voxloop/history.json")
        .to_string_lossy()
        .to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,

    #[serde(default)]
    pub audio: AudioConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,

    #[serde(default)]
    pub playback: PlaybackConfig,

    #[serde(default)]
    pub history: HistoryConfig,
}

/// Where the Conversation Service lives and how long to wait for it.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_chat_path")]
    pub chat_path: String,

    #[serde(default = "default_upload_path")]
    pub upload_path: String,

    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            chat_path: default_chat_path(),
            upload_path: default_upload_path(),
            health_path: default_health_path(),
            timeout_secs: default_timeout_secs(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    pub device: Option<String>,

    /// Recordings smaller than this are treated as "nothing was said".
    #[serde(default = "default_min_capture_bytes")]
    pub min_capture_bytes: usize,

    #[serde(default = "default_sample_tick_ms")]
    pub sample_tick_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            device: None,
            min_capture_bytes: default_min_capture_bytes(),
            sample_tick_ms: default_sample_tick_ms(),
        }
    }
}

/// Named loop behaviours. Each one used to be its own copy of the loop.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LoopPreset {
    /// Stop on sustained silence, keep the conversation going on its own.
    #[default]
    Continuous,
    /// Fixed listening window with no silence detection, keep going.
    Timed,
    /// Stop on silence, wait for the user after every reply.
    Manual,
}

impl LoopPreset {
    #[must_use]
    pub const fn loop_config(self) -> LoopConfig {
        match self {
            Self::Continuous => LoopConfig {
                max_listen: Duration::from_millis(10_000),
                silence_threshold_rms: 0.02,
                silence_duration: Some(Duration::from_millis(3000)),
                auto_continue: true,
                after_interrupt: AfterInterrupt::Listen,
                retry_backoff: Duration::from_millis(2000),
                record_transcripts: true,
                sample_tick: Duration::from_millis(16),
            },
            Self::Timed => LoopConfig {
                max_listen: Duration::from_millis(8000),
                silence_threshold_rms: 0.02,
                silence_duration: None,
                auto_continue: true,
                after_interrupt: AfterInterrupt::Listen,
                retry_backoff: Duration::from_millis(2000),
                record_transcripts: true,
                sample_tick: Duration::from_millis(16),
            },
            Self::Manual => LoopConfig {
                max_listen: Duration::from_millis(10_000),
                silence_threshold_rms: 0.02,
                silence_duration: Some(Duration::from_millis(3000)),
                auto_continue: false,
                after_interrupt: AfterInterrupt::Idle,
                retry_backoff: Duration::from_millis(2000),
                record_transcripts: true,
                sample_tick: Duration::from_millis(16),
            },
        }
    }
}

/// Loop policy: a preset plus per-field overrides.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConversationConfig {
    #[serde(default)]
    pub preset: LoopPreset,

    pub max_listen_ms: Option<u64>,

    pub silence_threshold_rms: Option<f32>,

    /// `0` turns silence detection off; only the listening ceiling ends a turn.
    pub silence_duration_ms: Option<u64>,

    pub auto_continue: Option<bool>,

    pub after_interrupt: Option<AfterInterrupt>,

    pub retry_backoff_ms: Option<u64>,

    pub record_transcripts: Option<bool>,
}

impl ConversationConfig {
    /// Resolve the preset and overrides into the orchestrator's loop config.
    #[must_use]
    pub fn loop_config(&self, audio: &AudioConfig) -> LoopConfig {
        let mut config = self.preset.loop_config();

        if let Some(ms) = self.max_listen_ms {
            config.max_listen = Duration::from_millis(ms);
        }
        if let Some(rms) = self.silence_threshold_rms {
            config.silence_threshold_rms = rms;
        }
        if let Some(ms) = self.silence_duration_ms {
            config.silence_duration = (ms > 0).then(|| Duration::from_millis(ms));
        }
        if let Some(auto) = self.auto_continue {
            config.auto_continue = auto;
        }
        if let Some(after) = self.after_interrupt {
            config.after_interrupt = after;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff = Duration::from_millis(ms);
        }
        if let Some(record) = self.record_transcripts {
            config.record_transcripts = record;
        }
        config.sample_tick = Duration::from_millis(audio.sample_tick_ms.max(1));

        config
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PlaybackConfig {
    #[serde(default = "default_text_ms_per_char")]
    pub text_ms_per_char: u64,

    #[serde(default = "default_text_min_ms")]
    pub text_min_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            text_ms_per_char: default_text_ms_per_char(),
            text_min_ms: default_text_min_ms(),
        }
    }
}

impl PlaybackConfig {
    #[must_use]
    pub const fn pacing(&self) -> TextPacing {
        TextPacing {
            per_char: Duration::from_millis(self.text_ms_per_char),
            minimum: Duration::from_millis(self.text_min_ms),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_history_path")]
    pub path: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_history_path(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(VoxError::Config(format!(
                "config file not found: {}",
                path.display()
            )));
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            VoxError::Config(format!(
                "failed to read config file {}: {e}",
                path.display()
            ))
        })?;

        let config: Self = serde_yaml_ng::from_str(&contents).map_err(|e| {
            VoxError::Config(format!(
                "failed to parse config file {}: {e}",
                path.display()
            ))
        })?;

        Ok(config)
    }

    /// Load the file at the default location, or fall back to built-in defaults when
    /// nobody has written one yet.
    pub fn load_or_default() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load(&path)
        } else {
            tracing::debug!("no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    #[must_use]
    pub fn default_path() -> PathBuf {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from(".config"));
        config_dir.join("voxloop/config.yaml")
    }

    /// Expand `~` in a path string to the user's home directory.
    #[must_use]
    pub fn expand_path(path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix("~/")
            && let Some(home) = dirs::home_dir()
        {
            return home.join(rest);
        }
        PathBuf::from(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config: Config =
            serde_yaml_ng::from_str("{}").unwrap_or_else(|e| panic!("parse failed: {e}"));
        assert_eq!(config.service.base_url, "http://localhost:5000");
        assert_eq!(config.service.upload_path, "/upload-audio");
        assert_eq!(config.audio.min_capture_bytes, 8000);
        assert_eq!(config.conversation.preset, LoopPreset::Continuous);
        assert!(config.history.enabled);

        let looped = config.conversation.loop_config(&config.audio);
        assert_eq!(looped.silence_duration, Some(Duration::from_millis(3000)));
        assert!((looped.silence_threshold_rms - 0.02).abs() < f32::EPSILON);
        assert!(looped.auto_continue);
    }

    #[test]
    fn parse_full_config() {
        let yaml = r#"
service:
  base_url: "http://therapy.local:8000"
  chat_path: /api/chat
  upload_path: /api/upload
  health_path: /api/health
  timeout_secs: 10
  health_interval_secs: 5

audio:
  device: "USB Headset"
  min_capture_bytes: 2000
  sample_tick_ms: 20

conversation:
  preset: manual
  max_listen_ms: 9000
  silence_duration_ms: 2500
  after_interrupt: listen
  record_transcripts: false

playback:
  text_ms_per_char: 40
  text_min_ms: 2000

history:
  enabled: false
  path: /tmp/voxloop-history.json
"#;
        let config: Config =
            serde_yaml_ng::from_str(yaml).unwrap_or_else(|e| panic!("parse failed: {e}"));
        assert_eq!(config.service.base_url, "http://therapy.local:8000");
        assert_eq!(config.service.chat_path, "/api/chat");
        assert_eq!(config.service.timeout_secs, 10);
        assert_eq!(config.audio.device.as_deref(), Some("USB Headset"));
        assert_eq!(config.conversation.preset, LoopPreset::Manual);
        assert!(!config.history.enabled);

        let looped = config.conversation.loop_config(&config.audio);
        assert_eq!(looped.max_listen, Duration::from_millis(9000));
        assert_eq!(looped.silence_duration, Some(Duration::from_millis(2500)));
        assert!(!looped.auto_continue);
        assert_eq!(looped.after_interrupt, AfterInterrupt::Listen);
        assert!(!looped.record_transcripts);
        assert_eq!(looped.sample_tick, Duration::from_millis(20));

        let pacing = config.playback.pacing();
        assert_eq!(pacing.minimum, Duration::from_millis(2000));
    }

    #[test]
    fn zero_silence_duration_disables_detection() {
        let yaml = "conversation:\n  silence_duration_ms: 0\n";
        let config: Config =
            serde_yaml_ng::from_str(yaml).unwrap_or_else(|e| panic!("parse failed: {e}"));
        let looped = config.conversation.loop_config(&config.audio);
        assert_eq!(looped.silence_duration, None);
    }

    #[test]
    fn timed_preset_has_fixed_window() {
        let looped = LoopPreset::Timed.loop_config();
        assert_eq!(looped.silence_duration, None);
        assert_eq!(looped.max_listen, Duration::from_millis(8000));
        assert!(looped.auto_continue);
    }

    #[test]
    fn missing_config_file_gives_error() {
        let result = Config::load(Path::new("/nonexistent/voxloop.yaml"));
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("config file not found"));
    }

    #[test]
    fn expand_tilde_path() {
        let expanded = Config::expand_path("~/voxloop");
        assert!(!expanded.to_string_lossy().starts_with('~'));
    }
}
