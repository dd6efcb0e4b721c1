use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use crate::downloader::AuthSource;
use crate::errors::{AppError, Result};

const APP_DIR_NAME: &str = "video-downloader";
const ENV_PREFIX: &str = "VIDEO_DL";
const URL_HISTORY_LIMIT: usize = 20;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub download_path: PathBuf,
    /// 0 means no admission limit.
    pub max_concurrent_downloads: usize,
    pub kill_grace_secs: u64,
    /// Terminal jobs older than this are dropped from the registry; 0 keeps them.
    pub job_retention_secs: u64,
    pub event_buffer: usize,
    pub encoding: EncodingConfig,
    pub auth: AuthSource,
    pub tools: ToolPaths,
    pub logging: LogConfig,
    pub url_history: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct EncodingConfig {
    pub media: MediaKind,
    pub container: Option<String>,
    pub codec: VideoCodec,
    pub preset: QualityPreset,
    pub threads: u32,
    pub split_download: bool,
    pub fragments: u32,
    pub overwrite: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ToolPaths {
    pub extractor: Option<PathBuf>,
    pub encoder: Option<PathBuf>,
    pub js_runtime: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct LogConfig {
    pub rotation: LogRotation,
    /// Newest log files kept; older ones are deleted on rotation.
    pub max_files: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogRotation {
    Hourly,
    Daily,
    Never,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Video,
    Audio,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    Passthrough,
    H264,
    H264Nvenc,
    Hevc,
    Vp9,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QualityPreset {
    Lossless,
    NearLossless,
    Balanced,
    MaxCompression,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            download_path: dirs::download_dir()
                .unwrap_or_else(|| PathBuf::from("./downloads")),
            max_concurrent_downloads: 3,
            kill_grace_secs: 3,
            job_retention_secs: 0,
            event_buffer: 256,
            encoding: EncodingConfig::default(),
            auth: AuthSource::None,
            tools: ToolPaths::default(),
            logging: LogConfig::default(),
            url_history: Vec::new(),
        }
    }
}

impl Default for EncodingConfig {
    fn default() -> Self {
        Self {
            media: MediaKind::Video,
            container: Some("mp4".to_string()),
            codec: VideoCodec::Passthrough,
            preset: QualityPreset::Balanced,
            threads: 1,
            split_download: true,
            fragments: 5,
            overwrite: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            rotation: LogRotation::Daily,
            max_files: 3,
        }
    }
}

impl AppConfig {
    /// Loads the settings file, writing defaults first if it does not exist yet.
    pub fn load_or_create(config_path: &Path) -> Result<Self> {
        if !config_path.exists() {
            AppConfig::default().save_to(config_path)?;
        }
        Self::load_from(config_path)
    }

    /// Reads `path` and applies `VIDEO_DL__<KEY>` environment overrides on top.
    pub fn load_from(path: &Path) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Json)
                    .required(false),
            )
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(config_dir) = config_path.parent() {
            if !config_dir.exists() {
                std::fs::create_dir_all(config_dir)?;
            }
        }

        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| AppError::Config(config::ConfigError::Message("Could not find config directory".to_string())))?;

        Ok(config_dir.join(APP_DIR_NAME).join("settings.json"))
    }

    /// Directory holding the key file, encrypted cookies and logs.
    pub fn data_dir() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| AppError::Config(config::ConfigError::Message("Could not find data directory".to_string())))?;

        Ok(data_dir.join(APP_DIR_NAME))
    }

    pub fn kill_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.kill_grace_secs)
    }

    pub fn job_retention(&self) -> Option<std::time::Duration> {
        (self.job_retention_secs > 0).then(|| std::time::Duration::from_secs(self.job_retention_secs))
    }

    /// Most recent first, without duplicates.
    pub fn add_history(&mut self, url: &str) {
        self.url_history.retain(|existing| existing != url);
        self.url_history.insert(0, url.to_string());
        self.url_history.truncate(URL_HISTORY_LIMIT);
    }

    /// Sets one top-level key from its textual form. Values that parse as JSON are
    /// taken as JSON, anything else as a plain string.
    pub fn set_value(&mut self, key: &str, raw: &str) -> Result<()> {
        let mut document = serde_json::to_value(&*self)?;
        let fields = document
            .as_object_mut()
            .ok_or_else(|| AppError::InvalidState("settings are not a JSON object".to_string()))?;

        if !fields.contains_key(key) {
            return Err(AppError::InvalidInput(format!("Unknown setting: {}", key)));
        }

        let value = serde_json::from_str(raw)
            .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
        fields.insert(key.to_string(), value);

        *self = serde_json::from_value(document)
            .map_err(|e| AppError::InvalidInput(format!("Invalid value for {}: {}", key, e)))?;
        Ok(())
    }
}

impl VideoCodec {
    pub fn is_passthrough(&self) -> bool {
        matches!(self, VideoCodec::Passthrough)
    }
}

impl std::str::FromStr for VideoCodec {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "passthrough" | "none" | "copy" => Ok(VideoCodec::Passthrough),
            "h264" | "x264" => Ok(VideoCodec::H264),
            "nvenc" | "h264-nvenc" | "h264_nvenc" => Ok(VideoCodec::H264Nvenc),
            "hevc" | "h265" | "x265" => Ok(VideoCodec::Hevc),
            "vp9" => Ok(VideoCodec::Vp9),
            other => Err(AppError::InvalidInput(format!("Unknown codec: {}", other))),
        }
    }
}

impl std::str::FromStr for QualityPreset {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "lossless" => Ok(QualityPreset::Lossless),
            "near-lossless" | "high" => Ok(QualityPreset::NearLossless),
            "balanced" | "default" => Ok(QualityPreset::Balanced),
            "max-compression" | "small" => Ok(QualityPreset::MaxCompression),
            other => Err(AppError::InvalidInput(format!("Unknown quality preset: {}", other))),
        }
    }
}
