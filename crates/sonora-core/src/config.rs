//! Server configuration loaded from `configs/config.toml`.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::registry::OffloadPolicy;
use crate::separation::SeparatorPreset;
use crate::transcription::{WhisperCppConfig, DEFAULT_EXECUTABLE, DEFAULT_MODEL_SIZE};
use crate::vad::VadOptions;

pub const DEFAULT_CONFIG_PATH: &str = "configs/config.toml";

/// Whisper checkpoint used when the test profile is active.
pub const TEST_MODEL_SIZE: &str = "tiny";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub whisper: WhisperSection,
    #[serde(default)]
    pub vad: VadOptions,
    #[serde(default)]
    pub bgm_separation: BgmSeparationSection,
    #[serde(default)]
    pub cache: CacheSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Tasks executed at the same time; the rest wait in the queue.
    #[serde(default = "default_max_concurrent_tasks")]
    pub max_concurrent_tasks: usize,

    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_concurrent_tasks: default_max_concurrent_tasks(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

impl ServerSection {
    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_mb.saturating_mul(1024 * 1024)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhisperSection {
    /// whisper.cpp command line tool, looked up on `PATH` when not a path.
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Directory holding `ggml-<size>.bin` checkpoints.
    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,

    #[serde(default = "default_model_size")]
    pub model_size: String,

    #[serde(default)]
    pub enable_offload: bool,

    /// Decoder threads; unset uses the available cores, capped at 8.
    #[serde(default)]
    pub threads: Option<usize>,
}

impl Default for WhisperSection {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            models_dir: default_models_dir(),
            model_size: default_model_size(),
            enable_offload: false,
            threads: None,
        }
    }
}

impl WhisperSection {
    pub fn cpp_config(&self) -> WhisperCppConfig {
        WhisperCppConfig {
            executable: self.executable.clone(),
            models_dir: self.models_dir.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BgmSeparationSection {
    #[serde(default = "default_separator")]
    pub model_size: String,

    #[serde(default)]
    pub enable_offload: bool,
}

impl Default for BgmSeparationSection {
    fn default() -> Self {
        Self {
            model_size: default_separator(),
            enable_offload: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSection {
    /// Where file results are kept, one directory per task.
    #[serde(default = "default_cache_dir")]
    pub dir: PathBuf,

    /// Age after which cached results are deleted.
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// Interval between cleanup sweeps.
    #[serde(default = "default_frequency_secs")]
    pub frequency_secs: u64,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            dir: default_cache_dir(),
            ttl_secs: default_ttl_secs(),
            frequency_secs: default_frequency_secs(),
        }
    }
}

impl ServerConfig {
    /// Parse a config file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                "Config file {} not found, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml(&raw).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {msg}", path.display())),
            other => other,
        })
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.max_concurrent_tasks == 0 {
            return Err(Error::Config(
                "server.max_concurrent_tasks must be at least 1".to_string(),
            ));
        }
        if self.cache.frequency_secs == 0 {
            return Err(Error::Config("cache.frequency_secs must be positive".to_string()));
        }
        self.bgm_separation
            .model_size
            .parse::<SeparatorPreset>()
            .map_err(|e| Error::Config(e.to_string()))?;
        self.vad
            .validate()
            .map_err(|e| Error::Config(e.to_string()))?;
        Ok(())
    }

    /// Swap heavy defaults for the lightweight models used by test runs.
    pub fn apply_test_profile(&mut self) {
        self.whisper.model_size = TEST_MODEL_SIZE.to_string();
        self.whisper.enable_offload = false;
        self.bgm_separation.model_size = SeparatorPreset::CenterMaskFast.name().to_string();
        self.bgm_separation.enable_offload = false;
    }

    pub fn offload_policy(&self) -> OffloadPolicy {
        OffloadPolicy {
            transcription: self.whisper.enable_offload,
            bgm_separation: self.bgm_separation.enable_offload,
        }
    }
}

/// `SONORA_CONFIG` when set, otherwise `configs/config.toml`.
pub fn default_config_path() -> PathBuf {
    std::env::var("SONORA_CONFIG")
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// `TEST_ENV=true`, in any case, selects the test profile.
pub fn is_test_env() -> bool {
    std::env::var("TEST_ENV")
        .map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

pub fn load_server_config(test: bool) -> Result<ServerConfig> {
    load_server_config_from(&default_config_path(), test)
}

pub fn load_server_config_from(path: &Path, test: bool) -> Result<ServerConfig> {
    let mut config = ServerConfig::from_file(path)?;
    if test {
        info!("TEST_ENV is set, using the test model profile");
        config.apply_test_profile();
    }
    Ok(config)
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_max_concurrent_tasks() -> usize {
    1
}

fn default_max_upload_mb() -> usize {
    500
}

fn default_executable() -> PathBuf {
    PathBuf::from(DEFAULT_EXECUTABLE)
}

fn default_models_dir() -> PathBuf {
    if let Ok(from_env) = std::env::var("SONORA_MODELS_DIR") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("sonora")
        .join("models")
        .join("whisper")
}

fn default_model_size() -> String {
    DEFAULT_MODEL_SIZE.to_string()
}

fn default_separator() -> String {
    SeparatorPreset::default().name().to_string()
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_ttl_secs() -> u64 {
    60 * 60
}

fn default_frequency_secs() -> u64 {
    10 * 60
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env_lock;

    #[test]
    fn empty_file_yields_defaults() {
        let config = ServerConfig::from_toml("").unwrap();
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.whisper.model_size, "base");
        assert_eq!(config.bgm_separation.model_size, "center-mask-hq");
        assert_eq!(config.vad, VadOptions::default());
    }

    #[test]
    fn sections_override_defaults() {
        let config = ServerConfig::from_toml(
            r#"
            [server]
            port = 9100
            max_concurrent_tasks = 2

            [whisper]
            model_size = "small"
            enable_offload = true

            [vad]
            threshold = 0.6
            speech_pad_ms = 100

            [cache]
            ttl_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.server.port, 9100);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.whisper.model_size, "small");
        assert!(config.offload_policy().transcription);
        assert!(!config.offload_policy().bgm_separation);
        assert_eq!(config.vad.threshold, 0.6);
        assert_eq!(config.vad.min_silence_duration_ms, 2000);
        assert_eq!(config.cache.ttl_secs, 30);
        assert_eq!(config.cache.frequency_secs, 600);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        for raw in [
            "[server]\nmax_concurrent_tasks = 0",
            "[bgm_separation]\nmodel_size = \"UVR-MDX-NET\"",
            "[vad]\nthreshold = 1.5",
            "[server]\nport = \"eighty\"",
        ] {
            assert!(
                matches!(ServerConfig::from_toml(raw), Err(Error::Config(_))),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_profile_uses_light_models() {
        let mut config = ServerConfig::from_toml(
            "[whisper]\nmodel_size = \"large-v3\"\nenable_offload = true",
        )
        .unwrap();
        config.apply_test_profile();

        assert_eq!(config.whisper.model_size, TEST_MODEL_SIZE);
        assert_eq!(config.bgm_separation.model_size, "center-mask-fast");
        assert_eq!(config.offload_policy(), OffloadPolicy::default());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let path = std::env::temp_dir().join(format!("sonora-missing-{}.toml", uuid::Uuid::new_v4()));
        let config = load_server_config_from(&path, true).unwrap();
        assert_eq!(config.whisper.model_size, TEST_MODEL_SIZE);
        assert_eq!(config.server, ServerSection::default());
    }

    #[test]
    fn test_env_flag_is_case_insensitive() {
        let _guard = env_lock();
        std::env::set_var("TEST_ENV", "True");
        assert!(is_test_env());
        std::env::set_var("TEST_ENV", "false");
        assert!(!is_test_env());
        std::env::set_var("TEST_ENV", "1");
        assert!(!is_test_env());
        std::env::set_var("TEST_ENV", "yes");
        assert!(!is_test_env());
        std::env::remove_var("TEST_ENV");
        assert!(!is_test_env());
    }

    #[test]
    fn shipped_config_matches_defaults() {
        let config = ServerConfig::from_toml(include_str!("../../../configs/config.toml")).unwrap();
        let defaults = ServerConfig::default();
        assert_eq!(config.server, defaults.server);
        assert_eq!(config.vad, defaults.vad);
        assert_eq!(config.bgm_separation, defaults.bgm_separation);
        assert_eq!(config.cache, defaults.cache);
        assert_eq!(config.whisper.model_size, defaults.whisper.model_size);
        config.validate().unwrap();
    }

    #[test]
    fn invalid_file_error_names_the_path_once() {
        let path = std::env::temp_dir().join(format!("sonora-bad-{}.toml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "[server]\nmax_concurrent_tasks = 0\n").unwrap();

        let err = ServerConfig::from_file(&path).unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, Error::Config(_)));
        assert!(message.contains(&path.display().to_string()), "{message}");
        assert!(message.contains("max_concurrent_tasks"), "{message}");
        assert_eq!(message.matches("Configuration error").count(), 1, "{message}");
        let _ = std::fs::remove_file(path);
    }
}
