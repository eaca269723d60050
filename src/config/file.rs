//! TOML configuration file loading
//!
//! Supports `~/.config/cadence/config.toml` (or `CADENCE_CONFIG`) as a
//! persistent config source. All fields are optional; the file is a partial
//! overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::Result;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct CadenceConfigFile {
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Streaming transcription settings
    #[serde(default)]
    pub stt: SttFileConfig,

    /// Turn-taking behaviour
    #[serde(default)]
    pub turn: TurnFileConfig,

    #[serde(default)]
    pub llm: LlmFileConfig,

    #[serde(default)]
    pub tts: TtsFileConfig,

    /// API keys for external services
    #[serde(default)]
    pub api_keys: ApiKeysFileConfig,
}

/// Server/runtime configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Directory with the web client
    pub static_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SttFileConfig {
    /// Deepgram model (e.g. "nova-2")
    pub model: Option<String>,
    pub language: Option<String>,
    pub sample_rate: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TurnFileConfig {
    /// Quiet interval that ends an utterance, in seconds
    pub silence_threshold_secs: Option<f64>,
    /// "final", "any" or "off"
    pub interrupt: Option<String>,
    /// "keep_alive" or "per_turn"
    pub link: Option<String>,
    pub keepalive_interval_secs: Option<f64>,
    pub idle_timeout_secs: Option<u64>,
    pub max_retries: Option<u32>,
    pub backoff_step_secs: Option<f64>,
}

/// LLM-related configuration
#[derive(Debug, Default, Deserialize)]
pub struct LlmFileConfig {
    /// Model identifier (e.g. "openai/gpt-oss-120b")
    pub model: Option<String>,
    /// OpenAI-compatible base URL
    pub base_url: Option<String>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    /// Path to the system prompt file
    pub system_prompt_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TtsFileConfig {
    /// "openai" or "elevenlabs"
    pub provider: Option<String>,
    pub model: Option<String>,
    pub voice: Option<String>,
    pub speed: Option<f32>,
    pub sample_rate: Option<u32>,
    pub streaming: Option<bool>,
    pub chunk_bytes: Option<usize>,
}

/// API keys configuration
#[derive(Debug, Default, Deserialize)]
pub struct ApiKeysFileConfig {
    pub deepgram: Option<String>,
    pub groq: Option<String>,
    pub openai: Option<String>,
    pub elevenlabs: Option<String>,
}

/// Parse a config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<CadenceConfigFile> {
    let content = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&content)?)
}

/// Load the TOML config file from `path` or the standard location
///
/// Returns `CadenceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file(path: Option<PathBuf>) -> CadenceConfigFile {
    let Some(path) = path.or_else(config_file_path) else {
        return CadenceConfigFile::default();
    };

    if !path.exists() {
        return CadenceConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => {
            tracing::info!(path = %path.display(), "loaded config file");
            config
        }
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            CadenceConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/cadence/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("cadence").join("config.toml"))
}
