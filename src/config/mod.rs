//! Configuration management for the cadence gateway
//!
//! Values are layered: environment variables > TOML file > defaults.

pub mod file;

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use self::file::CadenceConfigFile;
use crate::voice::ReconnectPolicy;
use crate::voice::stt::TranscriptEvent;
use crate::{Error, Result};

/// Used when no system prompt file is readable
pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// Cadence gateway configuration
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    pub server: ServerConfig,

    /// Streaming transcription configuration
    pub stt: SttConfig,

    /// Turn-taking configuration
    pub turn: TurnConfig,

    /// Text generation configuration
    pub llm: LlmConfig,

    /// Speech synthesis configuration
    pub tts: TtsConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Directory for static web UI files, served at `/`
    pub static_dir: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 7860,
            static_dir: None,
        }
    }
}

/// Streaming transcription (Deepgram) configuration
#[derive(Debug, Clone)]
pub struct SttConfig {
    /// `Deepgram` API key
    pub api_key: Option<SecretString>,
    pub model: String,
    pub language: String,
    /// Sample rate of the microphone PCM sent by clients
    pub sample_rate: u32,
    pub encoding: String,
    pub channels: u16,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "nova-2".to_string(),
            language: "en".to_string(),
            sample_rate: 16000,
            encoding: "linear16".to_string(),
            channels: 1,
        }
    }
}

/// Which transcripts interrupt a reply that is being spoken
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InterruptPolicy {
    /// Final fragments with non-empty text
    #[default]
    Final,
    /// Any fragment with non-empty text, partial or final
    Any,
    /// Only the explicit `interrupt` command
    Off,
}

impl InterruptPolicy {
    /// Whether `event` should abort the reply in progress
    #[must_use]
    pub fn should_interrupt(self, event: &TranscriptEvent) -> bool {
        match self {
            Self::Final => event.is_final && event.has_text(),
            Self::Any => event.has_text(),
            Self::Off => false,
        }
    }
}

impl FromStr for InterruptPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "final" => Ok(Self::Final),
            "any" => Ok(Self::Any),
            "off" | "none" => Ok(Self::Off),
            other => Err(Error::Config(format!("unknown interrupt policy: {other}"))),
        }
    }
}

/// Lifetime of the transcription link across turns
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LinkPolicy {
    /// Keep the link open, feeding keepalives while a reply is produced
    #[default]
    KeepAlive,
    /// Close the link on dispatch and reopen it when playback starts
    PerTurn,
}

impl FromStr for LinkPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "keep_alive" | "keepalive" => Ok(Self::KeepAlive),
            "per_turn" => Ok(Self::PerTurn),
            other => Err(Error::Config(format!("unknown link policy: {other}"))),
        }
    }
}

/// Turn-taking configuration
#[derive(Debug, Clone)]
pub struct TurnConfig {
    /// Quiet interval after a terminal transcript that ends the utterance
    pub silence_threshold: Duration,
    pub interrupt: InterruptPolicy,
    pub link: LinkPolicy,
    /// Cadence of the idle feed while a reply is produced
    pub keepalive_interval: Duration,
    /// Session is torn down after this long without inbound frames
    pub idle_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            silence_threshold: Duration::from_millis(2300),
            interrupt: InterruptPolicy::default(),
            link: LinkPolicy::default(),
            keepalive_interval: Duration::from_secs(2),
            idle_timeout: Duration::from_secs(300),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Text generation configuration
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// `Groq` (or other OpenAI-compatible) API key
    pub api_key: Option<SecretString>,
    /// OpenAI-compatible base URL
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub system_prompt: String,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "openai/gpt-oss-120b".to_string(),
            temperature: 0.7,
            max_tokens: 2048,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Speech synthesis backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TtsProviderKind {
    #[default]
    OpenAi,
    ElevenLabs,
}

impl fmt::Display for TtsProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OpenAi => write!(f, "OpenAI"),
            Self::ElevenLabs => write!(f, "ElevenLabs"),
        }
    }
}

impl FromStr for TtsProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "elevenlabs" => Ok(Self::ElevenLabs),
            other => Err(Error::Config(format!("unknown TTS provider: {other}"))),
        }
    }
}

/// Speech synthesis configuration
#[derive(Debug, Clone)]
pub struct TtsConfig {
    pub provider: TtsProviderKind,
    /// Key for the selected provider
    pub api_key: Option<SecretString>,
    pub model: String,
    /// Voice name (`OpenAI`) or voice id (`ElevenLabs`)
    pub voice: String,
    pub speed: f32,
    /// Requested output rate; `OpenAI` PCM is always 24kHz
    pub sample_rate: u32,
    /// Stream chunks as they are synthesized instead of buffering the reply
    pub streaming: bool,
    /// Size of each outbound PCM frame in bytes
    pub chunk_bytes: usize,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            provider: TtsProviderKind::default(),
            api_key: None,
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            speed: 1.0,
            sample_rate: 24000,
            streaming: true,
            chunk_bytes: 4800,
        }
    }
}

fn secs(value: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::Config(format!("invalid duration {value}: {e}")))
}

fn secret(value: Option<String>) -> Option<SecretString> {
    value.filter(|v| !v.is_empty()).map(SecretString::from)
}

fn has_secret(value: Option<&SecretString>) -> bool {
    value.is_some_and(|s| !s.expose_secret().is_empty())
}

/// Read the system prompt, falling back to the default
fn load_system_prompt(path: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(prompt) if !prompt.trim().is_empty() => {
            tracing::debug!(path, "loaded system prompt");
            prompt.trim().to_string()
        }
        Ok(_) => DEFAULT_SYSTEM_PROMPT.to_string(),
        Err(e) => {
            tracing::warn!(path, error = %e, "system prompt file unreadable, using default");
            DEFAULT_SYSTEM_PROMPT.to_string()
        }
    }
}

impl Config {
    /// Load configuration from the environment and the config file
    ///
    /// `path` (or `CADENCE_CONFIG`) overrides the standard file location.
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.or_else(|| std::env::var("CADENCE_CONFIG").ok().map(PathBuf::from));
        let fc = file::load_config_file(path);
        Self::from_sources(fc, |key| std::env::var(key).ok())
    }

    /// Build configuration from a parsed file and an environment lookup
    ///
    /// # Errors
    ///
    /// Returns error if a value is present but invalid
    pub fn from_sources<F>(fc: CadenceConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let num = |key: &str| env(key).and_then(|v| v.parse::<f64>().ok());

        // Server config (env > toml > default)
        let server_defaults = ServerConfig::default();
        let server = ServerConfig {
            host: env("CADENCE_HOST")
                .or(fc.server.host)
                .unwrap_or(server_defaults.host),
            port: env("CADENCE_PORT")
                .or_else(|| env("PORT"))
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(server_defaults.port),
            static_dir: env("CADENCE_STATIC_DIR")
                .or(fc.server.static_dir)
                .map(PathBuf::from),
        };

        let stt_defaults = SttConfig::default();
        let stt = SttConfig {
            api_key: secret(env("DEEPGRAM_API_KEY").or(fc.api_keys.deepgram)),
            model: env("CADENCE_STT_MODEL")
                .or(fc.stt.model)
                .unwrap_or(stt_defaults.model),
            language: env("CADENCE_STT_LANGUAGE")
                .or(fc.stt.language)
                .unwrap_or(stt_defaults.language),
            sample_rate: env("CADENCE_STT_SAMPLE_RATE")
                .and_then(|s| s.parse().ok())
                .or(fc.stt.sample_rate)
                .unwrap_or(stt_defaults.sample_rate),
            ..stt_defaults
        };

        let turn_defaults = TurnConfig::default();
        let interrupt = match env("CADENCE_INTERRUPT").or(fc.turn.interrupt) {
            Some(value) => value.parse()?,
            None => turn_defaults.interrupt,
        };
        let link = match env("CADENCE_LINK_POLICY").or(fc.turn.link) {
            Some(value) => value.parse()?,
            None => turn_defaults.link,
        };
        let silence_threshold = match num("CADENCE_SILENCE_THRESHOLD")
            .or(fc.turn.silence_threshold_secs)
        {
            Some(value) => secs(value)?,
            None => turn_defaults.silence_threshold,
        };
        let keepalive_interval = match num("CADENCE_KEEPALIVE_INTERVAL")
            .or(fc.turn.keepalive_interval_secs)
        {
            Some(value) => secs(value)?,
            None => turn_defaults.keepalive_interval,
        };
        let backoff_step = match fc.turn.backoff_step_secs {
            Some(value) => secs(value)?,
            None => turn_defaults.reconnect.backoff_step,
        };
        let turn = TurnConfig {
            silence_threshold,
            interrupt,
            link,
            keepalive_interval,
            idle_timeout: env("CADENCE_IDLE_TIMEOUT")
                .and_then(|s| s.parse().ok())
                .or(fc.turn.idle_timeout_secs)
                .map_or(turn_defaults.idle_timeout, Duration::from_secs),
            reconnect: ReconnectPolicy {
                max_retries: fc
                    .turn
                    .max_retries
                    .unwrap_or(turn_defaults.reconnect.max_retries),
                backoff_step,
            },
        };

        let llm_defaults = LlmConfig::default();
        let prompt_path = env("CADENCE_SYSTEM_PROMPT_FILE")
            .or(fc.llm.system_prompt_file)
            .unwrap_or_else(|| "config/system_prompt.txt".to_string());
        let llm = LlmConfig {
            api_key: secret(env("GROQ_API_KEY").or(fc.api_keys.groq)),
            base_url: env("CADENCE_LLM_BASE_URL")
                .or(fc.llm.base_url)
                .unwrap_or(llm_defaults.base_url),
            model: env("CADENCE_LLM_MODEL")
                .or(fc.llm.model)
                .unwrap_or(llm_defaults.model),
            temperature: fc.llm.temperature.unwrap_or(llm_defaults.temperature),
            max_tokens: fc.llm.max_tokens.unwrap_or(llm_defaults.max_tokens),
            system_prompt: load_system_prompt(&prompt_path),
        };

        let tts_defaults = TtsConfig::default();
        let provider = match env("CADENCE_TTS_PROVIDER").or(fc.tts.provider) {
            Some(value) => value.parse()?,
            None => tts_defaults.provider,
        };
        let tts_key = match provider {
            TtsProviderKind::OpenAi => env("OPENAI_API_KEY").or(fc.api_keys.openai),
            TtsProviderKind::ElevenLabs => env("ELEVENLABS_API_KEY").or(fc.api_keys.elevenlabs),
        };
        let tts = TtsConfig {
            provider,
            api_key: secret(tts_key),
            model: env("CADENCE_TTS_MODEL")
                .or(fc.tts.model)
                .unwrap_or(tts_defaults.model),
            voice: env("CADENCE_TTS_VOICE")
                .or(fc.tts.voice)
                .unwrap_or(tts_defaults.voice),
            speed: fc.tts.speed.unwrap_or(tts_defaults.speed),
            sample_rate: fc.tts.sample_rate.unwrap_or(tts_defaults.sample_rate),
            streaming: env("CADENCE_TTS_STREAMING")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .or(fc.tts.streaming)
                .unwrap_or(tts_defaults.streaming),
            chunk_bytes: fc.tts.chunk_bytes.unwrap_or(tts_defaults.chunk_bytes),
        };

        Ok(Self {
            server,
            stt,
            turn,
            llm,
            tts,
        })
    }

    /// Check that every collaborator has credentials
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first missing key
    pub fn validate(&self) -> Result<()> {
        if !has_secret(self.stt.api_key.as_ref()) {
            return Err(Error::Config(
                "DEEPGRAM_API_KEY is required for transcription".to_string(),
            ));
        }
        if !has_secret(self.llm.api_key.as_ref()) {
            return Err(Error::Config(
                "GROQ_API_KEY is required for generation".to_string(),
            ));
        }
        if !has_secret(self.tts.api_key.as_ref()) {
            let key = match self.tts.provider {
                TtsProviderKind::OpenAi => "OPENAI_API_KEY",
                TtsProviderKind::ElevenLabs => "ELEVENLABS_API_KEY",
            };
            return Err(Error::Config(format!("{key} is required for synthesis")));
        }
        if self.turn.silence_threshold.is_zero() {
            return Err(Error::Config("silence threshold must be positive".to_string()));
        }
        Ok(())
    }
}
