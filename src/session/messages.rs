//! Duplex channel message envelope
//!
//! Text frames are JSON objects with a `type` tag; binary frames carry PCM.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};

use crate::{Error, Result};

/// Incoming control message from the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsIncoming {
    /// Begin listening
    Start,
    /// The user finished speaking
    Stop,
    /// Forget the conversation so far
    Reset,
    /// Liveness probe
    Ping,
    /// Abort the reply in progress
    Interrupt,
}

impl WsIncoming {
    /// Parse a text frame
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for malformed or unknown messages
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("invalid message: {e}")))
    }
}

/// Conversation phase reported to the peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    LoadingTts,
    Ready,
    Listening,
    Thinking,
    Speaking,
}

/// Transcript progress notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transcription {
    pub text: String,
    pub is_final: bool,
    /// Everything accumulated for the pending utterance
    pub full_text: String,
}

/// Marks the edges of a synthesized audio stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    BeginStream,
    StopStream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Interrupted,
}

/// Outgoing text message to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsOutgoing {
    Status(Status),
    Transcription(Transcription),
    /// Generated reply text
    Response(String),
    /// `sample_rate` is only carried on `begin_stream`
    AudioConfig {
        sample_rate: Option<u32>,
        stream_status: StreamStatus,
    },
    AudioStopped(StopReason),
    Pong,
    Error(String),
}

impl WsOutgoing {
    /// Notice sent before the first PCM frame of a reply
    #[must_use]
    pub const fn begin_stream(sample_rate: u32) -> Self {
        Self::AudioConfig {
            sample_rate: Some(sample_rate),
            stream_status: StreamStatus::BeginStream,
        }
    }

    /// Notice sent after the last PCM frame of a reply
    #[must_use]
    pub const fn stop_stream() -> Self {
        Self::AudioConfig {
            sample_rate: None,
            stream_status: StreamStatus::StopStream,
        }
    }

    /// Value of the `type` tag
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::Transcription(_) => "transcription",
            Self::Response(_) => "response",
            Self::AudioConfig { .. } => "audio_config",
            Self::AudioStopped(_) => "audio_stopped",
            Self::Pong => "pong",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Serialize)]
struct AudioConfigData {
    sample_rate: u32,
}

impl Serialize for WsOutgoing {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.kind())?;
        match self {
            Self::Status(status) => map.serialize_entry("data", status)?,
            Self::Transcription(t) => map.serialize_entry("data", t)?,
            Self::Response(text) | Self::Error(text) => map.serialize_entry("data", text)?,
            Self::AudioConfig {
                sample_rate,
                stream_status,
            } => {
                if let Some(sample_rate) = sample_rate {
                    map.serialize_entry(
                        "data",
                        &AudioConfigData {
                            sample_rate: *sample_rate,
                        },
                    )?;
                }
                map.serialize_entry("stream_status", stream_status)?;
            }
            Self::AudioStopped(reason) => map.serialize_entry("data", reason)?,
            Self::Pong => map.serialize_entry("data", "ok")?,
        }
        map.end()
    }
}

/// Anything the session hands to the connection writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(WsOutgoing),
    /// Synthesized PCM frame
    Audio(Vec<u8>),
}

impl From<WsOutgoing> for Outbound {
    fn from(message: WsOutgoing) -> Self {
        Self::Message(message)
    }
}
