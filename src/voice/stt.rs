//! Streaming speech-to-text (STT) collaborator
//!
//! A [`TranscriptionService`] opens a live session and pushes [`LinkEvent`]s
//! into a channel owned by the caller. The returned [`TranscriptionHandle`]
//! carries microphone audio upstream.

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::config::SttConfig;
use crate::{Error, Result};

/// Deepgram live transcription endpoint
const DEEPGRAM_LISTEN_URL: &str = "wss://api.deepgram.com/v1/listen";

/// A transcript fragment from the upstream provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEvent {
    pub text: String,
    /// The provider will not revise this fragment further
    pub is_final: bool,
    /// The provider considers the utterance finished
    pub is_speech_final: bool,
}

impl TranscriptEvent {
    /// Build a transcript fragment
    pub fn new(text: impl Into<String>, is_final: bool, is_speech_final: bool) -> Self {
        Self {
            text: text.into(),
            is_final,
            is_speech_final,
        }
    }

    /// Whether the fragment carries any non-whitespace text
    #[must_use]
    pub fn has_text(&self) -> bool {
        !self.text.trim().is_empty()
    }
}

/// Events emitted by a live transcription session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// A partial or final transcript
    Transcript(TranscriptEvent),
    /// The remote side closed the session
    Closed { reason: Option<String> },
    /// The session failed mid-stream
    Error(String),
}

/// Opens live transcription sessions
#[async_trait]
pub trait TranscriptionService: Send + Sync {
    /// Establish a session; events are pushed into `events` until it closes
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` if the remote handshake does not complete
    async fn connect(&self, events: mpsc::Sender<LinkEvent>)
    -> Result<Arc<dyn TranscriptionHandle>>;
}

/// A live transcription session
#[async_trait]
pub trait TranscriptionHandle: Send + Sync {
    /// Forward a chunk of PCM audio
    ///
    /// # Errors
    ///
    /// Returns `Error::Link` if the session can no longer accept audio
    async fn send(&self, pcm: Vec<u8>) -> Result<()>;

    /// Keep the remote session from timing out while no speech is sent
    ///
    /// The default sends 100ms of 16-bit 16kHz silence.
    ///
    /// # Errors
    ///
    /// Returns `Error::Link` if the session can no longer accept audio
    async fn keep_alive(&self) -> Result<()> {
        self.send(vec![0u8; 3200]).await
    }

    /// Finalize and close the remote session
    ///
    /// # Errors
    ///
    /// Returns error if the close message cannot be delivered
    async fn close(&self) -> Result<()>;
}

/// Deepgram `Results` message
#[derive(Debug, Deserialize)]
struct DeepgramMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    channel: Option<DeepgramChannel>,
    #[serde(default)]
    is_final: bool,
    #[serde(default)]
    speech_final: bool,
}

#[derive(Debug, Deserialize)]
struct DeepgramChannel {
    alternatives: Vec<DeepgramAlternative>,
}

#[derive(Debug, Deserialize)]
struct DeepgramAlternative {
    transcript: String,
}

/// Parse a Deepgram text frame into a transcript
///
/// Returns `None` for metadata, utterance-end and other non-result messages.
fn parse_deepgram_message(text: &str) -> Option<TranscriptEvent> {
    let message: DeepgramMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unparseable Deepgram message");
            return None;
        }
    };

    if message.kind != "Results" {
        tracing::trace!(kind = %message.kind, "ignoring Deepgram message");
        return None;
    }

    let transcript = message
        .channel?
        .alternatives
        .into_iter()
        .next()
        .map(|a| a.transcript)
        .unwrap_or_default();

    Some(TranscriptEvent::new(
        transcript,
        message.is_final,
        message.speech_final,
    ))
}

type DeepgramSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, WsMessage>;

/// Deepgram live streaming transcription
pub struct DeepgramLive {
    api_key: SecretString,
    model: String,
    language: String,
    sample_rate: u32,
    encoding: String,
    channels: u16,
}

impl DeepgramLive {
    /// Create a Deepgram client from STT settings
    ///
    /// # Errors
    ///
    /// Returns error if API key is missing
    pub fn new(config: &SttConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| Error::Config("Deepgram API key required".to_string()))?;

        Ok(Self {
            api_key,
            model: config.model.clone(),
            language: config.language.clone(),
            sample_rate: config.sample_rate,
            encoding: config.encoding.clone(),
            channels: config.channels,
        })
    }

    /// Build the listen URL with streaming options
    fn listen_url(&self) -> Result<url::Url> {
        let mut url = url::Url::parse(DEEPGRAM_LISTEN_URL)
            .map_err(|e| Error::Config(format!("invalid Deepgram URL: {e}")))?;
        url.query_pairs_mut()
            .append_pair("model", &self.model)
            .append_pair("language", &self.language)
            .append_pair("encoding", &self.encoding)
            .append_pair("sample_rate", &self.sample_rate.to_string())
            .append_pair("channels", &self.channels.to_string())
            .append_pair("interim_results", "true")
            .append_pair("punctuate", "true")
            .append_pair("smart_format", "true");
        Ok(url)
    }
}

#[async_trait]
impl TranscriptionService for DeepgramLive {
    async fn connect(
        &self,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn TranscriptionHandle>> {
        let url = self.listen_url()?;
        tracing::debug!(model = %self.model, language = %self.language, "connecting to Deepgram");

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| Error::Connect(format!("failed to build request: {e}")))?;
        request.headers_mut().insert(
            "Authorization",
            format!("Token {}", self.api_key.expose_secret())
                .parse()
                .map_err(|e| Error::Config(format!("invalid auth header: {e}")))?,
        );

        let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| Error::Connect(format!("Deepgram handshake failed: {e}")))?;

        let (sink, mut stream) = ws_stream.split();

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let event = match frame {
                    Ok(WsMessage::Text(text)) => match parse_deepgram_message(&text) {
                        Some(transcript) => LinkEvent::Transcript(transcript),
                        None => continue,
                    },
                    Ok(WsMessage::Close(frame)) => {
                        let reason = frame.map(|f| f.reason.to_string());
                        let _ = events.send(LinkEvent::Closed { reason }).await;
                        return;
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        let _ = events.send(LinkEvent::Error(e.to_string())).await;
                        return;
                    }
                };
                if events.send(event).await.is_err() {
                    return;
                }
            }
            let _ = events.send(LinkEvent::Closed { reason: None }).await;
        });

        tracing::info!("Deepgram session established");
        Ok(Arc::new(DeepgramHandle {
            sink: Mutex::new(sink),
        }))
    }
}

/// Write half of a Deepgram session
struct DeepgramHandle {
    sink: Mutex<DeepgramSink>,
}

impl DeepgramHandle {
    async fn send_control(&self, kind: &str) -> Result<()> {
        let body = serde_json::json!({ "type": kind }).to_string();
        self.sink
            .lock()
            .await
            .send(WsMessage::Text(body.into()))
            .await
            .map_err(|e| Error::Link(format!("failed to send {kind}: {e}")))
    }
}

#[async_trait]
impl TranscriptionHandle for DeepgramHandle {
    async fn send(&self, pcm: Vec<u8>) -> Result<()> {
        self.sink
            .lock()
            .await
            .send(WsMessage::Binary(pcm.into()))
            .await
            .map_err(|e| Error::Link(e.to_string()))
    }

    async fn keep_alive(&self) -> Result<()> {
        self.send_control("KeepAlive").await
    }

    async fn close(&self) -> Result<()> {
        self.send_control("CloseStream").await?;
        self.sink.lock().await.close().await?;
        Ok(())
    }
}
