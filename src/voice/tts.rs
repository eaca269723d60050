//! Text-to-speech (TTS) processing
//!
//! Replies are synthesized as raw 16-bit little-endian mono PCM so they can
//! be streamed to the peer frame by frame.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};

use crate::config::{TtsConfig, TtsProviderKind};
use crate::{Error, Result};

/// Lazy, finite sequence of PCM chunks
pub type PcmStream = BoxStream<'static, Result<Vec<u8>>>;

/// OpenAI `pcm` output is fixed at 24kHz
const OPENAI_PCM_SAMPLE_RATE: u32 = 24000;

/// Synthesized reply audio
pub enum SynthesizedAudio {
    /// The whole reply in one buffer
    Buffer(Vec<u8>),
    /// Chunks produced as synthesis progresses
    Stream(PcmStream),
}

impl std::fmt::Debug for SynthesizedAudio {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buffer(pcm) => f.debug_tuple("Buffer").field(&pcm.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Speech synthesis collaborator
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Output sample rate of the produced PCM
    fn sample_rate(&self) -> u32;

    /// Whether the engine can synthesize immediately
    fn is_ready(&self) -> bool {
        true
    }

    /// Load whatever the engine needs before the first request
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot be prepared
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    /// Synthesize `text` into a single PCM buffer
    ///
    /// # Errors
    ///
    /// Returns `Error::Synthesis` if synthesis fails
    async fn synthesize(&self, text: &str) -> Result<Vec<u8>>;

    /// Synthesize `text` into a lazy sequence of PCM chunks
    ///
    /// The default yields the full buffer as one chunk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Synthesis` if synthesis cannot start
    async fn synthesize_stream(&self, text: &str) -> Result<PcmStream> {
        let pcm = self.synthesize(text).await?;
        Ok(futures::stream::once(async move { Ok(pcm) }).boxed())
    }
}

/// Regroup an arbitrary byte stream into fixed-size PCM chunks
///
/// `chunk_bytes` is rounded down to a whole number of 16-bit samples. The
/// trailing chunk may be shorter. An upstream error ends the stream.
pub fn rechunk<S>(source: S, chunk_bytes: usize) -> PcmStream
where
    S: Stream<Item = Result<Vec<u8>>> + Send + 'static,
{
    let chunk_bytes = (chunk_bytes & !1).max(2);
    let state = (Box::pin(source), Vec::<u8>::new(), false);

    futures::stream::unfold(state, move |(mut source, mut buf, mut done)| async move {
        loop {
            if buf.len() >= chunk_bytes {
                let rest = buf.split_off(chunk_bytes);
                let chunk = std::mem::replace(&mut buf, rest);
                return Some((Ok(chunk), (source, buf, done)));
            }
            if done {
                if buf.is_empty() {
                    return None;
                }
                let chunk = std::mem::take(&mut buf);
                return Some((Ok(chunk), (source, buf, done)));
            }
            match source.next().await {
                Some(Ok(bytes)) => buf.extend_from_slice(&bytes),
                Some(Err(e)) => {
                    buf.clear();
                    return Some((Err(e), (source, buf, true)));
                }
                None => done = true,
            }
        }
    })
    .boxed()
}

/// Synthesizes speech from text
pub struct TextToSpeech {
    client: reqwest::Client,
    api_key: SecretString,
    voice: String,
    speed: f32,
    model: String,
    sample_rate: u32,
    chunk_bytes: usize,
    provider: TtsProviderKind,
}

impl TextToSpeech {
    /// Create a TTS instance from configuration
    ///
    /// # Errors
    ///
    /// Returns error if the provider's API key is missing
    pub fn from_config(config: &TtsConfig) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.expose_secret().is_empty())
            .ok_or_else(|| {
                Error::Config(format!("{} API key required for TTS", config.provider))
            })?;

        let sample_rate = match config.provider {
            TtsProviderKind::OpenAi => OPENAI_PCM_SAMPLE_RATE,
            TtsProviderKind::ElevenLabs => config.sample_rate,
        };

        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            voice: config.voice.clone(),
            speed: config.speed,
            model: config.model.clone(),
            sample_rate,
            chunk_bytes: config.chunk_bytes,
            provider: config.provider,
        })
    }

    /// Issue the provider request; the body is raw PCM
    async fn request(&self, text: &str) -> Result<reqwest::Response> {
        let response = match self.provider {
            TtsProviderKind::OpenAi => self.request_openai(text).await?,
            TtsProviderKind::ElevenLabs => self.request_elevenlabs(text).await?,
        };

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Synthesis(format!(
                "{} TTS error {status}: {body}",
                self.provider
            )));
        }

        Ok(response)
    }

    /// Request PCM from OpenAI TTS
    async fn request_openai(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct TtsRequest<'a> {
            model: &'a str,
            input: &'a str,
            voice: &'a str,
            speed: f32,
            response_format: &'a str,
        }

        let request = TtsRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            speed: self.speed,
            response_format: "pcm",
        };

        Ok(self
            .client
            .post("https://api.openai.com/v1/audio/speech")
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&request)
            .send()
            .await?)
    }

    /// Request PCM from ElevenLabs streaming TTS
    async fn request_elevenlabs(&self, text: &str) -> Result<reqwest::Response> {
        #[derive(serde::Serialize)]
        struct ElevenLabsRequest<'a> {
            text: &'a str,
            model_id: &'a str,
        }

        let url = format!(
            "https://api.elevenlabs.io/v1/text-to-speech/{}/stream?output_format=pcm_{}",
            self.voice, self.sample_rate
        );

        let request = ElevenLabsRequest {
            text,
            model_id: &self.model,
        };

        Ok(self
            .client
            .post(&url)
            .header("xi-api-key", self.api_key.expose_secret())
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?)
    }
}

#[async_trait]
impl SpeechSynthesizer for TextToSpeech {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        tracing::debug!(chars = text.len(), provider = %self.provider, "synthesizing");
        let audio = self.request(text).await?.bytes().await?;
        Ok(audio.to_vec())
    }

    async fn synthesize_stream(&self, text: &str) -> Result<PcmStream> {
        tracing::debug!(chars = text.len(), provider = %self.provider, "synthesizing stream");
        let response = self.request(text).await?;
        let bytes = response.bytes_stream().map(|chunk| {
            chunk
                .map(|b| b.to_vec())
                .map_err(|e| Error::Synthesis(e.to_string()))
        });
        Ok(rechunk(bytes, self.chunk_bytes))
    }
}
