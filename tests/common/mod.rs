//! Shared test utilities: scripted collaborators and a session harness

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use cadence_gateway::agent::ChatMessage;
use cadence_gateway::session::messages::{Outbound, Status, WsIncoming, WsOutgoing};
use cadence_gateway::voice::{
    LinkEvent, PcmStream, SpeechSynthesizer, TranscriptEvent, TranscriptionHandle,
    TranscriptionService,
};
use cadence_gateway::{
    Error, Generator, Result, Session, SessionHandle, SessionOptions, SessionServices,
};

/// How long a test waits for the next outbound item (virtual time when paused)
pub const RECV_TIMEOUT: Duration = Duration::from_secs(60);

/// Transcription service driven by the test
#[derive(Default)]
pub struct ScriptedTranscription {
    /// Event channel of the most recent session
    events: Mutex<Option<mpsc::Sender<LinkEvent>>>,
    connects: AtomicUsize,
    failures_left: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    closes: Arc<AtomicUsize>,
    audio_bytes: Arc<AtomicUsize>,
    keepalives: Arc<AtomicUsize>,
    /// Simulated handshake time
    handshake: Duration,
}

impl ScriptedTranscription {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `n` connect attempts
    pub fn failing(n: usize) -> Arc<Self> {
        Arc::new(Self {
            failures_left: AtomicUsize::new(n),
            ..Self::default()
        })
    }

    /// Every handshake takes `handshake` to complete
    pub fn slow(handshake: Duration) -> Arc<Self> {
        Arc::new(Self {
            handshake,
            ..Self::default()
        })
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn audio_bytes(&self) -> usize {
        self.audio_bytes.load(Ordering::SeqCst)
    }

    pub fn keepalives(&self) -> usize {
        self.keepalives.load(Ordering::SeqCst)
    }

    /// Highest number of handshakes observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Push an event into the live session; `false` if none is open
    pub async fn emit(&self, event: LinkEvent) -> bool {
        let sender = self.events.lock().unwrap().clone();
        match sender {
            Some(sender) => sender.send(event).await.is_ok(),
            None => false,
        }
    }

    pub async fn transcript(&self, text: &str, is_final: bool, speech_final: bool) -> bool {
        self.emit(LinkEvent::Transcript(TranscriptEvent::new(
            text,
            is_final,
            speech_final,
        )))
        .await
    }

    /// Simulate the provider hanging up
    pub async fn drop_session(&self) -> bool {
        self.emit(LinkEvent::Closed {
            reason: Some("remote hangup".to_string()),
        })
        .await
    }
}

#[async_trait]
impl TranscriptionService for ScriptedTranscription {
    async fn connect(
        &self,
        events: mpsc::Sender<LinkEvent>,
    ) -> Result<Arc<dyn TranscriptionHandle>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);

        if !self.handshake.is_zero() {
            tokio::time::sleep(self.handshake).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(Error::Connect("scripted handshake failure".to_string()));
        }

        *self.events.lock().unwrap() = Some(events);
        Ok(Arc::new(ScriptedHandle {
            closes: Arc::clone(&self.closes),
            audio_bytes: Arc::clone(&self.audio_bytes),
            keepalives: Arc::clone(&self.keepalives),
        }))
    }
}

struct ScriptedHandle {
    closes: Arc<AtomicUsize>,
    audio_bytes: Arc<AtomicUsize>,
    keepalives: Arc<AtomicUsize>,
}

#[async_trait]
impl TranscriptionHandle for ScriptedHandle {
    async fn send(&self, pcm: Vec<u8>) -> Result<()> {
        self.audio_bytes.fetch_add(pcm.len(), Ordering::SeqCst);
        Ok(())
    }

    async fn keep_alive(&self) -> Result<()> {
        self.keepalives.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Generator that records every request
pub struct RecordingGenerator {
    reply: String,
    fail: bool,
    latency: Duration,
    calls: Mutex<Vec<(String, usize)>>,
}

impl RecordingGenerator {
    pub fn replying(reply: &str) -> Arc<Self> {
        Self::with_latency(reply, Duration::ZERO)
    }

    pub fn with_latency(reply: &str, latency: Duration) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            fail: false,
            latency,
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            reply: String::new(),
            fail: true,
            latency: Duration::ZERO,
            calls: Mutex::new(Vec::new()),
        })
    }

    /// Utterances received, in order
    pub fn utterances(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(u, _)| u.clone()).collect()
    }

    /// History length passed with each request
    pub fn history_lengths(&self) -> Vec<usize> {
        self.calls.lock().unwrap().iter().map(|(_, n)| *n).collect()
    }
}

#[async_trait]
impl Generator for RecordingGenerator {
    async fn generate(&self, utterance: &str, history: &[ChatMessage]) -> Result<String> {
        self.calls
            .lock()
            .unwrap()
            .push((utterance.to_string(), history.len()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.fail {
            return Err(Error::Generation("model unavailable".to_string()));
        }
        Ok(self.reply.clone())
    }
}

/// Synthesizer emitting a fixed number of constant PCM chunks
pub struct ToneSynthesizer {
    chunks: usize,
    chunk_bytes: usize,
    /// Pause before each streamed chunk
    pace: Duration,
    ready: AtomicBool,
    requests: Mutex<Vec<String>>,
}

impl ToneSynthesizer {
    pub const SAMPLE_RATE: u32 = 24_000;

    pub fn new(chunks: usize, chunk_bytes: usize) -> Arc<Self> {
        Self::paced(chunks, chunk_bytes, Duration::ZERO)
    }

    pub fn paced(chunks: usize, chunk_bytes: usize, pace: Duration) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            chunk_bytes,
            pace,
            ready: AtomicBool::new(true),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Starts unprepared so sessions announce loading first
    pub fn cold(chunks: usize, chunk_bytes: usize) -> Arc<Self> {
        let synth = Self::new(chunks, chunk_bytes);
        synth.ready.store(false, Ordering::SeqCst);
        synth
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn chunk(&self) -> Vec<u8> {
        vec![7u8; self.chunk_bytes]
    }
}

#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    fn sample_rate(&self) -> u32 {
        Self::SAMPLE_RATE
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn prepare(&self) -> Result<()> {
        self.ready.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn synthesize(&self, text: &str) -> Result<Vec<u8>> {
        self.requests.lock().unwrap().push(text.to_string());
        Ok(self.chunk().repeat(self.chunks))
    }

    async fn synthesize_stream(&self, text: &str) -> Result<PcmStream> {
        self.requests.lock().unwrap().push(text.to_string());
        let chunk = self.chunk();
        let pace = self.pace;
        let stream = futures::stream::unfold(self.chunks, move |left| {
            let chunk = chunk.clone();
            async move {
                if left == 0 {
                    return None;
                }
                if !pace.is_zero() {
                    tokio::time::sleep(pace).await;
                }
                Some((Ok(chunk), left - 1))
            }
        });
        Ok(stream.boxed())
    }
}

/// A running session plus the peer side of its outbound channel
pub struct Harness {
    pub handle: SessionHandle,
    pub task: JoinHandle<()>,
    pub out: mpsc::Receiver<Outbound>,
    pub stt: Arc<ScriptedTranscription>,
    pub generator: Arc<RecordingGenerator>,
    pub synth: Arc<ToneSynthesizer>,
}

impl Harness {
    pub fn spawn(
        stt: Arc<ScriptedTranscription>,
        generator: Arc<RecordingGenerator>,
        synth: Arc<ToneSynthesizer>,
        options: SessionOptions,
    ) -> Self {
        let services = SessionServices {
            transcription: stt.clone(),
            generator: generator.clone(),
            synthesizer: synth.clone(),
        };
        let (tx, out) = mpsc::channel(256);
        let (handle, task) = Session::spawn(services, options, tx);
        Self {
            handle,
            task,
            out,
            stt,
            generator,
            synth,
        }
    }

    /// Default collaborators: replies "Hi there." in three 960-byte chunks
    pub fn standard() -> Self {
        Self::spawn(
            ScriptedTranscription::new(),
            RecordingGenerator::replying("Hi there."),
            ToneSynthesizer::new(3, 960),
            SessionOptions::default(),
        )
    }

    pub async fn next(&mut self) -> Outbound {
        tokio::time::timeout(RECV_TIMEOUT, self.out.recv())
            .await
            .expect("timed out waiting for outbound item")
            .expect("outbound channel closed")
    }

    /// Next item, which must be a text message
    pub async fn next_message(&mut self) -> WsOutgoing {
        match self.next().await {
            Outbound::Message(message) => message,
            Outbound::Audio(pcm) => panic!("expected message, got {} bytes of audio", pcm.len()),
        }
    }

    pub async fn expect_status(&mut self, status: Status) {
        assert_eq!(self.next_message().await, WsOutgoing::Status(status));
    }

    /// Skip items until `wanted` arrives, returning everything skipped
    pub async fn until(&mut self, wanted: &WsOutgoing) -> Vec<Outbound> {
        let mut skipped = Vec::new();
        loop {
            match self.next().await {
                Outbound::Message(ref m) if m == wanted => return skipped,
                other => skipped.push(other),
            }
        }
    }

    /// Consume the greeting and open the microphone
    pub async fn start_listening(&mut self) {
        self.expect_status(Status::Ready).await;
        assert!(self.handle.command(WsIncoming::Start));
        self.expect_status(Status::Listening).await;
    }

    /// Whether nothing further is queued right now
    pub fn is_quiet(&mut self) -> bool {
        self.out.try_recv().is_err()
    }
}

/// Give spawned tasks a chance to run without advancing virtual time far
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
