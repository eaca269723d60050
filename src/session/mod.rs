//! Per-connection turn-taking state machine
//!
//! A [`Session`] is an actor: every input (peer commands, microphone audio,
//! transcripts, timer fires, finished background work) arrives as a
//! [`SessionEvent`] on one queue and is handled in order. Phase changes are
//! therefore atomic with respect to each other, which is what keeps a second
//! `stop` or a racing silence timer from dispatching the same utterance twice.
//!
//! Generation and playback run as background tasks tagged with a turn id.
//! Interrupting a turn cancels its token and forgets the id, so anything the
//! task reports afterwards is discarded.

pub mod messages;

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

use self::messages::{Outbound, Status, StopReason, Transcription, WsIncoming, WsOutgoing};
use crate::agent::{Conversation, Generator};
use crate::config::{Config, LinkPolicy, TurnConfig};
use crate::voice::{
    DeliveryOutcome, SilenceDetector, SpeechSynthesizer, SynthesizedAudio, TranscriptEvent,
    TranscriptSink, TranscriptionService, UpstreamLink, collapse_repeats, deliver,
};
use crate::Result;

/// How often streaming diagnostics are logged
const AUDIO_REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// Conversation phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Phase {
    /// Before the first `start` and after teardown
    #[default]
    Idle,
    /// Accumulating transcript
    Listening,
    /// Generation in flight
    Thinking,
    /// Reply audio being delivered
    Speaking,
}

/// Remote collaborators shared by every session
#[derive(Clone)]
pub struct SessionServices {
    pub transcription: Arc<dyn TranscriptionService>,
    pub generator: Arc<dyn Generator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
}

/// Per-session behaviour
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub turn: TurnConfig,
    /// Stream synthesized chunks instead of buffering whole replies
    pub stream_synthesis: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            turn: TurnConfig::default(),
            stream_synthesis: true,
        }
    }
}

impl SessionOptions {
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            turn: config.turn.clone(),
            stream_synthesis: config.tts.streaming,
        }
    }
}

/// Inputs processed by the session actor
#[derive(Debug)]
enum SessionEvent {
    Command(WsIncoming),
    Audio(Vec<u8>),
    Transcript(TranscriptEvent),
    SilenceElapsed {
        epoch: u64,
    },
    Generated {
        turn: u64,
        utterance: String,
        result: Result<String>,
    },
    PlaybackFinished {
        turn: u64,
        outcome: Result<DeliveryOutcome>,
    },
    Shutdown,
}

/// Cloneable handle used by the connection to feed a session
#[derive(Clone)]
pub struct SessionHandle {
    id: Uuid,
    events: mpsc::UnboundedSender<SessionEvent>,
    phase: watch::Receiver<Phase>,
}

impl SessionHandle {
    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    /// Deliver a peer command; returns `false` once the session has ended
    pub fn command(&self, command: WsIncoming) -> bool {
        self.events.send(SessionEvent::Command(command)).is_ok()
    }

    /// Deliver a microphone PCM chunk; returns `false` once the session has ended
    pub fn audio(&self, pcm: Vec<u8>) -> bool {
        self.events.send(SessionEvent::Audio(pcm)).is_ok()
    }

    /// Ask the session to tear down
    pub fn shutdown(&self) {
        let _ = self.events.send(SessionEvent::Shutdown);
    }

    /// Current phase
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Subscribe to phase changes
    #[must_use]
    pub fn watch_phase(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }
}

/// The turn currently being produced
struct Turn {
    id: u64,
    /// Interrupt flag for generation and playback
    interrupt: CancellationToken,
    /// Resolves to whether playback opened (and so closed) a stream
    playback: Option<JoinHandle<bool>>,
}

/// Which source claimed the end of speech
#[derive(Debug, Clone, Copy)]
enum EndOfSpeech {
    Silence { epoch: u64 },
    Stop,
}

/// Diagnostic counters for inbound audio
struct AudioStats {
    chunks: u64,
    bytes: u64,
    last_activity: Instant,
    last_report: Instant,
}

impl AudioStats {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            chunks: 0,
            bytes: 0,
            last_activity: now,
            last_report: now,
        }
    }

    fn record(&mut self, bytes: usize) {
        self.chunks += 1;
        self.bytes += bytes as u64;
        self.last_activity = Instant::now();

        if self.last_report.elapsed() >= AUDIO_REPORT_INTERVAL {
            tracing::debug!(chunks = self.chunks, bytes = self.bytes, "streaming audio");
            self.last_report = self.last_activity;
        }
    }
}

/// Session actor state
pub struct Session {
    id: Uuid,
    services: SessionServices,
    options: SessionOptions,
    link: UpstreamLink,
    detector: SilenceDetector,
    conversation: Conversation,
    phase: Phase,
    phase_tx: watch::Sender<Phase>,
    pending: String,
    turn_seq: u64,
    turn: Option<Turn>,
    events: mpsc::WeakUnboundedSender<SessionEvent>,
    out: mpsc::Sender<Outbound>,
    stats: AudioStats,
}

impl Session {
    /// Start a session actor writing to `out`
    ///
    /// The session greets the peer, then runs until [`SessionHandle::shutdown`]
    /// is called or every handle is dropped. The returned task completes after
    /// teardown.
    pub fn spawn(
        services: SessionServices,
        options: SessionOptions,
        out: mpsc::Sender<Outbound>,
    ) -> (SessionHandle, JoinHandle<()>) {
        let id = Uuid::new_v4();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (phase_tx, phase_rx) = watch::channel(Phase::Idle);

        let link = UpstreamLink::new(
            Arc::clone(&services.transcription),
            options.turn.reconnect,
        );

        let session = Self {
            id,
            services,
            options,
            link,
            detector: SilenceDetector::new(),
            conversation: Conversation::new(),
            phase: Phase::Idle,
            phase_tx,
            pending: String::new(),
            turn_seq: 0,
            turn: None,
            events: events_tx.downgrade(),
            out,
            stats: AudioStats::new(),
        };

        let span = tracing::info_span!("session", session_id = %id);
        let task = tokio::spawn(session.run(events_rx).instrument(span));

        let handle = SessionHandle {
            id,
            events: events_tx,
            phase: phase_rx,
        };
        (handle, task)
    }

    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        tracing::info!("session started");
        self.greet().await;

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Shutdown => break,
                SessionEvent::Command(command) => self.on_command(command).await,
                SessionEvent::Audio(pcm) => self.on_audio(pcm).await,
                SessionEvent::Transcript(event) => self.on_transcript(event).await,
                SessionEvent::SilenceElapsed { epoch } => {
                    self.end_of_speech(EndOfSpeech::Silence { epoch }).await;
                }
                SessionEvent::Generated {
                    turn,
                    utterance,
                    result,
                } => self.on_generated(turn, utterance, result).await,
                SessionEvent::PlaybackFinished { turn, outcome } => {
                    self.on_playback_finished(turn, outcome).await;
                }
            }
        }

        self.teardown().await;
    }

    /// Announce readiness, preparing the synthesizer first if needed
    async fn greet(&mut self) {
        if !self.services.synthesizer.is_ready() {
            self.send(WsOutgoing::Status(Status::LoadingTts)).await;
            if let Err(e) = self.services.synthesizer.prepare().await {
                tracing::error!(error = %e, "failed to prepare synthesizer");
                self.send(WsOutgoing::Error(e.to_string())).await;
            }
        }
        self.send(WsOutgoing::Status(Status::Ready)).await;
    }

    async fn on_command(&mut self, command: WsIncoming) {
        tracing::debug!(?command, phase = ?self.phase, "command");
        match command {
            WsIncoming::Start => {
                if matches!(self.phase, Phase::Thinking | Phase::Speaking) {
                    self.interrupt().await;
                }
                self.start().await;
            }
            WsIncoming::Stop => self.end_of_speech(EndOfSpeech::Stop).await,
            WsIncoming::Reset => {
                self.conversation.reset();
                tracing::info!("conversation reset");
                if matches!(self.phase, Phase::Idle | Phase::Listening) {
                    self.send(WsOutgoing::Status(Status::Ready)).await;
                }
            }
            WsIncoming::Ping => self.send(WsOutgoing::Pong).await,
            WsIncoming::Interrupt => {
                if matches!(self.phase, Phase::Thinking | Phase::Speaking) {
                    self.interrupt().await;
                }
            }
        }
    }

    async fn start(&mut self) {
        self.pending.clear();
        self.detector.cancel();
        self.detector.reset_trigger();

        if self.link.is_connected() {
            tracing::debug!("reusing transcription link");
        } else if let Err(e) = self.link.connect(self.transcript_sink()).await {
            tracing::warn!(error = %e, "failed to connect transcription link");
            self.set_phase(Phase::Idle);
            self.send(WsOutgoing::Error(e.to_string())).await;
            self.send(WsOutgoing::Status(Status::Ready)).await;
            return;
        }

        self.link.stop_keepalive().await;
        self.set_phase(Phase::Listening);
        self.send(WsOutgoing::Status(Status::Listening)).await;
    }

    async fn on_audio(&mut self, pcm: Vec<u8>) {
        self.stats.record(pcm.len());
        if self.phase == Phase::Thinking {
            tracing::trace!(bytes = pcm.len(), "dropping audio while thinking");
            return;
        }
        self.link.send_audio(pcm).await;
    }

    async fn on_transcript(&mut self, event: TranscriptEvent) {
        match self.phase {
            Phase::Speaking => {
                if self.options.turn.interrupt.should_interrupt(&event) {
                    tracing::info!(text = %event.text, "speech during playback");
                    self.interrupt().await;
                }
            }
            Phase::Listening => {
                if event.is_final && event.has_text() {
                    if !self.pending.is_empty() {
                        self.pending.push(' ');
                    }
                    self.pending.push_str(event.text.trim());
                }

                let terminal = event.is_final || event.is_speech_final;
                self.send(WsOutgoing::Transcription(Transcription {
                    text: event.text,
                    is_final: event.is_final,
                    full_text: self.pending.clone(),
                }))
                .await;

                if terminal {
                    self.arm_silence();
                }
            }
            Phase::Idle | Phase::Thinking => {
                tracing::trace!(phase = ?self.phase, "ignoring transcript");
            }
        }
    }

    fn arm_silence(&mut self) {
        let events = self.events.clone();
        self.detector
            .arm(self.options.turn.silence_threshold, move |epoch| {
                if let Some(events) = events.upgrade() {
                    let _ = events.send(SessionEvent::SilenceElapsed { epoch });
                }
            });
    }

    /// Accept the end of the utterance, at most once per turn
    async fn end_of_speech(&mut self, source: EndOfSpeech) {
        if self.phase != Phase::Listening {
            tracing::debug!(?source, phase = ?self.phase, "end of speech ignored");
            return;
        }
        if self.pending.trim().is_empty() {
            tracing::debug!(?source, "end of speech with nothing to send");
            self.detector.reset_trigger();
            return;
        }

        let accepted = match source {
            EndOfSpeech::Silence { epoch } => self.detector.is_current(epoch),
            EndOfSpeech::Stop => self.detector.try_trigger(),
        };
        if !accepted {
            tracing::debug!(?source, "end of speech already signalled");
            return;
        }

        self.dispatch().await;
    }

    /// Hand the pending utterance to the generator
    async fn dispatch(&mut self) {
        self.set_phase(Phase::Thinking);
        self.detector.cancel();
        let utterance = collapse_repeats(&std::mem::take(&mut self.pending));

        self.turn_seq += 1;
        let turn = Turn {
            id: self.turn_seq,
            interrupt: CancellationToken::new(),
            playback: None,
        };
        tracing::info!(turn = turn.id, utterance = %utterance, "generating reply");

        match self.options.turn.link {
            LinkPolicy::KeepAlive => {
                self.link
                    .start_keepalive(self.options.turn.keepalive_interval)
                    .await;
            }
            LinkPolicy::PerTurn => self.link.close().await,
        }
        self.send(WsOutgoing::Status(Status::Thinking)).await;

        let generator = Arc::clone(&self.services.generator);
        let history = self.conversation.messages().to_vec();
        let events = self.events.clone();
        let id = turn.id;
        tokio::spawn(async move {
            let result = generator.generate(&utterance, &history).await;
            if let Some(events) = events.upgrade() {
                let _ = events.send(SessionEvent::Generated {
                    turn: id,
                    utterance,
                    result,
                });
            }
        });

        self.turn = Some(turn);
    }

    fn is_current_turn(&self, id: u64) -> bool {
        self.turn.as_ref().is_some_and(|t| t.id == id)
    }

    async fn on_generated(&mut self, id: u64, utterance: String, result: Result<String>) {
        if !self.is_current_turn(id) || self.phase != Phase::Thinking {
            tracing::debug!(turn = id, "discarding reply for abandoned turn");
            return;
        }

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                self.fail_turn(&e).await;
                return;
            }
        };

        tracing::info!(turn = id, chars = reply.len(), "reply generated");
        self.conversation.record(utterance, reply.clone());
        self.send(WsOutgoing::Response(reply.clone())).await;
        self.set_phase(Phase::Speaking);
        self.send(WsOutgoing::Status(Status::Speaking)).await;
        self.resume_link().await;

        let Some(turn) = self.turn.as_mut() else {
            return;
        };
        let synthesizer = Arc::clone(&self.services.synthesizer);
        let interrupt = turn.interrupt.clone();
        let out = self.out.clone();
        let streaming = self.options.stream_synthesis;
        let events = self.events.clone();
        turn.playback = Some(tokio::spawn(async move {
            let outcome = play(synthesizer.as_ref(), &reply, streaming, &interrupt, &out).await;
            let opened = outcome.as_ref().is_ok_and(DeliveryOutcome::opened_stream);
            if let Some(events) = events.upgrade() {
                let _ = events.send(SessionEvent::PlaybackFinished { turn: id, outcome });
            }
            opened
        }));
    }

    async fn on_playback_finished(&mut self, id: u64, outcome: Result<DeliveryOutcome>) {
        if !self.is_current_turn(id) {
            return;
        }

        match outcome {
            Ok(outcome) => {
                tracing::info!(turn = id, ?outcome, "turn complete");
                self.turn = None;
                self.detector.reset_trigger();
                self.set_phase(Phase::Listening);
                self.send(WsOutgoing::Status(Status::Ready)).await;
            }
            Err(e) => self.fail_turn(&e).await,
        }
    }

    /// Report a failed turn and return to listening
    async fn fail_turn(&mut self, error: &crate::Error) {
        tracing::warn!(error = %error, phase = ?self.phase, "turn failed");
        if let Some(turn) = self.turn.take() {
            turn.interrupt.cancel();
        }
        self.set_phase(Phase::Listening);
        self.detector.reset_trigger();
        self.resume_link().await;
        self.send(WsOutgoing::Error(error.to_string())).await;
        self.send(WsOutgoing::Status(Status::Ready)).await;
    }

    /// Abort the turn in progress and return to listening
    async fn interrupt(&mut self) {
        let Some(mut turn) = self.turn.take() else {
            return;
        };
        tracing::info!(turn = turn.id, phase = ?self.phase, "interrupting turn");
        turn.interrupt.cancel();

        // Playback closes its own stream; wait so the stop notice lands first
        let stream_closed = match turn.playback.take() {
            Some(playback) => playback.await.unwrap_or_else(|e| {
                tracing::warn!(error = %e, "playback task failed");
                false
            }),
            None => false,
        };
        if !stream_closed {
            // Resets the peer's player even when no audio was sent
            self.send(WsOutgoing::stop_stream()).await;
        }

        self.pending.clear();
        self.detector.cancel();
        self.detector.reset_trigger();
        self.set_phase(Phase::Listening);
        self.resume_link().await;
        self.send(WsOutgoing::AudioStopped(StopReason::Interrupted))
            .await;
        self.send(WsOutgoing::Status(Status::Listening)).await;
    }

    /// Return the link to live microphone use
    async fn resume_link(&self) {
        match self.options.turn.link {
            LinkPolicy::KeepAlive => self.link.stop_keepalive().await,
            LinkPolicy::PerTurn => {
                if !self.link.is_connected() {
                    if let Err(e) = self.link.connect(self.transcript_sink()).await {
                        tracing::warn!(error = %e, "failed to reopen transcription link");
                    }
                }
            }
        }
    }

    async fn teardown(&mut self) {
        if let Some(turn) = self.turn.take() {
            turn.interrupt.cancel();
        }
        self.detector.cancel();
        self.link.close().await;
        self.set_phase(Phase::Idle);

        let idle = self.stats.last_activity.elapsed();
        tracing::info!(
            chunks = self.stats.chunks,
            bytes = self.stats.bytes,
            idle_secs = idle.as_secs(),
            turns = self.conversation.turns(),
            "session closed"
        );
    }

    fn transcript_sink(&self) -> TranscriptSink {
        let events = self.events.clone();
        Arc::new(move |event| {
            if let Some(events) = events.upgrade() {
                let _ = events.send(SessionEvent::Transcript(event));
            }
        })
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "phase change");
        }
        self.phase = phase;
        self.phase_tx.send_replace(phase);
    }

    async fn send(&self, message: WsOutgoing) {
        if self.out.send(Outbound::Message(message)).await.is_err() {
            tracing::debug!("peer channel closed, dropping message");
        }
    }
}

/// Synthesize `text` and stream it unless interrupted first
async fn play(
    synthesizer: &dyn SpeechSynthesizer,
    text: &str,
    streaming: bool,
    interrupt: &CancellationToken,
    out: &mpsc::Sender<Outbound>,
) -> Result<DeliveryOutcome> {
    let sample_rate = synthesizer.sample_rate();
    let synthesis = async {
        if streaming {
            synthesizer
                .synthesize_stream(text)
                .await
                .map(SynthesizedAudio::Stream)
        } else {
            synthesizer.synthesize(text).await.map(SynthesizedAudio::Buffer)
        }
    };

    let audio = tokio::select! {
        biased;
        () = interrupt.cancelled() => return Ok(DeliveryOutcome::Skipped),
        audio = synthesis => audio?,
    };
    deliver(audio, sample_rate, interrupt, out).await
}
