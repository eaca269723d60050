//! Upstream transcription link lifecycle
//!
//! [`UpstreamLink`] owns one live transcription session at a time. It
//! forwards microphone audio, hands transcript events to a registered sink,
//! and reconnects with bounded linear backoff when the remote side drops
//! unexpectedly. A deliberate [`UpstreamLink::close`] sets the manual-close
//! flag first so the resulting close event is not treated as a failure.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, RwLock, mpsc};
use tokio_util::sync::CancellationToken;

use super::stt::{LinkEvent, TranscriptEvent, TranscriptionHandle, TranscriptionService};
use crate::{Error, Result};

/// Receives transcript events from the live session
pub type TranscriptSink = Arc<dyn Fn(TranscriptEvent) + Send + Sync>;

/// Capacity of the per-session event channel
const EVENT_BUFFER: usize = 64;

/// Reconnect policy for unexpected upstream closure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of reconnect attempts per sequence
    pub max_retries: u32,
    /// Backoff step; the wait after failed attempt `n` is `n * step`
    pub backoff_step: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_step: Duration::from_secs(2),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before attempt `attempt` (1-based); the first attempt is immediate
    #[must_use]
    pub fn delay_before(&self, attempt: u32) -> Duration {
        self.backoff_step * attempt.saturating_sub(1)
    }
}

/// Shared link state
struct LinkInner {
    service: Arc<dyn TranscriptionService>,
    policy: ReconnectPolicy,
    handle: Mutex<Option<Arc<dyn TranscriptionHandle>>>,
    sink: RwLock<Option<TranscriptSink>>,
    keepalive: Mutex<Option<CancellationToken>>,
    connected: AtomicBool,
    reconnecting: AtomicBool,
    manual_close: AtomicBool,
    retry_count: AtomicU32,
    /// Identifies the live session; events from older sessions are ignored
    epoch: AtomicU64,
}

/// Manages the streaming transcription connection
#[derive(Clone)]
pub struct UpstreamLink {
    inner: Arc<LinkInner>,
}

impl UpstreamLink {
    /// Create a disconnected link
    #[must_use]
    pub fn new(service: Arc<dyn TranscriptionService>, policy: ReconnectPolicy) -> Self {
        Self {
            inner: Arc::new(LinkInner {
                service,
                policy,
                handle: Mutex::new(None),
                sink: RwLock::new(None),
                keepalive: Mutex::new(None),
                connected: AtomicBool::new(false),
                reconnecting: AtomicBool::new(false),
                manual_close: AtomicBool::new(false),
                retry_count: AtomicU32::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Whether a live session is established
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Whether a reconnect sequence is in flight
    #[must_use]
    pub fn is_reconnecting(&self) -> bool {
        self.inner.reconnecting.load(Ordering::SeqCst)
    }

    /// Whether the last close was deliberate
    #[must_use]
    pub fn is_manually_closed(&self) -> bool {
        self.inner.manual_close.load(Ordering::SeqCst)
    }

    /// Attempt number of the current (or last) reconnect sequence
    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// Establish the session and register the transcript sink
    ///
    /// The sink is kept for automatic reconnects.
    ///
    /// # Errors
    ///
    /// Returns `Error::Connect` if the remote handshake fails
    pub async fn connect(&self, sink: TranscriptSink) -> Result<()> {
        *self.inner.sink.write().await = Some(sink);
        self.inner.manual_close.store(false, Ordering::SeqCst);

        if self.is_connected() {
            tracing::debug!("reusing live transcription session");
            return Ok(());
        }
        if self.is_reconnecting() {
            tracing::debug!("reconnect already in progress, not opening a second session");
            return Ok(());
        }

        self.establish().await
    }

    /// Forward microphone audio; dropped silently while disconnected
    pub async fn send_audio(&self, pcm: Vec<u8>) {
        if !self.is_connected() {
            tracing::trace!(bytes = pcm.len(), "link down, dropping audio");
            return;
        }

        let handle = self.inner.handle.lock().await.clone();
        let Some(handle) = handle else {
            return;
        };

        if let Err(e) = handle.send(pcm).await {
            tracing::warn!(error = %e, "upstream send failed");
            let epoch = self.inner.epoch.load(Ordering::SeqCst);
            self.on_session_ended(epoch, Some(e.to_string())).await;
        }
    }

    /// Start the idle feed that keeps the remote session alive
    ///
    /// Replaces any running feed.
    pub async fn start_keepalive(&self, interval: Duration) {
        let token = CancellationToken::new();
        if let Some(previous) = self.inner.keepalive.lock().await.replace(token.clone()) {
            previous.cancel();
        }

        let link = self.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let handle = link.inner.handle.lock().await.clone();
                if let Some(handle) = handle {
                    if let Err(e) = handle.keep_alive().await {
                        tracing::debug!(error = %e, "keepalive failed");
                    }
                }
            }
            tracing::trace!("keepalive feed stopped");
        });
    }

    /// Stop the idle feed, if running
    pub async fn stop_keepalive(&self) {
        if let Some(token) = self.inner.keepalive.lock().await.take() {
            token.cancel();
        }
    }

    /// Deliberately shut the session down without reconnecting
    pub async fn close(&self) {
        self.inner.manual_close.store(true, Ordering::SeqCst);
        self.stop_keepalive().await;

        let handle = {
            let mut slot = self.inner.handle.lock().await;
            self.inner.connected.store(false, Ordering::SeqCst);
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                tracing::debug!(error = %e, "error finalizing transcription session");
            }
            tracing::info!("transcription link closed");
        }
    }

    /// Launch a reconnect sequence unless one is already running
    ///
    /// Returns `false` when a sequence is already in flight.
    pub fn trigger_reconnect(&self) -> bool {
        if self
            .inner
            .reconnecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("reconnect already in progress");
            return false;
        }

        let link = self.clone();
        tokio::spawn(async move {
            link.reconnect_sequence().await;
        });
        true
    }

    async fn reconnect_sequence(&self) {
        let policy = self.inner.policy;
        let mut recovered = false;

        for attempt in 1..=policy.max_retries {
            let delay = policy.delay_before(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            if self.is_manually_closed() {
                tracing::debug!("link closed during reconnect, abandoning");
                break;
            }

            self.inner.retry_count.store(attempt, Ordering::SeqCst);
            tracing::info!(attempt, max = policy.max_retries, "reconnecting transcription link");

            match self.establish().await {
                Ok(()) => {
                    recovered = true;
                    break;
                }
                Err(e) => {
                    if self.is_manually_closed() {
                        tracing::debug!("link closed during reconnect handshake, abandoning");
                        break;
                    }
                    tracing::warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }

        if recovered {
            self.inner.retry_count.store(0, Ordering::SeqCst);
            tracing::info!("transcription link restored");
        } else if !self.is_manually_closed() {
            tracing::error!(
                retries = policy.max_retries,
                "transcription link reconnect exhausted, waiting for next start"
            );
        }
        self.inner.reconnecting.store(false, Ordering::SeqCst);
    }

    /// Open a session and start pumping its events
    async fn establish(&self) -> Result<()> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let handle = self
            .inner
            .service
            .connect(events_tx)
            .await
            .map_err(|e| match e {
                Error::Connect(_) => e,
                other => Error::Connect(other.to_string()),
            })?;

        // Publish under the slot lock so a concurrent close sees either no
        // session or this one
        let epoch = {
            let mut slot = self.inner.handle.lock().await;
            if self.is_manually_closed() {
                drop(slot);
                if let Err(e) = handle.close().await {
                    tracing::debug!(error = %e, "error finalizing discarded session");
                }
                return Err(Error::Connect("link closed during handshake".to_string()));
            }
            let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
            *slot = Some(handle);
            self.inner.connected.store(true, Ordering::SeqCst);
            epoch
        };

        let link = self.clone();
        tokio::spawn(async move {
            link.pump(epoch, events_rx).await;
        });
        Ok(())
    }

    /// Route events of one session to the sink until it ends
    async fn pump(&self, epoch: u64, mut events: mpsc::Receiver<LinkEvent>) {
        let mut reason = None;
        while let Some(event) = events.recv().await {
            match event {
                LinkEvent::Transcript(transcript) => {
                    let sink = self.inner.sink.read().await.clone();
                    if let Some(sink) = sink {
                        sink(transcript);
                    }
                }
                LinkEvent::Closed { reason: r } => {
                    reason = r;
                    break;
                }
                LinkEvent::Error(e) => {
                    tracing::warn!(error = %e, "transcription link error");
                    reason = Some(e);
                    break;
                }
            }
        }
        self.on_session_ended(epoch, reason).await;
    }

    async fn on_session_ended(&self, epoch: u64, reason: Option<String>) {
        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            return;
        }
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.handle.lock().await.take();

        if self.is_manually_closed() {
            tracing::debug!("transcription session ended after deliberate close");
            return;
        }

        tracing::warn!(reason = ?reason, "transcription link closed unexpectedly");
        self.trigger_reconnect();
    }
}
