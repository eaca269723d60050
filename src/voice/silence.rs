//! Restartable silence timer marking the end of a user utterance
//!
//! Every terminal transcript fragment re-arms the timer. If nothing re-arms
//! or cancels it before the threshold elapses, the callback runs once for
//! that arm cycle. Cancellation is cooperative: the delayed task watches a
//! [`CancellationToken`] and is never awaited by the owner.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// The single outstanding delayed task
#[derive(Debug)]
struct PendingTimer {
    epoch: u64,
    cancel: CancellationToken,
}

/// Single-shot, restartable end-of-speech timer
#[derive(Debug, Default)]
pub struct SilenceDetector {
    pending: Option<PendingTimer>,
    /// Set once the end of speech has been signalled for the current cycle
    triggered: Arc<AtomicBool>,
    epoch: u64,
}

impl SilenceDetector {
    /// Create an idle detector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start (or restart) the timer
    ///
    /// Cancels any outstanding timer and clears the fired guard. When
    /// `threshold` elapses without another `arm` or `cancel`, `on_elapsed`
    /// is invoked with the returned epoch. Must be called inside a tokio
    /// runtime.
    pub fn arm<F>(&mut self, threshold: Duration, on_elapsed: F) -> u64
    where
        F: FnOnce(u64) + Send + 'static,
    {
        self.cancel();
        self.triggered.store(false, Ordering::SeqCst);
        self.epoch += 1;

        let epoch = self.epoch;
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let triggered = Arc::clone(&self.triggered);

        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = tokio::time::sleep(threshold) => {
                    if token.is_cancelled() {
                        return;
                    }
                    if triggered
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                    {
                        tracing::debug!(epoch, ?threshold, "silence threshold elapsed");
                        on_elapsed(epoch);
                    }
                }
            }
        });

        self.pending = Some(PendingTimer { epoch, cancel });
        epoch
    }

    /// Cancel the outstanding timer, if any
    pub fn cancel(&mut self) {
        if let Some(timer) = self.pending.take() {
            timer.cancel.cancel();
        }
    }

    /// Claim the end-of-speech signal for the current cycle
    ///
    /// Used by explicit stop requests so they cannot race a timer that
    /// already fired. Returns `false` when the signal was already claimed.
    pub fn try_trigger(&self) -> bool {
        self.triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Clear the fired guard so the next cycle can signal again
    pub fn reset_trigger(&self) {
        self.triggered.store(false, Ordering::SeqCst);
    }

    /// Whether the end of speech was already signalled this cycle
    #[must_use]
    pub fn has_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    /// Whether a fire for `epoch` still belongs to the live timer
    ///
    /// A fire can be queued behind a re-arm or cancel; stale epochs are
    /// ignored by the caller.
    #[must_use]
    pub fn is_current(&self, epoch: u64) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|t| t.epoch == epoch && !t.cancel.is_cancelled())
    }

    /// Whether a timer is outstanding
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.pending.is_some()
    }
}

impl Drop for SilenceDetector {
    fn drop(&mut self) {
        self.cancel();
    }
}
