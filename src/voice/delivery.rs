//! Audio delivery loop
//!
//! Forwards synthesized PCM to the peer between a `begin_stream` and a
//! `stop_stream` notice. The interrupt token is checked before every chunk.

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::tts::SynthesizedAudio;
use crate::session::messages::{Outbound, WsOutgoing};
use crate::{Error, Result};

/// How a delivery ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every chunk was forwarded
    Completed { chunks: usize },
    /// The interrupt was observed; `chunks` were forwarded before it
    Interrupted { chunks: usize },
    /// Interrupted before the stream was opened; nothing was sent
    Skipped,
}

impl DeliveryOutcome {
    /// Whether the peer saw a `begin_stream` and its matching `stop_stream`
    #[must_use]
    pub const fn opened_stream(&self) -> bool {
        !matches!(self, Self::Skipped)
    }
}

async fn emit(out: &mpsc::Sender<Outbound>, item: impl Into<Outbound>) -> Result<()> {
    out.send(item.into())
        .await
        .map_err(|_| Error::Channel("peer channel closed".to_string()))
}

/// Stream `audio` to the peer
///
/// Nothing is sent if the interrupt is already set. Otherwise the stream is
/// always closed with `stop_stream`, including after an error.
///
/// # Errors
///
/// Returns the synthesis error that ended the stream, or `Error::Channel`
/// if the peer channel is closed
pub async fn deliver(
    audio: SynthesizedAudio,
    sample_rate: u32,
    interrupt: &CancellationToken,
    out: &mpsc::Sender<Outbound>,
) -> Result<DeliveryOutcome> {
    if interrupt.is_cancelled() {
        return Ok(DeliveryOutcome::Skipped);
    }

    emit(out, WsOutgoing::begin_stream(sample_rate)).await?;
    let forwarded = forward(audio, interrupt, out).await;
    let stopped = emit(out, WsOutgoing::stop_stream()).await;

    let outcome = forwarded?;
    stopped?;
    tracing::debug!(?outcome, sample_rate, "audio delivery finished");
    Ok(outcome)
}

async fn forward(
    audio: SynthesizedAudio,
    interrupt: &CancellationToken,
    out: &mpsc::Sender<Outbound>,
) -> Result<DeliveryOutcome> {
    let mut stream = match audio {
        SynthesizedAudio::Buffer(pcm) => {
            futures::stream::once(async move { Ok::<_, Error>(pcm) }).boxed()
        }
        SynthesizedAudio::Stream(stream) => stream,
    };

    let mut chunks = 0;
    loop {
        let next = tokio::select! {
            biased;
            () = interrupt.cancelled() => None,
            next = stream.next() => Some(next),
        };
        let Some(next) = next else {
            return Ok(DeliveryOutcome::Interrupted { chunks });
        };
        let Some(chunk) = next else {
            return Ok(DeliveryOutcome::Completed { chunks });
        };
        let chunk = chunk?;

        if interrupt.is_cancelled() {
            return Ok(DeliveryOutcome::Interrupted { chunks });
        }
        if chunk.is_empty() {
            continue;
        }

        emit(out, Outbound::Audio(chunk)).await?;
        chunks += 1;
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio_stream::wrappers::ReceiverStream;

    use super::*;

    fn drain(rx: &mut mpsc::Receiver<Outbound>) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Ok(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn delivers_chunks_in_order() {
        let (tx, mut rx) = mpsc::channel(16);
        let chunks: Vec<Result<Vec<u8>>> = vec![Ok(vec![1, 1]), Ok(vec![2, 2]), Ok(vec![3, 3])];
        let audio = SynthesizedAudio::Stream(futures::stream::iter(chunks).boxed());

        let outcome = deliver(audio, 24000, &CancellationToken::new(), &tx)
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Completed { chunks: 3 });
        assert_eq!(
            drain(&mut rx),
            vec![
                Outbound::from(WsOutgoing::begin_stream(24000)),
                Outbound::Audio(vec![1, 1]),
                Outbound::Audio(vec![2, 2]),
                Outbound::Audio(vec![3, 3]),
                Outbound::from(WsOutgoing::stop_stream()),
            ]
        );
    }

    #[tokio::test]
    async fn single_buffer_is_one_frame() {
        let (tx, mut rx) = mpsc::channel(16);
        let outcome = deliver(
            SynthesizedAudio::Buffer(vec![0; 64]),
            16000,
            &CancellationToken::new(),
            &tx,
        )
        .await
        .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Completed { chunks: 1 });
        assert_eq!(drain(&mut rx).len(), 3);
    }

    #[tokio::test]
    async fn interrupted_before_start_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(16);
        let interrupt = CancellationToken::new();
        interrupt.cancel();

        let outcome = deliver(SynthesizedAudio::Buffer(vec![0; 8]), 16000, &interrupt, &tx)
            .await
            .unwrap();

        assert_eq!(outcome, DeliveryOutcome::Skipped);
        assert!(!outcome.opened_stream());
        assert!(drain(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn interrupt_mid_stream_stops_before_next_chunk() {
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (pcm_tx, pcm_rx) = mpsc::channel::<Result<Vec<u8>>>(4);
        let interrupt = CancellationToken::new();

        let audio = SynthesizedAudio::Stream(ReceiverStream::new(pcm_rx).boxed());
        let token = interrupt.clone();
        let task = tokio::spawn(async move { deliver(audio, 24000, &token, &out_tx).await });

        pcm_tx.send(Ok(vec![1, 1])).await.unwrap();
        assert_eq!(
            out_rx.recv().await.unwrap(),
            Outbound::from(WsOutgoing::begin_stream(24000))
        );
        assert_eq!(out_rx.recv().await.unwrap(), Outbound::Audio(vec![1, 1]));

        interrupt.cancel();
        pcm_tx.send(Ok(vec![2, 2])).await.unwrap();
        drop(pcm_tx);

        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, DeliveryOutcome::Interrupted { chunks: 1 });
        assert!(outcome.opened_stream());
        assert_eq!(
            drain(&mut out_rx),
            vec![Outbound::from(WsOutgoing::stop_stream())]
        );
    }

    #[tokio::test]
    async fn synthesis_error_still_stops_stream() {
        let (tx, mut rx) = mpsc::channel(16);
        let chunks: Vec<Result<Vec<u8>>> = vec![
            Ok(vec![1, 1]),
            Err(Error::Synthesis("engine crashed".to_string())),
        ];
        let audio = SynthesizedAudio::Stream(futures::stream::iter(chunks).boxed());

        let result = deliver(audio, 24000, &CancellationToken::new(), &tx).await;

        assert!(matches!(result, Err(Error::Synthesis(_))));
        let items = drain(&mut rx);
        assert_eq!(items.last(), Some(&Outbound::from(WsOutgoing::stop_stream())));
    }

    #[tokio::test]
    async fn closed_channel_is_an_error() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let result = deliver(
            SynthesizedAudio::Buffer(vec![0; 8]),
            16000,
            &CancellationToken::new(),
            &tx,
        )
        .await;
        assert!(matches!(result, Err(Error::Channel(_))));
    }
}
