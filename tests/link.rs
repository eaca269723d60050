//! Upstream transcription link lifecycle tests

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use cadence_gateway::voice::{ReconnectPolicy, TranscriptEvent, TranscriptSink, UpstreamLink};

mod common;
use common::{ScriptedTranscription, settle};

/// Sink collecting transcript text
fn collecting_sink() -> (TranscriptSink, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let store = Arc::clone(&seen);
    let sink: TranscriptSink = Arc::new(move |event: TranscriptEvent| {
        store.lock().unwrap().push(event.text);
    });
    (sink, seen)
}

async fn wait_until(mut done: impl FnMut() -> bool) {
    for _ in 0..200 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn transcripts_reach_the_sink() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, seen) = collecting_sink();

    assert_ok!(link.connect(sink).await);
    assert!(link.is_connected());

    stt.transcript("good morning", true, true).await;
    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec!["good morning".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn audio_is_dropped_while_disconnected() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());

    link.send_audio(vec![0u8; 100]).await;
    assert_eq!(stt.audio_bytes(), 0);

    let (sink, _) = collecting_sink();
    assert_ok!(link.connect(sink).await);
    link.send_audio(vec![0u8; 100]).await;
    assert_eq!(stt.audio_bytes(), 100);
}

#[tokio::test(start_paused = true)]
async fn connect_reuses_a_live_session() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());

    let (sink, _) = collecting_sink();
    link.connect(sink.clone()).await.unwrap();
    assert_ok!(link.connect(sink).await);
    assert_eq!(stt.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn unexpected_close_reconnects_with_the_same_sink() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, seen) = collecting_sink();
    assert_ok!(link.connect(sink).await);

    stt.drop_session().await;
    wait_until(|| stt.connects() == 2 && link.is_connected()).await;
    assert!(!link.is_reconnecting());
    assert_eq!(link.retry_count(), 0);

    stt.transcript("still here", true, false).await;
    settle().await;
    assert_eq!(*seen.lock().unwrap(), vec!["still here".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn reconnect_gives_up_after_max_retries() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, _) = collecting_sink();
    assert_ok!(link.connect(sink).await);

    stt.fail_next(usize::MAX);
    let dropped_at = tokio::time::Instant::now();
    stt.drop_session().await;

    settle().await;
    assert!(link.is_reconnecting());
    wait_until(|| !link.is_reconnecting()).await;

    // One initial connect plus three attempts at 0s, 2s and 2s + 4s
    assert_eq!(stt.connects(), 4);
    assert_eq!(link.retry_count(), 3);
    assert!(!link.is_connected());
    assert!(dropped_at.elapsed() >= Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn reconnect_recovers_on_a_later_attempt() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, _) = collecting_sink();
    assert_ok!(link.connect(sink).await);

    stt.fail_next(1);
    stt.drop_session().await;
    wait_until(|| link.is_connected()).await;

    assert_eq!(stt.connects(), 3);
    assert_eq!(link.retry_count(), 0);
    assert!(!link.is_reconnecting());
}

#[tokio::test(start_paused = true)]
async fn overlapping_reconnect_requests_are_coalesced() {
    let stt = ScriptedTranscription::slow(Duration::from_millis(500));
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, _) = collecting_sink();
    link.connect(sink.clone()).await.unwrap();

    stt.drop_session().await;
    settle().await;
    assert!(link.is_reconnecting());
    assert!(!link.trigger_reconnect());

    // A start racing the reconnect must not open a second session
    assert_ok!(link.connect(sink).await);

    wait_until(|| link.is_connected() && !link.is_reconnecting()).await;
    assert_eq!(stt.connects(), 2);
    assert_eq!(stt.max_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn manual_close_does_not_reconnect() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, _) = collecting_sink();
    assert_ok!(link.connect(sink).await);

    link.close().await;
    assert!(link.is_manually_closed());
    assert!(!link.is_connected());
    assert_eq!(stt.closes(), 1);

    // The provider acknowledges the close
    stt.drop_session().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(stt.connects(), 1);
    assert!(!link.is_reconnecting());
}

#[tokio::test(start_paused = true)]
async fn close_during_reconnect_handshake_discards_the_new_session() {
    let stt = ScriptedTranscription::slow(Duration::from_millis(500));
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, seen) = collecting_sink();
    assert_ok!(link.connect(sink).await);

    stt.drop_session().await;
    settle().await;
    assert!(link.is_reconnecting());

    link.close().await;
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(!link.is_connected());
    assert!(!link.is_reconnecting());
    assert_eq!(stt.connects(), 2);
    assert_eq!(stt.closes(), 1);

    // Nothing pumps the discarded session
    assert!(!stt.transcript("late", true, true).await);
    assert!(seen.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn connect_after_close_clears_the_manual_flag() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, _) = collecting_sink();
    link.connect(sink.clone()).await.unwrap();
    link.close().await;

    assert_ok!(link.connect(sink).await);
    assert!(!link.is_manually_closed());
    assert!(link.is_connected());
    assert_eq!(stt.connects(), 2);
}

#[tokio::test(start_paused = true)]
async fn keepalive_ticks_until_stopped() {
    let stt = ScriptedTranscription::new();
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, _) = collecting_sink();
    assert_ok!(link.connect(sink).await);

    link.start_keepalive(Duration::from_secs(2)).await;
    tokio::time::sleep(Duration::from_millis(6500)).await;
    assert_eq!(stt.keepalives(), 3);

    link.stop_keepalive().await;
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(stt.keepalives(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_initial_connect_is_reported() {
    let stt = ScriptedTranscription::failing(1);
    let link = UpstreamLink::new(stt.clone(), ReconnectPolicy::default());
    let (sink, _) = collecting_sink();

    let err = assert_err!(link.connect(sink).await);
    assert!(matches!(err, cadence_gateway::Error::Connect(_)));
    assert!(!link.is_connected());
    assert!(!link.is_reconnecting());
}
