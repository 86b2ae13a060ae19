//! Adapter behavior under recognizer stalls and restarts, driven with a
//! scripted mock recognizer and paused time.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, timeout};

use voxrelay_pipeline::recognizer::adapter::RecognizerAdapter;
use voxrelay_pipeline::recognizer::{
    RecognizerError, RecognizerEvent, StreamEvent, StreamOptions, StreamingRecognizer,
};
use voxrelay_pipeline::PipelineConfig;

/// A recognizer whose streams swallow audio and say nothing unless the test
/// feeds results in by hand.
struct SilentRecognizer {
    streams_opened: AtomicUsize,
    /// Result-injection handle for the most recently opened stream.
    current_results: Mutex<Option<mpsc::Sender<StreamEvent>>>,
}

impl SilentRecognizer {
    fn new() -> Self {
        Self {
            streams_opened: AtomicUsize::new(0),
            current_results: Mutex::new(None),
        }
    }
}

#[async_trait]
impl StreamingRecognizer for SilentRecognizer {
    async fn start_stream(
        &self,
        _options: StreamOptions,
    ) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<StreamEvent>), RecognizerError> {
        self.streams_opened.fetch_add(1, Ordering::SeqCst);
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        // Swallow audio so writes never block.
        tokio::spawn(async move { while audio_rx.recv().await.is_some() {} });
        let (result_tx, result_rx) = mpsc::channel(64);
        *self.current_results.lock().await = Some(result_tx);
        Ok((audio_tx, result_rx))
    }

    fn supports_language(&self, lang: &str) -> bool {
        lang.starts_with("en")
    }

    fn name(&self) -> &str {
        "silent-mock"
    }
}

fn chunk() -> String {
    BASE64.encode(vec![0u8; 960])
}

async fn recv_event(events: &mut mpsc::Receiver<RecognizerEvent>) -> RecognizerEvent {
    timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for adapter event")
        .expect("adapter closed its event channel")
}

#[tokio::test(start_paused = true)]
async fn timeout_burst_restarts_stream_exactly_once() {
    let recognizer = Arc::new(SilentRecognizer::new());
    let (events_tx, mut events_rx) = mpsc::channel(64);

    let adapter = RecognizerAdapter::initialize(
        recognizer.clone(),
        PipelineConfig::default(),
        StreamOptions {
            language: "en-US".to_string(),
            ..StreamOptions::default()
        },
        false,
        events_tx,
    )
    .await
    .expect("adapter initializes");

    // Seven chunks within two seconds, none ever acknowledged.
    for _ in 0..7 {
        adapter.process_audio(&chunk()).await.expect("audio accepted");
        tokio::time::advance(Duration::from_millis(250)).await;
    }

    // Feed one partial so a forced flush has something to carry, then let
    // every chunk watchdog expire.
    {
        let results = recognizer.current_results.lock().await;
        results
            .as_ref()
            .expect("stream open")
            .send(StreamEvent::Result {
                text: "and you know".to_string(),
                is_final: false,
            })
            .await
            .expect("inject partial");
    }
    let event = recv_event(&mut events_rx).await;
    assert!(matches!(event, RecognizerEvent::Partial(ref t) if t == "and you know"));

    tokio::time::advance(Duration::from_millis(8000)).await;

    // The burst restart flushes the unacknowledged partial as Forced.
    let event = recv_event(&mut events_rx).await;
    match event {
        RecognizerEvent::Forced(text) => assert_eq!(text, "and you know"),
        other => panic!("expected forced flush, got {other:?}"),
    }

    // Give the restart a moment to settle, then count streams: the initial
    // one plus exactly one restart.
    tokio::time::advance(Duration::from_millis(2000)).await;
    assert_eq!(recognizer.streams_opened.load(Ordering::SeqCst), 2);

    adapter.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn final_result_is_forwarded_in_order() {
    let recognizer = Arc::new(SilentRecognizer::new());
    let (events_tx, mut events_rx) = mpsc::channel(64);

    let adapter = RecognizerAdapter::initialize(
        recognizer.clone(),
        PipelineConfig::default(),
        StreamOptions::default(),
        false,
        events_tx,
    )
    .await
    .expect("adapter initializes");

    adapter.process_audio(&chunk()).await.expect("audio accepted");
    tokio::time::advance(Duration::from_millis(150)).await;

    {
        let results = recognizer.current_results.lock().await;
        let tx = results.as_ref().expect("stream open");
        tx.send(StreamEvent::Result {
            text: "where two".to_string(),
            is_final: false,
        })
        .await
        .expect("inject partial");
        tx.send(StreamEvent::Result {
            text: "where two or three are.".to_string(),
            is_final: true,
        })
        .await
        .expect("inject final");
    }

    assert!(matches!(
        recv_event(&mut events_rx).await,
        RecognizerEvent::Partial(ref t) if t == "where two"
    ));
    assert!(matches!(
        recv_event(&mut events_rx).await,
        RecognizerEvent::Final(ref t) if t == "where two or three are."
    ));

    adapter.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn unsupported_language_is_rejected_without_fallback() {
    let recognizer = Arc::new(SilentRecognizer::new());
    let (events_tx, _events_rx) = mpsc::channel(8);

    let result = RecognizerAdapter::initialize(
        recognizer,
        PipelineConfig::default(),
        StreamOptions {
            language: "xx-XX".to_string(),
            ..StreamOptions::default()
        },
        false,
        events_tx,
    )
    .await;

    assert!(matches!(
        result.err(),
        Some(RecognizerError::UnsupportedLanguage(lang)) if lang == "xx-XX"
    ));
}

#[tokio::test(start_paused = true)]
async fn unsupported_language_falls_back_to_english_with_warning() {
    let recognizer = Arc::new(SilentRecognizer::new());
    let (events_tx, mut events_rx) = mpsc::channel(8);

    let _adapter = RecognizerAdapter::initialize(
        recognizer,
        PipelineConfig::default(),
        StreamOptions {
            language: "xx-XX".to_string(),
            ..StreamOptions::default()
        },
        true,
        events_tx,
    )
    .await
    .expect("fallback succeeds");

    assert!(matches!(
        recv_event(&mut events_rx).await,
        RecognizerEvent::Warning(_)
    ));
}
