use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Duration, timeout};

use voxrelay_api::session::registry::{SessionHandle, SessionRegistry};
use voxrelay_api::session::{SessionDeps, SessionMsg, spawn_session};
use voxrelay_api::ws::messages::InitRequest;
use voxrelay_pipeline::PipelineConfig;
use voxrelay_pipeline::recognizer::{
    RecognizerError, StreamEvent, StreamOptions, StreamingRecognizer,
};
use voxrelay_translate::worker::{
    GrammarCorrector, RecoveryTranscriber, TranslateError, TranslationRequest, Translator,
};

/// Recognizer whose streams are driven entirely by the test: audio is
/// swallowed, results are injected by hand, and dropping the result side
/// simulates a voice-activity stream teardown.
pub struct ScriptedRecognizer {
    pub opened: AtomicUsize,
    results: Mutex<Option<mpsc::Sender<StreamEvent>>>,
}

impl ScriptedRecognizer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: AtomicUsize::new(0),
            results: Mutex::new(None),
        })
    }

    pub async fn emit_partial(&self, text: &str) {
        self.emit(StreamEvent::Result {
            text: text.to_string(),
            is_final: false,
        })
        .await;
    }

    pub async fn emit_final(&self, text: &str) {
        self.emit(StreamEvent::Result {
            text: text.to_string(),
            is_final: true,
        })
        .await;
    }

    pub async fn emit_error(&self, error: RecognizerError) {
        self.emit(StreamEvent::Error(error)).await;
    }

    /// Drops the current stream's result side; the adapter sees end-of-
    /// stream and runs its restart sequence.
    pub async fn break_stream(&self) {
        self.results.lock().await.take();
    }

    async fn emit(&self, event: StreamEvent) {
        let guard = self.results.lock().await;
        let tx = guard.as_ref().expect("no open recognizer stream");
        tx.send(event).await.expect("adapter receiver alive");
    }
}

#[async_trait]
impl StreamingRecognizer for ScriptedRecognizer {
    async fn start_stream(
        &self,
        _options: StreamOptions,
    ) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<StreamEvent>), RecognizerError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        let (audio_tx, mut audio_rx) = mpsc::channel::<Vec<u8>>(64);
        tokio::spawn(async move { while audio_rx.recv().await.is_some() {} });
        let (result_tx, result_rx) = mpsc::channel(64);
        *self.results.lock().await = Some(result_tx);
        Ok((audio_tx, result_rx))
    }

    fn supports_language(&self, lang: &str) -> bool {
        !lang.starts_with("xx")
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Translator that tags text with the target language, optionally failing
/// whole paths or individual targets.
pub struct TaggingTranslator {
    pub fail_partials: bool,
    pub fail_final_targets: Vec<String>,
}

impl TaggingTranslator {
    pub fn reliable() -> Arc<Self> {
        Arc::new(Self {
            fail_partials: false,
            fail_final_targets: vec![],
        })
    }
}

#[async_trait]
impl Translator for TaggingTranslator {
    async fn translate_partial(&self, req: TranslationRequest) -> Result<String, TranslateError> {
        if self.fail_partials {
            return Err(TranslateError::Timeout);
        }
        Ok(format!("[{}] {}", req.target_lang, req.text))
    }

    async fn translate_final(&self, req: TranslationRequest) -> Result<String, TranslateError> {
        if self.fail_final_targets.contains(&req.target_lang) {
            return Err(TranslateError::Timeout);
        }
        Ok(format!("[{}] {}", req.target_lang, req.text))
    }
}

/// Grammar corrector that returns a fixed correction after a delay.
pub struct ScriptedGrammar {
    pub corrected: String,
    pub delay: Duration,
}

#[async_trait]
impl GrammarCorrector for ScriptedGrammar {
    async fn correct_partial(&self, _text: &str) -> Result<String, TranslateError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.corrected.clone())
    }

    async fn correct_final(&self, text: &str) -> Result<String, TranslateError> {
        Ok(text.to_string())
    }
}

/// Recovery transcriber returning a scripted transcript after a delay.
pub struct ScriptedRecovery {
    pub text: String,
    pub delay: Duration,
}

#[async_trait]
impl RecoveryTranscriber for ScriptedRecovery {
    async fn transcribe(&self, _pcm: Vec<u8>, _language: &str) -> Result<String, TranslateError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.text.clone())
    }
}

/// A running session plus the host's outbound queue.
pub struct TestSession {
    pub handle: SessionHandle,
    pub host_rx: mpsc::Receiver<String>,
    pub registry: Arc<SessionRegistry>,
    pub recognizer: Arc<ScriptedRecognizer>,
}

pub struct TestSessionBuilder {
    pub init: InitRequest,
    pub translator: Option<Arc<dyn Translator>>,
    pub grammar: Option<Arc<dyn GrammarCorrector>>,
    pub recovery: Option<Arc<dyn RecoveryTranscriber>>,
}

impl TestSessionBuilder {
    pub fn english() -> Self {
        Self {
            init: init_request("en-US", None),
            translator: Some(TaggingTranslator::reliable() as Arc<dyn Translator>),
            grammar: None,
            recovery: None,
        }
    }

    pub async fn start(self) -> TestSession {
        let recognizer = ScriptedRecognizer::new();
        let registry = Arc::new(SessionRegistry::new());
        let (host_tx, host_rx) = mpsc::channel(256);

        let deps = SessionDeps {
            recognizer: recognizer.clone(),
            translator: self.translator,
            grammar: self.grammar,
            recovery: self.recovery,
            pipeline: PipelineConfig::default(),
            fallback_to_english: false,
            phrase_set_id: None,
            project_id: None,
            detect_scripture: false,
        };

        let handle = spawn_session(
            "test-session".to_string(),
            self.init,
            deps,
            host_tx,
            registry.clone(),
        )
        .await
        .expect("session spawns");

        TestSession {
            handle,
            host_rx,
            registry,
            recognizer,
        }
    }
}

impl TestSession {
    /// Feeds a few audio chunks through the jitter gate so the rolling
    /// buffer has content for recovery, waiting out the release window.
    pub async fn feed_audio(&self, chunks: usize) {
        use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
        let data = BASE64.encode(vec![0u8; 960]);
        for _ in 0..chunks {
            self.handle
                .cmd_tx
                .send(SessionMsg::Audio { data: data.clone() })
                .await
                .expect("session alive");
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
    }

    /// Attaches a listener for a target language and returns its queue.
    pub async fn add_listener(&self, lang: &str) -> mpsc::Receiver<String> {
        let (tx, mut rx) = mpsc::channel(256);
        self.handle
            .cmd_tx
            .send(SessionMsg::ListenerJoin {
                connection_id: format!("listener-{lang}"),
                target_lang: lang.to_string(),
                tx,
            })
            .await
            .expect("session alive");
        // Swallow the session_joined greeting.
        let joined = next_json(&mut rx).await;
        assert_eq!(joined["type"], "session_joined");
        rx
    }

    pub async fn shutdown(self) {
        let _ = self.handle.cmd_tx.send(SessionMsg::Shutdown).await;
    }
}

pub fn init_request(source: &str, target: Option<&str>) -> InitRequest {
    InitRequest {
        source_lang: source.to_string(),
        target_lang: target.map(str::to_string),
        tier: None,
        mode: None,
        enable_multi_language: None,
        alternative_language_codes: None,
        enable_speaker_diarization: None,
        min_speakers: None,
        max_speakers: None,
    }
}

/// Next JSON message from a queue, with a generous budget (paused-time
/// tests auto-advance through pipeline waits).
pub async fn next_json(rx: &mut mpsc::Receiver<String>) -> serde_json::Value {
    let raw = timeout(Duration::from_secs(60), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed");
    serde_json::from_str(&raw).expect("valid JSON")
}

/// Drains messages until one matches `predicate`, returning it.
pub async fn next_matching(
    rx: &mut mpsc::Receiver<String>,
    predicate: impl Fn(&serde_json::Value) -> bool,
) -> serde_json::Value {
    for _ in 0..256 {
        let value = next_json(rx).await;
        if predicate(&value) {
            return value;
        }
    }
    panic!("no matching message within 256 messages");
}

/// Collects every final `translation` event currently reachable within
/// `budget`, by draining until the queue stays silent.
pub async fn collect_finals(
    rx: &mut mpsc::Receiver<String>,
    budget: Duration,
) -> Vec<serde_json::Value> {
    let mut finals = Vec::new();
    loop {
        match timeout(budget, rx.recv()).await {
            Ok(Some(raw)) => {
                let value: serde_json::Value =
                    serde_json::from_str(&raw).expect("valid JSON");
                if value["type"] == "translation" && value["isPartial"] == false {
                    finals.push(value);
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    finals
}
