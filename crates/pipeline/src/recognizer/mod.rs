pub mod adapter;
pub mod jitter;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

pub use adapter::RecognizerAdapter;

/// Errors produced by the external streaming recognizer, classified by how
/// the adapter must react.
#[derive(Debug, Clone, Error)]
pub enum RecognizerError {
    /// Connection reset, UNAVAILABLE, request timeout: handled inside the
    /// adapter by a stream restart, never surfaced to the caller.
    #[error("transient recognizer failure: {0}")]
    Transient(String),

    /// The enhanced model or speech-adaptation resources were rejected for
    /// this language; the adapter downgrades transparently and restarts.
    #[error("recognizer configuration rejected: {0:?}")]
    Config(ConfigProblem),

    /// Unsupported audio encoding or authentication failure: surfaced to
    /// the host, the session terminates.
    #[error("fatal recognizer failure: {0}")]
    Fatal(String),

    /// The requested source language is not recognizer-supported.
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigProblem {
    /// INVALID_ARGUMENT with an adaptation-specific message.
    EnhancedModelUnavailable,
    PhraseSetRejected,
}

impl RecognizerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, RecognizerError::Transient(_))
    }
}

/// One raw recognition result from the external stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Result { text: String, is_final: bool },
    Error(RecognizerError),
}

/// Options passed to the external recognizer when a stream opens.
#[derive(Debug, Clone)]
pub struct StreamOptions {
    pub language: String,
    pub sample_rate_hz: u32,
    pub interim_results: bool,
    /// Prefer the enhanced model; dropped after the first rejection.
    pub enhanced_model: bool,
    /// Speech-adaptation phrase set; dropped after the first rejection.
    pub phrase_set_id: Option<String>,
    pub project_id: Option<String>,
    pub alternative_languages: Vec<String>,
    pub diarization: Option<DiarizationOptions>,
}

#[derive(Debug, Clone)]
pub struct DiarizationOptions {
    pub min_speakers: u32,
    pub max_speakers: u32,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            language: "en-US".to_string(),
            sample_rate_hz: 24_000,
            interim_results: true,
            enhanced_model: true,
            phrase_set_id: None,
            project_id: None,
            alternative_languages: Vec::new(),
            diarization: None,
        }
    }
}

/// The external stream recognizer client: a byte sink that yields labeled
/// transcript fragments. Implementations wrap the vendor SDK; tests use a
/// scripted mock.
#[async_trait]
pub trait StreamingRecognizer: Send + Sync + 'static {
    /// Opens a streaming recognition session. Audio goes in through the
    /// returned sender; results come back on the receiver. Dropping the
    /// sender ends the stream.
    async fn start_stream(
        &self,
        options: StreamOptions,
    ) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<StreamEvent>), RecognizerError>;

    fn supports_language(&self, lang: &str) -> bool;

    fn name(&self) -> &str;
}

/// Events the adapter delivers to the session, in order.
#[derive(Debug, Clone)]
pub enum RecognizerEvent {
    Partial(String),
    Final(String),
    /// Synthesized by the adapter itself: the stream had to restart with an
    /// unacknowledged partial outstanding.
    Forced(String),
    /// Degradations the host should know about (model downgrade recurring).
    Warning(String),
    /// The session cannot continue.
    Fatal(String),
}
