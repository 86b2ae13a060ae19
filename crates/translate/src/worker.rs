use async_trait::async_trait;
use thiserror::Error;

/// Failures from the external LLM workers, classified by how the
/// coordinator recovers.
#[derive(Debug, Clone, Error)]
pub enum TranslateError {
    #[error("worker timed out")]
    Timeout,
    /// Rate limit or active-response conflict: drop the individual call;
    /// the next threshold crossing issues a new one.
    #[error("worker rate limited")]
    RateLimited,
    #[error("active response conflict")]
    Conflict,
    #[error("worker call failed: {0}")]
    Http(String),
    #[error("translation disabled")]
    Disabled,
    #[error("call superseded by a newer partial")]
    Cancelled,
}

/// A single translation request.
#[derive(Debug, Clone)]
pub struct TranslationRequest {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
}

/// External translation worker pair: a low-latency path for incomplete
/// text and a higher-quality path for committed finals.
#[async_trait]
pub trait Translator: Send + Sync + 'static {
    /// Low-latency worker intended for incomplete text. Deterministic
    /// temperature, bounded output.
    async fn translate_partial(&self, req: TranslationRequest) -> Result<String, TranslateError>;

    /// Higher-quality worker for committed, grammar-corrected text.
    async fn translate_final(&self, req: TranslationRequest) -> Result<String, TranslateError>;
}

/// Grammar correction worker. Only invoked for English source text; every
/// failure falls back to the original.
#[async_trait]
pub trait GrammarCorrector: Send + Sync + 'static {
    async fn correct_partial(&self, text: &str) -> Result<String, TranslateError>;

    async fn correct_final(&self, text: &str) -> Result<String, TranslateError>;
}

/// Post-hoc recovery worker: re-transcribes the rolling audio buffer after
/// a forced restart truncated an utterance.
#[async_trait]
pub trait RecoveryTranscriber: Send + Sync + 'static {
    async fn transcribe(&self, pcm: Vec<u8>, language: &str) -> Result<String, TranslateError>;
}
