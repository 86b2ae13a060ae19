use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheKey, TranslationCache};
use crate::worker::{
    GrammarCorrector, RecoveryTranscriber, TranslateError, TranslationRequest, Translator,
};

/// Output-token ceiling for partial translations.
const PARTIAL_MAX_TOKENS: u32 = 16_384;
/// Partial-cache TTL.
const PARTIAL_CACHE_TTL: Duration = Duration::from_secs(120);
/// Final-cache TTL.
const FINAL_CACHE_TTL: Duration = Duration::from_secs(600);
/// Cache capacity per worker.
const CACHE_CAPACITY: usize = 200;
/// Grammar cache is intentionally tiny; corrections rarely repeat.
const GRAMMAR_CACHE_CAPACITY: usize = 20;

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: String,
}

/// LLM translation worker speaking an OpenAI-compatible chat API.
///
/// Two model tiers share one client: a low-latency model for partials and a
/// higher-quality one for finals, each with its own process-global cache.
pub struct HttpTranslator {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    partial_model: String,
    final_model: String,
    partial_cache: Arc<TranslationCache>,
    final_cache: Arc<TranslationCache>,
}

impl HttpTranslator {
    pub fn new(endpoint: &str, api_key: &str, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("reqwest client builds"),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            partial_model: "gpt-4o-mini".to_string(),
            final_model: "gpt-4o".to_string(),
            partial_cache: Arc::new(TranslationCache::new(CACHE_CAPACITY, PARTIAL_CACHE_TTL)),
            final_cache: Arc::new(TranslationCache::new(CACHE_CAPACITY, FINAL_CACHE_TTL)),
        }
    }

    pub fn with_models(mut self, partial_model: &str, final_model: &str) -> Self {
        self.partial_model = partial_model.to_string();
        self.final_model = final_model.to_string();
        self
    }

    async fn chat(
        &self,
        model: &str,
        system: &str,
        user: &str,
        max_tokens: Option<u32>,
    ) -> Result<String, TranslateError> {
        let mut body = json!({
            "model": model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        });
        if let Some(max) = max_tokens {
            body["max_tokens"] = json!(max);
        }

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslateError::Timeout
                } else {
                    TranslateError::Http(e.to_string())
                }
            })?;

        match response.status().as_u16() {
            200 => {}
            429 => return Err(TranslateError::RateLimited),
            409 => return Err(TranslateError::Conflict),
            status => {
                let detail = response.text().await.unwrap_or_default();
                return Err(TranslateError::Http(format!("status {status}: {detail}")));
            }
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Http(format!("undecodable response: {e}")))?;
        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| TranslateError::Http("empty choices".to_string()))
    }

    async fn translate(
        &self,
        req: &TranslationRequest,
        model: &str,
        cache: &TranslationCache,
        max_tokens: Option<u32>,
    ) -> Result<String, TranslateError> {
        let key = CacheKey::for_text(&req.source_lang, &req.target_lang, &req.text);
        if let Some(hit) = cache.get(&key) {
            debug!(target = %req.target_lang, "translation cache hit");
            return Ok(hit);
        }

        let system = format!(
            "You are a professional simultaneous interpreter. Translate the \
             user's text from {} to {}. Output only the translation, with no \
             commentary. Preserve incomplete trailing words as-is.",
            req.source_lang, req.target_lang
        );
        let translated = self.chat(model, &system, &req.text, max_tokens).await?;
        cache.insert(key, translated.clone());
        Ok(translated)
    }
}

#[async_trait]
impl Translator for HttpTranslator {
    async fn translate_partial(&self, req: TranslationRequest) -> Result<String, TranslateError> {
        self.translate(
            &req,
            &self.partial_model,
            &self.partial_cache,
            Some(PARTIAL_MAX_TOKENS),
        )
        .await
    }

    async fn translate_final(&self, req: TranslationRequest) -> Result<String, TranslateError> {
        self.translate(&req, &self.final_model, &self.final_cache, None)
            .await
    }
}

/// Grammar corrector over the same chat API. Callers enforce the 2 s
/// budget and fall back to the original text on any failure.
pub struct HttpGrammarCorrector {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    cache: Arc<TranslationCache>,
}

impl HttpGrammarCorrector {
    pub fn new(endpoint: &str, api_key: &str, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("reqwest client builds"),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: "gpt-4o-mini".to_string(),
            cache: Arc::new(TranslationCache::new(
                GRAMMAR_CACHE_CAPACITY,
                FINAL_CACHE_TTL,
            )),
        }
    }

    async fn correct(&self, text: &str, partial: bool) -> Result<String, TranslateError> {
        let key = CacheKey::for_text("en", "en-grammar", text);
        if let Some(hit) = self.cache.get(&key) {
            return Ok(hit);
        }

        let system = if partial {
            "Lightly fix grammar and punctuation of this live speech fragment. \
             Never complete unfinished thoughts. Output only the corrected text."
        } else {
            "Fix grammar, capitalization and punctuation of this transcribed \
             sentence. Keep the wording; output only the corrected text."
        };

        let body = json!({
            "model": self.model,
            "temperature": 0,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": text },
            ],
        });

        let response = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslateError::Timeout
                } else {
                    TranslateError::Http(e.to_string())
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(TranslateError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(TranslateError::Http(format!(
                "status {}",
                response.status()
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Http(format!("undecodable response: {e}")))?;
        let corrected = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or_else(|| TranslateError::Http("empty choices".to_string()))?;

        self.cache.insert(key, corrected.clone());
        Ok(corrected)
    }
}

/// Recovery worker: ships the rolling PCM ring to a transcription endpoint
/// to recover words a forced restart truncated.
pub struct HttpRecoveryTranscriber {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    model: String,
    sample_rate_hz: u32,
}

impl HttpRecoveryTranscriber {
    pub fn new(endpoint: &str, api_key: &str, request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(request_timeout)
                .build()
                .expect("reqwest client builds"),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: "whisper-1".to_string(),
            sample_rate_hz: 24_000,
        }
    }
}

/// Minimal RIFF/WAVE container around LINEAR16 mono PCM.
fn wrap_pcm_as_wav(pcm: &[u8], sample_rate_hz: u32) -> Vec<u8> {
    let byte_rate = sample_rate_hz * 2;
    let data_len = pcm.len() as u32;
    let mut wav = Vec::with_capacity(44 + pcm.len());
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_len).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&1u16.to_le_bytes()); // mono
    wav.extend_from_slice(&sample_rate_hz.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&2u16.to_le_bytes()); // block align
    wav.extend_from_slice(&16u16.to_le_bytes()); // bits per sample
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    wav.extend_from_slice(pcm);
    wav
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[async_trait]
impl RecoveryTranscriber for HttpRecoveryTranscriber {
    async fn transcribe(&self, pcm: Vec<u8>, language: &str) -> Result<String, TranslateError> {
        let wav = wrap_pcm_as_wav(&pcm, self.sample_rate_hz);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("recovery.wav")
            .mime_str("audio/wav")
            .map_err(|e| TranslateError::Http(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .text("model", self.model.clone())
            .text("language", language.split('-').next().unwrap_or("en").to_string())
            .part("file", part);

        let response = self
            .client
            .post(format!("{}/audio/transcriptions", self.endpoint))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    TranslateError::Timeout
                } else {
                    TranslateError::Http(e.to_string())
                }
            })?;

        if response.status().as_u16() == 429 {
            return Err(TranslateError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(TranslateError::Http(format!("status {}", response.status())));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| TranslateError::Http(format!("undecodable response: {e}")))?;
        Ok(parsed.text.trim().to_string())
    }
}

#[async_trait]
impl GrammarCorrector for HttpGrammarCorrector {
    async fn correct_partial(&self, text: &str) -> Result<String, TranslateError> {
        self.correct(text, true).await.map_err(|e| {
            warn!(%e, "partial grammar correction failed");
            e
        })
    }

    async fn correct_final(&self, text: &str) -> Result<String, TranslateError> {
        self.correct(text, false).await
    }
}
