use serde::{Deserialize, Serialize};

/// Hard limits on inbound payloads. Oversized or malformed input is
/// answered with a `VALIDATION_ERROR` and otherwise ignored.
pub const MAX_MESSAGE_BYTES: usize = 1024 * 1024;
/// 64 KiB of PCM, base64-expanded.
pub const MAX_AUDIO_B64_BYTES: usize = 64 * 1024 * 4 / 3 + 4;
pub const MAX_STRING_CHARS: usize = 10_000;
pub const MAX_ALTERNATIVE_LANGUAGES: usize = 3;

pub mod error_codes {
    pub const AUTH_FAILED: &str = "AUTH_FAILED";
    pub const RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
    pub const VALIDATION_ERROR: &str = "VALIDATION_ERROR";
    pub const INTERNAL_ERROR: &str = "INTERNAL_ERROR";
}

/// WebSocket close code used for auth or rate-limit denial.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// Messages a client may send over the duplex connection.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Init(InitRequest),
    Audio(AudioMessage),
    /// Hint only; the pipeline keeps running until the recognizer emits
    /// naturally.
    AudioEnd,
    Ping,
    Pong,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    pub source_lang: String,
    pub target_lang: Option<String>,
    pub tier: Option<String>,
    /// "solo" collapses host and listener into this one connection.
    pub mode: Option<String>,
    pub enable_multi_language: Option<bool>,
    pub alternative_language_codes: Option<Vec<String>>,
    pub enable_speaker_diarization: Option<bool>,
    pub min_speakers: Option<u32>,
    pub max_speakers: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioMessage {
    /// Base64 PCM LINEAR16, default 24 kHz.
    pub data: String,
    pub chunk_index: Option<u64>,
    pub client_timestamp: Option<u64>,
}

/// Control-plane messages sent to clients.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    Info {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        connection_id: Option<String>,
    },
    Warning {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after: Option<u64>,
    },
    SessionReady {
        session_id: String,
        connection_id: String,
        source_lang: String,
    },
    SessionJoined {
        session_id: String,
        connection_id: String,
        target_lang: String,
    },
    SessionStats {
        session_id: String,
        listener_count: usize,
        languages: Vec<String>,
        committed_finals: u64,
        uptime_ms: u64,
    },
}

impl ControlMessage {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Patterns never allowed through in client-supplied strings.
const DANGEROUS_PATTERNS: [&str; 6] = [
    "<script",
    "</script",
    "javascript:",
    "onerror=",
    "onload=",
    "<iframe",
];

/// Byte index of an ASCII-case-insensitive needle. ASCII needles cannot
/// match starting inside a multi-byte character, so the index is always a
/// char boundary.
fn find_ascii_ci(haystack: &str, needle: &str) -> Option<usize> {
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle.as_bytes()))
}

/// Strips dangerous HTML patterns and enforces the string limit.
pub fn sanitize_text(input: &str) -> String {
    let mut text: String = input.chars().take(MAX_STRING_CHARS).collect();
    for pattern in DANGEROUS_PATTERNS {
        let mut cleaned = String::with_capacity(text.len());
        let mut rest = text.as_str();
        while let Some(idx) = find_ascii_ci(rest, pattern) {
            cleaned.push_str(&rest[..idx]);
            rest = &rest[idx + pattern.len()..];
        }
        cleaned.push_str(rest);
        text = cleaned;
    }
    text
}

/// BCP-47-ish language tags only; anything else is rejected up front.
pub fn valid_lang_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag.len() <= 16
        && tag.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
}

#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("audio payload exceeds 64 KiB")]
    AudioTooLarge,
    #[error("invalid language tag: {0}")]
    BadLanguage(String),
    #[error("too many alternative language codes")]
    TooManyAlternatives,
}

pub fn validate_init(init: &InitRequest) -> Result<(), ValidationError> {
    if !valid_lang_tag(&init.source_lang) {
        return Err(ValidationError::BadLanguage(init.source_lang.clone()));
    }
    if let Some(target) = &init.target_lang
        && !valid_lang_tag(target)
    {
        return Err(ValidationError::BadLanguage(target.clone()));
    }
    if let Some(alts) = &init.alternative_language_codes {
        if alts.len() > MAX_ALTERNATIVE_LANGUAGES {
            return Err(ValidationError::TooManyAlternatives);
        }
        for alt in alts {
            if !valid_lang_tag(alt) {
                return Err(ValidationError::BadLanguage(alt.clone()));
            }
        }
    }
    Ok(())
}

pub fn validate_audio(msg: &AudioMessage) -> Result<(), ValidationError> {
    if msg.data.len() > MAX_AUDIO_B64_BYTES {
        return Err(ValidationError::AudioTooLarge);
    }
    Ok(())
}
