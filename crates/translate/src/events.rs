use serde::{Deserialize, Serialize};
use voxrelay_pipeline::SegmentId;

/// One outbound `translation` event for a single target language.
///
/// `seq_id` is stamped by the broadcaster at emission time; everything else
/// is filled by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub original_text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corrected_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translated_text: Option<String>,
    pub source_lang: String,
    pub target_lang: String,
    pub is_partial: bool,
    pub has_translation: bool,
    pub has_correction: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub translation_error: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub force_final: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update_type: Option<String>,
    pub seq_id: u64,
    /// Unix milliseconds.
    pub timestamp: i64,
    pub segment_id: SegmentId,
}

impl TranslationEvent {
    pub fn new(segment: SegmentId, original: &str, source_lang: &str, target_lang: &str) -> Self {
        Self {
            event_type: "translation".to_string(),
            original_text: original.to_string(),
            corrected_text: None,
            translated_text: None,
            source_lang: source_lang.to_string(),
            target_lang: target_lang.to_string(),
            is_partial: false,
            has_translation: false,
            has_correction: false,
            translation_error: None,
            force_final: None,
            update_type: None,
            seq_id: 0,
            timestamp: chrono::Utc::now().timestamp_millis(),
            segment_id: segment,
        }
    }
}

/// A detected scripture reference on committed source text.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptureEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub reference: ScriptureReference,
    pub display_text: String,
    pub confidence: f64,
    pub method: String,
    pub timestamp: i64,
    pub seq_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptureReference {
    pub book: String,
    pub chapter: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verse: Option<u32>,
}
