use std::sync::Arc;

use voxrelay_config::Settings;
use voxrelay_pipeline::{PipelineConfig, StreamingRecognizer};
use voxrelay_translate::{GrammarCorrector, RecoveryTranscriber, Translator};

use crate::session::SessionDeps;
use crate::session::registry::SessionRegistry;

/// Shared application state; cheap to clone into every handler.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<SessionRegistry>,
    pub recognizer: Arc<dyn StreamingRecognizer>,
    pub translator: Option<Arc<dyn Translator>>,
    pub grammar: Option<Arc<dyn GrammarCorrector>>,
    pub recovery: Option<Arc<dyn RecoveryTranscriber>>,
    pub pipeline: PipelineConfig,
}

impl AppState {
    /// Bundles the per-session collaborator set.
    pub fn session_deps(&self) -> SessionDeps {
        SessionDeps {
            recognizer: self.recognizer.clone(),
            translator: self.translator.clone(),
            grammar: self.grammar.clone(),
            recovery: self.recovery.clone(),
            pipeline: self.pipeline.clone(),
            fallback_to_english: self.settings.recognizer.fallback_to_english,
            phrase_set_id: self.settings.recognizer.phrase_set_id.clone(),
            project_id: self.settings.recognizer.project_id.clone(),
            detect_scripture: self.settings.translator.detect_scripture,
        }
    }
}
