pub mod cache;
pub mod coordinator;
pub mod events;
pub mod http;
pub mod scripture;
pub mod worker;

pub use coordinator::{CoordinatorEvent, CoordinatorSettings, TranslationCoordinator};
pub use events::{ScriptureEvent, TranslationEvent};
pub use http::{HttpGrammarCorrector, HttpRecoveryTranscriber, HttpTranslator};
pub use worker::{
    GrammarCorrector, RecoveryTranscriber, TranslateError, TranslationRequest, Translator,
};
