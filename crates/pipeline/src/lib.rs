pub mod config;
pub mod driver;
pub mod finalize;
pub mod forced;
pub mod gate;
pub mod partials;
pub mod recognizer;
pub mod segment;
pub mod text;

pub use config::PipelineConfig;
pub use driver::{PipelineAction, PipelineDriver, PipelineInput};
pub use gate::FinalityGate;
pub use recognizer::{
    RecognizerAdapter, RecognizerError, RecognizerEvent, StreamEvent, StreamOptions,
    StreamingRecognizer,
};
pub use segment::{CandidateSource, CommitCandidate, CommittedUtterance, LastCommit, SegmentId};
