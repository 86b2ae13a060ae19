use async_trait::async_trait;
use tokio::sync::mpsc;

use voxrelay_pipeline::recognizer::{
    RecognizerError, StreamEvent, StreamOptions, StreamingRecognizer,
};

/// Stand-in for the external streaming recognizer client.
///
/// The real vendor SDK (gRPC or WebSocket) plugs in behind
/// [`StreamingRecognizer`]; until one is wired up, sessions fail fast with
/// a clear configuration error instead of hanging.
pub struct UnconfiguredRecognizer;

#[async_trait]
impl StreamingRecognizer for UnconfiguredRecognizer {
    async fn start_stream(
        &self,
        _options: StreamOptions,
    ) -> Result<(mpsc::Sender<Vec<u8>>, mpsc::Receiver<StreamEvent>), RecognizerError> {
        Err(RecognizerError::Fatal(
            "no streaming recognizer client configured (set RECOGNIZER_CREDENTIALS and wire a \
             vendor client)"
                .to_string(),
        ))
    }

    fn supports_language(&self, _lang: &str) -> bool {
        true
    }

    fn name(&self) -> &str {
        "unconfigured"
    }
}
