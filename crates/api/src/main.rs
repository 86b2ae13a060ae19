use std::sync::Arc;

use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voxrelay_api::recognizer::UnconfiguredRecognizer;
use voxrelay_api::session::registry::SessionRegistry;
use voxrelay_api::state::AppState;
use voxrelay_config::Settings;
use voxrelay_pipeline::PipelineConfig;
use voxrelay_translate::http::HttpRecoveryTranscriber;
use voxrelay_translate::{
    GrammarCorrector, HttpGrammarCorrector, HttpTranslator, RecoveryTranscriber, Translator,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = Arc::new(Settings::load()?);

    let (translator, grammar, recovery) = match &settings.translator.api_key {
        Some(key) => {
            let timeout = Duration::from_millis(settings.translator.request_timeout_ms);
            let endpoint = settings.translator.endpoint.clone();
            let translator: Arc<dyn Translator> =
                Arc::new(HttpTranslator::new(&endpoint, key, timeout));
            let grammar: Arc<dyn GrammarCorrector> =
                Arc::new(HttpGrammarCorrector::new(&endpoint, key, timeout));
            let recovery: Arc<dyn RecoveryTranscriber> =
                Arc::new(HttpRecoveryTranscriber::new(&endpoint, key, timeout));
            (Some(translator), Some(grammar), Some(recovery))
        }
        None => {
            warn!("TRANSLATOR_API_KEY not set; translation disabled, source text passes through");
            (None, None, None)
        }
    };

    if settings.recognizer.credentials.is_none() {
        warn!("RECOGNIZER_CREDENTIALS not set; sessions will fail until a recognizer is wired");
    }

    let state = AppState {
        settings: settings.clone(),
        registry: Arc::new(SessionRegistry::new()),
        recognizer: Arc::new(UnconfiguredRecognizer),
        translator,
        grammar,
        recovery,
        pipeline: PipelineConfig::default(),
    };

    let router = voxrelay_api::build_router(state);
    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "voxrelay listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    Ok(())
}
