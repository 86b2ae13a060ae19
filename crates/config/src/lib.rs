use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

/// Top-level settings, merged from defaults, an optional `config.toml`
/// and `VOXRELAY_`-prefixed environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerSettings,
    pub auth: AuthSettings,
    pub recognizer: RecognizerSettings,
    pub translator: TranslatorSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Allow any origin on the WS/HTTP ingress (dev convenience).
    pub cors_allow_any: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthSettings {
    /// Comma-separated in the environment (`SESSION_WS_API_KEYS`); an empty
    /// list disables the key check entirely.
    pub ws_api_keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecognizerSettings {
    /// API key or service-account JSON path for the streaming recognizer.
    pub credentials: Option<String>,
    /// Optional speech-adaptation phrase set.
    pub phrase_set_id: Option<String>,
    pub project_id: Option<String>,
    /// Fall back to English (with a host-visible warning) instead of failing
    /// when the requested source language is not recognizer-supported.
    pub fallback_to_english: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TranslatorSettings {
    /// Absent key disables translation: events go out with the source text
    /// and `hasTranslation=false`.
    pub api_key: Option<String>,
    pub endpoint: String,
    pub request_timeout_ms: u64,
    /// Enable scripture-reference detection on committed source text.
    pub detect_scripture: bool,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("server.cors_allow_any", true)?
            .set_default("auth.ws_api_keys", Vec::<String>::new())?
            .set_default("recognizer.fallback_to_english", true)?
            .set_default("translator.endpoint", "https://api.openai.com/v1")?
            .set_default("translator.request_timeout_ms", 8000)?
            .set_default("translator.detect_scripture", false)?
            .add_source(File::with_name("config").required(false))
            .add_source(
                Environment::with_prefix("VOXRELAY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("auth.ws_api_keys")
                    .try_parsing(true),
            );

        // Legacy flat variables from the deployment contract take precedence
        // over the prefixed form when both are present.
        let mut builder = builder;
        if let Ok(v) = std::env::var("RECOGNIZER_CREDENTIALS") {
            builder = builder.set_override("recognizer.credentials", v)?;
        }
        if let Ok(v) = std::env::var("PHRASE_SET_ID") {
            builder = builder.set_override("recognizer.phrase_set_id", v)?;
        }
        if let Ok(v) = std::env::var("PROJECT_ID") {
            builder = builder.set_override("recognizer.project_id", v)?;
        }
        if let Ok(v) = std::env::var("TRANSLATOR_API_KEY") {
            builder = builder.set_override("translator.api_key", v)?;
        }
        if let Ok(v) = std::env::var("SESSION_WS_API_KEYS") {
            let keys: Vec<String> = v
                .split(',')
                .map(|k| k.trim().to_string())
                .filter(|k| !k.is_empty())
                .collect();
            builder = builder.set_override("auth.ws_api_keys", keys)?;
        }

        builder.build()?.try_deserialize()
    }
}
