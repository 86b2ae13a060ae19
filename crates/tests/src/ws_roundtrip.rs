use std::sync::Arc;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::time::{Duration, timeout};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use crate::fixtures::{ScriptedRecognizer, TaggingTranslator};
use voxrelay_api::build_router;
use voxrelay_api::session::registry::SessionRegistry;
use voxrelay_api::state::AppState;
use voxrelay_config::{
    AuthSettings, RecognizerSettings, ServerSettings, Settings, TranslatorSettings,
};
use voxrelay_pipeline::PipelineConfig;

fn test_settings(api_keys: Vec<String>) -> Settings {
    Settings {
        server: ServerSettings {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_allow_any: true,
        },
        auth: AuthSettings {
            ws_api_keys: api_keys,
        },
        recognizer: RecognizerSettings {
            credentials: None,
            phrase_set_id: None,
            project_id: None,
            fallback_to_english: true,
        },
        translator: TranslatorSettings {
            api_key: None,
            endpoint: "http://unused".to_string(),
            request_timeout_ms: 1000,
            detect_scripture: false,
        },
    }
}

async fn serve(state: AppState) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let router = build_router(state);
    tokio::spawn(async move {
        axum::serve(listener, router).await.expect("serve");
    });
    addr
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    loop {
        let message = timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for ws message")
            .expect("stream open")
            .expect("ws ok");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("valid JSON");
        }
    }
}

#[tokio::test]
async fn host_listener_roundtrip_over_websocket() {
    let recognizer = ScriptedRecognizer::new();
    let state = AppState {
        settings: Arc::new(test_settings(vec!["k1".to_string()])),
        registry: Arc::new(SessionRegistry::new()),
        recognizer: recognizer.clone(),
        translator: Some(TaggingTranslator::reliable() as Arc<dyn voxrelay_translate::Translator>),
        grammar: None,
        recovery: None,
        pipeline: PipelineConfig::default(),
    };
    let addr = serve(state).await;

    // Host connects, initializes a session.
    let (mut host, _) = connect_async(format!("ws://{addr}/ws?key=k1&session=abc"))
        .await
        .expect("host connects");
    host.send(Message::Text(
        r#"{"type":"init","sourceLang":"en-US"}"#.into(),
    ))
    .await
    .expect("init sent");

    let ready = next_json(&mut host).await;
    assert_eq!(ready["type"], "session_ready");
    assert_eq!(ready["sessionId"], "abc");

    // Listener attaches for Spanish.
    let (mut listener, _) = connect_async(format!(
        "ws://{addr}/ws?key=k1&role=listen&session=abc&lang=es"
    ))
    .await
    .expect("listener connects");
    let joined = next_json(&mut listener).await;
    assert_eq!(joined["type"], "session_joined");
    assert_eq!(joined["targetLang"], "es");

    // A recognizer partial flows to the listener as a translated partial.
    recognizer.emit_partial("and you know").await;
    let event = next_json(&mut listener).await;
    assert_eq!(event["type"], "translation");
    assert_eq!(event["isPartial"], true);
    assert_eq!(event["targetLang"], "es");
    assert_eq!(event["translatedText"], "[es] and you know");

    // The host sees the partial too (after any session_stats updates).
    loop {
        let host_event = next_json(&mut host).await;
        if host_event["type"] == "translation" {
            break;
        }
    }
}

#[tokio::test]
async fn invalid_api_key_is_denied_with_policy_close() {
    let state = AppState {
        settings: Arc::new(test_settings(vec!["k1".to_string()])),
        registry: Arc::new(SessionRegistry::new()),
        recognizer: ScriptedRecognizer::new(),
        translator: None,
        grammar: None,
        recovery: None,
        pipeline: PipelineConfig::default(),
    };
    let addr = serve(state).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws?key=wrong"))
        .await
        .expect("upgrade succeeds before denial");

    let error = next_json(&mut ws).await;
    assert_eq!(error["type"], "error");
    assert_eq!(error["code"], "AUTH_FAILED");

    let close = timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("close within budget")
        .expect("frame")
        .expect("ws ok");
    match close {
        Message::Close(Some(frame)) => assert_eq!(u16::from(frame.code), 1008),
        other => panic!("expected close frame, got {other:?}"),
    }
}
