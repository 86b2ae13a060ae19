use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt, stream::SplitSink};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::session::broadcast::SUBSCRIBER_QUEUE_DEPTH;
use crate::session::registry::SessionHandle;
use crate::session::{SessionMsg, spawn_session};
use crate::state::AppState;
use crate::ws::messages::{
    CLOSE_POLICY_VIOLATION, ClientMessage, ControlMessage, MAX_MESSAGE_BYTES, error_codes,
    validate_audio, validate_init,
};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub key: Option<String>,
    pub session: Option<String>,
    pub lang: Option<String>,
    /// "host" (default), "listen", or "solo".
    pub role: Option<String>,
}

pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
    ws: WebSocketUpgrade,
) -> Response {
    let authorized = state.settings.auth.ws_api_keys.is_empty()
        || params
            .key
            .as_deref()
            .is_some_and(|k| state.settings.auth.ws_api_keys.iter().any(|allowed| allowed == k));

    ws.on_upgrade(move |socket| async move {
        if !authorized {
            deny(socket, error_codes::AUTH_FAILED, "invalid or missing API key").await;
            return;
        }
        match params.role.as_deref() {
            Some("listen") => handle_listener(socket, state, params).await,
            _ => handle_host(socket, state, params).await,
        }
    })
}

/// Sends a typed error and closes with the policy-violation code.
async fn deny(mut socket: WebSocket, code: &str, message: &str) {
    let error = ControlMessage::Error {
        code: Some(code.to_string()),
        message: message.to_string(),
        retry_after: None,
    };
    let _ = socket.send(Message::text(error.to_json())).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: code.to_string().into(),
        })))
        .await;
}

/// Pumps a bounded outbound queue into the socket sink; ends when the
/// sender side is dropped (subscriber closed) or the write fails.
fn spawn_outbound_pump(
    mut rx: mpsc::Receiver<String>,
    mut sink: SplitSink<WebSocket, Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if sink.send(Message::text(json)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    })
}

async fn handle_host(socket: WebSocket, state: AppState, params: WsParams) {
    let connection_id = Uuid::new_v4().to_string();
    info!(%connection_id, "host connected");

    let (sink, mut receiver) = socket.split();
    let (host_tx, host_rx) = mpsc::channel::<String>(SUBSCRIBER_QUEUE_DEPTH * 2);
    let pump = spawn_outbound_pump(host_rx, sink);

    let mut session: Option<SessionHandle> = None;

    while let Some(message) = receiver.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => continue,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        if text.len() > MAX_MESSAGE_BYTES {
            send_control(
                &host_tx,
                &ControlMessage::Warning {
                    code: Some(error_codes::VALIDATION_ERROR.to_string()),
                    message: "message exceeds 1 MiB".to_string(),
                },
            );
            continue;
        }

        let parsed: ClientMessage = match serde_json::from_str(&text) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(%connection_id, %e, "undecodable client message");
                send_control(
                    &host_tx,
                    &ControlMessage::Warning {
                        code: Some(error_codes::VALIDATION_ERROR.to_string()),
                        message: "undecodable message".to_string(),
                    },
                );
                continue;
            }
        };

        match parsed {
            ClientMessage::Init(init) => {
                if session.is_some() {
                    send_control(
                        &host_tx,
                        &ControlMessage::Warning {
                            code: Some(error_codes::VALIDATION_ERROR.to_string()),
                            message: "session already initialized".to_string(),
                        },
                    );
                    continue;
                }
                if let Err(e) = validate_init(&init) {
                    send_control(
                        &host_tx,
                        &ControlMessage::Error {
                            code: Some(error_codes::VALIDATION_ERROR.to_string()),
                            message: e.to_string(),
                            retry_after: None,
                        },
                    );
                    continue;
                }

                let session_id = params
                    .session
                    .as_deref()
                    .map(crate::ws::messages::sanitize_text)
                    .filter(|s| !s.is_empty())
                    .unwrap_or_else(|| nanoid::nanoid!(10));
                let source_lang = init.source_lang.clone();
                match spawn_session(
                    session_id.clone(),
                    init,
                    state.session_deps(),
                    host_tx.clone(),
                    state.registry.clone(),
                )
                .await
                {
                    Ok(handle) => {
                        send_control(
                            &host_tx,
                            &ControlMessage::SessionReady {
                                session_id,
                                connection_id: connection_id.clone(),
                                source_lang,
                            },
                        );
                        session = Some(handle);
                    }
                    Err(e) => {
                        warn!(%connection_id, %e, "session init failed");
                        send_control(
                            &host_tx,
                            &ControlMessage::Error {
                                code: Some(error_codes::VALIDATION_ERROR.to_string()),
                                message: e.to_string(),
                                retry_after: None,
                            },
                        );
                    }
                }
            }
            ClientMessage::Audio(audio) => {
                let Some(handle) = &session else {
                    continue;
                };
                if let Err(e) = validate_audio(&audio) {
                    send_control(
                        &host_tx,
                        &ControlMessage::Warning {
                            code: Some(error_codes::VALIDATION_ERROR.to_string()),
                            message: e.to_string(),
                        },
                    );
                    continue;
                }
                if handle
                    .cmd_tx
                    .send(SessionMsg::Audio { data: audio.data })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            ClientMessage::AudioEnd => {
                if let Some(handle) = &session {
                    let _ = handle.cmd_tx.send(SessionMsg::AudioEnd).await;
                }
            }
            ClientMessage::Ping => {
                send_control(
                    &host_tx,
                    &ControlMessage::Info {
                        message: "pong".to_string(),
                        connection_id: Some(connection_id.clone()),
                    },
                );
            }
            ClientMessage::Pong => {}
        }
    }

    // Host disconnect destroys the session.
    if let Some(handle) = session {
        let _ = handle.cmd_tx.send(SessionMsg::Shutdown).await;
    }
    pump.abort();
    info!(%connection_id, "host disconnected");
}

async fn handle_listener(socket: WebSocket, state: AppState, params: WsParams) {
    let connection_id = Uuid::new_v4().to_string();

    let (session_id, target_lang) = match (params.session.as_deref(), params.lang.as_deref()) {
        (Some(session), Some(lang)) if crate::ws::messages::valid_lang_tag(lang) => {
            (crate::ws::messages::sanitize_text(session), lang.to_string())
        }
        _ => {
            deny(
                socket,
                error_codes::VALIDATION_ERROR,
                "listener requires session and lang",
            )
            .await;
            return;
        }
    };

    let Some(handle) = state.registry.get(&session_id) else {
        deny(socket, error_codes::VALIDATION_ERROR, "unknown session").await;
        return;
    };

    info!(%connection_id, %session_id, %target_lang, "listener connected");

    let (sink, mut receiver) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<String>(SUBSCRIBER_QUEUE_DEPTH);
    let pump = spawn_outbound_pump(out_rx, sink);

    if handle
        .cmd_tx
        .send(SessionMsg::ListenerJoin {
            connection_id: connection_id.clone(),
            target_lang,
            tx: out_tx,
        })
        .await
        .is_err()
    {
        pump.abort();
        return;
    }

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                // Listeners only speak the ping/pong control vocabulary.
                if let Ok(ClientMessage::Ping) = serde_json::from_str::<ClientMessage>(&text) {
                    let _ = handle.cmd_tx.send(SessionMsg::StatsRequest).await;
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    let _ = handle
        .cmd_tx
        .send(SessionMsg::ListenerLeave {
            connection_id: connection_id.clone(),
        })
        .await;
    pump.abort();
    info!(%connection_id, "listener disconnected");
}

fn send_control(tx: &mpsc::Sender<String>, message: &ControlMessage) {
    if tx.try_send(message.to_json()).is_err() {
        debug!("outbound queue full, dropping control message");
    }
}
