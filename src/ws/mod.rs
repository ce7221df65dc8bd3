// Browser-facing WebSocket endpoint: one connection = one session.
// Client frames are `{id, action, payload}` and receive exactly one ack;
// broadcasts arrive as `{event, payload}` pushes.
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use chrono::Utc;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::auth::{self, AuthGate, Credentials};
use crate::config;
use crate::error::RelayError;
use crate::relay::RelayState;
use crate::session::{PushEvent, Session};

#[derive(Debug, Deserialize)]
pub struct ClientFrame {
    #[serde(default)]
    pub id: Option<Value>,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

pub async fn ws_handler(
    State(state): State<Arc<RelayState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let handshake_timeout =
        Duration::from_secs(config::config().relay.handshake_timeout_secs);
    ws.on_upgrade(move |socket| handle_socket(state, socket, handshake_timeout))
}

async fn handle_socket(state: Arc<RelayState>, socket: WebSocket, handshake_timeout: Duration) {
    let (mut sink, mut stream) = socket.split();

    // Authenticate-first handshake; anything else closes the socket
    let frame = match read_auth_frame(&mut stream, handshake_timeout).await {
        Ok(frame) => frame,
        Err(err) => {
            let _ = sink.send(text(ack_error(&None, &err))).await;
            return;
        }
    };
    let frame_id = frame.id.clone();

    let (credentials, issue_token) = match parse_credentials(frame.payload) {
        Ok(parsed) => parsed,
        Err(err) => {
            let _ = sink.send(text(ack_error(&frame_id, &err))).await;
            return;
        }
    };

    let identity = match state.auth.authenticate(credentials).await {
        Ok(identity) => identity,
        Err(err) => {
            let _ = sink.send(text(ack_error(&frame_id, &err.into()))).await;
            return;
        }
    };

    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<PushEvent>();
    let session = Arc::new(Session::new(identity, push_tx));
    session.activate();
    state.registry.register(Arc::clone(&session));

    let mut data = json!({
        "session_id": session.session_id,
        "identity": identity_value(&session),
    });
    if issue_token {
        match auth::generate_token(&session.identity) {
            Ok(token) => data["token"] = json!(token),
            // Session still works for this connection; only reconnect suffers
            Err(e) => tracing::error!("failed to issue session token: {}", e),
        }
    }

    // Single writer task; acks and pushes both funnel through out_tx
    let (out_tx, out_rx) = mpsc::unbounded_channel::<String>();
    let _writer = tokio::spawn(write_loop(sink, out_rx));

    if out_tx.send(ack_ok(&frame_id, data).to_string()).is_err() {
        state.drop_session(session.session_id);
        return;
    }

    let push_out = out_tx.clone();
    let push_bridge = tokio::spawn(async move {
        while let Some(event) = push_rx.recv().await {
            let frame = json!({ "event": event.topic, "payload": event.payload });
            if push_out.send(frame.to_string()).is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(raw)) => {
                session.touch();
                let frame: ClientFrame = match serde_json::from_str(&raw) {
                    Ok(frame) => frame,
                    Err(_) => {
                        let err = RelayError::Protocol(
                            "frame must be JSON with an action field".to_string(),
                        );
                        if out_tx.send(ack_error(&None, &err).to_string()).is_err() {
                            break;
                        }
                        continue;
                    }
                };

                if frame.action == "logout" {
                    let _ = out_tx.send(ack_ok(&frame.id, json!({"logged_out": true})).to_string());
                    break;
                }

                if let Some(reply) = handle_local(&session, &frame) {
                    if out_tx.send(reply.to_string()).is_err() {
                        break;
                    }
                    continue;
                }

                // Bus-bound action: handled concurrently so a slow backend
                // never blocks this session's other frames or its pushes
                let state = Arc::clone(&state);
                let session = Arc::clone(&session);
                let out = out_tx.clone();
                tokio::spawn(async move {
                    let reply = handle_dispatch(&state, &session, frame).await;
                    let _ = out.send(reply.to_string());
                });
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.drop_session(session.session_id);
    push_bridge.abort();
}

async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut out_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(frame) = out_rx.recv().await {
        if sink.send(Message::Text(frame)).await.is_err() {
            break;
        }
    }
    let _ = sink.close().await;
}

async fn read_auth_frame(
    stream: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Result<ClientFrame, RelayError> {
    let first = tokio::time::timeout(timeout, stream.next()).await;
    match first {
        Err(_) => Err(RelayError::Protocol(
            "authentication handshake timed out".to_string(),
        )),
        Ok(None) | Ok(Some(Err(_))) => Err(RelayError::Protocol(
            "connection closed before authentication".to_string(),
        )),
        Ok(Some(Ok(Message::Text(raw)))) => {
            let frame: ClientFrame = serde_json::from_str(&raw).map_err(|_| {
                RelayError::Protocol("frame must be JSON with an action field".to_string())
            })?;
            if frame.action != "authenticate" {
                return Err(RelayError::Protocol(
                    "first frame must be an authenticate action".to_string(),
                ));
            }
            Ok(frame)
        }
        Ok(Some(Ok(_))) => Err(RelayError::Protocol(
            "first frame must be a text authenticate frame".to_string(),
        )),
    }
}

/// Returns the credentials and whether to issue a reconnect token
/// (password logins get one, token logins already have one).
fn parse_credentials(payload: Value) -> Result<(Credentials, bool), RelayError> {
    let credentials: Credentials = serde_json::from_value(payload).map_err(|_| {
        RelayError::Protocol(
            "authenticate payload must contain email/password or token".to_string(),
        )
    })?;
    let issue_token = matches!(credentials, Credentials::Password { .. });
    Ok((credentials, issue_token))
}

/// Actions answered without touching the bus. Returns `None` for actions
/// that must be dispatched.
fn handle_local(session: &Session, frame: &ClientFrame) -> Option<Value> {
    match frame.action.as_str() {
        "ping" => Some(ack_ok(&frame.id, json!({"pong": Utc::now()}))),
        "whoami" => Some(ack_ok(&frame.id, identity_value(session))),
        "subscribe" => Some(match parse_topics(&frame.payload) {
            Ok(topics) => {
                session.subscribe(topics);
                ack_ok(&frame.id, json!({"subscriptions": session.subscriptions()}))
            }
            Err(err) => ack_error(&frame.id, &err),
        }),
        "unsubscribe" => Some(match parse_topics(&frame.payload) {
            Ok(topics) => {
                session.unsubscribe(&topics);
                ack_ok(&frame.id, json!({"subscriptions": session.subscriptions()}))
            }
            Err(err) => ack_error(&frame.id, &err),
        }),
        _ => None,
    }
}

async fn handle_dispatch(state: &RelayState, session: &Session, frame: ClientFrame) -> Value {
    if let Err(err) = AuthGate::authorize(&session.identity, &frame.action) {
        return ack_error(&frame.id, &err.into());
    }

    match state
        .dispatcher
        .dispatch(session, &frame.action, frame.payload, state.default_timeout())
        .await
    {
        // The backend envelope is already {success, data} / {success, error};
        // forward it untouched, tagged with the frame id
        Ok(Value::Object(mut envelope)) => {
            envelope.insert("id".to_string(), frame.id.unwrap_or(Value::Null));
            Value::Object(envelope)
        }
        Ok(other) => ack_ok(&frame.id, other),
        Err(err) => ack_error(&frame.id, &err.into()),
    }
}

fn parse_topics(payload: &Value) -> Result<Vec<String>, RelayError> {
    let topics = payload
        .get("topics")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            RelayError::Protocol("payload must contain a topics array".to_string())
        })?;
    topics
        .iter()
        .map(|t| {
            t.as_str().map(str::to_string).ok_or_else(|| {
                RelayError::Protocol("topics must be strings".to_string())
            })
        })
        .collect()
}

fn identity_value(session: &Session) -> Value {
    serde_json::to_value(&session.identity).unwrap_or(Value::Null)
}

fn ack_ok(id: &Option<Value>, data: Value) -> Value {
    json!({
        "id": id.clone().unwrap_or(Value::Null),
        "success": true,
        "data": data,
    })
}

fn ack_error(id: &Option<Value>, err: &RelayError) -> Value {
    json!({
        "id": id.clone().unwrap_or(Value::Null),
        "success": false,
        "error": err.to_error_value(),
    })
}

fn text(value: Value) -> Message {
    Message::Text(value.to_string())
}
