//! WebSocket transport for voice conversations
//!
//! Each connection gets its own orchestrator. The socket relays raw audio in
//! both directions and JSON control frames outward; inbound text frames carry
//! start/stop commands. The orchestrator runs as its own task, fed by a
//! command channel and drained by a sender task, so a slow reader never
//! stalls turn handling.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::voice::{OrchestratorEvent, VoiceCommand, VoiceOrchestrator};

/// Control frames sent to the browser
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Ready,
    State { state: &'static str },
    Transcript { text: String, is_final: bool },
    Response { text: String },
    Interrupt,
    Error { message: String },
}

/// Control frames received from the browser
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Start {
        #[serde(default)]
        session_id: Option<String>,
    },
    Stop,
}

pub async fn voice_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    info!("Voice client connected");
    let (mut ws_tx, mut ws_rx) = socket.split();

    if let Err(e) = ws_tx.send(control_frame(&ServerMessage::Ready)).await {
        warn!("Voice client gone before ready: {}", e);
        return;
    }

    let (command_tx, command_rx) = mpsc::channel::<VoiceCommand>(256);
    let (event_tx, mut event_rx) = mpsc::channel::<OrchestratorEvent>(256);

    let orchestrator = VoiceOrchestrator::new(
        state.config.stt.clone(),
        state.config.tts.clone(),
        state.deps.clone(),
        event_tx,
    );
    let orchestrator_task = tokio::spawn(orchestrator.run(command_rx));

    // Orchestrator events out to the socket
    let sender_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let message = match event {
                OrchestratorEvent::Audio(data) => Message::Binary(data.into()),
                OrchestratorEvent::StateChange(state) => control_frame(&ServerMessage::State {
                    state: state.as_str(),
                }),
                OrchestratorEvent::Transcript { text, is_final } => {
                    control_frame(&ServerMessage::Transcript { text, is_final })
                }
                OrchestratorEvent::ResponseText(text) => {
                    control_frame(&ServerMessage::Response { text })
                }
                OrchestratorEvent::Interrupt => control_frame(&ServerMessage::Interrupt),
                OrchestratorEvent::Error(message) => {
                    control_frame(&ServerMessage::Error { message })
                }
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Socket frames in to the orchestrator
    while let Some(message) = ws_rx.next().await {
        let message = match message {
            Ok(m) => m,
            Err(e) => {
                debug!("Voice socket read error: {}", e);
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(ClientMessage::Start { session_id }) => {
                    if command_tx
                        .send(VoiceCommand::Start { session_id })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(ClientMessage::Stop) => {
                    if command_tx.send(VoiceCommand::Stop).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Ignoring malformed control frame: {}", e),
            },
            Message::Binary(data) => {
                if command_tx
                    .send(VoiceCommand::Audio(data.to_vec()))
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Dropping the command channel makes the orchestrator stop and exit
    drop(command_tx);
    let _ = orchestrator_task.await;
    sender_task.abort();
    info!("Voice client disconnected");
}

fn control_frame(message: &ServerMessage) -> Message {
    // Serialization of these enums cannot fail
    let json = serde_json::to_string(message).unwrap_or_default();
    Message::Text(json.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_shapes() {
        let state = serde_json::to_string(&ServerMessage::State { state: "listening" }).unwrap();
        assert_eq!(state, r#"{"type":"state","state":"listening"}"#);

        let transcript = serde_json::to_string(&ServerMessage::Transcript {
            text: "hi".to_string(),
            is_final: true,
        })
        .unwrap();
        assert_eq!(
            transcript,
            r#"{"type":"transcript","text":"hi","is_final":true}"#
        );

        assert_eq!(
            serde_json::to_string(&ServerMessage::Interrupt).unwrap(),
            r#"{"type":"interrupt"}"#
        );
        assert_eq!(
            serde_json::to_string(&ServerMessage::Ready).unwrap(),
            r#"{"type":"ready"}"#
        );
    }

    #[test]
    fn test_client_message_shapes() {
        let start: ClientMessage = serde_json::from_str(r#"{"type":"start"}"#).unwrap();
        assert!(matches!(start, ClientMessage::Start { session_id: None }));

        let with_session: ClientMessage =
            serde_json::from_str(r#"{"type":"start","session_id":"abc"}"#).unwrap();
        match with_session {
            ClientMessage::Start { session_id } => assert_eq!(session_id.as_deref(), Some("abc")),
            other => panic!("unexpected message: {:?}", other),
        }

        let stop: ClientMessage = serde_json::from_str(r#"{"type":"stop"}"#).unwrap();
        assert!(matches!(stop, ClientMessage::Stop));
    }
}
