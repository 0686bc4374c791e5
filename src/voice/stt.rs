//! Streaming speech-to-text client
//!
//! Maintains a WebSocket connection to a turn-aware transcription service
//! (Deepgram Flux). Raw audio goes out over the write half; a background task
//! reads service frames and demultiplexes them into typed [`SttEvent`]s on an
//! mpsc channel. The service owns turn detection, so the orchestrator never
//! has to run its own silence timers.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, info, warn};

use super::{VoiceError, WsSink, WsSource};
use crate::config::SttConfig;

/// Transcription events, in service order
#[derive(Debug, Clone, PartialEq)]
pub enum SttEvent {
    /// The service accepted the connection and will take audio
    Ready,
    /// A transcript fragment; `is_final` fragments accumulate into the turn
    Transcript { text: String, is_final: bool },
    /// The user began speaking
    SpeechStarted,
    /// Confirmed end of the user's turn, with the full turn transcript
    EndOfTurn(String),
    /// Early low-confidence end-of-turn signal; may be followed by
    /// `TurnResumed` if the user keeps talking
    EagerEndOfTurn(String),
    /// The user resumed after an eager end-of-turn
    TurnResumed,
    /// A service-reported or connection error
    Error(String),
}

/// Wire frames from the transcription service
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum SttFrame {
    Connected,
    TurnInfo {
        #[serde(default)]
        event: String,
        #[serde(default)]
        transcript: String,
    },
    Transcript {
        #[serde(default)]
        transcript: String,
        #[serde(default)]
        is_final: bool,
    },
    SpeechStarted,
    Error {
        #[serde(default)]
        message: String,
    },
    #[serde(other)]
    Other,
}

/// Streaming transcription connection
pub struct TranscriptStreamClient {
    sink: WsSink,
    receive_task: JoinHandle<()>,
    connected: Arc<AtomicBool>,
}

impl TranscriptStreamClient {
    /// Connect to the transcription service and start the receive loop.
    /// Events are delivered on `events` until the connection closes.
    pub async fn connect(
        config: &SttConfig,
        events: mpsc::Sender<SttEvent>,
    ) -> Result<Self, VoiceError> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| VoiceError::Startup("DEEPGRAM_API_KEY is not set".to_string()))?;

        let url = format!(
            "{}?model={}&encoding={}&sample_rate={}&eot_threshold={}&eager_eot_threshold={}&eot_timeout_ms={}",
            config.url,
            config.model,
            config.encoding,
            config.sample_rate,
            config.eot_threshold,
            config.eager_eot_threshold,
            config.eot_timeout_ms,
        );

        let mut request = url
            .into_client_request()
            .map_err(|e| VoiceError::Startup(format!("invalid STT endpoint: {}", e)))?;
        let auth = HeaderValue::from_str(&format!("Token {}", api_key))
            .map_err(|e| VoiceError::Startup(format!("invalid API key: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (ws, _) = connect_async(request)
            .await
            .map_err(|e| VoiceError::Startup(format!("STT connection failed: {}", e)))?;
        info!("Connected to STT stream");

        let (sink, source) = ws.split();
        let connected = Arc::new(AtomicBool::new(true));
        let receive_task = tokio::spawn(receive_loop(source, events, connected.clone()));

        Ok(Self {
            sink,
            receive_task,
            connected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Forward raw audio bytes to the service.
    pub async fn send_audio(&mut self, data: &[u8]) -> Result<(), VoiceError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.sink
            .send(WsMessage::Binary(data.to_vec().into()))
            .await
            .map_err(|e| VoiceError::TransportSend(format!("audio send failed: {}", e)))
    }

    /// Close the connection, telling the service to flush any pending turn.
    pub async fn close(&mut self) {
        self.connected.store(false, Ordering::SeqCst);
        self.receive_task.abort();

        let close_frame = r#"{"type":"CloseStream"}"#;
        if let Err(e) = self.sink.send(WsMessage::Text(close_frame.into())).await {
            debug!("STT close frame not delivered: {}", e);
        }
        if let Err(e) = self.sink.close().await {
            debug!("STT socket close failed: {}", e);
        }
        info!("Closed STT connection");
    }
}

async fn receive_loop(
    mut source: WsSource,
    events: mpsc::Sender<SttEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(message) = source.next().await {
        if !connected.load(Ordering::SeqCst) {
            break;
        }
        match message {
            Ok(WsMessage::Text(text)) => match serde_json::from_str::<SttFrame>(&text) {
                Ok(frame) => {
                    if let Some(event) = event_for(frame) {
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                }
                Err(e) => {
                    let err = VoiceError::MalformedMessage(e.to_string());
                    warn!("Dropping STT frame: {}", err);
                }
            },
            Ok(WsMessage::Close(_)) => {
                info!("STT stream closed by service");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                error!("STT receive failed: {}", e);
                let _ = events.send(SttEvent::Error(e.to_string())).await;
                break;
            }
        }
    }
    connected.store(false, Ordering::SeqCst);
}

/// Map a wire frame to the event the orchestrator consumes. Frames with no
/// conversational meaning map to `None`.
fn event_for(frame: SttFrame) -> Option<SttEvent> {
    match frame {
        SttFrame::Connected => {
            info!("STT stream ready");
            Some(SttEvent::Ready)
        }
        SttFrame::TurnInfo { event, transcript } => match event.as_str() {
            "EndOfTurn" if !transcript.trim().is_empty() => {
                info!("End of turn: {:.100}", transcript);
                Some(SttEvent::EndOfTurn(transcript))
            }
            "EagerEndOfTurn" if !transcript.trim().is_empty() => {
                debug!("Eager end of turn: {:.100}", transcript);
                Some(SttEvent::EagerEndOfTurn(transcript))
            }
            "TurnResumed" => Some(SttEvent::TurnResumed),
            "StartOfTurn" => Some(SttEvent::SpeechStarted),
            _ => None,
        },
        SttFrame::Transcript { transcript, is_final } if !transcript.trim().is_empty() => {
            Some(SttEvent::Transcript {
                text: transcript,
                is_final,
            })
        }
        SttFrame::Transcript { .. } => None,
        SttFrame::SpeechStarted => Some(SttEvent::SpeechStarted),
        SttFrame::Error { message } => {
            error!("STT service error: {}", message);
            Some(SttEvent::Error(message))
        }
        SttFrame::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> Option<SttEvent> {
        event_for(serde_json::from_str(json).expect("frame should parse"))
    }

    #[test]
    fn test_end_of_turn_frame() {
        let event = parse(r#"{"type":"TurnInfo","event":"EndOfTurn","transcript":"hello there"}"#);
        assert_eq!(event, Some(SttEvent::EndOfTurn("hello there".to_string())));
    }

    #[test]
    fn test_empty_end_of_turn_dropped() {
        assert_eq!(parse(r#"{"type":"TurnInfo","event":"EndOfTurn","transcript":"  "}"#), None);
    }

    #[test]
    fn test_turn_lifecycle_frames() {
        assert_eq!(
            parse(r#"{"type":"TurnInfo","event":"StartOfTurn","transcript":""}"#),
            Some(SttEvent::SpeechStarted)
        );
        assert_eq!(
            parse(r#"{"type":"TurnInfo","event":"TurnResumed","transcript":""}"#),
            Some(SttEvent::TurnResumed)
        );
        assert_eq!(
            parse(r#"{"type":"TurnInfo","event":"EagerEndOfTurn","transcript":"so"}"#),
            Some(SttEvent::EagerEndOfTurn("so".to_string()))
        );
        // Interim updates carry no action
        assert_eq!(parse(r#"{"type":"TurnInfo","event":"Update","transcript":"so"}"#), None);
    }

    #[test]
    fn test_transcript_frame() {
        let event = parse(r#"{"type":"Transcript","transcript":"hi","is_final":true}"#);
        assert_eq!(
            event,
            Some(SttEvent::Transcript {
                text: "hi".to_string(),
                is_final: true
            })
        );
    }

    #[test]
    fn test_unknown_frame_ignored() {
        assert_eq!(parse(r#"{"type":"Metadata","request_id":"abc"}"#), None);
    }

    #[test]
    fn test_error_frame() {
        let event = parse(r#"{"type":"Error","message":"bad audio"}"#);
        assert_eq!(event, Some(SttEvent::Error("bad audio".to_string())));
    }
}
