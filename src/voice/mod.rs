//! Real-time voice conversation pipeline
//!
//! Wires streaming speech-to-text, response generation, and streaming speech
//! synthesis into a per-connection state machine with interruption support.
//!
//! ```text
//! audio bytes → TranscriptStreamClient → end-of-turn
//!                                           ↓
//!                                  VoiceOrchestrator ── response task
//!                                           ↓               ↓
//!                              history + retrieval → LLM stream → sentences
//!                                                                    ↓
//!                     transport ← audio chunks ← SpeechSynthesisClient
//! ```
//!
//! Clients expose typed event channels rather than callbacks; the
//! orchestrator is a consumer loop selecting over inbound transport commands
//! and transcription events.

pub mod orchestrator;
pub mod sentence;
pub mod stt;
pub mod tts;

pub use orchestrator::{
    ConversationState, OrchestratorEvent, VoiceCommand, VoiceDeps, VoiceOrchestrator,
};

use thiserror::Error;

/// Voice pipeline errors. Cancellation is deliberately absent: an interrupted
/// or superseded response is normal control flow, not a failure.
#[derive(Debug, Error)]
pub enum VoiceError {
    /// A streaming connection could not be established; fatal to the caller
    #[error("failed to start voice connection: {0}")]
    Startup(String),
    /// Best-effort send failed; logged and surfaced, connection continues
    #[error("transport send failed: {0}")]
    TransportSend(String),
    /// Non-success response from a speech or generation service
    #[error("upstream service error: {0}")]
    UpstreamApi(String),
    /// Unparseable control frame; logged and dropped, never fatal
    #[error("malformed control frame: {0}")]
    MalformedMessage(String),
}

/// Write half of a client WebSocket connection
pub(crate) type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    tokio_tungstenite::tungstenite::Message,
>;

/// Read half of a client WebSocket connection
pub(crate) type WsSource = futures_util::stream::SplitStream<
    tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
>;
