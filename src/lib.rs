//! Cadence: a voice-enabled assistant that answers questions about one
//! person's professional background, grounded in a document corpus.
//!
//! The crate is a backend service: browsers connect over WebSocket for
//! real-time voice (speech in, speech out) or over HTTP for streaming text
//! chat. Both paths share the retrieval, history, and generation pipeline;
//! the voice path adds streaming transcription, sentence-paced synthesis,
//! and barge-in interruption.

pub mod config;
pub mod llm;
pub mod prompts;
pub mod retrieval;
pub mod server;
pub mod session;
pub mod voice;

pub use config::Config;
