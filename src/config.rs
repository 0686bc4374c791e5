//! Configuration management
//!
//! Settings for the server, LLM provider, speech services, retrieval backend,
//! and session store. Loaded from a TOML file with environment-variable
//! overrides for secrets.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// HTTP/WebSocket server settings
    #[serde(default)]
    pub server: ServerConfig,
    /// LLM provider settings
    #[serde(default)]
    pub llm: LlmConfig,
    /// Streaming speech-to-text settings
    #[serde(default)]
    pub stt: SttConfig,
    /// Streaming text-to-speech settings
    #[serde(default)]
    pub tts: TtsConfig,
    /// Vector retrieval settings
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    /// Session history settings
    #[serde(default)]
    pub session: SessionConfig,
}

/// Server bind settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// LLM provider settings (OpenAI-compatible chat completions API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// API key; normally supplied via OPENAI_API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model for voice turns
    #[serde(default = "default_voice_model")]
    pub voice_model: String,
    /// Model for text chat
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    /// Token cap for voice responses — kept short so answers stay speakable
    #[serde(default = "default_voice_max_tokens")]
    pub voice_max_tokens: u32,
    #[serde(default = "default_chat_max_tokens")]
    pub chat_max_tokens: u32,
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_voice_model() -> String {
    "gpt-4.1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_voice_max_tokens() -> u32 {
    150
}

fn default_chat_max_tokens() -> u32 {
    800
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            api_key: None,
            voice_model: default_voice_model(),
            chat_model: default_chat_model(),
            voice_max_tokens: default_voice_max_tokens(),
            chat_max_tokens: default_chat_max_tokens(),
        }
    }
}

/// Streaming STT settings (Deepgram Flux)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SttConfig {
    #[serde(default = "default_stt_url")]
    pub url: String,
    /// API key; normally supplied via DEEPGRAM_API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_stt_model")]
    pub model: String,
    #[serde(default = "default_audio_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
    /// Confidence threshold for a confirmed end-of-turn
    #[serde(default = "default_eot_threshold")]
    pub eot_threshold: f64,
    /// Lower threshold for the early (eager) end-of-turn signal
    #[serde(default = "default_eager_eot_threshold")]
    pub eager_eot_threshold: f64,
    /// Silence that forces an end-of-turn, in milliseconds
    #[serde(default = "default_eot_timeout_ms")]
    pub eot_timeout_ms: u32,
}

fn default_stt_url() -> String {
    "wss://api.deepgram.com/v2/listen".to_string()
}

fn default_stt_model() -> String {
    "flux-general-en".to_string()
}

fn default_audio_encoding() -> String {
    "linear16".to_string()
}

fn default_sample_rate() -> u32 {
    16000
}

fn default_eot_threshold() -> f64 {
    0.7
}

fn default_eager_eot_threshold() -> f64 {
    0.4
}

fn default_eot_timeout_ms() -> u32 {
    6000
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            url: default_stt_url(),
            api_key: None,
            model: default_stt_model(),
            encoding: default_audio_encoding(),
            sample_rate: default_sample_rate(),
            eot_threshold: default_eot_threshold(),
            eager_eot_threshold: default_eager_eot_threshold(),
            eot_timeout_ms: default_eot_timeout_ms(),
        }
    }
}

/// Streaming TTS settings (Deepgram Aura)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TtsConfig {
    #[serde(default = "default_tts_url")]
    pub url: String,
    /// API key; normally supplied via DEEPGRAM_API_KEY
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_tts_voice")]
    pub voice: String,
    #[serde(default = "default_audio_encoding")]
    pub encoding: String,
    #[serde(default = "default_sample_rate")]
    pub sample_rate: u32,
}

fn default_tts_url() -> String {
    "wss://api.deepgram.com/v1/speak".to_string()
}

fn default_tts_voice() -> String {
    "aura-2-odysseus-en".to_string()
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            url: default_tts_url(),
            api_key: None,
            voice: default_tts_voice(),
            encoding: default_audio_encoding(),
            sample_rate: default_sample_rate(),
        }
    }
}

/// Vector retrieval settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Query endpoint of the similarity-search provider
    #[serde(default)]
    pub index_url: Option<String>,
    /// Bearer token; normally supplied via VECTOR_INDEX_TOKEN
    #[serde(default)]
    pub index_token: Option<String>,
    /// Passages returned per query
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Source files preferred when a query matches the topic keywords
    #[serde(default = "default_pinned_sources")]
    pub pinned_sources: Vec<String>,
    /// Keywords that activate the pinned-source preference
    #[serde(default = "default_topic_keywords")]
    pub topic_keywords: Vec<String>,
}

fn default_top_k() -> usize {
    6
}

fn default_pinned_sources() -> Vec<String> {
    vec!["career_summary.md".to_string()]
}

fn default_topic_keywords() -> Vec<String> {
    ["work", "worked", "career", "company", "companies", "job", "role", "experience"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            index_url: None,
            index_token: None,
            top_k: default_top_k(),
            pinned_sources: default_pinned_sources(),
            topic_keywords: default_topic_keywords(),
        }
    }
}

/// Session history settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// SQLite path; defaults to the platform data directory
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    /// Most-recent messages retained per session
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
    /// Idle lifetime of a session before its history expires
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: u64,
}

fn default_max_messages() -> usize {
    10
}

fn default_ttl_seconds() -> u64 {
    3600
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            db_path: None,
            max_messages: default_max_messages(),
            ttl_seconds: default_ttl_seconds(),
        }
    }
}

impl Config {
    /// Load configuration from an optional TOML file, then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => {
                let contents = std::fs::read_to_string(p)
                    .with_context(|| format!("Failed to read config file: {}", p.display()))?;
                toml::from_str(&contents)
                    .with_context(|| format!("Failed to parse config file: {}", p.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over file values for secrets and endpoints.
    fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("DEEPGRAM_API_KEY") {
            self.stt.api_key = Some(key.clone());
            self.tts.api_key = Some(key);
        }
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("VECTOR_INDEX_URL") {
            self.retrieval.index_url = Some(url);
        }
        if let Ok(token) = std::env::var("VECTOR_INDEX_TOKEN") {
            self.retrieval.index_token = Some(token);
        }
    }

    /// Resolve the session database path, falling back to the platform data dir.
    pub fn session_db_path(&self) -> PathBuf {
        self.session.db_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .map(|d| d.join("cadence/sessions.db"))
                .unwrap_or_else(|| PathBuf::from("./sessions.db"))
        })
    }
}
