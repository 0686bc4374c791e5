//! Text chat over server-sent events
//!
//! The same retrieval and generation pipeline as voice, minus the speech
//! legs. Responses stream as `{"content": ...}` chunks terminated by a
//! `[DONE]` sentinel; an upstream failure becomes a single `{"error": ...}`
//! chunk.

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::info;

use super::AppState;
use crate::llm::StreamEvent;
use crate::session::{format_history, Role};
use crate::voice::VoiceDeps;

/// Passages of context fetched per chat message
const CONTEXT_K: usize = 6;
/// Prior exchanges included in the prompt
const HISTORY_EXCHANGES: usize = 5;

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Mint a fresh session id for a chat or voice conversation.
pub async fn create_session() -> Json<serde_json::Value> {
    let session_id = uuid::Uuid::new_v4().to_string();
    info!("Created session {}", session_id);
    Json(json!({ "session_id": session_id }))
}

pub async fn chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ChatRequest>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let (tx, mut rx) = mpsc::channel::<Event>(64);
    tokio::spawn(run_chat(state.deps.clone(), request, tx));

    let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).map(Ok::<_, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn run_chat(deps: VoiceDeps, request: ChatRequest, tx: mpsc::Sender<Event>) {
    // History write happens off the critical path
    if let (Some(store), Some(session_id)) = (&deps.sessions, &request.session_id) {
        let store = store.clone();
        let session_id = session_id.clone();
        let message = request.message.clone();
        tokio::spawn(async move {
            store.save_message(&session_id, Role::User, &message).await;
        });
    }

    let retrieval = deps.retriever.retrieve(&request.message, CONTEXT_K);
    let history = async {
        match (&deps.sessions, &request.session_id) {
            (Some(store), Some(session_id)) => store.get_history(session_id).await,
            _ => Vec::new(),
        }
    };
    let ((context, _chunks), history) = tokio::join!(retrieval, history);
    let chat_history = format_history(&history, HISTORY_EXCHANGES);

    let mut generation = deps
        .generator
        .stream_chat(&request.message, &context, &chat_history);
    let mut full_response = String::new();

    while let Some(item) = generation.recv().await {
        let event = match item {
            StreamEvent::Content(text) => {
                full_response.push_str(&text);
                Event::default().data(json!({ "content": text }).to_string())
            }
            StreamEvent::Failed(e) => {
                let _ = tx
                    .send(Event::default().data(json!({ "error": e }).to_string()))
                    .await;
                return;
            }
        };
        if tx.send(event).await.is_err() {
            // Client went away; stop generating
            return;
        }
    }

    if !full_response.is_empty() {
        if let (Some(store), Some(session_id)) = (&deps.sessions, &request.session_id) {
            store
                .save_message(session_id, Role::Assistant, &full_response)
                .await;
        }
    }

    let _ = tx.send(Event::default().data("[DONE]")).await;
}
