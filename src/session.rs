//! Per-session conversation history
//!
//! SQLite-backed store of role/content message pairs, capped at the most
//! recent N entries per session and expiring after an idle TTL. Reads and
//! writes never fail outward — an unavailable or corrupt store degrades to
//! an empty history.

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error};

/// Maximum characters of a message included when formatting prompt history
const MAX_CONTENT_CHARS: usize = 500;

/// Message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    fn label(self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

/// One entry of session history
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: Role,
    pub content: String,
}

/// SQLite-backed session history store
pub struct SessionStore {
    conn: Arc<Mutex<Connection>>,
    max_messages: usize,
    ttl: Duration,
}

impl SessionStore {
    /// Open (or create) the store at the given path.
    pub async fn open<P: AsRef<Path>>(path: P, max_messages: usize, ttl_seconds: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            max_messages,
            ttl: Duration::seconds(ttl_seconds as i64),
        };
        store.purge_expired().await;
        Ok(store)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                history TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);
        "#,
        )?;
        Ok(())
    }

    /// Retrieve the history for a session. Empty on miss, expiry, or any
    /// internal error — never errors outward.
    pub async fn get_history(&self, session_id: &str) -> Vec<ChatTurn> {
        match self.try_get_history(session_id).await {
            Ok(history) => history,
            Err(e) => {
                error!("Error retrieving session history: {}", e);
                Vec::new()
            }
        }
    }

    async fn try_get_history(&self, session_id: &str) -> Result<Vec<ChatTurn>> {
        let conn = self.conn.lock().await;

        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT history, expires_at FROM sessions WHERE session_id = ?1",
                params![session_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((history_json, expires_at)) = row else {
            return Ok(Vec::new());
        };

        let expires_at: DateTime<Utc> = expires_at.parse()?;
        if expires_at < Utc::now() {
            debug!("Session {} expired, dropping history", session_id);
            conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;
            return Ok(Vec::new());
        }

        Ok(serde_json::from_str(&history_json)?)
    }

    /// Append a message to a session, truncating to the most recent
    /// `max_messages` and refreshing the TTL. Errors are logged, not raised.
    pub async fn save_message(&self, session_id: &str, role: Role, content: &str) {
        if let Err(e) = self.try_save_message(session_id, role, content).await {
            error!("Error saving session message: {}", e);
        }
    }

    async fn try_save_message(&self, session_id: &str, role: Role, content: &str) -> Result<()> {
        let mut history = self.get_history(session_id).await;
        history.push(ChatTurn {
            role,
            content: content.to_string(),
        });

        if history.len() > self.max_messages {
            history.drain(..history.len() - self.max_messages);
        }

        let history_json = serde_json::to_string(&history)?;
        let expires_at = (Utc::now() + self.ttl).to_rfc3339();

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (session_id, history, expires_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(session_id) DO UPDATE SET history = ?2, expires_at = ?3",
            params![session_id, history_json, expires_at],
        )?;

        debug!(
            "Saved message to session {}, total messages: {}",
            session_id,
            history.len()
        );
        Ok(())
    }

    /// Delete every expired session row. Best effort housekeeping.
    pub async fn purge_expired(&self) {
        let conn = self.conn.lock().await;
        match conn.execute(
            "DELETE FROM sessions WHERE expires_at < ?1",
            params![Utc::now().to_rfc3339()],
        ) {
            Ok(n) if n > 0 => debug!("Purged {} expired sessions", n),
            Ok(_) => {}
            Err(e) => error!("Error purging expired sessions: {}", e),
        }
    }
}

/// Render the most recent `max_exchanges * 2` entries as alternating
/// `User:` / `Assistant:` lines for prompt inclusion. Long messages are
/// capped at 500 characters.
pub fn format_history(history: &[ChatTurn], max_exchanges: usize) -> String {
    if history.is_empty() {
        return String::new();
    }

    let recent = &history[history.len().saturating_sub(max_exchanges * 2)..];

    recent
        .iter()
        .map(|turn| {
            let content: String = if turn.content.chars().count() > MAX_CONTENT_CHARS {
                let truncated: String = turn.content.chars().take(MAX_CONTENT_CHARS).collect();
                format!("{}...", truncated)
            } else {
                turn.content.clone()
            };
            format!("{}: {}", turn.role.label(), content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: Role, content: &str) -> ChatTurn {
        ChatTurn {
            role,
            content: content.to_string(),
        }
    }

    #[test]
    fn test_format_history_empty() {
        assert_eq!(format_history(&[], 5), "");
    }

    #[test]
    fn test_format_history_roles() {
        let history = vec![turn(Role::User, "hi"), turn(Role::Assistant, "hello")];
        assert_eq!(format_history(&history, 5), "User: hi\nAssistant: hello");
    }

    #[test]
    fn test_format_history_window() {
        let history: Vec<ChatTurn> = (0..8)
            .map(|i| {
                let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
                turn(role, &format!("m{}", i))
            })
            .collect();

        let formatted = format_history(&history, 2);
        // Last 2 exchanges = 4 messages
        assert!(!formatted.contains("m3"));
        assert!(formatted.contains("m4"));
        assert!(formatted.contains("m7"));
    }

    #[test]
    fn test_format_history_truncates_long_content() {
        let long = "x".repeat(600);
        let history = vec![turn(Role::User, &long)];
        let formatted = format_history(&history, 5);
        assert!(formatted.ends_with("..."));
        assert!(formatted.len() < 600);
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::User).unwrap(), "\"user\"");
        let role: Role = serde_json::from_str("\"assistant\"").unwrap();
        assert_eq!(role, Role::Assistant);
    }
}
