//! Context retrieval over the document corpus
//!
//! Wraps a black-box similarity-search provider behind the [`VectorIndex`]
//! trait and turns raw scored passages into prompt-ready context: over-fetch,
//! rank by similarity, topically boost pinned sources, and format with source
//! attribution. An empty or unreachable index degrades to empty context
//! rather than an error.

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::RetrievalConfig;

/// A passage returned by the similarity-search provider
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub content: String,
    pub source_file: String,
    pub section_path: String,
    /// Similarity in [0, 1], higher is more similar
    pub score: f64,
}

/// A passage selected for a response, with attribution. Produced fresh per
/// query, never persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub index: usize,
    pub content: String,
    pub source_file: String,
    pub section_path: String,
    pub similarity_score: f64,
}

/// Black-box similarity-search provider
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>>;
}

/// Provider backed by a remote vector index with a JSON query endpoint
pub struct RemoteVectorIndex {
    client: reqwest::Client,
    url: String,
    token: String,
}

impl RemoteVectorIndex {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl VectorIndex for RemoteVectorIndex {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<ScoredChunk>> {
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.token))
            .json(&json!({
                "data": query,
                "topK": limit,
                "includeMetadata": true,
            }))
            .send()
            .await
            .context("Failed to query vector index")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Vector index query failed ({}): {}", status, body);
        }

        let body: serde_json::Value = response.json().await?;
        let results = body
            .get("result")
            .and_then(|r| r.as_array())
            .cloned()
            .unwrap_or_default();

        Ok(results.iter().map(parse_result).collect())
    }
}

fn parse_result(item: &serde_json::Value) -> ScoredChunk {
    let metadata = item.get("metadata").and_then(|m| m.as_object());

    let content = metadata
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .or_else(|| item.get("data").and_then(|d| d.as_str()))
        .unwrap_or_default()
        .trim()
        .to_string();

    let source_file = metadata
        .and_then(|m| m.get("file_name"))
        .and_then(|f| f.as_str())
        .unwrap_or("Unknown")
        .to_string();

    // Section path is assembled from "Header N" metadata keys in key order
    let section_path = metadata
        .map(|m| {
            let headers: BTreeMap<&String, &serde_json::Value> = m
                .iter()
                .filter(|(k, _)| k.to_lowercase().starts_with("header"))
                .collect();
            headers
                .values()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .collect::<Vec<_>>()
                .join(" > ")
        })
        .unwrap_or_default();

    ScoredChunk {
        content,
        source_file,
        section_path,
        score: item.get("score").and_then(|s| s.as_f64()).unwrap_or(0.0),
    }
}

/// Provider used when no retrieval backend is configured. Every query
/// resolves to no passages, so responses fall back to unassisted generation.
pub struct NullIndex;

#[async_trait]
impl VectorIndex for NullIndex {
    async fn search(&self, _query: &str, _limit: usize) -> Result<Vec<ScoredChunk>> {
        Ok(Vec::new())
    }
}

/// Retrieves and formats context passages for a query
pub struct ContextRetriever {
    index: Arc<dyn VectorIndex>,
    config: RetrievalConfig,
}

impl ContextRetriever {
    pub fn new(index: Arc<dyn VectorIndex>, config: RetrievalConfig) -> Self {
        Self { index, config }
    }

    /// Retrieve up to `k` passages for the query. Returns the formatted
    /// context block plus the selected chunks. Failures and empty indexes
    /// yield empty context, never an error.
    pub async fn retrieve(&self, query: &str, k: usize) -> (String, Vec<RetrievedChunk>) {
        if k == 0 {
            return (String::new(), Vec::new());
        }

        debug!("Retrieving context for query: {:.100}", query);

        // Over-fetch so the boost has candidates to reorder
        let mut candidates = match self.index.search(query, k * 2).await {
            Ok(chunks) => chunks,
            Err(e) => {
                error!("Error retrieving context: {}", e);
                return (String::new(), Vec::new());
            }
        };

        if candidates.is_empty() {
            info!("No chunks retrieved from vector index");
            return (String::new(), Vec::new());
        }

        // Most similar first; stable, so equal scores keep provider order
        candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        let selected = if self.topic_match(query) {
            // Pinned sources move to the front, score order preserved inside
            // each group. A preference, not a filter: remaining slots still go
            // to the best of the rest.
            let (pinned, rest): (Vec<_>, Vec<_>) = candidates
                .into_iter()
                .partition(|c| self.config.pinned_sources.iter().any(|p| p == &c.source_file));
            pinned.into_iter().chain(rest).take(k).collect::<Vec<_>>()
        } else {
            candidates.into_iter().take(k).collect()
        };

        info!(
            "Retrieved {} chunks (scores: {:?})",
            selected.len(),
            selected.iter().map(|c| format!("{:.4}", c.score)).collect::<Vec<_>>()
        );

        let chunks: Vec<RetrievedChunk> = selected
            .into_iter()
            .enumerate()
            .map(|(i, c)| RetrievedChunk {
                index: i + 1,
                content: c.content,
                source_file: c.source_file,
                section_path: c.section_path,
                similarity_score: c.score,
            })
            .collect();

        let context = chunks
            .iter()
            .map(|c| {
                if c.section_path.is_empty() {
                    format!("[{}] From {}:\n{}", c.index, c.source_file, c.content)
                } else {
                    format!("[{}] From {} - {}:\n{}", c.index, c.source_file, c.section_path, c.content)
                }
            })
            .collect::<Vec<_>>()
            .join("\n\n");

        (context, chunks)
    }

    fn topic_match(&self, query: &str) -> bool {
        let query = query.to_lowercase();
        self.config.topic_keywords.iter().any(|kw| query.contains(kw.as_str()))
    }
}
