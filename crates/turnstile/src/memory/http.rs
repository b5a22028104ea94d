//! [`MemoryStore`] over an HTTP search endpoint.
//!
//! Request body:
//!
//! ```json
//! { "namespace": ["<namespace>", "profile"], "query": "...", "limit": 5 }
//! ```
//!
//! Response body: `{ "items": [{ "key": "...", "value": ..., "score": 0.8 }] }`.
//! Profile values are either a string or an object with a `profile` field;
//! QA values carry `question` and `answer`. A missing score counts as 1.0.

use super::{MemoryFuture, MemoryKind, MemoryRecord, MemoryStore};
use crate::error::MemoryError;
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

#[derive(Deserialize, Debug)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
}

#[derive(Deserialize, Debug)]
struct SearchItem {
    key: String,
    #[serde(default)]
    value: Value,
    score: Option<f64>,
}

/// HTTP-backed memory store.
pub struct HttpMemoryStore {
    client: reqwest::Client,
    endpoint: String,
    namespace: String,
    api_key: Option<String>,
}

impl HttpMemoryStore {
    pub fn new(endpoint: impl Into<String>, namespace: impl Into<String>) -> Result<Self, MemoryError> {
        let client = reqwest::Client::builder()
            .user_agent("turnstile/0.1")
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            namespace: namespace.into(),
            api_key: None,
        })
    }

    /// Send `Authorization: Bearer <key>` with every search.
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    async fn search_inner(
        &self,
        query: &str,
        kind: MemoryKind,
        limit: usize,
    ) -> Result<Vec<MemoryRecord>, MemoryError> {
        let body = json!({
            "namespace": [self.namespace, kind.as_str()],
            "query": query,
            "limit": limit,
        });
        let start = Instant::now();
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        let resp = request.send().await?;

        let status = resp.status();
        let text = resp.text().await?;
        debug!(
            "Memory search ({kind}): HTTP {} in {:.1}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );
        if !status.is_success() {
            return Err(MemoryError::Unavailable(format!("HTTP {status}: {text}")));
        }

        let parsed: SearchResponse = serde_json::from_str(&text)?;
        trace!("Memory search returned {} items", parsed.items.len());
        Ok(parsed
            .items
            .into_iter()
            .map(|item| record_from_item(kind, item))
            .collect())
    }
}

impl MemoryStore for HttpMemoryStore {
    fn search<'a>(&'a self, query: &'a str, kind: MemoryKind, limit: usize) -> MemoryFuture<'a> {
        Box::pin(self.search_inner(query, kind, limit))
    }
}

fn record_from_item(kind: MemoryKind, item: SearchItem) -> MemoryRecord {
    let score = item.score.unwrap_or(1.0);
    match kind {
        MemoryKind::Profile => {
            let text = match item.value.get("profile") {
                Some(profile) => value_text(profile),
                None => value_text(&item.value),
            };
            MemoryRecord::new(item.key, kind, text, score)
        }
        MemoryKind::Qa => {
            let field = |name: &str| item.value.get(name).map(value_text).unwrap_or_default();
            MemoryRecord::qa(item.key, field("question"), field("answer"), score)
        }
    }
}

/// Strings as-is, anything else as compact JSON.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
