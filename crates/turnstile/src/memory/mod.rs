//! Long-term memory: retrieve records from an external store and inject
//! them into the system prompt.
//!
//! The store itself (storage, embeddings, similarity) lives elsewhere and is
//! reached through [`MemoryStore`]. [`HttpMemoryStore`] is an adapter for
//! stores exposed over HTTP; [`LongTermMemoryInjector`] does the filtering,
//! ranking, formatting, and injection.

pub mod http;
pub mod injector;

pub use http::HttpMemoryStore;
pub use injector::{
    DEFAULT_INSTRUCTION_HINT, DEFAULT_WRAPPER_TAG, InjectOutcome, LongTermMemoryConfig,
    LongTermMemoryInjector, MemoryKindConfig,
};

use crate::error::MemoryError;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

/// Category of a stored memory.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum MemoryKind {
    /// Facts about the user.
    Profile,
    /// Question/answer pairs from earlier conversations.
    Qa,
}

impl MemoryKind {
    pub const ALL: [MemoryKind; 2] = [MemoryKind::Profile, MemoryKind::Qa];

    pub fn as_str(self) -> &'static str {
        match self {
            MemoryKind::Profile => "profile",
            MemoryKind::Qa => "qa",
        }
    }
}

impl std::fmt::Display for MemoryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A record returned by a [`MemoryStore`].
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MemoryRecord {
    pub id: String,
    pub kind: MemoryKind,
    /// Profile text, or the question of a QA pair.
    pub text: String,
    /// The answer of a QA pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub answer: Option<String>,
    /// Relevance to the query, 0 to 1.
    #[serde(alias = "score")]
    pub relevance_score: f64,
}

impl MemoryRecord {
    pub fn new(
        id: impl Into<String>,
        kind: MemoryKind,
        text: impl Into<String>,
        relevance_score: f64,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            text: text.into(),
            answer: None,
            relevance_score,
        }
    }

    /// A QA record.
    pub fn qa(
        id: impl Into<String>,
        question: impl Into<String>,
        answer: impl Into<String>,
        relevance_score: f64,
    ) -> Self {
        Self {
            answer: Some(answer.into()),
            ..Self::new(id, MemoryKind::Qa, question, relevance_score)
        }
    }

    /// Characters of record text counted against the injector's
    /// `max_chars` budget. A QA pair counts as `question\nanswer`.
    pub fn char_len(&self) -> usize {
        self.text.chars().count() + self.answer.as_ref().map_or(0, |a| a.chars().count() + 1)
    }
}

/// Boxed future returned by [`MemoryStore::search`].
pub type MemoryFuture<'a> = BoxFuture<'a, Result<Vec<MemoryRecord>, MemoryError>>;

/// Similarity search over stored memories.
pub trait MemoryStore: Send + Sync {
    /// Up to `limit` records of `kind` relevant to `query`.
    fn search<'a>(&'a self, query: &'a str, kind: MemoryKind, limit: usize) -> MemoryFuture<'a>;
}
