//! Context window management: token estimation and tool-result clearing.
//!
//! 1. **[`estimator`]**: cheap, deterministic token approximation
//!    (characters / 4) shared by every middleware that needs a size.
//!
//! 2. **[`editing`]**: [`ContextEditor`] replaces the content of old tool
//!    results with a fixed placeholder once the estimate crosses a threshold.
//!    Tool calls and their results are cleared as pairs, so the transcript
//!    stays valid for providers that reject unmatched tool messages.

pub mod editing;
pub mod estimator;

pub use editing::{
    ContextEditingConfig, ContextEditor, DEFAULT_MAX_TOKENS, DEFAULT_PLACEHOLDER, EditOutcome,
    EditStrategy,
};
pub use estimator::{ApproxTokenCounter, CHARS_PER_TOKEN, TokenCounter, estimate_tokens};
