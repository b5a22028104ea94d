//! Tool-call limits.
//!
//! [`ToolCallLimiter`] counts tool invocations at two scopes:
//!
//! - **Thread** counters persist across runs through a
//!   [`ThreadCounterStore`]. Concurrent runs of one thread share them.
//! - **Run** counters live in the [`ConversationState`](crate::state::ConversationState)
//!   and reset at the start of every run.
//!
//! Each request moves through `Requested -> Admitted -> Executed` or
//! `Requested -> Rejected`. What a rejection means for the run is decided by
//! the scope's [`ExitBehavior`].

pub mod store;
pub mod tool_call;

pub use store::{CounterFuture, FileCounterStore, InMemoryCounterStore, ThreadCounterStore};
pub use tool_call::{
    ALL_TOOLS_KEY, Admission, CallCounts, ExitBehavior, LimitScope, Rejection, ScopeLimit,
    ToolCallLimitConfig, ToolCallLimiter,
};
