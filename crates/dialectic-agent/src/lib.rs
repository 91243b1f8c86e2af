//! # dialectic-agent
//!
//! AI provider adapters and the continuation loop.
//!
//! A provider may stop mid-answer because it ran out of room
//! (`finish_reason == "length"`). The continuation loop hides that from
//! callers: it re-sends the conversation with the partial answer appended
//! as an assistant turn, stitches the fragments together and hands back a
//! single logically-complete response with summed token usage.
//!
//! ## Key Pattern
//!
//! - [`AiProviderAdapter`] is the only seam that touches the network
//! - [`continue_until_complete`] drives one adapter sequentially; each call
//!   depends on the history of the previous ones
//! - [`ScriptedAdapter`] replays queued responses for tests

mod adapter;
mod anthropic;
mod continuation;
mod scripted;

pub use adapter::AiProviderAdapter;
pub use anthropic::AnthropicAdapter;
pub use continuation::{
    continue_until_complete, continue_until_complete_with, should_continue, ContinuationObserver,
    FragmentProgress, NoopObserver,
};
pub use scripted::ScriptedAdapter;
