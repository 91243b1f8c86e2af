//! # dialectic-core
//!
//! Core types for the multi-stage dialectic contribution engine.
//!
//! A dialectic session walks a fixed sequence of stages
//! (thesis → antithesis → synthesis → parenthesis → paralysis). Each stage
//! asks one or more AI models for a contribution, and the session's status
//! string records where it is in that walk.
//!
//! ## Contents
//!
//! - The process-wide [`StageRegistry`] and the status resolver that maps
//!   free-form session status strings back to a canonical [`StageSlug`]
//! - Conversation, request/response and token accounting types shared by
//!   adapters and the orchestrator
//! - The unified [`DialecticError`] and configuration loading

pub mod config;
mod error;
pub mod fail_open;
mod stages;
mod types;

pub use config::{ContinuationConfig, DialecticConfig};
pub use error::{DialecticError, Result};
pub use stages::{resolve_stage, Resolution, StageDefinition, StageRegistry, StageResolution, StageSlug};
pub use types::*;
