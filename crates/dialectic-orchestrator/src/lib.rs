//! # dialectic-orchestrator
//!
//! Runs generation jobs for the dialectic engine.
//!
//! This crate provides:
//! - [`StageOrchestrator`], which fans one stage out to every selected model
//!   and retries failed models as a group
//! - The notification factory: one typed constructor per event, with the
//!   internal / user-facing split carried by the type
//! - [`NotificationDispatcher`], an ordered fail-open delivery channel
//! - The [`DialecticStore`] persistence seam and an in-memory implementation
//! - A pure job lifecycle state machine

mod delivery;
pub mod notifications;
mod orchestrator;
mod state_machine;
mod storage;

pub use delivery::{MemorySink, NotificationDispatcher, NotificationEmitter, NotificationSink};
pub use notifications::{FailureDetail, Notification, NotificationEvent, NotificationRecord};
pub use orchestrator::{
    GenerationJob, JobOutcome, ModelFailure, StageOrchestrator, RETRY_LOOP_FAILED,
};
pub use state_machine::{transition, JobEvent, JobStatus};
pub use storage::{
    DialecticStore, InMemoryStore, JobStatusUpdate, ProjectRecord, ProviderRecord, SeedPrompt,
    SessionRecord,
};
