//! Notification factory
//!
//! One variant per notification type. Only [`NotificationEvent::GenerationFailed`]
//! is user-facing, and its title, message and deep link are derived from the
//! payload, so an internal event has no way to carry them.
//!
//! Everything here is pure: no I/O, no state. Delivery lives in
//! the delivery module.

use dialectic_core::{DialecticContribution, Result, StageSlug};
use serde::{Deserialize, Serialize};

pub const GENERATION_FAILED_TITLE: &str = "Contribution Generation Failed";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStarted {
    pub session_id: String,
    #[serde(rename = "job_id")]
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionStarted {
    pub session_id: String,
    pub model_id: String,
    pub iteration_number: u32,
    #[serde(rename = "job_id")]
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRetrying {
    pub session_id: String,
    pub model_id: String,
    pub iteration_number: u32,
    /// Message of the error that caused the retry
    pub error: String,
    pub attempt: u32,
    pub max_attempts: u32,
    #[serde(rename = "job_id")]
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionReceived {
    pub session_id: String,
    pub contribution: DialecticContribution,
    #[serde(rename = "job_id")]
    pub job_id: String,
    /// True for a truncated fragment that will be continued
    pub is_continuing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationContinued {
    pub session_id: String,
    pub project_id: String,
    pub model_id: String,
    pub continuation_number: u32,
    #[serde(rename = "job_id")]
    pub job_id: String,
    pub contribution: DialecticContribution,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationComplete {
    pub session_id: String,
    pub project_id: String,
    #[serde(rename = "job_id")]
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressUpdate {
    pub session_id: String,
    pub stage_slug: StageSlug,
    pub current_step: u32,
    pub total_steps: u32,
    pub message: String,
    #[serde(rename = "job_id")]
    pub job_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub code: String,
    pub message: String,
}

impl FailureDetail {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationFailed {
    pub session_id: String,
    pub project_id: String,
    /// Kept as text: a job can fail before its stage is known
    pub stage_slug: String,
    pub error: FailureDetail,
    #[serde(rename = "job_id")]
    pub job_id: String,
}

/// A phase transition worth telling someone about
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NotificationEvent {
    #[serde(rename = "contribution_generation_started")]
    GenerationStarted(GenerationStarted),
    #[serde(rename = "dialectic_contribution_started")]
    ContributionStarted(ContributionStarted),
    #[serde(rename = "contribution_generation_retrying")]
    GenerationRetrying(GenerationRetrying),
    #[serde(rename = "dialectic_contribution_received")]
    ContributionReceived(ContributionReceived),
    #[serde(rename = "contribution_generation_continued")]
    GenerationContinued(GenerationContinued),
    #[serde(rename = "contribution_generation_complete")]
    GenerationComplete(GenerationComplete),
    #[serde(rename = "dialectic_progress_update")]
    ProgressUpdate(ProgressUpdate),
    #[serde(rename = "contribution_generation_failed")]
    GenerationFailed(GenerationFailed),
}

impl NotificationEvent {
    pub fn notification_type(&self) -> &'static str {
        match self {
            Self::GenerationStarted(_) => "contribution_generation_started",
            Self::ContributionStarted(_) => "dialectic_contribution_started",
            Self::GenerationRetrying(_) => "contribution_generation_retrying",
            Self::ContributionReceived(_) => "dialectic_contribution_received",
            Self::GenerationContinued(_) => "contribution_generation_continued",
            Self::GenerationComplete(_) => "contribution_generation_complete",
            Self::ProgressUpdate(_) => "dialectic_progress_update",
            Self::GenerationFailed(_) => "contribution_generation_failed",
        }
    }

    pub fn is_internal_event(&self) -> bool {
        !matches!(self, Self::GenerationFailed(_))
    }

    pub fn session_id(&self) -> &str {
        match self {
            Self::GenerationStarted(p) => &p.session_id,
            Self::ContributionStarted(p) => &p.session_id,
            Self::GenerationRetrying(p) => &p.session_id,
            Self::ContributionReceived(p) => &p.session_id,
            Self::GenerationContinued(p) => &p.session_id,
            Self::GenerationComplete(p) => &p.session_id,
            Self::ProgressUpdate(p) => &p.session_id,
            Self::GenerationFailed(p) => &p.session_id,
        }
    }

    pub fn title(&self) -> Option<&'static str> {
        match self {
            Self::GenerationFailed(_) => Some(GENERATION_FAILED_TITLE),
            _ => None,
        }
    }

    pub fn message(&self) -> Option<String> {
        match self {
            Self::GenerationFailed(p) => Some(format!(
                "Generation failed for stage '{}': {}",
                p.stage_slug, p.error.message
            )),
            _ => None,
        }
    }

    pub fn link_path(&self) -> Option<String> {
        match self {
            Self::GenerationFailed(p) => Some(format!(
                "/projects/{}/sessions/{}",
                p.project_id, p.session_id
            )),
            _ => None,
        }
    }

    /// Payload as JSON, with the notification type under `type`
    pub fn data(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }
}

pub fn generation_started(session_id: &str, job_id: &str) -> NotificationEvent {
    NotificationEvent::GenerationStarted(GenerationStarted {
        session_id: session_id.to_string(),
        job_id: job_id.to_string(),
    })
}

pub fn contribution_started(
    session_id: &str,
    model_id: &str,
    iteration_number: u32,
    job_id: &str,
) -> NotificationEvent {
    NotificationEvent::ContributionStarted(ContributionStarted {
        session_id: session_id.to_string(),
        model_id: model_id.to_string(),
        iteration_number,
        job_id: job_id.to_string(),
    })
}

pub fn generation_retrying(
    session_id: &str,
    model_id: &str,
    iteration_number: u32,
    error: &str,
    attempt: u32,
    max_attempts: u32,
    job_id: &str,
) -> NotificationEvent {
    NotificationEvent::GenerationRetrying(GenerationRetrying {
        session_id: session_id.to_string(),
        model_id: model_id.to_string(),
        iteration_number,
        error: error.to_string(),
        attempt,
        max_attempts,
        job_id: job_id.to_string(),
    })
}

pub fn contribution_received(
    session_id: &str,
    contribution: DialecticContribution,
    job_id: &str,
    is_continuing: bool,
) -> NotificationEvent {
    NotificationEvent::ContributionReceived(ContributionReceived {
        session_id: session_id.to_string(),
        contribution,
        job_id: job_id.to_string(),
        is_continuing,
    })
}

pub fn generation_continued(
    session_id: &str,
    project_id: &str,
    model_id: &str,
    continuation_number: u32,
    job_id: &str,
    contribution: DialecticContribution,
) -> NotificationEvent {
    NotificationEvent::GenerationContinued(GenerationContinued {
        session_id: session_id.to_string(),
        project_id: project_id.to_string(),
        model_id: model_id.to_string(),
        continuation_number,
        job_id: job_id.to_string(),
        contribution,
    })
}

pub fn generation_complete(session_id: &str, project_id: &str, job_id: &str) -> NotificationEvent {
    NotificationEvent::GenerationComplete(GenerationComplete {
        session_id: session_id.to_string(),
        project_id: project_id.to_string(),
        job_id: job_id.to_string(),
    })
}

pub fn progress_update(
    session_id: &str,
    stage_slug: StageSlug,
    current_step: u32,
    total_steps: u32,
    message: impl Into<String>,
    job_id: &str,
) -> NotificationEvent {
    NotificationEvent::ProgressUpdate(ProgressUpdate {
        session_id: session_id.to_string(),
        stage_slug,
        current_step,
        total_steps,
        message: message.into(),
        job_id: job_id.to_string(),
    })
}

pub fn generation_failed(
    session_id: &str,
    project_id: &str,
    stage_slug: &str,
    error: FailureDetail,
    job_id: &str,
) -> NotificationEvent {
    NotificationEvent::GenerationFailed(GenerationFailed {
        session_id: session_id.to_string(),
        project_id: project_id.to_string(),
        stage_slug: stage_slug.to_string(),
        error,
        job_id: job_id.to_string(),
    })
}

/// An event addressed to a user
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub target_user_id: String,
    pub event: NotificationEvent,
}

/// Flat record the way a notifications table stores it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub target_user_id: String,
    pub notification_type: String,
    pub is_internal_event: bool,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_path: Option<String>,
}

impl Notification {
    pub fn new(target_user_id: impl Into<String>, event: NotificationEvent) -> Self {
        Self {
            target_user_id: target_user_id.into(),
            event,
        }
    }

    pub fn to_record(&self) -> Result<NotificationRecord> {
        Ok(NotificationRecord {
            target_user_id: self.target_user_id.clone(),
            notification_type: self.event.notification_type().to_string(),
            is_internal_event: self.event.is_internal_event(),
            data: self.event.data()?,
            title: self.event.title().map(str::to_string),
            message: self.event.message(),
            link_path: self.event.link_path(),
        })
    }
}
