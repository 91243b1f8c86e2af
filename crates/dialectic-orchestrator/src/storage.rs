//! Persistence interface consumed by the orchestrator
//!
//! The schema behind it is someone else's concern. [`InMemoryStore`] backs
//! tests and the CLI's one-off runs.

use crate::notifications::FailureDetail;
use crate::state_machine::JobStatus;
use async_trait::async_trait;
use dialectic_core::{DialecticContribution, DialecticError, Result, StageSlug};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub project_id: String,
    /// Free-text status, resolved back to a stage by the stage registry
    pub status: Option<String>,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            project_id: project_id.into(),
            status: None,
        }
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRecord {
    pub id: String,
    pub name: String,
    pub owner_user_id: String,
}

/// Provider row for one selectable model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRecord {
    pub id: String,
    pub name: String,
    /// Identifier passed verbatim to the adapter
    pub api_identifier: String,
}

impl ProviderRecord {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        api_identifier: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            api_identifier: api_identifier.into(),
        }
    }
}

/// Assembled prompt for one (session, stage, iteration)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedPrompt {
    pub content: String,
    pub system_prompt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatusUpdate {
    pub status: JobStatus,
    pub error: Option<FailureDetail>,
}

#[async_trait]
pub trait DialecticStore: Send + Sync {
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord>;

    async fn update_session_status(&self, session_id: &str, status: &str) -> Result<()>;

    async fn get_project(&self, project_id: &str) -> Result<ProjectRecord>;

    async fn get_provider(&self, model_id: &str) -> Result<ProviderRecord>;

    async fn get_seed_prompt(
        &self,
        session_id: &str,
        stage: StageSlug,
        iteration_number: u32,
    ) -> Result<SeedPrompt>;

    async fn save_contribution(&self, contribution: &DialecticContribution) -> Result<()>;

    async fn list_contributions(
        &self,
        session_id: &str,
        stage: Option<StageSlug>,
    ) -> Result<Vec<DialecticContribution>>;

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&FailureDetail>,
    ) -> Result<()>;
}

/// `DialecticStore` over in-process maps
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: RwLock<HashMap<String, SessionRecord>>,
    projects: RwLock<HashMap<String, ProjectRecord>>,
    providers: RwLock<HashMap<String, ProviderRecord>>,
    seed_prompts: RwLock<HashMap<(String, StageSlug, u32), SeedPrompt>>,
    contributions: RwLock<Vec<DialecticContribution>>,
    jobs: RwLock<HashMap<String, Vec<JobStatusUpdate>>>,
    /// Models whose contributions are rejected on save
    reject_saves: HashSet<String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(mut self, session: SessionRecord) -> Self {
        self.sessions.get_mut().insert(session.id.clone(), session);
        self
    }

    pub fn with_project(mut self, project: ProjectRecord) -> Self {
        self.projects.get_mut().insert(project.id.clone(), project);
        self
    }

    pub fn with_provider(mut self, provider: ProviderRecord) -> Self {
        self.providers.get_mut().insert(provider.id.clone(), provider);
        self
    }

    pub fn with_seed_prompt(
        mut self,
        session_id: &str,
        stage: StageSlug,
        iteration_number: u32,
        prompt: SeedPrompt,
    ) -> Self {
        self.seed_prompts
            .get_mut()
            .insert((session_id.to_string(), stage, iteration_number), prompt);
        self
    }

    /// Make `save_contribution` fail for `model_id`
    pub fn rejecting_saves_for(mut self, model_id: &str) -> Self {
        self.reject_saves.insert(model_id.to_string());
        self
    }

    pub async fn session_status(&self, session_id: &str) -> Option<String> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .and_then(|s| s.status.clone())
    }

    /// Every status written for `job_id`, oldest first
    pub async fn job_history(&self, job_id: &str) -> Vec<JobStatusUpdate> {
        self.jobs.read().await.get(job_id).cloned().unwrap_or_default()
    }

    pub async fn job_status(&self, job_id: &str) -> Option<JobStatus> {
        self.jobs
            .read()
            .await
            .get(job_id)
            .and_then(|h| h.last())
            .map(|u| u.status)
    }
}

#[async_trait]
impl DialecticStore for InMemoryStore {
    async fn get_session(&self, session_id: &str) -> Result<SessionRecord> {
        self.sessions
            .read()
            .await
            .get(session_id)
            .cloned()
            .ok_or_else(|| DialecticError::SessionNotFound(session_id.to_string()))
    }

    async fn update_session_status(&self, session_id: &str, status: &str) -> Result<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| DialecticError::SessionNotFound(session_id.to_string()))?;
        session.status = Some(status.to_string());
        Ok(())
    }

    async fn get_project(&self, project_id: &str) -> Result<ProjectRecord> {
        self.projects
            .read()
            .await
            .get(project_id)
            .cloned()
            .ok_or_else(|| DialecticError::ProjectNotFound(project_id.to_string()))
    }

    async fn get_provider(&self, model_id: &str) -> Result<ProviderRecord> {
        self.providers
            .read()
            .await
            .get(model_id)
            .cloned()
            .ok_or_else(|| DialecticError::ProviderNotFound(model_id.to_string()))
    }

    async fn get_seed_prompt(
        &self,
        session_id: &str,
        stage: StageSlug,
        iteration_number: u32,
    ) -> Result<SeedPrompt> {
        self.seed_prompts
            .read()
            .await
            .get(&(session_id.to_string(), stage, iteration_number))
            .cloned()
            .ok_or_else(|| {
                DialecticError::SeedPromptNotFound(format!(
                    "session {} stage {} iteration {}",
                    session_id, stage, iteration_number
                ))
            })
    }

    async fn save_contribution(&self, contribution: &DialecticContribution) -> Result<()> {
        if self.reject_saves.contains(&contribution.model_id) {
            return Err(DialecticError::SaveFailed(format!(
                "storage rejected {}",
                contribution.content_path
            )));
        }
        self.contributions.write().await.push(contribution.clone());
        Ok(())
    }

    async fn list_contributions(
        &self,
        session_id: &str,
        stage: Option<StageSlug>,
    ) -> Result<Vec<DialecticContribution>> {
        Ok(self
            .contributions
            .read()
            .await
            .iter()
            .filter(|c| c.session_id == session_id)
            .filter(|c| stage.map_or(true, |s| c.stage == s))
            .cloned()
            .collect())
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
        error: Option<&FailureDetail>,
    ) -> Result<()> {
        self.jobs
            .write()
            .await
            .entry(job_id.to_string())
            .or_default()
            .push(JobStatusUpdate {
                status,
                error: error.cloned(),
            });
        Ok(())
    }
}
