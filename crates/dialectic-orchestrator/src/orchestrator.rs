//! Stage orchestrator
//!
//! Runs one generation job: every selected model produces a contribution
//! for one stage of one session. Models run concurrently as independent
//! tasks, each driving its own continuation loop. Failed models are
//! re-attempted as a group up to `max_retries` times.

use crate::delivery::NotificationEmitter;
use crate::notifications::{self, FailureDetail};
use crate::state_machine::{transition, JobEvent, JobStatus};
use crate::storage::{DialecticStore, SeedPrompt};
use dialectic_agent::{
    continue_until_complete_with, AiProviderAdapter, ContinuationObserver, FragmentProgress,
};
use dialectic_core::config::RetrySettings;
use dialectic_core::fail_open::fail_open;
use dialectic_core::{
    ApiKey, ChatRequest, ContinuationConfig, ConversationMessage, DialecticConfig,
    DialecticContribution, DialecticError, Result, StageRegistry, StageSlug,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Failure code for a job whose models kept failing after every attempt
pub const RETRY_LOOP_FAILED: &str = "RETRY_LOOP_FAILED";

const NO_PROMPT_ID: &str = "__none__";

/// Payload of one generation job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: String,
    pub session_id: String,
    pub project_id: String,
    pub stage_slug: StageSlug,
    pub iteration_number: u32,
    pub selected_model_ids: Vec<String>,
    /// Recipient of every notification; a job without one cannot run
    pub owner_user_id: Option<String>,
    pub max_retries: u32,
    pub continue_until_complete: bool,
}

impl GenerationJob {
    pub fn new(
        session_id: impl Into<String>,
        project_id: impl Into<String>,
        stage_slug: StageSlug,
        selected_model_ids: Vec<String>,
    ) -> Self {
        Self {
            job_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            project_id: project_id.into(),
            stage_slug,
            iteration_number: 1,
            selected_model_ids,
            owner_user_id: None,
            max_retries: RetrySettings::default().max_retries,
            continue_until_complete: true,
        }
    }

    pub fn with_owner(mut self, owner_user_id: impl Into<String>) -> Self {
        self.owner_user_id = Some(owner_user_id.into());
        self
    }

    pub fn with_iteration(mut self, iteration_number: u32) -> Self {
        self.iteration_number = iteration_number;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_continuation(mut self, enabled: bool) -> Self {
        self.continue_until_complete = enabled;
        self
    }
}

/// A model that produced no contribution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFailure {
    pub model_id: String,
    /// Attempts made for this model
    pub attempts: u32,
    pub error: FailureDetail,
    /// True when the final error would have been retried given more attempts
    pub retryable: bool,
}

/// What a job ended with
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job_id: String,
    pub status: JobStatus,
    pub contributions: Vec<DialecticContribution>,
    pub failures: Vec<ModelFailure>,
    pub error: Option<FailureDetail>,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        self.status == JobStatus::Completed
    }
}

/// Immutable per-job state shared by model tasks
struct JobContext {
    job_id: String,
    session_id: String,
    project_id: String,
    stage: StageSlug,
    iteration_number: u32,
    owner_user_id: String,
    seed: SeedPrompt,
    continuation: ContinuationConfig,
}

/// Runs generation jobs against a store, an adapter and a notification channel
pub struct StageOrchestrator {
    store: Arc<dyn DialecticStore>,
    adapter: Arc<dyn AiProviderAdapter>,
    api_key: ApiKey,
    emitter: NotificationEmitter,
    config: DialecticConfig,
    registry: &'static StageRegistry,
    cancel: CancellationToken,
}

impl StageOrchestrator {
    pub fn new(
        store: Arc<dyn DialecticStore>,
        adapter: Arc<dyn AiProviderAdapter>,
        api_key: ApiKey,
        emitter: NotificationEmitter,
        config: DialecticConfig,
    ) -> Self {
        Self {
            store,
            adapter,
            api_key,
            emitter,
            config,
            registry: StageRegistry::standard(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Token that cancels every job run by this orchestrator
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Canonical stage a session is in, derived from its status string
    pub async fn resume_stage(&self, session_id: &str) -> Result<Option<StageSlug>> {
        let session = self.store.get_session(session_id).await?;
        Ok(self.registry.resolve(session.status.as_deref()))
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.job_id, session_id = %job.session_id, stage = %job.stage_slug)
    )]
    pub async fn run(&self, job: GenerationJob) -> JobOutcome {
        let Some(owner) = job.owner_user_id.clone().filter(|o| !o.is_empty()) else {
            // Nobody to notify
            let detail = FailureDetail::new(
                "INVALID_PAYLOAD",
                "job payload is missing owner_user_id",
            );
            return self
                .fail_unrecoverable(&job, None, JobStatus::Pending, detail)
                .await;
        };

        if job.selected_model_ids.is_empty() {
            let err = DialecticError::InvalidPayload("no models selected".to_string());
            let detail = detail_of(&err);
            return self
                .fail_unrecoverable(&job, Some(&owner), JobStatus::Pending, detail)
                .await;
        }

        let mut status = transition(JobStatus::Pending, JobEvent::Start);
        self.record_job_status(&job.job_id, status, None).await;
        self.record_session_status(&job.session_id, &job.stage_slug.generating_status())
            .await;

        let Some(stage) = self.registry.get(job.stage_slug) else {
            let err = DialecticError::StageConfig(format!(
                "stage {} is not registered",
                job.stage_slug
            ));
            let detail = detail_of(&err);
            return self
                .fail_unrecoverable(&job, Some(&owner), status, detail)
                .await;
        };

        let mut remaining = dedup(&job.selected_model_ids);
        let total_steps = remaining.len() as u32;
        self.emitter
            .emit(&owner, notifications::generation_started(&job.session_id, &job.job_id));
        self.emitter.emit(
            &owner,
            notifications::progress_update(
                &job.session_id,
                job.stage_slug,
                0,
                total_steps,
                format!("Starting {} stage...", stage.display_name),
                &job.job_id,
            ),
        );

        let ctx = match self.load_context(&job, &owner).await {
            Ok(ctx) => Arc::new(ctx),
            Err(err) => {
                let detail = detail_of(&err);
                return self
                    .fail_unrecoverable(&job, Some(&owner), status, detail)
                    .await;
            }
        };

        let max_attempts = job.max_retries.max(1);
        let mut last_errors: HashMap<String, String> = HashMap::new();
        let mut contributions = Vec::new();
        let mut failures = Vec::new();
        let mut cancelled = false;
        let mut completed_steps = 0;

        for attempt in 1..=max_attempts {
            if remaining.is_empty() {
                break;
            }
            if self.cancel.is_cancelled() {
                cancelled = true;
                break;
            }

            if attempt > 1 {
                status = transition(status, JobEvent::Retry { attempt });
                self.record_job_status(&job.job_id, status, None).await;
                for model_id in &remaining {
                    let last_error = last_errors.get(model_id).map(String::as_str).unwrap_or("");
                    self.emitter.emit(
                        &owner,
                        notifications::generation_retrying(
                            &job.session_id,
                            model_id,
                            job.iteration_number,
                            last_error,
                            attempt,
                            max_attempts,
                            &job.job_id,
                        ),
                    );
                }
                info!(attempt, models = remaining.len(), "retrying failed models");
            }

            let results = self
                .run_attempt(&ctx, &remaining, attempt, total_steps, &mut completed_steps)
                .await;

            let mut still_failing = Vec::new();
            for (model_id, result) in results {
                match result {
                    Ok(contribution) => contributions.push(contribution),
                    Err(err) => {
                        if matches!(err, DialecticError::Cancelled(_)) {
                            cancelled = true;
                        }
                        if err.is_retryable() && attempt < max_attempts {
                            warn!(model_id = %model_id, attempt, error = %err, "model attempt failed, will retry");
                            last_errors.insert(model_id.clone(), err.to_string());
                            still_failing.push(model_id);
                        } else {
                            warn!(model_id = %model_id, attempt, error = %err, "model failed");
                            failures.push(ModelFailure {
                                retryable: err.is_retryable(),
                                error: FailureDetail::new(err.failure_code(), err.to_string()),
                                model_id,
                                attempts: attempt,
                            });
                        }
                    }
                }
            }
            remaining = still_failing;
        }

        if cancelled || self.cancel.is_cancelled() {
            let detail = FailureDetail::new(
                "CANCELLED",
                "generation was cancelled before every model finished",
            );
            let status = transition(status, JobEvent::Cancel);
            return self
                .finish_failed(&job, Some(&owner), status, detail, contributions, failures)
                .await;
        }

        if failures.is_empty() {
            status = transition(status, JobEvent::AllSucceeded);
            self.record_job_status(&job.job_id, status, None).await;
            self.record_session_status(&job.session_id, &job.stage_slug.complete_status())
                .await;
            self.emitter.emit(
                &owner,
                notifications::generation_complete(&job.session_id, &job.project_id, &job.job_id),
            );
            info!(contributions = contributions.len(), "stage generation complete");
            return JobOutcome {
                job_id: job.job_id,
                status,
                contributions,
                failures,
                error: None,
            };
        }

        let detail = summarize(&failures);
        let event = if failures.iter().any(|f| f.retryable) {
            JobEvent::RetriesExhausted
        } else {
            unrecoverable(&detail)
        };
        let status = transition(status, event);
        self.finish_failed(&job, Some(&owner), status, detail, contributions, failures)
            .await
    }

    async fn load_context(&self, job: &GenerationJob, owner: &str) -> Result<JobContext> {
        // Existence checks; the records themselves are not needed further
        self.store.get_session(&job.session_id).await?;
        self.store.get_project(&job.project_id).await?;
        let seed = self
            .store
            .get_seed_prompt(&job.session_id, job.stage_slug, job.iteration_number)
            .await?;

        let continuation = if job.continue_until_complete {
            self.config.continuation_config()
        } else {
            ContinuationConfig::single_call()
        };

        Ok(JobContext {
            job_id: job.job_id.clone(),
            session_id: job.session_id.clone(),
            project_id: job.project_id.clone(),
            stage: job.stage_slug,
            iteration_number: job.iteration_number,
            owner_user_id: owner.to_string(),
            seed,
            continuation,
        })
    }

    /// Run every model in `models` once, concurrently. Results come back in
    /// the order of `models`.
    async fn run_attempt(
        &self,
        ctx: &Arc<JobContext>,
        models: &[String],
        attempt: u32,
        total_steps: u32,
        completed_steps: &mut u32,
    ) -> Vec<(String, Result<DialecticContribution>)> {
        let semaphore = Arc::new(Semaphore::new(
            self.config.concurrency.max_parallel_models.max(1),
        ));
        let mut join_set = JoinSet::new();

        for model_id in models {
            let worker = ModelWorker {
                ctx: Arc::clone(ctx),
                store: Arc::clone(&self.store),
                adapter: Arc::clone(&self.adapter),
                api_key: self.api_key.clone(),
                emitter: self.emitter.clone(),
                cancel: self.cancel.clone(),
                attempt,
            };
            let semaphore = Arc::clone(&semaphore);
            let model_id = model_id.clone();

            join_set.spawn(async move {
                let result = match semaphore.acquire_owned().await {
                    Ok(_permit) => worker.generate(&model_id).await,
                    Err(_) => Err(DialecticError::Other("model semaphore closed".to_string())),
                };
                (model_id, result)
            });
        }

        let mut results: HashMap<String, Result<DialecticContribution>> = HashMap::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((model_id, result)) => {
                    if result.is_ok() {
                        *completed_steps += 1;
                        self.emitter.emit(
                            &ctx.owner_user_id,
                            notifications::progress_update(
                                &ctx.session_id,
                                ctx.stage,
                                *completed_steps,
                                total_steps,
                                format!("Contribution received from {}", model_id),
                                &ctx.job_id,
                            ),
                        );
                    }
                    results.insert(model_id, result);
                }
                Err(e) => error!(error = %e, "model generation task did not complete"),
            }
        }

        models
            .iter()
            .map(|model_id| {
                let result = results.remove(model_id).unwrap_or_else(|| {
                    Err(DialecticError::Other(format!(
                        "generation task for {} aborted",
                        model_id
                    )))
                });
                (model_id.clone(), result)
            })
            .collect()
    }

    /// Fail a job that never reached its models
    async fn fail_unrecoverable(
        &self,
        job: &GenerationJob,
        owner: Option<&str>,
        status: JobStatus,
        detail: FailureDetail,
    ) -> JobOutcome {
        let status = transition(status, unrecoverable(&detail));
        self.finish_failed(job, owner, status, detail, Vec::new(), Vec::new())
            .await
    }

    /// Record a terminal failure. Without an owner there is no recipient and
    /// the session is left untouched.
    async fn finish_failed(
        &self,
        job: &GenerationJob,
        owner: Option<&str>,
        status: JobStatus,
        detail: FailureDetail,
        contributions: Vec<DialecticContribution>,
        failures: Vec<ModelFailure>,
    ) -> JobOutcome {
        error!(code = %detail.code, error = %detail.message, status = %status, "generation job failed");

        self.record_job_status(&job.job_id, status, Some(&detail)).await;

        if let Some(owner) = owner {
            self.record_session_status(&job.session_id, &job.stage_slug.error_status())
                .await;
            self.emitter.emit(
                owner,
                notifications::generation_failed(
                    &job.session_id,
                    &job.project_id,
                    job.stage_slug.as_str(),
                    detail.clone(),
                    &job.job_id,
                ),
            );
        }

        JobOutcome {
            job_id: job.job_id.clone(),
            status,
            contributions,
            failures,
            error: Some(detail),
        }
    }

    async fn record_job_status(&self, job_id: &str, status: JobStatus, error: Option<&FailureDetail>) {
        fail_open(
            "update_job_status",
            self.store.update_job_status(job_id, status, error),
        )
        .await;
    }

    async fn record_session_status(&self, session_id: &str, status: &str) {
        fail_open(
            "update_session_status",
            self.store.update_session_status(session_id, status),
        )
        .await;
    }
}

/// Everything one model task needs, owned
struct ModelWorker {
    ctx: Arc<JobContext>,
    store: Arc<dyn DialecticStore>,
    adapter: Arc<dyn AiProviderAdapter>,
    api_key: ApiKey,
    emitter: NotificationEmitter,
    cancel: CancellationToken,
    attempt: u32,
}

impl ModelWorker {
    #[instrument(skip(self), fields(attempt = self.attempt))]
    async fn generate(&self, model_id: &str) -> Result<DialecticContribution> {
        let ctx = &self.ctx;
        let provider = self.store.get_provider(model_id).await?;

        if self.attempt == 1 {
            self.emitter.emit(
                &ctx.owner_user_id,
                notifications::contribution_started(
                    &ctx.session_id,
                    &provider.id,
                    ctx.iteration_number,
                    &ctx.job_id,
                ),
            );
        }

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = ctx.seed.system_prompt.as_deref().filter(|s| !s.trim().is_empty()) {
            messages.push(ConversationMessage::system(system));
        }
        messages.push(ConversationMessage::user(ctx.seed.content.clone()));
        let request = ChatRequest::new(ctx.seed.content.clone(), provider.id.clone(), NO_PROMPT_ID)
            .with_messages(messages);

        let template = DialecticContribution::new(
            &ctx.session_id,
            ctx.stage,
            &provider.id,
            &provider.name,
            ctx.iteration_number,
        );
        let observer = FragmentNotifier {
            ctx: Arc::clone(ctx),
            emitter: self.emitter.clone(),
            template: template.clone(),
            calls: AtomicU32::new(0),
        };

        let response = continue_until_complete_with(
            self.adapter.as_ref(),
            request,
            &provider.api_identifier,
            &self.api_key,
            &ctx.continuation,
            &observer,
            &self.cancel,
        )
        .await?;

        let usage = response.usage();
        let mut contribution = template.with_content(response.content, usage);
        contribution.continuations = observer.calls.load(Ordering::SeqCst).saturating_sub(1);

        self.store
            .save_contribution(&contribution)
            .await
            .map_err(|e| match e {
                DialecticError::SaveFailed(_) => e,
                other => DialecticError::SaveFailed(other.to_string()),
            })?;

        debug!(
            contribution_id = %contribution.id,
            total_tokens = usage.total_tokens,
            continuations = contribution.continuations,
            "contribution saved"
        );

        self.emitter.emit(
            &ctx.owner_user_id,
            notifications::contribution_received(
                &ctx.session_id,
                contribution.clone(),
                &ctx.job_id,
                false,
            ),
        );

        Ok(contribution)
    }
}

/// Emits a notification pair for every truncated fragment
struct FragmentNotifier {
    ctx: Arc<JobContext>,
    emitter: NotificationEmitter,
    template: DialecticContribution,
    calls: AtomicU32,
}

impl ContinuationObserver for FragmentNotifier {
    fn on_fragment(&self, progress: &FragmentProgress<'_>) {
        self.calls.store(progress.call_number, Ordering::SeqCst);
        if !progress.will_continue {
            return;
        }

        let ctx = &self.ctx;
        let mut partial = self
            .template
            .clone()
            .with_content(progress.accumulated_content, progress.accumulated_usage);
        partial.continuations = progress.call_number;
        let model_id = partial.model_id.clone();

        self.emitter.emit(
            &ctx.owner_user_id,
            notifications::contribution_received(&ctx.session_id, partial.clone(), &ctx.job_id, true),
        );
        self.emitter.emit(
            &ctx.owner_user_id,
            notifications::generation_continued(
                &ctx.session_id,
                &ctx.project_id,
                &model_id,
                progress.call_number,
                &ctx.job_id,
                partial,
            ),
        );
    }
}

fn detail_of(err: &DialecticError) -> FailureDetail {
    FailureDetail::new(err.failure_code(), err.to_string())
}

fn unrecoverable(detail: &FailureDetail) -> JobEvent {
    JobEvent::Unrecoverable {
        reason: detail.message.clone(),
    }
}

/// One failure keeps its own code; several collapse into RETRY_LOOP_FAILED
fn summarize(failures: &[ModelFailure]) -> FailureDetail {
    let message = failures
        .iter()
        .map(|f| format!("{}: {}", f.model_id, f.error.message))
        .collect::<Vec<_>>()
        .join("; ");

    match failures {
        [only] => FailureDetail::new(only.error.code.clone(), message),
        _ => FailureDetail::new(RETRY_LOOP_FAILED, message),
    }
}

fn dedup(models: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    models
        .iter()
        .filter(|m| seen.insert(m.as_str()))
        .cloned()
        .collect()
}
