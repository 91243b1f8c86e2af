//! End-to-end generation jobs against the scripted adapter and in-memory store

use async_trait::async_trait;
use dialectic_agent::{AiProviderAdapter, ScriptedAdapter};
use dialectic_core::{
    AdapterResponse, ApiKey, ChatRequest, DialecticConfig, DialecticError, FinishReason,
    ModelDescriptor, StageSlug, TokenUsage,
};
use dialectic_orchestrator::{
    DialecticStore, GenerationJob, InMemoryStore, JobOutcome, JobStatus, MemorySink,
    NotificationDispatcher, NotificationEvent, ProjectRecord, ProviderRecord, SeedPrompt,
    SessionRecord, StageOrchestrator, RETRY_LOOP_FAILED,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const OWNER: &str = "user-1";

fn seeded_store() -> InMemoryStore {
    InMemoryStore::new()
        .with_session(SessionRecord::new("sess-1", "proj-1").with_status("pending_thesis"))
        .with_project(ProjectRecord {
            id: "proj-1".to_string(),
            name: "Stories".to_string(),
            owner_user_id: OWNER.to_string(),
        })
        .with_provider(ProviderRecord::new("model-a", "Model A", "claude-a"))
        .with_provider(ProviderRecord::new("model-b", "Model B", "claude-b"))
        .with_seed_prompt(
            "sess-1",
            StageSlug::Thesis,
            1,
            SeedPrompt {
                content: "Tell me a story".to_string(),
                system_prompt: None,
            },
        )
}

fn job(models: &[&str]) -> GenerationJob {
    GenerationJob::new(
        "sess-1",
        "proj-1",
        StageSlug::Thesis,
        models.iter().map(|m| m.to_string()).collect(),
    )
    .with_owner(OWNER)
}

struct Run {
    outcome: JobOutcome,
    sink: MemorySink,
    store: Arc<InMemoryStore>,
    adapter: Arc<ScriptedAdapter>,
}

async fn run(
    store: InMemoryStore,
    adapter: ScriptedAdapter,
    job: GenerationJob,
    cancel: CancellationToken,
) -> Run {
    let store = Arc::new(store);
    let adapter = Arc::new(adapter);
    let sink = MemorySink::new();
    let dispatcher = NotificationDispatcher::spawn(sink.clone());

    let outcome = {
        let orchestrator = StageOrchestrator::new(
            store.clone(),
            adapter.clone(),
            ApiKey::new("test-key"),
            dispatcher.emitter(),
            DialecticConfig::default(),
        )
        .with_cancellation(cancel);
        orchestrator.run(job).await
    };
    dispatcher.finish().await;

    Run {
        outcome,
        sink,
        store,
        adapter,
    }
}

#[tokio::test]
async fn test_story_is_continued_and_saved() {
    let adapter = ScriptedAdapter::new()
        .reply_for(
            "claude-a",
            "Part 1.",
            Some(FinishReason::Length),
            Some(TokenUsage::new(10, 20)),
        )
        .reply_for(
            "claude-a",
            " Part 2.",
            Some(FinishReason::Stop),
            Some(TokenUsage::new(30, 15)),
        );

    let job = job(&["model-a"]);
    let job_id = job.job_id.clone();
    let run = run(seeded_store(), adapter, job, CancellationToken::new()).await;

    assert!(run.outcome.is_success());
    assert_eq!(run.outcome.contributions.len(), 1);
    let contribution = &run.outcome.contributions[0];
    assert_eq!(contribution.content, "Part 1. Part 2.");
    assert_eq!(contribution.token_usage.total_tokens, 75);
    assert_eq!(contribution.continuations, 1);
    assert_eq!(contribution.model_name, "Model A");

    // The second call carried the first fragment as an assistant turn
    let requests = run.adapter.requests_for("claude-a");
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].messages.len(), 2);
    assert_eq!(requests[1].messages[1].content, "Part 1.");

    assert_eq!(
        run.sink.types(),
        vec![
            "contribution_generation_started",
            "dialectic_progress_update",
            "dialectic_contribution_started",
            "dialectic_contribution_received",
            "contribution_generation_continued",
            "dialectic_contribution_received",
            "dialectic_progress_update",
            "contribution_generation_complete",
        ]
    );

    let events = run.sink.events();
    match &events[1] {
        NotificationEvent::ProgressUpdate(p) => {
            assert_eq!(p.current_step, 0);
            assert_eq!(p.total_steps, 1);
            assert_eq!(p.message, "Starting Thesis stage...");
        }
        other => panic!("unexpected event {:?}", other),
    }
    match &events[3] {
        NotificationEvent::ContributionReceived(p) => {
            assert!(p.is_continuing);
            assert_eq!(p.contribution.content, "Part 1.");
        }
        other => panic!("unexpected event {:?}", other),
    }
    match &events[5] {
        NotificationEvent::ContributionReceived(p) => assert!(!p.is_continuing),
        other => panic!("unexpected event {:?}", other),
    }
    assert!(run.sink.notifications().iter().all(|n| n.target_user_id == OWNER));

    let saved = run
        .store
        .list_contributions("sess-1", Some(StageSlug::Thesis))
        .await
        .unwrap();
    assert_eq!(saved.len(), 1);
    assert_eq!(
        run.store.session_status("sess-1").await.as_deref(),
        Some("thesis_complete")
    );
    let history: Vec<JobStatus> = run
        .store
        .job_history(&job_id)
        .await
        .into_iter()
        .map(|u| u.status)
        .collect();
    assert_eq!(history, vec![JobStatus::Processing, JobStatus::Completed]);
}

#[tokio::test]
async fn test_each_model_gets_its_own_contribution() {
    let adapter = ScriptedAdapter::new()
        .reply_for("claude-a", "A says hi", Some(FinishReason::Stop), None)
        .reply_for("claude-b", "B says hi", Some(FinishReason::Stop), None);

    let run = run(
        seeded_store(),
        adapter,
        job(&["model-a", "model-b"]),
        CancellationToken::new(),
    )
    .await;

    assert!(run.outcome.is_success());
    let mut contents: Vec<_> = run
        .outcome
        .contributions
        .iter()
        .map(|c| c.content.clone())
        .collect();
    contents.sort();
    assert_eq!(contents, vec!["A says hi", "B says hi"]);
    assert_eq!(run.sink.count_of("dialectic_contribution_started"), 2);
    assert_eq!(run.sink.count_of("dialectic_progress_update"), 3);
    assert_eq!(run.sink.count_of("contribution_generation_complete"), 1);
}

#[tokio::test]
async fn test_transient_failure_is_retried() {
    let adapter = ScriptedAdapter::new()
        .reply_for("claude-a", "steady", Some(FinishReason::Stop), None)
        .fail_for("claude-b", DialecticError::Timeout(30))
        .reply_for("claude-b", "recovered", Some(FinishReason::Stop), None);

    let job = job(&["model-a", "model-b"]);
    let job_id = job.job_id.clone();
    let run = run(seeded_store(), adapter, job, CancellationToken::new()).await;

    assert!(run.outcome.is_success());
    assert_eq!(run.outcome.contributions.len(), 2);
    assert_eq!(run.adapter.requests_for("claude-a").len(), 1);
    assert_eq!(run.adapter.requests_for("claude-b").len(), 2);

    let retrying: Vec<_> = run
        .sink
        .events()
        .into_iter()
        .filter_map(|e| match e {
            NotificationEvent::GenerationRetrying(p) => Some(p),
            _ => None,
        })
        .collect();
    assert_eq!(retrying.len(), 1);
    assert_eq!(retrying[0].model_id, "model-b");
    assert_eq!(retrying[0].attempt, 2);
    assert!(retrying[0].error.contains("timed out"));

    // contribution_started only on the first attempt
    assert_eq!(run.sink.count_of("dialectic_contribution_started"), 2);

    let history: Vec<JobStatus> = run
        .store
        .job_history(&job_id)
        .await
        .into_iter()
        .map(|u| u.status)
        .collect();
    assert_eq!(
        history,
        vec![JobStatus::Processing, JobStatus::Retrying, JobStatus::Completed]
    );
}

#[tokio::test]
async fn test_retries_exhausted() {
    let adapter = ScriptedAdapter::new()
        .fail_for("claude-a", DialecticError::Provider("502 bad gateway".to_string()))
        .fail_for("claude-a", DialecticError::Provider("502 bad gateway".to_string()));

    let run = run(
        seeded_store(),
        adapter,
        job(&["model-a"]).with_max_retries(2),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(run.outcome.status, JobStatus::RetryLoopFailed);
    assert_eq!(run.adapter.calls(), 2);
    assert_eq!(run.outcome.failures.len(), 1);
    assert_eq!(run.outcome.failures[0].attempts, 2);
    assert_eq!(run.sink.count_of("contribution_generation_complete"), 0);
    assert_eq!(run.sink.count_of("contribution_generation_failed"), 1);
    assert_eq!(
        run.store.session_status("sess-1").await.as_deref(),
        Some("thesis_error")
    );
}

#[tokio::test]
async fn test_context_window_fails_without_retry() {
    let adapter = ScriptedAdapter::new()
        .fail_for("claude-a", DialecticError::ContextWindow("prompt is too long".to_string()))
        .reply_for("claude-a", "never", Some(FinishReason::Stop), None);

    let run = run(
        seeded_store(),
        adapter,
        job(&["model-a"]),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert_eq!(run.adapter.calls(), 1);
    assert_eq!(run.sink.count_of("contribution_generation_retrying"), 0);

    let records = run.sink.records().unwrap();
    let failed: Vec<_> = records.iter().filter(|r| !r.is_internal_event).collect();
    assert_eq!(failed.len(), 1);
    let failed = failed[0];
    assert_eq!(failed.notification_type, "contribution_generation_failed");
    assert_eq!(failed.title.as_deref(), Some("Contribution Generation Failed"));
    assert!(failed.message.as_deref().unwrap().contains("thesis"));
    assert!(failed.message.as_deref().unwrap().contains("prompt is too long"));
    assert_eq!(failed.link_path.as_deref(), Some("/projects/proj-1/sessions/sess-1"));
    assert_eq!(failed.data["error"]["code"], "CONTEXT_WINDOW_ERROR");
}

#[tokio::test]
async fn test_several_failing_models_are_summarised_once() {
    let adapter = ScriptedAdapter::new()
        .fail_for("claude-a", DialecticError::Provider("down".to_string()))
        .fail_for("claude-b", DialecticError::Provider("down".to_string()));

    let run = run(
        seeded_store(),
        adapter,
        job(&["model-a", "model-b"]).with_max_retries(1),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(run.outcome.status, JobStatus::RetryLoopFailed);
    assert_eq!(run.sink.count_of("contribution_generation_failed"), 1);
    let error = run.outcome.error.unwrap();
    assert_eq!(error.code, RETRY_LOOP_FAILED);
    assert!(error.message.contains("model-a"));
    assert!(error.message.contains("model-b"));
}

#[tokio::test]
async fn test_save_failure_is_not_retried() {
    let adapter = ScriptedAdapter::new().repeat("content", Some(FinishReason::Stop));

    let run = run(
        seeded_store().rejecting_saves_for("model-a"),
        adapter,
        job(&["model-a"]),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert_eq!(run.adapter.calls(), 1);
    assert_eq!(run.outcome.error.unwrap().code, "SAVE_FAILED");
}

#[tokio::test]
async fn test_disabled_continuation_makes_single_call() {
    let adapter = ScriptedAdapter::new().repeat("cut off", Some(FinishReason::Length));

    let run = run(
        seeded_store(),
        adapter,
        job(&["model-a"]).with_continuation(false),
        CancellationToken::new(),
    )
    .await;

    assert!(run.outcome.is_success());
    assert_eq!(run.adapter.calls(), 1);
    assert_eq!(run.outcome.contributions[0].continuations, 0);
    assert_eq!(run.sink.count_of("contribution_generation_continued"), 0);
}

#[tokio::test]
async fn test_missing_owner_fails_silently() {
    let adapter = ScriptedAdapter::new().repeat("unused", Some(FinishReason::Stop));
    let mut job = job(&["model-a"]);
    job.owner_user_id = None;
    let job_id = job.job_id.clone();

    let run = run(seeded_store(), adapter, job, CancellationToken::new()).await;

    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert!(run.sink.is_empty());
    assert_eq!(run.adapter.calls(), 0);
    assert_eq!(run.store.job_status(&job_id).await, Some(JobStatus::Failed));
    // The session is not touched
    assert_eq!(
        run.store.session_status("sess-1").await.as_deref(),
        Some("pending_thesis")
    );
}

#[tokio::test]
async fn test_no_models_is_invalid() {
    let run = run(
        seeded_store(),
        ScriptedAdapter::new(),
        job(&[]),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert_eq!(run.outcome.error.unwrap().code, "INVALID_PAYLOAD");
    assert_eq!(run.sink.types(), vec!["contribution_generation_failed"]);
}

#[tokio::test]
async fn test_missing_seed_prompt_is_unrecoverable() {
    let adapter = ScriptedAdapter::new().repeat("unused", Some(FinishReason::Stop));
    let mut job = job(&["model-a"]);
    job.stage_slug = StageSlug::Antithesis;

    let run = run(seeded_store(), adapter, job, CancellationToken::new()).await;

    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert_eq!(run.outcome.error.unwrap().code, "INVALID_INITIAL_PROMPT");
    assert_eq!(run.adapter.calls(), 0);
    assert_eq!(
        run.store.session_status("sess-1").await.as_deref(),
        Some("antithesis_error")
    );
}

#[tokio::test]
async fn test_unknown_provider_fails_model() {
    let run = run(
        seeded_store(),
        ScriptedAdapter::new(),
        job(&["model-z"]),
        CancellationToken::new(),
    )
    .await;

    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert_eq!(run.outcome.error.unwrap().code, "PROVIDER_CONFIG_INVALID");
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let token = CancellationToken::new();
    token.cancel();
    let adapter = ScriptedAdapter::new().repeat("unused", Some(FinishReason::Stop));

    let run = run(seeded_store(), adapter, job(&["model-a"]), token).await;

    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert_eq!(run.outcome.error.unwrap().code, "CANCELLED");
    assert_eq!(run.adapter.calls(), 0);
    assert_eq!(run.sink.count_of("contribution_generation_complete"), 0);
    assert_eq!(run.sink.count_of("contribution_generation_failed"), 1);
}

#[tokio::test]
async fn test_cancelled_between_continuations() {
    let token = CancellationToken::new();
    let adapter = ScriptedAdapter::new()
        .repeat("more", Some(FinishReason::Length))
        .with_delay(Duration::from_millis(200));

    let canceller = {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            token.cancel();
        })
    };

    let run = run(seeded_store(), adapter, job(&["model-a"]), token).await;
    canceller.await.unwrap();

    // The in-flight call finishes, the next one is never sent
    assert_eq!(run.adapter.calls(), 1);
    assert_eq!(run.outcome.status, JobStatus::Failed);
    assert_eq!(run.outcome.error.unwrap().code, "CANCELLED");
    assert_eq!(run.sink.count_of("contribution_generation_complete"), 0);
    assert_eq!(run.sink.count_of("contribution_generation_failed"), 1);
}

#[tokio::test]
async fn test_resume_stage_reads_session_status() {
    let store = Arc::new(
        seeded_store().with_session(SessionRecord::new("sess-2", "proj-1").with_status("synthesis_error")),
    );
    let dispatcher = NotificationDispatcher::spawn(MemorySink::new());
    let orchestrator = StageOrchestrator::new(
        store.clone(),
        Arc::new(ScriptedAdapter::new()),
        ApiKey::new("k"),
        dispatcher.emitter(),
        DialecticConfig::default(),
    );

    assert_eq!(
        orchestrator.resume_stage("sess-1").await.unwrap(),
        Some(StageSlug::Thesis)
    );
    assert_eq!(
        orchestrator.resume_stage("sess-2").await.unwrap(),
        Some(StageSlug::Synthesis)
    );
    assert!(orchestrator.resume_stage("missing").await.is_err());

    store.update_session_status("sess-1", "").await.unwrap();
    assert_eq!(orchestrator.resume_stage("sess-1").await.unwrap(), None);
}

/// Counts how many calls are in flight at once
struct InFlightCounter {
    inner: ScriptedAdapter,
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl InFlightCounter {
    fn new(inner: ScriptedAdapter) -> Self {
        Self {
            inner,
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AiProviderAdapter for InFlightCounter {
    async fn send_message(
        &self,
        request: &ChatRequest,
        model_identifier: &str,
        api_key: &ApiKey,
    ) -> dialectic_core::Result<AdapterResponse> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let result = self.inner.send_message(request, model_identifier, api_key).await;
        self.current.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn list_models(&self, api_key: &ApiKey) -> dialectic_core::Result<Vec<ModelDescriptor>> {
        self.inner.list_models(api_key).await
    }

    fn provider_name(&self) -> &str {
        "counting"
    }
}

async fn peak_concurrency(max_parallel_models: usize) -> (JobOutcome, usize) {
    let adapter = Arc::new(InFlightCounter::new(
        ScriptedAdapter::new()
            .repeat("done", Some(FinishReason::Stop))
            .with_delay(Duration::from_millis(50)),
    ));
    let mut config = DialecticConfig::default();
    config.concurrency.max_parallel_models = max_parallel_models;

    let dispatcher = NotificationDispatcher::spawn(MemorySink::new());
    let outcome = {
        let orchestrator = StageOrchestrator::new(
            Arc::new(seeded_store()),
            adapter.clone(),
            ApiKey::new("test-key"),
            dispatcher.emitter(),
            config,
        );
        orchestrator.run(job(&["model-a", "model-b"])).await
    };
    dispatcher.finish().await;

    (outcome, adapter.peak.load(Ordering::SeqCst))
}

#[tokio::test]
async fn test_parallel_limit_of_one_runs_models_in_turn() {
    let (outcome, peak) = peak_concurrency(1).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.contributions.len(), 2);
    assert_eq!(peak, 1);
}

#[tokio::test]
async fn test_models_overlap_when_limit_allows() {
    let (outcome, peak) = peak_concurrency(2).await;
    assert!(outcome.is_success());
    assert_eq!(peak, 2);
}
