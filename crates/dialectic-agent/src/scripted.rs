//! Scripted adapter for tests and offline runs
//!
//! Replays queued replies in order and records every request it sees, so
//! tests can assert on call counts and on how the history grew.

use crate::AiProviderAdapter;
use async_trait::async_trait;
use dialectic_core::{
    AdapterResponse, ApiKey, ChatRequest, DialecticError, FinishReason, ModelDescriptor, Result,
    TokenUsage,
};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Reply {
    content: String,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
}

#[derive(Default)]
struct Script {
    /// Replies for a specific model identifier
    per_model: HashMap<String, VecDeque<Result<Reply>>>,
    /// Replies for any model without its own queue
    shared: VecDeque<Result<Reply>>,
    /// Served once the queues run dry
    repeat: Option<Reply>,
    requests: Vec<(String, ChatRequest)>,
}

/// Adapter that answers from a script instead of the network
#[derive(Default)]
pub struct ScriptedAdapter {
    script: Mutex<Script>,
    delay: Option<Duration>,
    models: Vec<ModelDescriptor>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for any model
    pub fn reply(self, content: impl Into<String>, finish_reason: Option<FinishReason>) -> Self {
        self.push(None, Ok(reply(content, finish_reason, None)))
    }

    /// Queue a reply that reports token usage
    pub fn reply_with_usage(
        self,
        content: impl Into<String>,
        finish_reason: Option<FinishReason>,
        usage: TokenUsage,
    ) -> Self {
        self.push(None, Ok(reply(content, finish_reason, Some(usage))))
    }

    /// Queue a reply for one model identifier
    pub fn reply_for(
        self,
        model_identifier: &str,
        content: impl Into<String>,
        finish_reason: Option<FinishReason>,
        usage: Option<TokenUsage>,
    ) -> Self {
        self.push(
            Some(model_identifier),
            Ok(reply(content, finish_reason, usage)),
        )
    }

    /// Queue a failure for any model
    pub fn fail(self, error: DialecticError) -> Self {
        self.push(None, Err(error))
    }

    /// Queue a failure for one model identifier
    pub fn fail_for(self, model_identifier: &str, error: DialecticError) -> Self {
        self.push(Some(model_identifier), Err(error))
    }

    /// Reply used forever once every queue is empty
    pub fn repeat(self, content: impl Into<String>, finish_reason: Option<FinishReason>) -> Self {
        self.lock().repeat = Some(reply(content, finish_reason, None));
        self
    }

    /// Sleep before answering each call
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Catalogue returned by `list_models`
    pub fn with_models(mut self, models: Vec<ModelDescriptor>) -> Self {
        self.models = models;
        self
    }

    /// Number of calls received so far
    pub fn calls(&self) -> usize {
        self.lock().requests.len()
    }

    /// Every request received, in order
    pub fn requests(&self) -> Vec<ChatRequest> {
        self.lock().requests.iter().map(|(_, r)| r.clone()).collect()
    }

    /// Requests received for one model identifier
    pub fn requests_for(&self, model_identifier: &str) -> Vec<ChatRequest> {
        self.lock()
            .requests
            .iter()
            .filter(|(m, _)| m == model_identifier)
            .map(|(_, r)| r.clone())
            .collect()
    }

    fn push(self, model: Option<&str>, step: Result<Reply>) -> Self {
        {
            let mut script = self.lock();
            match model {
                Some(m) => script.per_model.entry(m.to_string()).or_default().push_back(step),
                None => script.shared.push_back(step),
            }
        }
        self
    }

    fn lock(&self) -> MutexGuard<'_, Script> {
        self.script.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn reply(
    content: impl Into<String>,
    finish_reason: Option<FinishReason>,
    usage: Option<TokenUsage>,
) -> Reply {
    Reply {
        content: content.into(),
        finish_reason,
        usage,
    }
}

#[async_trait]
impl AiProviderAdapter for ScriptedAdapter {
    async fn send_message(
        &self,
        request: &ChatRequest,
        model_identifier: &str,
        _api_key: &ApiKey,
    ) -> Result<AdapterResponse> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let step = {
            let mut script = self.lock();
            script
                .requests
                .push((model_identifier.to_string(), request.clone()));

            let own = script
                .per_model
                .get_mut(model_identifier)
                .and_then(|queue| queue.pop_front());
            match own.or_else(|| script.shared.pop_front()) {
                Some(step) => step,
                None => script.repeat.clone().ok_or_else(|| {
                    DialecticError::Provider(format!(
                        "Script exhausted for model {}",
                        model_identifier
                    ))
                }),
            }
        };

        let reply = step?;
        let mut response = AdapterResponse::assistant(request, reply.content, reply.finish_reason);
        response.token_usage = reply.usage;
        Ok(response)
    }

    async fn list_models(&self, _api_key: &ApiKey) -> Result<Vec<ModelDescriptor>> {
        Ok(self.models.clone())
    }

    fn provider_name(&self) -> &str {
        "scripted"
    }
}
