//! Continuation loop - assemble one complete answer from truncated calls
//!
//! Each call depends on the full history of the previous ones, so calls are
//! strictly sequential. The request is owned by the loop and only grows:
//! after a truncated fragment the fragment is appended as an assistant turn
//! and the conversation is sent again.

use crate::AiProviderAdapter;
use dialectic_core::{
    AdapterResponse, ApiKey, ChatRequest, ContinuationConfig, ConversationMessage, DialecticError,
    FinishReason, Result, TokenUsage,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Whether a fragment with `finish_reason` should be continued.
///
/// Only `length` continues. `max_tokens`, `unknown` and a missing reason are
/// terminal here even though they can also mean the answer was cut short.
pub fn should_continue(
    finish_reason: Option<&FinishReason>,
    continuation_count: u32,
    max_continuations: u32,
) -> bool {
    continuation_count < max_continuations && matches!(finish_reason, Some(FinishReason::Length))
}

/// Snapshot handed to a [`ContinuationObserver`] after every provider call
#[derive(Debug)]
pub struct FragmentProgress<'a> {
    /// 1-based index of the call that produced `response`
    pub call_number: u32,
    pub response: &'a AdapterResponse,
    /// All content received so far, this fragment included
    pub accumulated_content: &'a str,
    /// Usage summed so far (total already finalized)
    pub accumulated_usage: TokenUsage,
    /// Whether another call will follow
    pub will_continue: bool,
}

/// Hook invoked synchronously between provider calls
pub trait ContinuationObserver: Send + Sync {
    fn on_fragment(&self, _progress: &FragmentProgress<'_>) {}
}

/// Observer that ignores every fragment
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ContinuationObserver for NoopObserver {}

/// Drive `adapter` until the provider signals completion or the
/// continuation budget in `config` runs out.
///
/// The returned response carries the concatenated content, the summed token
/// usage and `finish_reason == stop`.
pub async fn continue_until_complete<A>(
    adapter: &A,
    initial_request: ChatRequest,
    model_identifier: &str,
    api_key: &ApiKey,
    config: &ContinuationConfig,
) -> Result<AdapterResponse>
where
    A: AiProviderAdapter + ?Sized,
{
    continue_until_complete_with(
        adapter,
        initial_request,
        model_identifier,
        api_key,
        config,
        &NoopObserver,
        &CancellationToken::new(),
    )
    .await
}

/// [`continue_until_complete`] with a fragment observer and cancellation.
///
/// Cancellation is checked before every call. An in-flight call is never
/// interrupted; a cancelled loop returns [`DialecticError::Cancelled`].
#[instrument(
    skip_all,
    fields(model = %model_identifier, provider = adapter.provider_name())
)]
pub async fn continue_until_complete_with<A, O>(
    adapter: &A,
    initial_request: ChatRequest,
    model_identifier: &str,
    api_key: &ApiKey,
    config: &ContinuationConfig,
    observer: &O,
    cancel: &CancellationToken,
) -> Result<AdapterResponse>
where
    A: AiProviderAdapter + ?Sized,
    O: ContinuationObserver + ?Sized,
{
    let mut request = initial_request;
    let mut content = String::new();
    let mut usage = TokenUsage::default();
    let mut continuation_count: u32 = 0;
    let mut last_response: Option<AdapterResponse> = None;

    while continuation_count <= config.max_continuations {
        if cancel.is_cancelled() {
            warn!(
                calls_made = continuation_count,
                "generation cancelled between provider calls"
            );
            return Err(DialecticError::Cancelled(format!(
                "cancelled after {} provider call(s)",
                continuation_count
            )));
        }

        let call_number = continuation_count + 1;
        debug!(
            call = call_number,
            max_calls = config.max_calls(),
            history_len = request.messages.len(),
            "sending request to provider"
        );

        let response = adapter
            .send_message(&request, model_identifier, api_key)
            .await?;

        match &response.token_usage {
            Some(reported) => usage.accumulate(reported),
            None => debug!(call = call_number, "provider reported no token usage, counting as zero"),
        }
        content.push_str(&response.content);

        let will_continue = should_continue(
            response.finish_reason.as_ref(),
            continuation_count,
            config.max_continuations,
        );

        observer.on_fragment(&FragmentProgress {
            call_number,
            response: &response,
            accumulated_content: &content,
            accumulated_usage: usage.finalize(),
            will_continue,
        });

        if !will_continue {
            if response.finish_reason == Some(FinishReason::Length) {
                warn!(
                    calls = call_number,
                    max_continuations = config.max_continuations,
                    "continuation budget exhausted, returning accumulated content"
                );
            } else {
                debug!(
                    calls = call_number,
                    finish_reason = ?response.finish_reason,
                    "provider response complete"
                );
            }
            last_response = Some(response);
            break;
        }

        continuation_count += 1;
        info!(
            continuation = continuation_count,
            fragment_len = response.content.len(),
            "response truncated, requesting continuation"
        );
        request
            .messages
            .push(ConversationMessage::assistant(response.content.clone()));
        last_response = Some(response);
    }

    let last = last_response.ok_or(DialecticError::NoResponse)?;

    Ok(AdapterResponse {
        content,
        token_usage: Some(usage.finalize()),
        finish_reason: Some(FinishReason::Stop),
        ..last
    })
}
