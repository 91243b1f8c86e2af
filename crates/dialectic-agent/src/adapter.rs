//! Provider adapter abstraction

use async_trait::async_trait;
use dialectic_core::{AdapterResponse, ApiKey, ChatRequest, ModelDescriptor, Result};

/// One AI provider.
///
/// Implementations own the wire protocol and the per-call timeout; a timeout
/// surfaces as [`DialecticError::Timeout`](dialectic_core::DialecticError),
/// never as a finish reason.
#[async_trait]
pub trait AiProviderAdapter: Send + Sync {
    /// Send the full conversation in `request` and return one response
    async fn send_message(
        &self,
        request: &ChatRequest,
        model_identifier: &str,
        api_key: &ApiKey,
    ) -> Result<AdapterResponse>;

    /// Models this provider offers
    async fn list_models(&self, api_key: &ApiKey) -> Result<Vec<ModelDescriptor>>;

    /// Short provider name for logs
    fn provider_name(&self) -> &str;
}
