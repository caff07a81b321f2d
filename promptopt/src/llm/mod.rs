//! Model Client: one generation call against a configured provider, with a
//! fixed retry policy. Failures never escape as `Err`; they come back inside
//! [`ModelResponse::error`] so callers always get a well-formed response.

pub mod openai;

use crate::config::{ModelSpec, ProviderKind, ProviderSettings, RetryPolicy};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A structured-output schema the model is asked to fill by "calling" it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments.
    pub parameters: Value,
}

/// Forces the model to answer through the named function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallDirective {
    pub name: String,
}

impl FunctionCallDirective {
    pub fn force(spec: &FunctionSpec) -> Self {
        Self {
            name: spec.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRequest {
    pub model: String,
    pub prompt: String,
    pub temperature: f64,
    pub function: Option<FunctionSpec>,
    pub function_call: Option<FunctionCallDirective>,
}

/// A structured call result and a free-text message are alternatives; at most
/// one is normally set. `error` is set only when every attempt failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub function: Option<FunctionCall>,
    pub message: Option<String>,
    pub error: Option<String>,
    pub raw_response: Value,
    pub provider: String,
}

impl ModelResponse {
    pub fn failed(provider: &str, error: impl Into<String>) -> Self {
        let error = error.into();
        Self {
            function: None,
            message: None,
            raw_response: Value::String(error.clone()),
            error: Some(error),
            provider: provider.to_string(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The free-text message, or empty.
    pub fn text(&self) -> &str {
        self.message.as_deref().unwrap_or_default()
    }

    /// Arguments of the structured call when it was made to `name`.
    pub fn function_data(&self, name: &str) -> Option<&Value> {
        self.function
            .as_ref()
            .filter(|f| f.name == name)
            .map(|f| &f.data)
    }
}

/// A successful provider round trip.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderReply {
    pub function: Option<FunctionCall>,
    pub message: Option<String>,
    pub raw: Value,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub message: String,
    /// Worth another attempt (network trouble, rate limits, server errors).
    pub transient: bool,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn send(
        &self,
        request: &ModelRequest,
    ) -> std::result::Result<ProviderReply, ProviderError>;
    fn name(&self) -> &'static str;
}

#[tracing::instrument(level = "debug", skip(settings))]
pub fn build_provider(
    kind: ProviderKind,
    settings: &ProviderSettings,
) -> Result<Arc<dyn ProviderApi>> {
    match kind {
        ProviderKind::OpenAi => Ok(Arc::new(openai::OpenAiProvider::new(settings)?)),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_name: String,
    pub temperature: f64,
    pub provider: String,
}

#[derive(Clone)]
pub struct ModelClient {
    spec: ModelSpec,
    provider: Arc<dyn ProviderApi>,
    retry: RetryPolicy,
}

impl ModelClient {
    #[tracing::instrument(skip_all)]
    pub fn new(spec: ModelSpec, provider: Arc<dyn ProviderApi>, retry: RetryPolicy) -> Self {
        Self {
            spec,
            provider,
            retry,
        }
    }

    pub fn model_info(&self) -> ModelInfo {
        ModelInfo {
            model_name: self.spec.model.clone(),
            temperature: self.spec.temperature,
            provider: self.provider.name().to_string(),
        }
    }

    /// Free-text generation.
    pub async fn complete(&self, prompt: &str) -> ModelResponse {
        self.generate(prompt, None, None).await
    }

    #[tracing::instrument(skip_all, fields(model = %self.spec.model))]
    pub async fn generate(
        &self,
        prompt: &str,
        function: Option<&FunctionSpec>,
        function_call: Option<&FunctionCallDirective>,
    ) -> ModelResponse {
        let request = ModelRequest {
            model: self.spec.model.clone(),
            prompt: prompt.to_string(),
            temperature: self.spec.temperature,
            function: function.cloned(),
            function_call: function_call.cloned(),
        };
        let provider = self.provider.name();
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.provider.send(&request).await {
                Ok(reply) => {
                    return ModelResponse {
                        function: reply.function,
                        message: reply.message,
                        error: None,
                        raw_response: reply.raw,
                        provider: provider.to_string(),
                    }
                }
                Err(e) => {
                    if !e.transient || attempt >= attempts {
                        tracing::warn!(
                            attempt,
                            transient = e.transient,
                            error = %e,
                            "model request failed; giving up"
                        );
                        return ModelResponse::failed(provider, e.message);
                    }
                    tracing::warn!(attempt, error = %e, "model request failed; retrying");
                    if self.retry.delay_ms > 0 {
                        tokio::time::sleep(self.retry.delay()).await;
                    }
                }
            }
        }

        ModelResponse::failed(provider, "unreachable retry loop")
    }
}
