use async_trait::async_trait;
use serde_json::{json, Value};

use super::{FunctionCall, ModelRequest, ProviderApi, ProviderError, ProviderReply};
use crate::config::ProviderSettings;
use crate::{PromptOptError, Result};

/// OpenAI-compatible Chat Completions endpoint.
#[derive(Clone)]
pub struct OpenAiProvider {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
}

impl OpenAiProvider {
    #[tracing::instrument(level = "debug", skip(settings))]
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let api_key = settings
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| {
                PromptOptError::InvalidConfig("OpenAI API key not configured".to_string())
            })?;
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            client,
            api_base: normalize_api_base(&settings.api_base),
            api_key,
        })
    }

    async fn send_chat(
        &self,
        request: &ModelRequest,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        let url = format!("{}/chat/completions", self.api_base);
        let payload = chat_payload(request);

        let response = self
            .client
            .post(url)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|err| ProviderError::transient(format!("llm request failed: {err}")))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_else(|_| "unknown".to_string());
            let message = format!("llm request failed ({status}): {body}");
            return Err(if is_transient_status(status.as_u16()) {
                ProviderError::transient(message)
            } else {
                ProviderError::permanent(message)
            });
        }

        let value: Value = response
            .json()
            .await
            .map_err(|err| ProviderError::transient(format!("llm response parse failed: {err}")))?;
        parse_chat_reply(value)
    }
}

#[async_trait]
impl ProviderApi for OpenAiProvider {
    #[tracing::instrument(level = "debug", skip_all, fields(model = %request.model))]
    async fn send(
        &self,
        request: &ModelRequest,
    ) -> std::result::Result<ProviderReply, ProviderError> {
        self.send_chat(request).await
    }

    fn name(&self) -> &'static str {
        "OpenAIProvider"
    }
}

pub(crate) fn chat_payload(request: &ModelRequest) -> Value {
    let mut payload = json!({
        "model": request.model,
        "messages": [{"role": "user", "content": request.prompt}],
        "temperature": request.temperature,
    });
    if let Some(obj) = payload.as_object_mut() {
        if let Some(function) = &request.function {
            obj.insert(
                "tools".to_string(),
                json!([{
                    "type": "function",
                    "function": {
                        "name": function.name,
                        "description": function.description,
                        "parameters": function.parameters,
                    }
                }]),
            );
        }
        if let Some(call) = &request.function_call {
            obj.insert(
                "tool_choice".to_string(),
                json!({"type": "function", "function": {"name": call.name}}),
            );
        }
    }
    payload
}

pub(crate) fn parse_chat_reply(value: Value) -> std::result::Result<ProviderReply, ProviderError> {
    let message = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|choices| choices.first())
        .and_then(|first| first.get("message"))
        .ok_or_else(|| ProviderError::transient("llm response has no choices[0].message"))?;

    if let Some((name, arguments)) = extract_function_call(message) {
        let data: Value = serde_json::from_str(arguments).map_err(|err| {
            ProviderError::transient(format!("function call arguments are not JSON: {err}"))
        })?;
        let function = FunctionCall {
            name: name.to_string(),
            data,
        };
        return Ok(ProviderReply {
            function: Some(function),
            message: None,
            raw: value,
        });
    }

    let content = message
        .get("content")
        .and_then(|v| v.as_str())
        .map(|v| v.to_string());
    Ok(ProviderReply {
        function: None,
        message: content,
        raw: value,
    })
}

/// `tool_calls[0].function` first, then the legacy `function_call` field.
fn extract_function_call(message: &Value) -> Option<(&str, &str)> {
    let call = message
        .get("tool_calls")
        .and_then(|v| v.as_array())
        .and_then(|calls| calls.first())
        .and_then(|first| first.get("function"))
        .or_else(|| message.get("function_call").filter(|v| !v.is_null()))?;
    let name = call.get("name")?.as_str()?;
    let arguments = call.get("arguments")?.as_str()?;
    Some((name, arguments))
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 429) || (500..600).contains(&status)
}

fn normalize_api_base(base: &str) -> String {
    let trimmed = base.trim().trim_end_matches('/');
    trimmed.trim_end_matches("/chat/completions").to_string()
}
