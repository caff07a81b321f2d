#![cfg(test)]

use crate::llm::{FunctionCall, ModelRequest, ProviderApi, ProviderError, ProviderReply};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::Mutex;

type Responder = Box<dyn Fn(&ModelRequest) -> Result<ProviderReply, ProviderError> + Send + Sync>;

/// Provider double. Replays queued replies in order, then falls back to the
/// responder (if any), and records every request it sees.
pub(crate) struct ScriptedProvider {
    queue: Mutex<VecDeque<Result<ProviderReply, ProviderError>>>,
    responder: Option<Responder>,
    requests: Mutex<Vec<ModelRequest>>,
}

impl ScriptedProvider {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            responder: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&ModelRequest) -> Result<ProviderReply, ProviderError> + Send + Sync + 'static,
    {
        Self {
            responder: Some(Box::new(responder)),
            ..Self::new()
        }
    }

    pub(crate) fn push_message(&self, text: &str) {
        self.push(Ok(message_reply(text)));
    }

    pub(crate) fn push_function(&self, name: &str, data: Value) {
        self.push(Ok(function_reply(name, data)));
    }

    pub(crate) fn push_error(&self, err: ProviderError) {
        self.push(Err(err));
    }

    fn push(&self, item: Result<ProviderReply, ProviderError>) {
        self.queue.lock().unwrap().push_back(item);
    }

    pub(crate) fn requests(&self) -> Vec<ModelRequest> {
        self.requests.lock().unwrap().clone()
    }
}

pub(crate) fn message_reply(text: &str) -> ProviderReply {
    ProviderReply {
        function: None,
        message: Some(text.to_string()),
        raw: Value::Null,
    }
}

pub(crate) fn function_reply(name: &str, data: Value) -> ProviderReply {
    ProviderReply {
        function: Some(FunctionCall {
            name: name.to_string(),
            data,
        }),
        message: None,
        raw: Value::Null,
    }
}

#[async_trait]
impl ProviderApi for ScriptedProvider {
    async fn send(&self, request: &ModelRequest) -> Result<ProviderReply, ProviderError> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some(next) = self.queue.lock().unwrap().pop_front() {
            return next;
        }
        match &self.responder {
            Some(responder) => responder(request),
            None => Err(ProviderError::permanent("no scripted reply left")),
        }
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}
