//! promptopt: iterative prompt optimization against a labeled dataset.
//!
//! A candidate prompt set is evaluated example by example (target model output,
//! judged for semantic equivalence by a second model), the results are logged,
//! and a generator model proposes the next candidates from a barbell sample of
//! the history. The loop stops at an accuracy threshold, when no suggestions
//! come back, or when the iteration budget runs out.
//!
//! This crate is standalone; `promptopt_cli` wires it to the environment.

#![forbid(unsafe_code)]

pub mod config;
pub mod dataset;
pub mod evaluator;
pub mod generator;
pub mod llm;
pub mod models;
pub mod o11y;
pub mod optimizer;
pub mod perf_log;
pub mod template;

#[cfg(test)]
mod test_support;

pub type Result<T> = std::result::Result<T, PromptOptError>;

#[derive(thiserror::Error, Debug)]
pub enum PromptOptError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid data point at index {index}: {reason}")]
    InvalidDataPoint { index: usize, reason: String },

    #[error("template error: {0}")]
    Template(String),

    #[error("io error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl PromptOptError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

pub use config::{
    DatasetLocation, ModelRoles, ModelSpec, OptimizerConfig, ProviderKind, ProviderSettings,
    RetryPolicy, Settings,
};
pub use dataset::{DatasetExample, DatasetLoader};
pub use evaluator::Evaluator;
pub use generator::PromptGenerator;
pub use llm::{
    FunctionCall, FunctionCallDirective, FunctionSpec, ModelClient, ModelRequest, ModelResponse,
    ProviderApi, ProviderError,
};
pub use models::{
    CaseResult, EvaluationResult, HistoricalPrompt, IterationLog, OptimizationLog, Suggestion,
    SuggestionAnalysis, SuggestionSet,
};
pub use optimizer::{OptimizationOutcome, Optimizer, StopReason};
pub use perf_log::{barbell_sample, PerformanceLogger};
pub use template::PromptTemplate;
