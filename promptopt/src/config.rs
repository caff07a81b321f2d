use crate::template::PromptTemplate;
use crate::{PromptOptError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PROMPT: &str = "Summarize the following text in one sentence: {text}";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OPENAI_API_BASE: &str = "https://api.openai.com/v1";

/// Model providers this crate can talk to. Selected by configuration, never
/// guessed from a model name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    #[serde(rename = "openai")]
    OpenAi,
}

impl ProviderKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" | "open_ai" => Some(Self::OpenAi),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
        }
    }

    pub fn requires_api_key(&self) -> bool {
        match self {
            Self::OpenAi => true,
        }
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unsupported provider: {s}"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSpec {
    pub provider: ProviderKind,
    pub model: String,
    pub temperature: f64,
}

impl ModelSpec {
    pub fn openai(model: impl Into<String>) -> Self {
        Self {
            provider: ProviderKind::OpenAi,
            model: model.into(),
            temperature: 0.7,
        }
    }
}

/// One model per role in the loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRoles {
    /// Scores semantic equivalence and writes evaluation summaries.
    pub judge: ModelSpec,
    /// Proposes new prompt variants.
    pub generator: ModelSpec,
    /// The model the prompt is being optimized for.
    pub target: ModelSpec,
}

impl Default for ModelRoles {
    fn default() -> Self {
        Self {
            judge: ModelSpec::openai(DEFAULT_MODEL),
            generator: ModelSpec::openai(DEFAULT_MODEL),
            target: ModelSpec::openai(DEFAULT_MODEL),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Fixed pause between attempts.
    pub delay_ms: u64,
}

impl RetryPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn no_delay(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay_ms: 0,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay_ms: 5_000,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct ProviderSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    pub api_base: String,
    pub request_timeout_ms: u64,
}

impl ProviderSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Copy with the key masked, for printing.
    pub fn redacted(&self) -> Self {
        Self {
            api_key: self.api_key.as_deref().map(redact),
            ..self.clone()
        }
    }
}

impl std::fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSettings")
            .field("api_key", &self.api_key.as_ref().map(|_| "<set>"))
            .field("api_base", &self.api_base)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .finish()
    }
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: DEFAULT_OPENAI_API_BASE.to_string(),
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetLocation {
    pub dir: PathBuf,
    pub file: String,
}

impl DatasetLocation {
    pub fn path(&self) -> PathBuf {
        self.dir.join(&self.file)
    }
}

impl Default for DatasetLocation {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("data").join("dataset"),
            file: "dataset.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    pub max_iterations: usize,
    /// Number of prompt variants requested from the generator per iteration.
    pub parallel_variations: usize,
    /// Size of the barbell sample fed back to the generator.
    pub historical_prompts_count: usize,
    /// Stop once the best score reaches this value, in (0, 1].
    pub accuracy_threshold: f64,
    /// Generated prompts longer than this (in chars) are discarded.
    pub max_prompt_length: usize,
    /// Dataset examples evaluated at once for a single prompt.
    pub eval_concurrency: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 10,
            parallel_variations: 3,
            historical_prompts_count: 10,
            accuracy_threshold: 0.95,
            max_prompt_length: 2000,
            eval_concurrency: 1,
        }
    }
}

impl OptimizerConfig {
    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.max_iterations == 0 {
            return Err(PromptOptError::InvalidConfig(
                "max_iterations must be > 0".to_string(),
            ));
        }
        if self.parallel_variations == 0 {
            return Err(PromptOptError::InvalidConfig(
                "parallel_variations must be > 0".to_string(),
            ));
        }
        if self.historical_prompts_count == 0 {
            return Err(PromptOptError::InvalidConfig(
                "historical_prompts_count must be > 0".to_string(),
            ));
        }
        if !(self.accuracy_threshold > 0.0 && self.accuracy_threshold <= 1.0) {
            return Err(PromptOptError::InvalidConfig(
                "accuracy_threshold must be in (0,1]".to_string(),
            ));
        }
        if self.max_prompt_length == 0 {
            return Err(PromptOptError::InvalidConfig(
                "max_prompt_length must be > 0".to_string(),
            ));
        }
        if self.eval_concurrency == 0 {
            return Err(PromptOptError::InvalidConfig(
                "eval_concurrency must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub original_prompt: PromptTemplate,
    pub optimizer: OptimizerConfig,
    pub models: ModelRoles,
    pub retry: RetryPolicy,
    pub provider: ProviderSettings,
    pub dataset: DatasetLocation,
    pub log_dir: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            original_prompt: PromptTemplate::new(DEFAULT_PROMPT, vec!["text".to_string()]),
            optimizer: OptimizerConfig::default(),
            models: ModelRoles::default(),
            retry: RetryPolicy::default(),
            provider: ProviderSettings::default(),
            dataset: DatasetLocation::default(),
            log_dir: PathBuf::from("logs"),
        }
    }
}

impl Settings {
    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with whatever `lookup` yields for the `PROMPTOPT_*` names.
    /// Blank values count as unset.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut cfg = Self::default();

        if let Some(text) = get("PROMPTOPT_PROMPT") {
            cfg.original_prompt = match get("PROMPTOPT_PROMPT_VARIABLES") {
                Some(vars) => PromptTemplate::new(text, split_list(&vars)),
                None => PromptTemplate::infer(text)?,
            };
        } else if let Some(vars) = get("PROMPTOPT_PROMPT_VARIABLES") {
            cfg.original_prompt.variables = split_list(&vars);
        }

        if let Some(v) = parse_var(&get, "PROMPTOPT_MAX_ITERATIONS")? {
            cfg.optimizer.max_iterations = v;
        }
        if let Some(v) = parse_var(&get, "PROMPTOPT_PARALLEL_VARIATIONS")? {
            cfg.optimizer.parallel_variations = v;
        }
        if let Some(v) = parse_var(&get, "PROMPTOPT_HISTORICAL_PROMPTS_COUNT")? {
            cfg.optimizer.historical_prompts_count = v;
        }
        if let Some(v) = parse_var(&get, "PROMPTOPT_ACCURACY_THRESHOLD")? {
            cfg.optimizer.accuracy_threshold = v;
        }
        if let Some(v) = parse_var(&get, "PROMPTOPT_MAX_PROMPT_LENGTH")? {
            cfg.optimizer.max_prompt_length = v;
        }
        if let Some(v) = parse_var(&get, "PROMPTOPT_EVAL_CONCURRENCY")? {
            cfg.optimizer.eval_concurrency = v;
        }

        if let Some(provider) = parse_var::<ProviderKind, _>(&get, "PROMPTOPT_PROVIDER")? {
            cfg.models.judge.provider = provider;
            cfg.models.generator.provider = provider;
            cfg.models.target.provider = provider;
        }
        if let Some(v) = get("PROMPTOPT_JUDGE_MODEL") {
            cfg.models.judge.model = v;
        }
        if let Some(v) = get("PROMPTOPT_GENERATOR_MODEL") {
            cfg.models.generator.model = v;
        }
        if let Some(v) = get("PROMPTOPT_TARGET_MODEL") {
            cfg.models.target.model = v;
        }
        if let Some(t) = parse_var::<f64, _>(&get, "PROMPTOPT_TEMPERATURE")? {
            cfg.models.judge.temperature = t;
            cfg.models.generator.temperature = t;
            cfg.models.target.temperature = t;
        }

        if let Some(v) = parse_var(&get, "PROMPTOPT_MAX_RETRIES")? {
            cfg.retry.max_attempts = v;
        }
        if let Some(v) = parse_var(&get, "PROMPTOPT_RETRY_DELAY_MS")? {
            cfg.retry.delay_ms = v;
        }

        cfg.provider.api_key = get("PROMPTOPT_API_KEY").or_else(|| get("OPENAI_API_KEY"));
        if let Some(v) = get("PROMPTOPT_API_BASE").or_else(|| get("OPENAI_BASE_URL")) {
            cfg.provider.api_base = v;
        }
        if let Some(v) = parse_var(&get, "PROMPTOPT_REQUEST_TIMEOUT_MS")? {
            cfg.provider.request_timeout_ms = v;
        }

        if let Some(v) = get("PROMPTOPT_DATASET_DIR") {
            cfg.dataset.dir = PathBuf::from(v);
        }
        if let Some(v) = get("PROMPTOPT_DATASET_FILE") {
            cfg.dataset.file = v;
        }
        if let Some(v) = get("PROMPTOPT_LOG_DIR") {
            cfg.log_dir = PathBuf::from(v);
        }

        Ok(cfg)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn validate(&self) -> Result<()> {
        self.optimizer.validate()?;
        self.original_prompt
            .validate()
            .map_err(|e| PromptOptError::InvalidConfig(format!("original prompt: {e}")))?;

        for (role, spec) in [
            ("judge", &self.models.judge),
            ("generator", &self.models.generator),
            ("target", &self.models.target),
        ] {
            if spec.model.trim().is_empty() {
                return Err(PromptOptError::InvalidConfig(format!(
                    "{role} model identifier is empty"
                )));
            }
            if !spec.temperature.is_finite() || !(0.0..=2.0).contains(&spec.temperature) {
                return Err(PromptOptError::InvalidConfig(format!(
                    "{role} temperature must be in [0,2]"
                )));
            }
            if spec.provider.requires_api_key() && self.provider.api_key.is_none() {
                return Err(PromptOptError::InvalidConfig(format!(
                    "missing API key for provider {} ({role} model)",
                    spec.provider.as_str()
                )));
            }
        }

        if self.retry.max_attempts == 0 {
            return Err(PromptOptError::InvalidConfig(
                "retry.max_attempts must be > 0".to_string(),
            ));
        }
        if self.provider.request_timeout_ms == 0 {
            return Err(PromptOptError::InvalidConfig(
                "provider.request_timeout_ms must be > 0".to_string(),
            ));
        }
        if self.provider.api_base.trim().is_empty() {
            return Err(PromptOptError::InvalidConfig(
                "provider.api_base is empty".to_string(),
            ));
        }
        if self.dataset.file.trim().is_empty() {
            return Err(PromptOptError::InvalidConfig(
                "dataset.file is empty".to_string(),
            ));
        }
        Ok(())
    }

    /// Copy safe to print.
    pub fn redacted(&self) -> Self {
        Self {
            provider: self.provider.redacted(),
            ..self.clone()
        }
    }
}

fn parse_var<T, G>(get: &G, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(name) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| PromptOptError::InvalidConfig(format!("invalid {name}={raw}: {e}"))),
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .collect()
}

fn redact(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    if chars.len() <= 8 {
        return "***".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}***{tail}")
}
