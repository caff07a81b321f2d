use clap::{Args, Parser, Subcommand};
use promptopt::o11y::LogFormat;
use promptopt::{PromptTemplate, ProviderKind, Settings};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "promptopt",
    version,
    about = "Iteratively optimize a prompt template against a labeled dataset"
)]
pub struct Cli {
    /// Console log format: pretty, text or json.
    #[arg(
        long,
        global = true,
        env = "PROMPTOPT_LOG_FORMAT",
        default_value = "pretty"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run the optimization loop (default if no subcommand given).
    Run {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Load and validate the dataset against the prompt template, then exit.
    ValidateDataset {
        #[command(flatten)]
        overrides: Overrides,
    },

    /// Print the effective configuration (redacted secrets).
    Config {
        #[command(flatten)]
        overrides: Overrides,
    },
}

/// Command-line values take precedence over `PROMPTOPT_*` environment variables.
#[derive(Debug, Clone, Default, Args)]
pub struct Overrides {
    /// Prompt template text with `{name}` placeholders.
    #[arg(long)]
    pub prompt: Option<String>,

    /// Comma-delimited variables the template declares (inferred from the text if omitted).
    #[arg(long, value_delimiter = ',')]
    pub variables: Vec<String>,

    #[arg(long)]
    pub max_iterations: Option<usize>,

    /// Suggestions requested per iteration.
    #[arg(long)]
    pub parallel_variations: Option<usize>,

    /// Size of the barbell sample fed to the generator.
    #[arg(long)]
    pub historical_prompts_count: Option<usize>,

    #[arg(long)]
    pub accuracy_threshold: Option<f64>,

    /// Dataset examples evaluated at once per prompt.
    #[arg(long)]
    pub eval_concurrency: Option<usize>,

    #[arg(long)]
    pub max_prompt_length: Option<usize>,

    /// Provider for all three model roles (currently `openai`).
    #[arg(long)]
    pub provider: Option<ProviderKind>,

    /// Sampling temperature for all three model roles.
    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub judge_model: Option<String>,

    #[arg(long)]
    pub generator_model: Option<String>,

    #[arg(long)]
    pub target_model: Option<String>,

    /// Attempts per model call, first one included.
    #[arg(long)]
    pub max_retries: Option<u32>,

    #[arg(long)]
    pub retry_delay_ms: Option<u64>,

    #[arg(long)]
    pub api_base: Option<String>,

    #[arg(long)]
    pub request_timeout_ms: Option<u64>,

    #[arg(long)]
    pub dataset_dir: Option<PathBuf>,

    #[arg(long)]
    pub dataset_file: Option<String>,

    /// Directory for performance_log_*.json files.
    #[arg(long)]
    pub log_dir: Option<PathBuf>,
}

impl Overrides {
    pub fn apply(&self, settings: &mut Settings) -> anyhow::Result<()> {
        match (&self.prompt, self.variables.is_empty()) {
            (Some(text), true) => settings.original_prompt = PromptTemplate::infer(text.clone())?,
            (Some(text), false) => {
                settings.original_prompt = PromptTemplate::new(text.clone(), self.variables.clone())
            }
            (None, false) => settings.original_prompt.variables = self.variables.clone(),
            (None, true) => {}
        }

        let opt = &mut settings.optimizer;
        if let Some(v) = self.max_iterations {
            opt.max_iterations = v;
        }
        if let Some(v) = self.parallel_variations {
            opt.parallel_variations = v;
        }
        if let Some(v) = self.historical_prompts_count {
            opt.historical_prompts_count = v;
        }
        if let Some(v) = self.accuracy_threshold {
            opt.accuracy_threshold = v;
        }
        if let Some(v) = self.eval_concurrency {
            opt.eval_concurrency = v;
        }
        if let Some(v) = self.max_prompt_length {
            opt.max_prompt_length = v;
        }

        let roles = &mut settings.models;
        for spec in [&mut roles.judge, &mut roles.generator, &mut roles.target] {
            if let Some(provider) = self.provider {
                spec.provider = provider;
            }
            if let Some(t) = self.temperature {
                spec.temperature = t;
            }
        }

        if let Some(m) = &self.judge_model {
            settings.models.judge.model = m.clone();
        }
        if let Some(m) = &self.generator_model {
            settings.models.generator.model = m.clone();
        }
        if let Some(m) = &self.target_model {
            settings.models.target.model = m.clone();
        }

        if let Some(n) = self.max_retries {
            settings.retry.max_attempts = n;
        }
        if let Some(ms) = self.retry_delay_ms {
            settings.retry.delay_ms = ms;
        }
        if let Some(base) = &self.api_base {
            settings.provider.api_base = base.clone();
        }
        if let Some(ms) = self.request_timeout_ms {
            settings.provider.request_timeout_ms = ms;
        }

        if let Some(dir) = &self.dataset_dir {
            settings.dataset.dir = dir.clone();
        }
        if let Some(file) = &self.dataset_file {
            settings.dataset.file = file.clone();
        }
        if let Some(dir) = &self.log_dir {
            settings.log_dir = dir.clone();
        }
        Ok(())
    }
}
