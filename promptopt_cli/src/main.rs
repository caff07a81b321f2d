mod cli;

use anyhow::Context;
use clap::Parser;
use cli::{Cli, Commands, Overrides};
use promptopt::llm::build_provider;
use promptopt::{
    DatasetLoader, Evaluator, ModelClient, ModelSpec, Optimizer, PerformanceLogger,
    PromptGenerator, Settings,
};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    promptopt::o11y::init_tracing(cli.log_format)?;

    let command = cli.command.unwrap_or(Commands::Run {
        overrides: Overrides::default(),
    });

    match command {
        Commands::Run { overrides } => {
            let settings = load_settings(&overrides)?;
            settings.validate()?;
            run(settings).await?;
        }
        Commands::ValidateDataset { overrides } => {
            let settings = load_settings(&overrides)?;
            settings.original_prompt.validate()?;
            let loader = DatasetLoader::from_location(&settings.dataset, settings.original_prompt);
            let examples = loader.load().await?;
            if examples.is_empty() {
                anyhow::bail!("{} contains no examples", loader.path().display());
            }
            println!(
                "{}: {} valid examples",
                loader.path().display(),
                examples.len()
            );
        }
        Commands::Config { overrides } => {
            let settings = load_settings(&overrides)?;
            println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
        }
    }

    Ok(())
}

fn load_settings(overrides: &Overrides) -> anyhow::Result<Settings> {
    let mut settings = Settings::from_env().context("reading PROMPTOPT_* environment")?;
    overrides.apply(&mut settings)?;
    Ok(settings)
}

fn model_client(settings: &Settings, spec: &ModelSpec) -> anyhow::Result<ModelClient> {
    let provider = build_provider(spec.provider, &settings.provider)?;
    Ok(ModelClient::new(spec.clone(), provider, settings.retry))
}

#[tracing::instrument(level = "info", skip_all)]
async fn run(settings: Settings) -> anyhow::Result<()> {
    let judge = model_client(&settings, &settings.models.judge)?;
    let generator = model_client(&settings, &settings.models.generator)?;
    let target = model_client(&settings, &settings.models.target)?;
    tracing::info!(
        judge = %settings.models.judge.model,
        generator = %settings.models.generator.model,
        target = %settings.models.target.model,
        "models configured"
    );

    let dataset = DatasetLoader::from_location(&settings.dataset, settings.original_prompt.clone())
        .load()
        .await
        .context("loading dataset")?;
    tracing::info!(examples = dataset.len(), "dataset loaded");

    let logger = Arc::new(
        PerformanceLogger::create(&settings.log_dir, &settings.original_prompt.text).await?,
    );
    tracing::info!(path = %logger.log_file_path().display(), "performance log created");

    let evaluator = Evaluator::new(judge, dataset, logger.clone())?
        .with_concurrency(settings.optimizer.eval_concurrency);
    let prompt_generator = PromptGenerator::new(
        generator,
        settings.original_prompt.variables.clone(),
        settings.optimizer.max_prompt_length,
    );
    let optimizer = Optimizer::new(
        evaluator,
        prompt_generator,
        target,
        logger,
        settings.optimizer.clone(),
    )?;

    let outcome = optimizer.run(&settings.original_prompt).await?;
    tracing::info!(
        run_id = %outcome.run_id,
        stop_reason = ?outcome.stop_reason,
        iterations = outcome.iterations_run,
        best_score = outcome.best_score,
        log_file = %outcome.log_file.display(),
        "run complete"
    );
    println!("Final optimized prompt:\n{}", outcome.best_prompt);
    Ok(())
}
