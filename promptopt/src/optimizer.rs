use crate::config::OptimizerConfig;
use crate::evaluator::Evaluator;
use crate::generator::PromptGenerator;
use crate::llm::ModelClient;
use crate::perf_log::PerformanceLogger;
use crate::template::PromptTemplate;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use ulid::Ulid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    ThresholdReached,
    NoSuggestions,
    IterationBudgetExhausted,
    EvaluationFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationOutcome {
    pub run_id: Ulid,
    pub best_prompt: String,
    pub best_score: f64,
    pub iterations_run: usize,
    pub stop_reason: StopReason,
    pub log_file: PathBuf,
}

pub struct Optimizer {
    evaluator: Evaluator,
    generator: PromptGenerator,
    target: ModelClient,
    logger: Arc<PerformanceLogger>,
    config: OptimizerConfig,
}

impl Optimizer {
    #[tracing::instrument(skip_all)]
    pub fn new(
        evaluator: Evaluator,
        generator: PromptGenerator,
        target: ModelClient,
        logger: Arc<PerformanceLogger>,
        config: OptimizerConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            evaluator,
            generator,
            target,
            logger,
            config,
        })
    }

    /// Evaluate, keep the best, ask for successors, repeat.
    ///
    /// The best prompt only changes on a strictly higher score, so the first
    /// prompt to reach a score keeps it. Whatever ends the loop, the best
    /// prompt is written to the log before returning, including when the very
    /// first evaluation fails, which is the only failure returned as an error.
    /// A failed final write is logged; the outcome is still returned.
    #[tracing::instrument(skip_all, fields(run_id = tracing::field::Empty))]
    pub async fn run(&self, template: &PromptTemplate) -> Result<OptimizationOutcome> {
        let run_id = self.logger.run_id();
        tracing::Span::current().record("run_id", tracing::field::display(run_id));
        let cfg = &self.config;

        let mut current = vec![template.text.clone()];
        let mut best_prompt = template.text.clone();
        let mut best_score = 0.0_f64;
        let mut iterations_run = 0usize;
        let mut stop_reason = StopReason::IterationBudgetExhausted;

        for iteration in 0..cfg.max_iterations {
            tracing::info!(iteration, candidates = current.len(), "starting iteration");

            let evaluations = match self
                .evaluator
                .evaluate_prompts(&current, &self.target, iteration)
                .await
            {
                Ok(evaluations) => evaluations,
                Err(err) if iteration == 0 => {
                    self.persist_best(&best_prompt).await;
                    return Err(err);
                }
                Err(err) => {
                    tracing::error!(iteration, error = %err, "evaluation failed; stopping with best prompt so far");
                    stop_reason = StopReason::EvaluationFailed;
                    break;
                }
            };
            iterations_run = iteration + 1;

            for evaluation in &evaluations {
                if evaluation.score > best_score {
                    best_score = evaluation.score;
                    best_prompt = evaluation.prompt.clone();
                }
            }
            tracing::info!(iteration, best_score, best_prompt = %best_prompt, "iteration complete");

            if best_score >= cfg.accuracy_threshold {
                tracing::info!(best_score, threshold = cfg.accuracy_threshold, "accuracy threshold reached");
                stop_reason = StopReason::ThresholdReached;
                break;
            }
            if iterations_run == cfg.max_iterations {
                break;
            }

            let history = self
                .logger
                .get_historical_prompts(cfg.historical_prompts_count)
                .await;
            let suggestions = self
                .generator
                .generate_suggestions(&history, cfg.parallel_variations)
                .await;
            if suggestions.is_empty() {
                tracing::warn!(iteration, "no suggestions generated; stopping");
                stop_reason = StopReason::NoSuggestions;
                break;
            }
            current = suggestions.prompts();
        }

        self.persist_best(&best_prompt).await;
        tracing::info!(?stop_reason, iterations_run, best_score, "optimization finished");

        Ok(OptimizationOutcome {
            run_id,
            best_prompt,
            best_score,
            iterations_run,
            stop_reason,
            log_file: self.logger.log_file_path().to_path_buf(),
        })
    }

    async fn persist_best(&self, best_prompt: &str) {
        if let Err(err) = self.logger.log_optimized_prompt(best_prompt).await {
            tracing::error!(
                error = %err,
                path = %self.logger.log_file_path().display(),
                "failed to persist optimized prompt"
            );
        }
    }
}
