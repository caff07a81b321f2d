use crate::dataset::DatasetExample;
use crate::llm::{FunctionCallDirective, FunctionSpec, ModelClient};
use crate::models::{CaseResult, EvaluationResult};
use crate::perf_log::PerformanceLogger;
use crate::template::render_text;
use crate::{PromptOptError, Result};
use futures_util::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

pub const EVALUATION_FUNCTION: &str = "evaluate_semantic_equivalence";

pub fn evaluation_function() -> FunctionSpec {
    FunctionSpec {
        name: EVALUATION_FUNCTION.to_string(),
        description: "Evaluate if two outputs are semantically equivalent".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "is_equivalent": {
                    "type": "boolean",
                    "description": "True if the outputs are semantically equivalent, False otherwise"
                },
                "explanation_success": {
                    "type": "string",
                    "description": "What the model output got right relative to the expected output"
                },
                "explanation_failure": {
                    "type": "string",
                    "description": "What the model output got wrong or missed relative to the expected output"
                }
            },
            "required": ["is_equivalent", "explanation_success", "explanation_failure"]
        }),
    }
}

/// The judge's structured answer for one case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub is_equivalent: bool,
    #[serde(default)]
    pub explanation_success: String,
    #[serde(default)]
    pub explanation_failure: String,
}

impl Verdict {
    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            is_equivalent: false,
            explanation_success: String::new(),
            explanation_failure: reason.into(),
        }
    }
}

fn judge_prompt(model_output: &str, expected_output: &str) -> String {
    format!(
        "Model output: {model_output}\n\
         Expected output: {expected_output}\n\n\
         Evaluate if the model output is semantically equivalent to the expected output.\n\
         In explanation_success, describe what the model output got right. \
         In explanation_failure, describe what it got wrong or left out.\n"
    )
}

fn summary_prompt(successes: &[&str], failures: &[&str]) -> String {
    format!(
        "The following explanations were written while judging a prompt's outputs against \
         expected answers.\n\n\
         <Successes>\n{}\n</Successes>\n\n\
         <Failures>\n{}\n</Failures>\n\n\
         Summarize the prompt's strengths and weaknesses as they show in these explanations, \
         and suggest concrete directions for improving it. Answer in one short paragraph.\n",
        successes.join("\n"),
        failures.join("\n"),
    )
}

pub struct Evaluator {
    judge: ModelClient,
    dataset: Vec<DatasetExample>,
    logger: Arc<PerformanceLogger>,
    concurrency: usize,
    function: FunctionSpec,
}

impl Evaluator {
    /// An empty dataset cannot produce a score and is rejected here.
    #[tracing::instrument(skip_all, fields(examples = dataset.len()))]
    pub fn new(
        judge: ModelClient,
        dataset: Vec<DatasetExample>,
        logger: Arc<PerformanceLogger>,
    ) -> Result<Self> {
        if dataset.is_empty() {
            return Err(PromptOptError::InvalidConfig(
                "dataset has no examples".to_string(),
            ));
        }
        Ok(Self {
            judge,
            dataset,
            logger,
            concurrency: 1,
            function: evaluation_function(),
        })
    }

    /// Dataset examples of one prompt evaluated at once. Result order is
    /// always dataset order.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Scores every prompt in order, then logs the batch as one iteration.
    #[tracing::instrument(skip(self, prompts, target), fields(prompts = prompts.len()))]
    pub async fn evaluate_prompts(
        &self,
        prompts: &[String],
        target: &ModelClient,
        iteration: usize,
    ) -> Result<Vec<EvaluationResult>> {
        let mut evaluations = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            let evaluation = self.evaluate_prompt(prompt, target).await?;
            tracing::info!(
                iteration,
                score = evaluation.score,
                correct = evaluation.correct_answers,
                total = evaluation.total_cases,
                prompt = %evaluation.prompt,
                "prompt evaluated"
            );
            evaluations.push(evaluation);
        }

        self.logger
            .log_iteration(iteration, prompts, &evaluations)
            .await?;
        Ok(evaluations)
    }

    #[tracing::instrument(skip_all)]
    pub async fn evaluate_prompt(
        &self,
        prompt: &str,
        target: &ModelClient,
    ) -> Result<EvaluationResult> {
        let results: Vec<CaseResult> = futures_util::stream::iter(self.dataset.iter())
            .map(|example| self.evaluate_case(prompt, example, target))
            .buffered(self.concurrency)
            .try_collect()
            .await?;

        let summary = self.summarize(&results).await;
        EvaluationResult::from_cases(prompt, results, summary)
    }

    async fn evaluate_case(
        &self,
        prompt: &str,
        example: &DatasetExample,
        target: &ModelClient,
    ) -> Result<CaseResult> {
        let rendered = render_text(prompt, &example.variables)?;

        let (model_output, verdict) = match self.generate_model_output(&rendered, target).await {
            Ok(output) => {
                let verdict = self
                    .evaluate_output(&output, &example.expected_output)
                    .await;
                (output, verdict)
            }
            Err(err) => (
                String::new(),
                Verdict::rejected(format!("target model failed: {err}")),
            ),
        };

        Ok(CaseResult {
            prompt: rendered,
            model_output,
            expected_output: example.expected_output.clone(),
            is_correct: verdict.is_equivalent,
            explanation_success: verdict.explanation_success,
            explanation_failure: verdict.explanation_failure,
        })
    }

    /// The target's free-text answer, or the provider error after retries.
    #[tracing::instrument(skip_all)]
    pub async fn generate_model_output(
        &self,
        rendered_prompt: &str,
        target: &ModelClient,
    ) -> std::result::Result<String, String> {
        let response = target.complete(rendered_prompt).await;
        match response.error {
            Some(err) => Err(err),
            None => Ok(response.message.unwrap_or_default()),
        }
    }

    /// Asks the judge for a structured verdict. Anything other than a decodable
    /// verdict counts as "not equivalent".
    #[tracing::instrument(skip_all)]
    pub async fn evaluate_output(&self, model_output: &str, expected_output: &str) -> Verdict {
        let response = self
            .judge
            .generate(
                &judge_prompt(model_output, expected_output),
                Some(&self.function),
                Some(&FunctionCallDirective::force(&self.function)),
            )
            .await;

        if let Some(err) = &response.error {
            tracing::warn!(error = %err, "judge call failed; counting case as incorrect");
            return Verdict::rejected(format!("judge failed: {err}"));
        }
        let Some(data) = response.function_data(EVALUATION_FUNCTION) else {
            tracing::warn!("unexpected response format from evaluation model");
            return Verdict::rejected("judge returned no structured verdict");
        };
        match serde_json::from_value::<Verdict>(data.clone()) {
            Ok(verdict) => verdict,
            Err(err) => {
                tracing::warn!(error = %err, "judge verdict did not match the schema");
                Verdict::rejected(format!("judge verdict malformed: {err}"))
            }
        }
    }

    /// Free-text strengths/weaknesses summary from all case explanations.
    /// Empty when the judge call fails.
    #[tracing::instrument(skip_all)]
    pub async fn summarize(&self, results: &[CaseResult]) -> String {
        let successes: Vec<&str> = results
            .iter()
            .map(|r| r.explanation_success.trim())
            .filter(|s| !s.is_empty())
            .collect();
        let failures: Vec<&str> = results
            .iter()
            .map(|r| r.explanation_failure.trim())
            .filter(|s| !s.is_empty())
            .collect();

        let response = self
            .judge
            .complete(&summary_prompt(&successes, &failures))
            .await;
        if let Some(err) = &response.error {
            tracing::warn!(error = %err, "summary call failed; leaving summary empty");
            return String::new();
        }
        response.text().trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelSpec, RetryPolicy};
    use crate::llm::{ModelRequest, ProviderError, ProviderReply};
    use crate::test_support::{function_reply, message_reply, ScriptedProvider};
    use serde_json::Value;
    use std::collections::BTreeMap;

    fn example(text: &str, expected: &str) -> DatasetExample {
        let mut variables = BTreeMap::new();
        variables.insert("text".to_string(), Value::String(text.to_string()));
        DatasetExample {
            variables,
            expected_output: expected.to_string(),
        }
    }

    fn client(provider: Arc<ScriptedProvider>) -> ModelClient {
        ModelClient::new(
            ModelSpec::openai("gpt-test"),
            provider,
            RetryPolicy::no_delay(1),
        )
    }

    /// Target echoes the prompt; judge accepts when `accept` says so; summaries are fixed.
    fn judge_responder(
        accept: fn(&str) -> bool,
    ) -> impl Fn(&ModelRequest) -> std::result::Result<ProviderReply, ProviderError> {
        move |req: &ModelRequest| {
            if req.function.is_some() {
                let ok = accept(&req.prompt);
                Ok(function_reply(
                    EVALUATION_FUNCTION,
                    json!({
                        "is_equivalent": ok,
                        "explanation_success": if ok { "matched" } else { "" },
                        "explanation_failure": if ok { "" } else { "missed" },
                    }),
                ))
            } else {
                Ok(message_reply("Strong on brevity; weak on detail."))
            }
        }
    }

    fn target() -> (Arc<ScriptedProvider>, ModelClient) {
        let provider = Arc::new(ScriptedProvider::with_responder(|req| {
            Ok(message_reply(&format!("echo: {}", req.prompt)))
        }));
        let c = client(provider.clone());
        (provider, c)
    }

    async fn logger(dir: &std::path::Path) -> Arc<PerformanceLogger> {
        Arc::new(PerformanceLogger::create(dir, "Summarize: {text}").await.unwrap())
    }

    #[tokio::test]
    async fn always_correct_prompt_scores_one() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::with_responder(judge_responder(|_| true)));
        let evaluator = Evaluator::new(
            client(judge.clone()),
            vec![example("a", "A"), example("b", "B")],
            logger(tmp.path()).await,
        )
        .unwrap();
        let (_, target) = target();

        let eval = evaluator.evaluate_prompt("Summarize: {text}", &target).await.unwrap();
        assert_eq!(eval.prompt, "Summarize: {text}");
        assert_eq!(eval.total_cases, 2);
        assert_eq!(eval.correct_answers, 2);
        assert_eq!(eval.score, 1.0);
        assert_eq!(eval.results[0].prompt, "Summarize: a");
        assert_eq!(eval.results[0].model_output, "echo: Summarize: a");
        assert_eq!(eval.results[1].expected_output, "B");
        assert_eq!(eval.summary, "Strong on brevity; weak on detail.");

        // two verdicts + one summary
        assert_eq!(judge.requests().len(), 3);
        let summary_req = &judge.requests()[2];
        assert!(summary_req.function.is_none());
        assert!(summary_req.prompt.contains("matched"));
    }

    #[tokio::test]
    async fn mixed_verdicts_score_the_fraction() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::with_responder(judge_responder(|p| {
            p.contains("Expected output: A")
        })));
        let evaluator = Evaluator::new(
            client(judge),
            vec![example("a", "A"), example("b", "B"), example("c", "C")],
            logger(tmp.path()).await,
        )
        .unwrap();
        let (_, target) = target();

        let eval = evaluator.evaluate_prompt("Q: {text}", &target).await.unwrap();
        assert_eq!(eval.correct_answers, 1);
        assert_eq!(eval.total_cases, 3);
        assert!((eval.score - 1.0 / 3.0).abs() < f64::EPSILON);
        assert!(eval.results[0].is_correct);
        assert_eq!(eval.results[1].explanation_failure, "missed");
    }

    #[tokio::test]
    async fn malformed_judge_response_counts_as_incorrect() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::new());
        judge.push_message("I think they match!");
        judge.push_function(EVALUATION_FUNCTION, json!({"verdict": "yes"}));
        judge.push_message("summary");
        let evaluator = Evaluator::new(
            client(judge),
            vec![example("a", "A"), example("b", "B")],
            logger(tmp.path()).await,
        )
        .unwrap();
        let (_, target) = target();

        let eval = evaluator.evaluate_prompt("{text}", &target).await.unwrap();
        assert_eq!(eval.correct_answers, 0);
        assert_eq!(eval.score, 0.0);
        assert!(eval.results[0]
            .explanation_failure
            .contains("no structured verdict"));
        assert!(eval.results[1].explanation_failure.contains("malformed"));
    }

    #[tokio::test]
    async fn failed_target_call_is_incorrect_without_judging() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::with_responder(judge_responder(|_| true)));
        let evaluator = Evaluator::new(
            client(judge.clone()),
            vec![example("a", "A")],
            logger(tmp.path()).await,
        )
        .unwrap();
        let target_provider = Arc::new(ScriptedProvider::new());
        target_provider.push_error(ProviderError::transient("rate limited"));

        let eval = evaluator
            .evaluate_prompt("{text}", &client(target_provider))
            .await
            .unwrap();
        assert_eq!(eval.correct_answers, 0);
        assert_eq!(eval.results[0].model_output, "");
        assert!(eval.results[0].explanation_failure.contains("rate limited"));
        // only the summary reached the judge
        assert_eq!(judge.requests().len(), 1);
    }

    #[tokio::test]
    async fn failed_summary_leaves_it_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::new());
        judge.push_function(EVALUATION_FUNCTION, json!({"is_equivalent": true}));
        judge.push_error(ProviderError::permanent("400 bad request"));
        let evaluator = Evaluator::new(
            client(judge),
            vec![example("a", "A")],
            logger(tmp.path()).await,
        )
        .unwrap();
        let (_, target) = target();

        let eval = evaluator.evaluate_prompt("{text}", &target).await.unwrap();
        assert_eq!(eval.score, 1.0);
        assert_eq!(eval.summary, "");
    }

    #[tokio::test]
    async fn render_failure_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::with_responder(judge_responder(|_| true)));
        let evaluator = Evaluator::new(
            client(judge),
            vec![example("a", "A")],
            logger(tmp.path()).await,
        )
        .unwrap();
        let (target_provider, target) = target();

        let err = evaluator
            .evaluate_prompt("Translate {text} into {language}", &target)
            .await
            .unwrap_err();
        assert!(matches!(err, PromptOptError::Template(_)));
        assert!(target_provider.requests().is_empty());
    }

    #[tokio::test]
    async fn empty_dataset_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::new());
        let err = Evaluator::new(client(judge), vec![], logger(tmp.path()).await)
            .err()
            .unwrap();
        match err {
            PromptOptError::InvalidConfig(msg) => assert!(msg.contains("no examples")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn batch_is_logged_as_one_iteration() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::with_responder(judge_responder(|_| false)));
        let log = logger(tmp.path()).await;
        let evaluator =
            Evaluator::new(client(judge), vec![example("Sample text", "Expected output")], log.clone())
                .unwrap();
        let (_, target) = target();
        let prompts = vec!["Summarize: {text}".to_string(), "Paraphrase: {text}".to_string()];

        let first = evaluator.evaluate_prompts(&prompts, &target, 1).await.unwrap();
        let second = evaluator.evaluate_prompts(&prompts, &target, 2).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(second[0].prompt, "Summarize: {text}");
        assert_eq!(second[0].total_cases, 1);
        assert_eq!(second[0].correct_answers, 0);
        assert_eq!(second[0].score, 0.0);

        let snapshot = log.snapshot().await;
        assert_eq!(snapshot.optimization_logs.len(), 2);
        let last = &snapshot.optimization_logs[1];
        assert_eq!(last.iteration, 2);
        assert_eq!(last.prompts, prompts);
        assert_eq!(last.evaluations, second);
    }

    #[tokio::test]
    async fn concurrent_cases_keep_dataset_order() {
        let tmp = tempfile::tempdir().unwrap();
        let judge = Arc::new(ScriptedProvider::with_responder(judge_responder(|p| {
            p.contains("Expected output: 1") || p.contains("Expected output: 3")
        })));
        let examples: Vec<_> = (0..5)
            .map(|i| example(&format!("t{i}"), &i.to_string()))
            .collect();
        let evaluator = Evaluator::new(client(judge), examples, logger(tmp.path()).await)
            .unwrap()
            .with_concurrency(4);
        let (_, target) = target();

        let eval = evaluator.evaluate_prompt("> {text}", &target).await.unwrap();
        let rendered: Vec<_> = eval.results.iter().map(|r| r.prompt.as_str()).collect();
        assert_eq!(rendered, vec!["> t0", "> t1", "> t2", "> t3", "> t4"]);
        let flags: Vec<_> = eval.results.iter().map(|r| r.is_correct).collect();
        assert_eq!(flags, vec![false, true, false, true, false]);
        assert_eq!(eval.correct_answers, 2);
    }
}
