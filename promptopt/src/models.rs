use crate::{PromptOptError, Result};
use serde::{Deserialize, Serialize};

/// Outcome for one dataset example under one prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseResult {
    /// The rendered prompt sent to the target model.
    pub prompt: String,
    pub model_output: String,
    pub expected_output: String,
    pub is_correct: bool,
    #[serde(default)]
    pub explanation_success: String,
    #[serde(default)]
    pub explanation_failure: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationResult {
    /// The template text, not a rendered instance.
    pub prompt: String,
    pub total_cases: usize,
    pub correct_answers: usize,
    /// `correct_answers / total_cases`, in [0, 1].
    pub score: f64,
    pub results: Vec<CaseResult>,
    /// Judge-written strengths, weaknesses and directions for improvement.
    #[serde(default)]
    pub summary: String,
}

impl EvaluationResult {
    /// Counts and scores the cases. Zero cases has no score and is an error.
    #[tracing::instrument(skip_all)]
    pub fn from_cases(
        prompt: impl Into<String>,
        results: Vec<CaseResult>,
        summary: impl Into<String>,
    ) -> Result<Self> {
        let total_cases = results.len();
        if total_cases == 0 {
            return Err(PromptOptError::Unexpected(
                "cannot score a prompt over zero cases".to_string(),
            ));
        }
        let correct_answers = results.iter().filter(|r| r.is_correct).count();
        let score = require_unit_score(correct_answers as f64 / total_cases as f64)?;
        Ok(Self {
            prompt: prompt.into(),
            total_cases,
            correct_answers,
            score,
            results,
            summary: summary.into(),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestionAnalysis {
    pub high_performance_factors: Vec<String>,
    pub low_performance_factors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub prompt: String,
    pub explanation: String,
}

/// What the generator returns. Empty means no suggestions were available.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SuggestionSet {
    pub analysis: SuggestionAnalysis,
    pub suggestions: Vec<Suggestion>,
}

impl SuggestionSet {
    pub fn is_empty(&self) -> bool {
        self.suggestions.is_empty()
    }

    pub fn prompts(&self) -> Vec<String> {
        self.suggestions.iter().map(|s| s.prompt.clone()).collect()
    }
}

/// A past evaluation as fed back to the generator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoricalPrompt {
    pub prompt: String,
    pub summary: String,
    pub score: f64,
}

impl From<&EvaluationResult> for HistoricalPrompt {
    fn from(eval: &EvaluationResult) -> Self {
        Self {
            prompt: eval.prompt.clone(),
            summary: eval.summary.clone(),
            score: eval.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationLog {
    pub iteration: usize,
    pub prompts: Vec<String>,
    pub evaluations: Vec<EvaluationResult>,
}

/// The persisted document. `optimized_prompt` stays null until the run ends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationLog {
    pub original_prompt: String,
    pub optimized_prompt: Option<String>,
    pub optimization_logs: Vec<IterationLog>,
}

impl OptimizationLog {
    pub fn new(original_prompt: impl Into<String>) -> Self {
        Self {
            original_prompt: original_prompt.into(),
            optimized_prompt: None,
            optimization_logs: vec![],
        }
    }

    /// Every per-prompt evaluation across all iterations, oldest first.
    pub fn evaluations(&self) -> impl Iterator<Item = &EvaluationResult> {
        self.optimization_logs
            .iter()
            .flat_map(|entry| entry.evaluations.iter())
    }
}

#[tracing::instrument(skip_all)]
pub fn require_unit_score(score: f64) -> Result<f64> {
    if !score.is_finite() || !(0.0..=1.0).contains(&score) {
        return Err(PromptOptError::Unexpected(format!(
            "score outside [0,1] produced: {score}"
        )));
    }
    Ok(score)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn case(is_correct: bool) -> CaseResult {
        CaseResult {
            prompt: "rendered".to_string(),
            model_output: "out".to_string(),
            expected_output: "exp".to_string(),
            is_correct,
            explanation_success: String::new(),
            explanation_failure: String::new(),
        }
    }

    #[test]
    fn score_is_correct_over_total() {
        let eval = EvaluationResult::from_cases(
            "p",
            vec![case(true), case(false), case(true), case(false)],
            "",
        )
        .unwrap();
        assert_eq!(eval.total_cases, 4);
        assert_eq!(eval.correct_answers, 2);
        assert_eq!(eval.score, 0.5);
    }

    #[test]
    fn zero_cases_is_an_error_not_nan() {
        let err = EvaluationResult::from_cases("p", vec![], "").unwrap_err();
        assert!(matches!(err, PromptOptError::Unexpected(_)));
    }

    #[test]
    fn unset_optimized_prompt_serializes_as_null() {
        let log = OptimizationLog::new("orig {text}");
        let v = serde_json::to_value(&log).unwrap();
        assert_eq!(
            v,
            serde_json::json!({
                "original_prompt": "orig {text}",
                "optimized_prompt": null,
                "optimization_logs": []
            })
        );
    }

    #[test]
    fn require_unit_score_rejects_out_of_range() {
        assert!(require_unit_score(f64::NAN).is_err());
        assert!(require_unit_score(1.5).is_err());
        assert_eq!(require_unit_score(1.0).unwrap(), 1.0);
    }

    proptest! {
        #[test]
        fn score_stays_in_unit_range_and_matches_counts(
            outcomes in prop::collection::vec(any::<bool>(), 1..50),
        ) {
            let correct = outcomes.iter().filter(|ok| **ok).count();
            let cases = outcomes.iter().map(|ok| case(*ok)).collect();
            let eval = EvaluationResult::from_cases("p", cases, "").unwrap();

            prop_assert_eq!(eval.total_cases, outcomes.len());
            prop_assert_eq!(eval.correct_answers, correct);
            prop_assert!((0.0..=1.0).contains(&eval.score));
            prop_assert_eq!(eval.score, correct as f64 / outcomes.len() as f64);
            prop_assert_eq!(eval.results.len(), outcomes.len());
        }
    }
}
