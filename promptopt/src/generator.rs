use crate::llm::{FunctionCallDirective, FunctionSpec, ModelClient};
use crate::models::{HistoricalPrompt, Suggestion, SuggestionSet};
use crate::template::placeholders_of;
use serde_json::json;
use std::collections::BTreeSet;
use std::fmt::Write as _;

pub const SUGGESTION_FUNCTION: &str = "analyze_and_suggest_prompts";

pub fn suggestion_function(n: usize) -> FunctionSpec {
    FunctionSpec {
        name: SUGGESTION_FUNCTION.to_string(),
        description: "Analyze given prompts and suggest improvements".to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "analysis": {
                    "type": "object",
                    "properties": {
                        "high_performance_factors": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Factors contributing to high performance in prompts"
                        },
                        "low_performance_factors": {
                            "type": "array",
                            "items": {"type": "string"},
                            "description": "Factors contributing to low performance in prompts"
                        }
                    },
                    "required": ["high_performance_factors", "low_performance_factors"]
                },
                "suggestions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "prompt": {"type": "string"},
                            "explanation": {"type": "string"}
                        },
                        "required": ["prompt", "explanation"]
                    },
                    "description": format!("List of {n} suggested improved prompts with explanations")
                }
            },
            "required": ["analysis", "suggestions"]
        }),
    }
}

/// Proposes new prompt variants from scored history.
pub struct PromptGenerator {
    model: ModelClient,
    variables: BTreeSet<String>,
    max_prompt_length: usize,
}

impl PromptGenerator {
    /// `variables` are the placeholders a suggestion may use; anything else
    /// would fail to render against the dataset.
    pub fn new(model: ModelClient, variables: Vec<String>, max_prompt_length: usize) -> Self {
        Self {
            model,
            variables: variables.into_iter().collect(),
            max_prompt_length,
        }
    }

    /// At most `n` usable suggestions. An empty set means the model gave
    /// nothing usable; it never fails.
    #[tracing::instrument(skip(self, history), fields(history = history.len()))]
    pub async fn generate_suggestions(&self, history: &[HistoricalPrompt], n: usize) -> SuggestionSet {
        if n == 0 {
            return SuggestionSet::default();
        }
        let function = suggestion_function(n);
        let response = self
            .model
            .generate(
                &prepare_prompt(history, n),
                Some(&function),
                Some(&FunctionCallDirective::force(&function)),
            )
            .await;

        if let Some(err) = &response.error {
            tracing::warn!(error = %err, "suggestion request failed");
            return SuggestionSet::default();
        }
        let Some(data) = response.function_data(SUGGESTION_FUNCTION) else {
            tracing::warn!("unexpected response format from generator model");
            return SuggestionSet::default();
        };
        let set = match serde_json::from_value::<SuggestionSet>(data.clone()) {
            Ok(set) => set,
            Err(err) => {
                tracing::warn!(error = %err, "suggestions did not match the schema");
                return SuggestionSet::default();
            }
        };

        let received = set.suggestions.len();
        let suggestions: Vec<Suggestion> = set
            .suggestions
            .into_iter()
            .filter(|s| self.is_usable(&s.prompt))
            .take(n)
            .collect();
        tracing::info!(
            received,
            kept = suggestions.len(),
            high = ?set.analysis.high_performance_factors,
            low = ?set.analysis.low_performance_factors,
            "suggestions generated"
        );
        for s in &suggestions {
            tracing::info!(prompt = %s.prompt, explanation = %s.explanation, "suggestion");
        }

        SuggestionSet {
            analysis: set.analysis,
            suggestions,
        }
    }

    fn is_usable(&self, prompt: &str) -> bool {
        if prompt.trim().is_empty() {
            tracing::warn!("discarding empty suggestion");
            return false;
        }
        let length = prompt.chars().count();
        if length > self.max_prompt_length {
            tracing::warn!(length, max = self.max_prompt_length, "discarding oversized suggestion");
            return false;
        }
        match placeholders_of(prompt) {
            Ok(names) => {
                let unknown: Vec<&String> =
                    names.iter().filter(|n| !self.variables.contains(*n)).collect();
                if unknown.is_empty() {
                    true
                } else {
                    tracing::warn!(?unknown, "discarding suggestion with undeclared placeholders");
                    false
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "discarding suggestion that does not parse as a template");
                false
            }
        }
    }
}

fn prepare_prompt(history: &[HistoricalPrompt], n: usize) -> String {
    let mut items = String::new();
    for record in history {
        let _ = writeln!(
            items,
            "<Item>\n\t<Prompt>\n\t\t{}\n\t</Prompt>\n\t<Summary>\n\t\t{}\n\t</Summary>\n\t<Score>\n\t\t{}\n\t</Score>\n</Item>",
            record.prompt, record.summary, record.score
        );
    }

    format!(
        "Analyze the following list of prompts, the summaries of how they performed, and their \
         scores, then generate new suggestions:\n\n\
         {items}\n\
         Identify factors contributing to high and low performance. Then, generate {n} new prompt \
         variations that aim to improve upon the highest-scoring prompts, incorporating insights \
         from your analysis. Keep the same {{placeholder}} variables as the existing prompts.\n\n\
         Use the '{SUGGESTION_FUNCTION}' function to structure your response.\n"
    )
}
