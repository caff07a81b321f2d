use crate::config::DatasetLocation;
use crate::template::PromptTemplate;
use crate::{PromptOptError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One labeled record: the values substituted into the prompt and the answer
/// the judge compares against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetExample {
    pub variables: BTreeMap<String, Value>,
    pub expected_output: String,
}

pub struct DatasetLoader {
    dir: PathBuf,
    path: PathBuf,
    prompt: PromptTemplate,
}

impl DatasetLoader {
    #[tracing::instrument(skip_all)]
    pub fn new(dir: impl Into<PathBuf>, file: &str, prompt: PromptTemplate) -> Self {
        let dir = dir.into();
        let path = dir.join(file);
        Self { dir, path, prompt }
    }

    #[tracing::instrument(skip_all)]
    pub fn from_location(location: &DatasetLocation, prompt: PromptTemplate) -> Self {
        Self::new(location.dir.clone(), &location.file, prompt)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads every record in file order. Stops at the first invalid record.
    #[tracing::instrument(skip_all, fields(path = %self.path.display()))]
    pub async fn load(&self) -> Result<Vec<DatasetExample>> {
        if !tokio::fs::try_exists(&self.dir).await.unwrap_or(false) {
            return Err(PromptOptError::NotFound(format!(
                "dataset directory not found at {}",
                self.dir.display()
            )));
        }
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(PromptOptError::NotFound(format!(
                "dataset file not found at {}",
                self.path.display()
            )));
        }

        let bytes = tokio::fs::read(&self.path)
            .await
            .map_err(|e| PromptOptError::io(format!("read {}", self.path.display()), e))?;
        let records: Vec<Value> = serde_json::from_slice(&bytes)?;

        let examples = records
            .into_iter()
            .enumerate()
            .map(|(index, record)| self.validate_record(index, record))
            .collect::<Result<Vec<_>>>()?;

        tracing::debug!(count = examples.len(), "dataset loaded");
        Ok(examples)
    }

    fn validate_record(&self, index: usize, record: Value) -> Result<DatasetExample> {
        let Value::Object(mut record) = record else {
            return Err(PromptOptError::InvalidDataPoint {
                index,
                reason: "record must be an object".to_string(),
            });
        };
        let variables: BTreeMap<String, Value> = match record.remove("variables") {
            Some(Value::Object(map)) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };

        let mut missing: Vec<&str> = self
            .prompt
            .variables
            .iter()
            .filter(|name| !variables.contains_key(name.as_str()))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            missing.sort_unstable();
            missing.dedup();
            return Err(PromptOptError::InvalidDataPoint {
                index,
                reason: format!("missing required variables: {}", missing.join(", ")),
            });
        }

        let expected_output = match record.remove("expected_output") {
            None => {
                return Err(PromptOptError::InvalidDataPoint {
                    index,
                    reason: "missing expected output".to_string(),
                })
            }
            Some(Value::String(s)) => s,
            Some(_) => {
                return Err(PromptOptError::InvalidDataPoint {
                    index,
                    reason: "expected output must be a string".to_string(),
                })
            }
        };

        Ok(DatasetExample {
            variables,
            expected_output,
        })
    }
}
