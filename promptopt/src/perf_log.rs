use crate::models::{EvaluationResult, HistoricalPrompt, IterationLog, OptimizationLog};
use crate::{PromptOptError, Result};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use ulid::Ulid;

/// Durable, append-only record of a run.
///
/// Every mutation rewrites the whole document: the JSON goes to a sibling
/// temporary file which is then renamed over the log, so the file on disk is
/// always a complete document. The mutex keeps a single writer at a time.
pub struct PerformanceLogger {
    run_id: Ulid,
    path: PathBuf,
    state: Mutex<OptimizationLog>,
}

impl PerformanceLogger {
    /// Creates `performance_log_<timestamp>_<run id>.json` under `log_dir` and
    /// writes the empty log immediately. The run id keeps runs started within
    /// the same second apart.
    #[tracing::instrument(skip_all, fields(log_dir = %log_dir.as_ref().display()))]
    pub async fn create(log_dir: impl AsRef<Path>, original_prompt: &str) -> Result<Self> {
        let run_id = Ulid::new();
        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let path = log_dir
            .as_ref()
            .join(format!("performance_log_{timestamp}_{run_id}.json"));
        Self::open(run_id, path, original_prompt).await
    }

    /// Like [`PerformanceLogger::create`] but at an exact path. An existing file
    /// there is overwritten.
    pub async fn create_at(path: PathBuf, original_prompt: &str) -> Result<Self> {
        Self::open(Ulid::new(), path, original_prompt).await
    }

    #[tracing::instrument(skip_all, fields(%run_id, path = %path.display()))]
    async fn open(run_id: Ulid, path: PathBuf, original_prompt: &str) -> Result<Self> {
        let logger = Self {
            run_id,
            path,
            state: Mutex::new(OptimizationLog::new(original_prompt)),
        };
        logger.persist().await?;
        Ok(logger)
    }

    pub fn run_id(&self) -> Ulid {
        self.run_id
    }

    pub fn log_file_path(&self) -> &Path {
        &self.path
    }

    pub async fn snapshot(&self) -> OptimizationLog {
        self.state.lock().await.clone()
    }

    #[tracing::instrument(skip(self, prompts, evaluations))]
    pub async fn log_iteration(
        &self,
        iteration: usize,
        prompts: &[String],
        evaluations: &[EvaluationResult],
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.optimization_logs.push(IterationLog {
            iteration,
            prompts: prompts.to_vec(),
            evaluations: evaluations.to_vec(),
        });
        write_log(&self.path, &state).await
    }

    #[tracing::instrument(skip_all)]
    pub async fn log_optimized_prompt(&self, optimized_prompt: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.optimized_prompt = Some(optimized_prompt.to_string());
        write_log(&self.path, &state).await
    }

    /// Rewrites the current state without changing it.
    #[tracing::instrument(skip_all)]
    pub async fn persist(&self) -> Result<()> {
        let state = self.state.lock().await;
        write_log(&self.path, &state).await
    }

    /// Barbell sample of every evaluation logged so far. See [`barbell_sample`].
    #[tracing::instrument(skip(self))]
    pub async fn get_historical_prompts(&self, limit: usize) -> Vec<HistoricalPrompt> {
        let state = self.state.lock().await;
        let records: Vec<HistoricalPrompt> =
            state.evaluations().map(HistoricalPrompt::from).collect();
        barbell_sample(records, limit)
    }
}

/// Sorts by score descending (stable, so equal scores keep log order). If there
/// are more than `limit` records, keeps the top `ceil(limit/2)` followed by the
/// bottom `floor(limit/2)` and drops the middle.
pub fn barbell_sample(mut records: Vec<HistoricalPrompt>, limit: usize) -> Vec<HistoricalPrompt> {
    records.sort_by(|a, b| b.score.total_cmp(&a.score));
    if records.len() <= limit {
        return records;
    }
    let top = limit.div_ceil(2);
    let bottom = limit / 2;
    let tail_start = records.len() - bottom;
    let mut tail = records.split_off(tail_start);
    records.truncate(top);
    records.append(&mut tail);
    records
}

async fn write_log(path: &Path, log: &OptimizationLog) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| PromptOptError::io(format!("create {}", parent.display()), e))?;
    }
    let bytes = serde_json::to_vec_pretty(log)?;
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, &bytes)
        .await
        .map_err(|e| PromptOptError::io(format!("write {}", tmp.display()), e))?;
    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| PromptOptError::io(format!("rename to {}", path.display()), e))?;
    tracing::debug!(path = %path.display(), bytes = bytes.len(), "performance log persisted");
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
