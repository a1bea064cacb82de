use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::agent_engine::episode::StepData;
use crate::errors::MobileUseResult;

/// One JSONL line per finalized step. Screenshots are not stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    pub ts: i64,
    pub episode_id: String,
    pub step_idx: usize,
    pub package: String,
    pub thought: Option<String>,
    pub content: String,
    pub action: Option<serde_json::Value>,
    pub exec_error: Option<String>,
    pub vlm_calls: usize,
}

impl StepRecord {
    pub fn from_step(episode_id: &str, step: &StepData) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            episode_id: episode_id.to_string(),
            step_idx: step.step_idx,
            package: step.curr_env_state.package.clone(),
            thought: step.thought.clone(),
            content: step.content.clone(),
            action: step
                .action
                .as_ref()
                .and_then(|a| serde_json::to_value(a).ok()),
            exec_error: step.exec_error.clone(),
            vlm_calls: step.vlm_call_history.len(),
        }
    }
}

/// Append-only trajectory file for one episode.
pub struct TrajectoryLog {
    file_path: PathBuf,
}

impl TrajectoryLog {
    pub fn new(episode_id: &str, dir: Option<&Path>) -> Self {
        let dir = dir.map(Path::to_path_buf).unwrap_or_else(data_dir_or_cwd);
        let _ = std::fs::create_dir_all(&dir);
        Self {
            file_path: dir.join(format!("episode_{episode_id}.jsonl")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    pub fn append(&self, record: &StepRecord) -> MobileUseResult<()> {
        let line = serde_json::to_string(record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.file_path)?;
        writeln!(file, "{}", line)?;
        tracing::debug!(
            path = %self.file_path.display(),
            step = record.step_idx,
            "trajectory entry flushed"
        );
        Ok(())
    }
}

/// Returns `<data_local_dir>/mobile-use/episodes`, falling back to the
/// current working directory.
fn data_dir_or_cwd() -> PathBuf {
    if let Some(base) = dirs::data_local_dir() {
        return base.join("mobile-use").join("episodes");
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
