use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::agent_engine::state::{Action, AgentStatus};
use crate::environ::types::EnvState;
use crate::llm::types::ChatMessage;

/// One VLM attempt within a step: the conversation sent and the text received.
///
/// Screenshots inside the snapshot share their encoded data with the live
/// conversation.
#[derive(Debug, Clone)]
pub struct VlmCall {
    pub messages: Arc<[ChatMessage]>,
    pub response: String,
}

#[derive(Debug, Clone)]
pub struct StepData {
    pub step_idx: usize,
    pub curr_env_state: EnvState,
    /// Device state after the action ran; `None` if nothing was executed or
    /// execution failed.
    pub exec_env_state: Option<EnvState>,
    /// Raw model text of the latest attempt.
    pub content: String,
    pub thought: Option<String>,
    pub action: Option<Action>,
    /// Set when the device rejected the action.
    pub exec_error: Option<String>,
    pub vlm_call_history: Vec<VlmCall>,
}

impl StepData {
    pub fn new(step_idx: usize, curr_env_state: EnvState) -> Self {
        Self {
            step_idx,
            curr_env_state,
            exec_env_state: None,
            content: String::new(),
            thought: None,
            action: None,
            exec_error: None,
            vlm_call_history: Vec::new(),
        }
    }
}

/// How the episode driver last returned control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpisodeOutcome {
    Finished,
    Failed,
    /// `max_steps` reached without an explicit finish.
    StepsExhausted,
    /// Suspended until a human answer arrives.
    CallUser,
}

#[derive(Debug, Clone)]
pub struct EpisodeData {
    pub episode_id: String,
    pub goal: String,
    pub trajectory: Vec<StepData>,
    pub status: AgentStatus,
    pub num_steps: usize,
    pub message: String,
    pub outcome: Option<EpisodeOutcome>,
}

impl EpisodeData {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            episode_id: uuid::Uuid::new_v4().to_string(),
            goal: goal.into(),
            trajectory: Vec::new(),
            status: AgentStatus::Running,
            num_steps: 0,
            message: String::new(),
            outcome: None,
        }
    }
}
