pub mod agent_engine;
pub mod config;
pub mod environ;
pub mod errors;
pub mod llm;
pub mod perception;

pub use crate::agent_engine::engine::{Agent, EpisodeRun, StepRun};
pub use crate::agent_engine::episode::{EpisodeData, EpisodeOutcome, StepData};
pub use crate::agent_engine::state::{Action, AgentState, AgentStatus, ParamValue, Point};
pub use crate::environ::traits::Environment;
pub use crate::environ::types::EnvState;
pub use crate::errors::{MobileUseError, MobileUseResult, ParseError};
pub use crate::llm::provider::{Completion, VlmProvider};

/// Install the global `tracing` subscriber. Honours `RUST_LOG`, defaulting
/// to `info`. Safe to call more than once.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}
