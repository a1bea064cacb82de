use crate::agent_engine::policy::AgentPolicy;
use crate::agent_engine::variants::qwen::QwenPolicy;
use crate::agent_engine::variants::react::ReactPolicy;
use crate::errors::{MobileUseError, MobileUseResult};

/// Registry keys accepted by [`build_policy`].
pub const VARIANTS: &[&str] = &["default", "react", "qwen"];

/// Resolve an agent variant by its config name.
pub fn build_policy(name: &str) -> MobileUseResult<Box<dyn AgentPolicy>> {
    let policy: Box<dyn AgentPolicy> = match name.to_ascii_lowercase().as_str() {
        "default" | "react" => Box::new(ReactPolicy),
        "qwen" => Box::new(QwenPolicy),
        other => {
            return Err(MobileUseError::Config(format!(
                "unknown agent variant '{other}', expected one of {VARIANTS:?}"
            )))
        }
    };
    tracing::debug!(variant = policy.name(), "agent policy resolved");
    Ok(policy)
}
