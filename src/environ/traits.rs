use async_trait::async_trait;

use crate::agent_engine::state::Action;
use crate::environ::types::EnvState;
use crate::errors::MobileUseResult;

/// The device the agent drives.
///
/// `execute_action` should fail with [`MobileUseError::Environment`] when the
/// action cannot be carried out (unsupported name, bad coordinate, device
/// fault); the agent treats that as a failed step, not a failed episode.
///
/// [`MobileUseError::Environment`]: crate::errors::MobileUseError::Environment
#[async_trait]
pub trait Environment: Send + Sync {
    async fn get_state(&self) -> MobileUseResult<EnvState>;

    async fn execute_action(&self, action: &Action) -> MobileUseResult<()>;
}
