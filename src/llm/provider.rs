use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::errors::MobileUseResult;
use crate::llm::types::ChatMessage;

/// Incremental text deltas of a streamed completion.
pub type DeltaStream = BoxStream<'static, MobileUseResult<String>>;

/// What a VLM call returns: either the full text at once, or a stream of
/// text deltas that the caller drains at its own pace.
pub enum Completion {
    Complete(String),
    Stream(DeltaStream),
}

impl Completion {
    /// Drain the completion into a single string.
    pub async fn into_text(self) -> MobileUseResult<String> {
        match self {
            Completion::Complete(text) => Ok(text),
            Completion::Stream(mut deltas) => {
                let mut text = String::new();
                while let Some(delta) = deltas.next().await {
                    text.push_str(&delta?);
                }
                Ok(text)
            }
        }
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Completion::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            Completion::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// A vision-language model endpoint.
///
/// Implementations perform a single attempt per call; retry policy belongs to
/// the caller.
#[async_trait]
pub trait VlmProvider: Send + Sync {
    /// Returns the provider's identifier, used in logs.
    fn name(&self) -> &str;

    async fn predict(&self, messages: &[ChatMessage], stream: bool) -> MobileUseResult<Completion>;
}
