use image::DynamicImage;

use crate::agent_engine::context::Conversation;
use crate::agent_engine::parser::ParsedResponse;
use crate::agent_engine::state::{Action, Disposition};
use crate::errors::{MobileUseResult, ParseError};

/// What the model gets to see at the start of a step.
#[derive(Debug, Clone, Copy)]
pub enum Observation<'a> {
    /// A fresh screenshot at device resolution.
    Screenshot(&'a DynamicImage),
    /// The human's reply after a `call_user` suspension.
    UserAnswer(&'a str),
}

/// Per-step facts a policy needs when shaping the conversation.
#[derive(Debug, Clone, Copy)]
pub struct TurnInfo<'a> {
    pub goal: &'a str,
    pub step_idx: usize,
    /// Size of the image as the model perceives it.
    pub displayed: (u32, u32),
}

/// The parts that differ between agent variants: prompt layout, output
/// grammar, action vocabulary and how terminal actions are recognised.
///
/// The step state machine in [`Agent`](crate::agent_engine::engine::Agent) is
/// shared; it calls into the policy at fixed points of every step.
pub trait AgentPolicy: Send + Sync {
    /// Registry key.
    fn name(&self) -> &'static str;

    /// Start and end markers of the rationale, used to reveal it while streaming.
    fn thought_markers(&self) -> (&'static str, &'static str);

    /// Resolution the model reasons in, given the device resolution.
    fn displayed_size(&self, raw: (u32, u32)) -> MobileUseResult<(u32, u32)>;

    /// Seed the conversation on the first step and add this step's observation.
    fn begin_step(
        &self,
        conversation: &mut Conversation,
        turn: TurnInfo<'_>,
        observation: Observation<'_>,
    ) -> MobileUseResult<()>;

    /// Parse a response against this variant's grammar and action vocabulary.
    fn parse(
        &self,
        content: &str,
        displayed: (u32, u32),
        raw: (u32, u32),
    ) -> Result<ParsedResponse, ParseError>;

    /// Tell the model why its last answer was rejected.
    fn reflect(&self, conversation: &mut Conversation, content: &str, error: &ParseError);

    /// Record the step's outcome in the conversation once the step is over.
    fn end_step(
        &self,
        conversation: &mut Conversation,
        turn: TurnInfo<'_>,
        content: &str,
        parsed: Option<&ParsedResponse>,
    );

    fn disposition(&self, action: &Action) -> Disposition;
}
