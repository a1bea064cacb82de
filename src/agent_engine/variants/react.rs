use crate::agent_engine::context::Conversation;
use crate::agent_engine::parser::{parse_react, ParsedResponse};
use crate::agent_engine::policy::{AgentPolicy, Observation, TurnInfo};
use crate::agent_engine::state::{Action, Disposition};
use crate::errors::{MobileUseResult, ParseError};
use crate::llm::types::{ChatMessage, ContentPart};
use crate::perception::image_codec::{encode_image_url, thumbnail, thumbnail_size};

/// Longest side, in pixels, of the screenshot shown to the model.
const THUMBNAIL_BOX: u32 = 1024;

const VOCABULARY: &[&str] = &[
    "click",
    "long_press",
    "type",
    "scroll",
    "press_home",
    "press_back",
    "finished",
    "call_user",
];

const PROMPT_PREFIX: &str = "\
You are a GUI agent operating a mobile phone. You are given a task, your action history and \
screenshots. Decide the next action that moves the task forward.

## Output Format
```
Thought: ...
Action: ...
```

## Action Space
click(point='(x1,y1)')
long_press(point='(x1,y1)')
type(text='')
scroll(start_point='(x1,y1)', end_point='(x3,y3)')
press_home()
press_back()
finished() # Submit the task whether it succeeded or not.
call_user(question='') # Ask the user when the task is unsolvable or you need their help.

## Note
- Write the `Thought` part in English.
- In `Thought`, sketch a short plan and end with one sentence naming the next action and its target element.
- click, long_press and scroll must carry coordinates.

## User Instruction
";

/// ReAct-style agent: `Thought:` / `Action:` text with `key='value'` parameters.
#[derive(Debug, Default)]
pub struct ReactPolicy;

impl AgentPolicy for ReactPolicy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn thought_markers(&self) -> (&'static str, &'static str) {
        ("Thought:", "Action")
    }

    fn displayed_size(&self, raw: (u32, u32)) -> MobileUseResult<(u32, u32)> {
        Ok(thumbnail_size(raw.0, raw.1, THUMBNAIL_BOX, THUMBNAIL_BOX))
    }

    fn begin_step(
        &self,
        conversation: &mut Conversation,
        turn: TurnInfo<'_>,
        observation: Observation<'_>,
    ) -> MobileUseResult<()> {
        if conversation.is_empty() {
            conversation.append_user_part(ContentPart::text(format!("{PROMPT_PREFIX}{}", turn.goal)));
        }
        let part = match observation {
            Observation::Screenshot(pixels) => {
                let shown = thumbnail(pixels, THUMBNAIL_BOX, THUMBNAIL_BOX);
                ContentPart::image(encode_image_url(&shown)?)
            }
            Observation::UserAnswer(answer) => ContentPart::text(answer),
        };
        conversation.append_user_part(part);
        Ok(())
    }

    fn parse(
        &self,
        content: &str,
        displayed: (u32, u32),
        raw: (u32, u32),
    ) -> Result<ParsedResponse, ParseError> {
        parse_react(content, displayed, raw, VOCABULARY)
    }

    fn reflect(&self, conversation: &mut Conversation, content: &str, error: &ParseError) {
        conversation.append_user_part(ContentPart::text(format!(
            "Failed to parse the action from: {content}. Error is: {error}"
        )));
    }

    fn end_step(
        &self,
        conversation: &mut Conversation,
        _turn: TurnInfo<'_>,
        content: &str,
        parsed: Option<&ParsedResponse>,
    ) {
        if parsed.is_some() {
            conversation.push(ChatMessage::assistant(content));
        }
    }

    fn disposition(&self, action: &Action) -> Disposition {
        match action.name() {
            "finished" => Disposition::Finish,
            "call_user" => Disposition::CallUser,
            _ => Disposition::Execute,
        }
    }
}
