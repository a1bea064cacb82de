use crate::agent_engine::context::Conversation;
use crate::agent_engine::parser::{parse_tool_call, ParsedResponse};
use crate::agent_engine::policy::{AgentPolicy, Observation, TurnInfo};
use crate::agent_engine::state::{Action, Disposition, ParamValue};
use crate::errors::{MobileUseResult, ParseError};
use crate::llm::types::{ChatMessage, ContentPart, ImageUrl};
use crate::perception::image_codec::{encode_image_url, smart_resize, QWEN_MAX_PIXELS, QWEN_MIN_PIXELS};

const VOCABULARY: &[&str] = &[
    "key",
    "click",
    "left_click",
    "long_press",
    "swipe",
    "type",
    "answer",
    "system_button",
    "open",
    "wait",
    "terminate",
];

const IMAGE_PLACEHOLDER: &str = "<|vision_start|><|image_pad|><|vision_end|>";

/// Parts of the single user turn: progress log, observation line, image slot.
const USER_TURN_PARTS: usize = 3;

const SYSTEM_PROMPT_HEAD: &str = r#"You are a helpful assistant.

# Tools

You may call one or more functions to assist with the user query.

You are provided with function signatures within <tools></tools> XML tags:
<tools>
{"type": "function", "function": {"name_for_human": "mobile_use", "name": "mobile_use", "description": "Use a touchscreen to interact with a mobile device, and take screenshots.
* This is an interface to a mobile device with touchscreen. You can perform actions like clicking, typing, swiping, etc.
* Some applications may take time to start or process actions, so you may need to wait and take successive screenshots to see the results of your actions."#;

const SYSTEM_PROMPT_TAIL: &str = r#"
* Make sure to click any buttons, links, icons, etc with the cursor tip in the center of the element. Don't click boxes on their edges unless asked.", "parameters": {"properties": {"action": {"description": "The action to perform. The available actions are:
* `key`: Perform a key event on the mobile device using adb `keyevent` syntax, e.g. \"volume_up\", \"power\".
* `click`: Click the point on the screen with coordinate (x, y).
* `long_press`: Press the point on the screen with coordinate (x, y) for specified seconds.
* `swipe`: Swipe from the starting point with coordinate (x, y) to the end point with coordinates2 (x2, y2).
* `type`: Input the specified text into the activated input box.
* `answer`: Output the answer.
* `system_button`: Press the system button.
* `open`: Open an app on the device.
* `wait`: Wait specified seconds for the change to happen.
* `terminate`: Terminate the current task and report its completion status.", "enum": ["key", "click", "long_press", "swipe", "type", "answer", "system_button", "open", "wait", "terminate"], "type": "string"}, "coordinate": {"description": "(x, y): pixels from the left and top edges. Required only by `action=click`, `action=long_press`, and `action=swipe`.", "type": "array"}, "coordinate2": {"description": "(x, y): pixels from the left and top edges. Required only by `action=swipe`.", "type": "array"}, "text": {"description": "Required only by `action=key`, `action=type`, `action=answer`, and `action=open`.", "type": "string"}, "time": {"description": "The seconds to wait. Required only by `action=long_press` and `action=wait`.", "type": "number"}, "button": {"description": "Back returns to the previous interface, Home to the desktop, Menu opens the application background menu, Enter presses enter. Required only by `action=system_button`", "enum": ["Back", "Home", "Menu", "Enter"], "type": "string"}, "status": {"description": "The status of the task. Required only by `action=terminate`.", "type": "string", "enum": ["success", "failure"]}}, "required": ["action"], "type": "object"}, "args_format": "Format the arguments as a JSON object."}}
</tools>

## Note
- If you think the task is finished, terminate the task in time.
- Action click, long_press and swipe must contain coordinates.
- You may be given the plan and actions of previous steps.
- Consider your plan carefully based on the task, the screenshot and the history actions.

Write a small plan and finally summarize your next action (with its target element) in one sentence in the `Thought` part.
For each function call, return a json object with function name and arguments within <tool_call></tool_call> XML tags:

## Format
Thought: The process of thinking.
Action: The next action. Must be one of the Action Space.
<tool_call>
{"name": <function-name>, "arguments": <args-json-object>}
</tool_call>
Summary: Summarize your action."#;

fn system_prompt(displayed: (u32, u32)) -> String {
    format!(
        "{SYSTEM_PROMPT_HEAD}\n* The screen's resolution is {}x{}.{SYSTEM_PROMPT_TAIL}",
        displayed.0, displayed.1
    )
}

fn progress_header(goal: &str) -> String {
    format!("The user query: {goal}\nTask progress (You have done the following operation on the current device): ")
}

/// Qwen2.5-VL agent: JSON tool calls, one rolling user turn holding a running
/// task-progress log plus the latest observation.
#[derive(Debug, Default)]
pub struct QwenPolicy;

impl AgentPolicy for QwenPolicy {
    fn name(&self) -> &'static str {
        "qwen"
    }

    fn thought_markers(&self) -> (&'static str, &'static str) {
        ("<thinking>", "</thinking>")
    }

    fn displayed_size(&self, raw: (u32, u32)) -> MobileUseResult<(u32, u32)> {
        smart_resize(raw.0, raw.1)
    }

    fn begin_step(
        &self,
        conversation: &mut Conversation,
        turn: TurnInfo<'_>,
        observation: Observation<'_>,
    ) -> MobileUseResult<()> {
        if conversation.is_empty() {
            conversation.push(ChatMessage::system(system_prompt(turn.displayed)));
            conversation.push(ChatMessage::user(vec![
                ContentPart::text(format!("{}None", progress_header(turn.goal))),
                ContentPart::text(""),
                ContentPart::text(""),
            ]));
        }

        let (observation_text, slot) = match observation {
            Observation::Screenshot(pixels) => (
                IMAGE_PLACEHOLDER.to_string(),
                ContentPart::ImageUrl {
                    image_url: ImageUrl {
                        url: encode_image_url(pixels)?.into(),
                    },
                    min_pixels: Some(QWEN_MIN_PIXELS),
                    max_pixels: Some(QWEN_MAX_PIXELS),
                },
            ),
            Observation::UserAnswer(answer) => (answer.to_string(), ContentPart::text("")),
        };

        let last = conversation.len() - 1;
        if let Some(parts) = conversation.parts_mut(last) {
            parts.truncate(USER_TURN_PARTS);
            parts.resize(USER_TURN_PARTS, ContentPart::text(""));
            parts[1] = ContentPart::text(format!("Observation: {observation_text}"));
            parts[2] = slot;
        }
        Ok(())
    }

    fn parse(
        &self,
        content: &str,
        displayed: (u32, u32),
        raw: (u32, u32),
    ) -> Result<ParsedResponse, ParseError> {
        parse_tool_call(content, displayed, raw, VOCABULARY)
    }

    fn reflect(&self, conversation: &mut Conversation, content: &str, error: &ParseError) {
        conversation.append_user_part(ContentPart::text(format!(
            "Failed to parse the action from: {content}. Error is: {error}\n\
             Please follow the instruction to provide a valid action."
        )));
    }

    fn end_step(
        &self,
        conversation: &mut Conversation,
        turn: TurnInfo<'_>,
        _content: &str,
        parsed: Option<&ParsedResponse>,
    ) {
        let last = conversation.len().saturating_sub(1);
        let Some(parts) = conversation.parts_mut(last) else {
            return;
        };
        // Drop reflection messages; they only mattered within the step.
        parts.truncate(USER_TURN_PARTS);

        let entry = match parsed {
            Some(p) => format!(
                "\nStep {}: Thought: {}\nAction: \n<tool_call>\n{}\n</tool_call>\nSummary: {}",
                turn.step_idx + 1,
                p.thought.as_deref().unwrap_or("None"),
                p.raw_action,
                p.summary.as_deref().unwrap_or("None"),
            ),
            None => format!("\nStep {}: None", turn.step_idx + 1),
        };
        if let Some(ContentPart::Text { text }) = parts.first_mut() {
            if turn.step_idx == 0 {
                *text = progress_header(turn.goal);
            }
            text.push_str(&entry);
        }
    }

    fn disposition(&self, action: &Action) -> Disposition {
        match action.name() {
            "terminate" => match action.param("status").and_then(ParamValue::as_str) {
                Some("success") => Disposition::Finish,
                _ => Disposition::Fail,
            },
            "call_user" => Disposition::CallUser,
            _ => Disposition::Execute,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::MessageContent;

    fn turn(step_idx: usize) -> TurnInfo<'static> {
        TurnInfo {
            goal: "Open the Photos app",
            step_idx,
            displayed: (1092, 2408),
        }
    }

    fn user_parts(conv: &Conversation) -> Vec<ContentPart> {
        match &conv.messages()[1].content {
            MessageContent::Parts(parts) => parts.clone(),
            MessageContent::Text(_) => panic!("expected parts"),
        }
    }

    fn text_of(part: &ContentPart) -> &str {
        match part {
            ContentPart::Text { text } => text,
            _ => panic!("expected text"),
        }
    }

    #[test]
    fn system_prompt_names_displayed_resolution() {
        let policy = QwenPolicy;
        let mut conv = Conversation::new();
        let img = image::DynamicImage::new_rgb8(8, 8);
        policy.begin_step(&mut conv, turn(0), Observation::Screenshot(&img)).unwrap();
        assert_eq!(conv.len(), 2);
        let MessageContent::Parts(sys) = &conv.messages()[0].content else {
            panic!("expected parts");
        };
        assert!(text_of(&sys[0]).contains("The screen's resolution is 1092x2408."));
        let parts = user_parts(&conv);
        assert_eq!(parts.len(), 3);
        assert!(text_of(&parts[0]).ends_with("None"));
        assert_eq!(text_of(&parts[1]), format!("Observation: {IMAGE_PLACEHOLDER}"));
        assert!(matches!(&parts[2], ContentPart::ImageUrl { min_pixels: Some(3136), .. }));
    }

    #[test]
    fn progress_log_accumulates_and_reflections_are_dropped() {
        let policy = QwenPolicy;
        let mut conv = Conversation::new();
        let img = image::DynamicImage::new_rgb8(8, 8);

        policy.begin_step(&mut conv, turn(0), Observation::Screenshot(&img)).unwrap();
        policy.reflect(&mut conv, "garbage", &ParseError::MissingToolCall);
        assert_eq!(user_parts(&conv).len(), 4);

        let content = "Thought: tap photos\n<tool_call>\n\
                       {\"name\": \"mobile_use\", \"arguments\": {\"action\": \"click\", \"coordinate\": [10, 20]}}\n\
                       </tool_call>\nSummary: tapped";
        let parsed = policy.parse(content, (1092, 2408), (1092, 2408)).unwrap();
        policy.end_step(&mut conv, turn(0), content, Some(&parsed));

        let parts = user_parts(&conv);
        assert_eq!(parts.len(), 3);
        let progress = text_of(&parts[0]);
        assert!(!progress.contains("None\nStep"));
        assert!(progress.contains("\nStep 1: Thought: tap photos\nAction: \n<tool_call>\n"));
        assert!(progress.ends_with("Summary: tapped"));

        policy.begin_step(&mut conv, turn(1), Observation::Screenshot(&img)).unwrap();
        policy.end_step(&mut conv, turn(1), "nonsense", None);
        assert!(text_of(&user_parts(&conv)[0]).ends_with("\nStep 2: None"));
        assert_eq!(conv.image_count(), 1);
    }

    #[test]
    fn user_answer_replaces_the_image_slot() {
        let policy = QwenPolicy;
        let mut conv = Conversation::new();
        let img = image::DynamicImage::new_rgb8(8, 8);
        policy.begin_step(&mut conv, turn(0), Observation::Screenshot(&img)).unwrap();
        policy.begin_step(&mut conv, turn(1), Observation::UserAnswer("use the camera roll")).unwrap();
        let parts = user_parts(&conv);
        assert_eq!(text_of(&parts[1]), "Observation: use the camera roll");
        assert_eq!(conv.image_count(), 0);
    }

    #[test]
    fn terminate_status_decides_outcome() {
        let policy = QwenPolicy;
        let ok = policy
            .parse(r#"{"name": "mobile_use", "arguments": {"action": "terminate", "status": "success"}}"#, (1, 1), (1, 1))
            .unwrap();
        assert_eq!(policy.disposition(&ok.action), Disposition::Finish);
        let bad = policy
            .parse(r#"{"name": "mobile_use", "arguments": {"action": "terminate", "status": "failure"}}"#, (1, 1), (1, 1))
            .unwrap();
        assert_eq!(policy.disposition(&bad.action), Disposition::Fail);
    }
}
