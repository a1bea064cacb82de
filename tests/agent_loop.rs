use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;

use mobile_use::agent_engine::registry::build_policy;
use mobile_use::config::AgentConfig;
use mobile_use::llm::types::{ChatMessage, ContentPart, MessageContent};
use mobile_use::{
    Action, Agent, AgentState, AgentStatus, Completion, EnvState, Environment, EpisodeOutcome,
    MobileUseError, MobileUseResult, ParamValue, Point, VlmProvider,
};

enum Reply {
    Text(&'static str),
    Chunks(Vec<&'static str>),
    Fail(&'static str),
}

/// Plays back canned replies in order and remembers every conversation it saw.
struct ScriptedVlm {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Vec<ChatMessage>>>,
    stream_flags: Mutex<Vec<bool>>,
}

impl ScriptedVlm {
    fn new(replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
            stream_flags: Mutex::new(Vec::new()),
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    fn last_call(&self) -> Vec<ChatMessage> {
        self.calls.lock().unwrap().last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl VlmProvider for ScriptedVlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn predict(&self, messages: &[ChatMessage], stream: bool) -> MobileUseResult<Completion> {
        self.calls.lock().unwrap().push(messages.to_vec());
        self.stream_flags.lock().unwrap().push(stream);
        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Reply::Text("Thought: out of script\nAction: finished()"));
        match reply {
            Reply::Fail(msg) => Err(MobileUseError::VlmProvider(msg.into())),
            Reply::Text(text) => Ok(Completion::Complete(text.into())),
            Reply::Chunks(chunks) if stream => {
                let items: Vec<MobileUseResult<String>> =
                    chunks.into_iter().map(|c| Ok(c.to_string())).collect();
                Ok(Completion::Stream(futures_util::stream::iter(items).boxed()))
            }
            Reply::Chunks(chunks) => Ok(Completion::Complete(chunks.concat())),
        }
    }
}

/// A blank screen of fixed size that records what it was asked to do.
struct FakeDevice {
    width: u32,
    height: u32,
    executed: Mutex<Vec<Action>>,
    reject: Option<&'static str>,
}

impl FakeDevice {
    fn new(width: u32, height: u32) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            executed: Mutex::new(Vec::new()),
            reject: None,
        })
    }

    fn rejecting(width: u32, height: u32, name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            width,
            height,
            executed: Mutex::new(Vec::new()),
            reject: Some(name),
        })
    }

    fn executed(&self) -> Vec<Action> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl Environment for FakeDevice {
    async fn get_state(&self) -> MobileUseResult<EnvState> {
        Ok(EnvState::new(
            image::DynamicImage::new_rgb8(self.width, self.height),
            "com.google.android.apps.nexuslauncher",
        ))
    }

    async fn execute_action(&self, action: &Action) -> MobileUseResult<()> {
        if self.reject == Some(action.name()) {
            return Err(MobileUseError::Environment(format!("cannot perform {}", action.name())));
        }
        self.executed.lock().unwrap().push(action.clone());
        Ok(())
    }
}

fn config(max_steps: usize) -> AgentConfig {
    AgentConfig {
        max_steps,
        reflection_action_waiting_seconds: 0.0,
        retry_vlm_waiting_seconds: 0.0,
        ..AgentConfig::default()
    }
}

fn agent(variant: &str, cfg: AgentConfig, vlm: Arc<ScriptedVlm>, device: Arc<FakeDevice>) -> Agent {
    Agent::new(cfg, build_policy(variant).unwrap(), vlm, device)
}

fn first_image_url(messages: &[ChatMessage]) -> Option<Arc<str>> {
    messages.iter().find_map(|m| match &m.content {
        MessageContent::Parts(parts) => parts.iter().find_map(|p| match p {
            ContentPart::ImageUrl { image_url, .. } => Some(image_url.url.clone()),
            _ => None,
        }),
        MessageContent::Text(_) => None,
    })
}

fn all_text(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .flat_map(|m| match &m.content {
            MessageContent::Parts(parts) => parts.clone(),
            MessageContent::Text(t) => vec![ContentPart::text(t.clone())],
        })
        .filter_map(|p| match p {
            ContentPart::Text { text } => Some(text),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test]
async fn tap_then_finish_ends_the_episode() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("Thought: I will tap the icon.\nAction: click(point='(256,512)')"),
        Reply::Text("Thought: Photos is open.\nAction: finished()"),
    ]);
    let device = FakeDevice::new(1000, 2000);
    let mut agent = agent("default", config(10), vlm.clone(), device.clone());

    let episode = agent.run("Open the Photos app").await.unwrap();

    assert_eq!(episode.status, AgentStatus::Finished);
    assert_eq!(episode.outcome, Some(EpisodeOutcome::Finished));
    assert_eq!(episode.num_steps, 2);
    assert_eq!(episode.trajectory.len(), 2);
    assert_eq!(agent.state(), AgentState::Ready);

    let executed = device.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(executed[0].name(), "click");
    assert_eq!(
        executed[0].param("point"),
        Some(&ParamValue::Point(Point { x: 500, y: 1000 }))
    );

    let first = &episode.trajectory[0];
    assert_eq!(first.step_idx, 0);
    assert_eq!(first.thought.as_deref(), Some("I will tap the icon."));
    assert!(first.exec_env_state.is_some());
    let last = &episode.trajectory[1];
    assert_eq!(last.action.as_ref().map(|a| a.name()), Some("finished"));
    assert!(last.exec_env_state.is_none());
    assert_eq!(vlm.call_count(), 2);
}

#[tokio::test]
async fn exhausted_reflection_leaves_step_without_action() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("I am not sure what to do."),
        Reply::Text("Still thinking."),
        Reply::Text("Thought: hmm"),
        Reply::Text("Thought: done\nAction: finished()"),
    ]);
    let device = FakeDevice::new(100, 200);
    let cfg = AgentConfig {
        max_reflection_action: 2,
        ..config(5)
    };
    let mut agent = agent("default", cfg, vlm.clone(), device.clone());

    let episode = agent.run("Open the Photos app").await.unwrap();

    let first = &episode.trajectory[0];
    assert!(first.action.is_none());
    assert!(first.exec_env_state.is_none());
    assert_eq!(first.vlm_call_history.len(), 3);
    assert!(device.executed().is_empty());

    assert_eq!(episode.trajectory[1].step_idx, 1);
    assert_eq!(episode.status, AgentStatus::Finished);
    assert_eq!(vlm.call_count(), 4);
}

#[tokio::test]
async fn reflection_quotes_the_parse_error_back() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("Thought: go\nAction: teleport()"),
        Reply::Text("Thought: go\nAction: press_home()"),
        Reply::Text("Action: finished()"),
    ]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(5), vlm.clone(), device.clone());

    let mut run = agent.iter_run("Go home", false).unwrap();
    let first = run.next().await.unwrap();
    assert_eq!(first.action.as_ref().map(|a| a.name()), Some("press_home"));
    assert_eq!(first.vlm_call_history.len(), 2);
    while run.next().await.is_some() {}

    let retry_prompt = all_text(&vlm.calls.lock().unwrap()[1]);
    assert!(retry_prompt.contains("Failed to parse the action from: Thought: go\nAction: teleport()"));
    assert!(retry_prompt.contains("`teleport` is not in the action space"));
    assert_eq!(device.executed().len(), 1);
}

#[tokio::test]
async fn running_out_of_steps_is_distinct_from_finishing() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("Action: press_back()"),
        Reply::Text("Action: press_back()"),
    ]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(2), vlm, device.clone());

    let episode = agent.run("Find the settings").await.unwrap();

    assert_eq!(episode.status, AgentStatus::Running);
    assert_eq!(episode.outcome, Some(EpisodeOutcome::StepsExhausted));
    assert!(episode.message.contains("max number of steps"));
    assert_eq!(episode.trajectory.len(), 2);
    assert_eq!(device.executed().len(), 2);
    assert_eq!(agent.state(), AgentState::Ready);
}

#[tokio::test]
async fn vlm_failure_ends_episode_as_failed() {
    let vlm = ScriptedVlm::new(vec![Reply::Fail("503 overloaded"), Reply::Fail("503 overloaded")]);
    let device = FakeDevice::new(100, 200);
    let cfg = AgentConfig {
        max_retry_vlm: 2,
        ..config(5)
    };
    let mut agent = agent("default", cfg, vlm.clone(), device);

    let episode = agent.run("Open the Photos app").await.unwrap();

    assert_eq!(episode.status, AgentStatus::Failed);
    assert_eq!(episode.outcome, Some(EpisodeOutcome::Failed));
    assert!(episode.message.contains("503 overloaded"));
    assert_eq!(episode.trajectory.len(), 1);
    assert!(episode.trajectory[0].action.is_none());
    assert_eq!(vlm.call_count(), 2);
}

#[tokio::test]
async fn transient_vlm_failure_is_retried() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Fail("connection reset"),
        Reply::Text("Action: finished()"),
    ]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(5), vlm.clone(), device);

    let episode = agent.run("Open the Photos app").await.unwrap();

    assert_eq!(episode.status, AgentStatus::Finished);
    assert_eq!(vlm.call_count(), 2);
}

#[tokio::test]
async fn rejected_action_does_not_end_the_episode() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("Action: long_press(point='(10,10)')"),
        Reply::Text("Action: finished()"),
    ]);
    let device = FakeDevice::rejecting(100, 200, "long_press");
    let mut agent = agent("default", config(5), vlm, device);

    let episode = agent.run("Open the Photos app").await.unwrap();

    let first = &episode.trajectory[0];
    assert_eq!(first.action.as_ref().map(|a| a.name()), Some("long_press"));
    assert!(first.exec_env_state.is_none());
    assert!(first.exec_error.as_deref().unwrap_or("").contains("cannot perform long_press"));
    assert_eq!(episode.status, AgentStatus::Finished);
}

#[tokio::test]
async fn call_user_suspends_and_resumes_with_the_answer() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("Thought: Which album?\nAction: call_user(question='Which album?')"),
        Reply::Text("Thought: got it\nAction: finished()"),
    ]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(5), vlm.clone(), device.clone());

    let episode = agent.run("Open my album").await.unwrap();
    assert_eq!(agent.state(), AgentState::CallUser);
    assert_eq!(episode.status, AgentStatus::Running);
    assert_eq!(episode.outcome, Some(EpisodeOutcome::CallUser));
    assert_eq!(episode.trajectory.len(), 1);
    assert!(device.executed().is_empty());

    assert!(matches!(agent.step(false), Err(MobileUseError::AgentState(_))));

    let episode = agent.run("Vacation 2024").await.unwrap();
    assert_eq!(episode.status, AgentStatus::Finished);
    assert_eq!(episode.trajectory.len(), 2);
    assert_eq!(episode.trajectory[1].step_idx, 1);

    let resumed = vlm.last_call();
    let last_user = resumed.iter().rev().find(|m| m.role == "user").unwrap();
    match &last_user.content {
        MessageContent::Parts(parts) => {
            assert!(matches!(parts.last(), Some(ContentPart::Text { text }) if text == "Vacation 2024"));
        }
        MessageContent::Text(_) => panic!("expected parts"),
    }
}

#[tokio::test]
async fn usage_errors_are_raised_immediately() {
    let vlm = ScriptedVlm::new(vec![]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(5), vlm.clone(), device);

    assert!(matches!(agent.step(false), Err(MobileUseError::AgentState(_))));
    assert!(matches!(agent.answer_user("hi"), Err(MobileUseError::AgentState(_))));

    agent.reset("Open the Photos app");
    assert!(matches!(
        agent.iter_run("another goal", false),
        Err(MobileUseError::AgentState(_))
    ));
    assert_eq!(vlm.call_count(), 0);
}

#[tokio::test]
async fn streaming_reveals_thought_before_the_action() {
    let vlm = ScriptedVlm::new(vec![Reply::Chunks(vec![
        "Thought: I will",
        " tap the icon.\nAct",
        "ion: click(point='(1,1)')",
    ])]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(5), vlm, device);
    agent.reset("Open the Photos app");

    let mut snapshots = Vec::new();
    {
        let mut step = agent.step(true).unwrap();
        while let Some(item) = step.next().await {
            snapshots.push(item.unwrap());
        }
    }

    assert!(snapshots.len() >= 2);
    assert_eq!(snapshots[0].thought.as_deref(), Some("I will"));
    assert!(snapshots[0].action.is_none());
    let last = snapshots.last().unwrap();
    assert_eq!(last.thought.as_deref(), Some("I will tap the icon."));
    assert_eq!(last.action.as_ref().map(|a| a.name()), Some("click"));
    assert_eq!(agent.episode().trajectory.len(), 1);
    assert_eq!(agent.curr_step_idx(), 1);
}

#[tokio::test]
async fn screenshot_budget_bounds_the_conversation() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("Action: press_back()"),
        Reply::Text("Action: press_back()"),
        Reply::Text("Action: press_back()"),
        Reply::Text("Action: press_back()"),
    ]);
    let device = FakeDevice::new(100, 200);
    let cfg = AgentConfig {
        num_latest_screenshot: 2,
        ..config(4)
    };
    let mut agent = agent("default", cfg, vlm.clone(), device);

    agent.run("Scroll around").await.unwrap();

    assert_eq!(agent.conversation().image_count(), 2);
    let sent = vlm.last_call();
    let images: usize = sent
        .iter()
        .map(|m| match &m.content {
            MessageContent::Parts(parts) => parts.iter().filter(|p| p.is_image()).count(),
            MessageContent::Text(_) => 0,
        })
        .sum();
    assert_eq!(images, 2);
    assert!(all_text(&sent).contains("Scroll around"));
}

#[tokio::test]
async fn qwen_tool_calls_drive_the_device() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text(
            "Thought: tap Photos\nAction: tap\n<tool_call>\n\
             {\"name\": \"mobile_use\", \"arguments\": {\"action\": \"click\", \"coordinate\": [546, 1204]}}\n\
             </tool_call>\nSummary: Tapped Photos.",
        ),
        Reply::Text(
            "Thought: done\n<tool_call>\n\
             {\"name\": \"mobile_use\", \"arguments\": {\"action\": \"terminate\", \"status\": \"success\"}}\n\
             </tool_call>\nSummary: Finished.",
        ),
    ]);
    let device = FakeDevice::new(1080, 2400);
    let mut agent = agent("qwen", config(5), vlm.clone(), device.clone());

    let episode = agent.run("Open the Photos app").await.unwrap();

    assert_eq!(episode.status, AgentStatus::Finished);
    let executed = device.executed();
    assert_eq!(executed.len(), 1);
    assert_eq!(
        executed[0].param("coordinate"),
        Some(&ParamValue::Point(Point { x: 540, y: 1200 }))
    );
    let second_call = all_text(&vlm.last_call());
    assert!(second_call.contains("Step 1: Thought: tap Photos"));
    assert!(second_call.contains("Summary: Tapped Photos."));
}

#[tokio::test]
async fn qwen_terminate_failure_fails_the_episode() {
    let vlm = ScriptedVlm::new(vec![Reply::Text(
        "{\"name\": \"mobile_use\", \"arguments\": {\"action\": \"terminate\", \"status\": \"failure\"}}",
    )]);
    let device = FakeDevice::new(1080, 2400);
    let mut agent = agent("qwen", config(5), vlm, device);

    let episode = agent.run("Book a flight to the moon").await.unwrap();

    assert_eq!(episode.status, AgentStatus::Failed);
    assert_eq!(episode.outcome, Some(EpisodeOutcome::Failed));
    assert_eq!(episode.trajectory.len(), 1);
    assert_eq!(agent.state(), AgentState::Ready);
}

#[tokio::test]
async fn streamed_retry_drops_the_rejected_rationale() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Chunks(vec!["Thought: wrong plan", " and more"]),
        Reply::Chunks(vec!["Action: ", "finished()"]),
    ]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(5), vlm, device);

    let mut partial_thoughts = Vec::new();
    {
        let mut run = agent.iter_run("Open the Photos app", true).unwrap();
        while let Some(step) = run.next().await {
            if step.action.is_none() {
                partial_thoughts.extend(step.thought);
            }
        }
    }

    assert_eq!(partial_thoughts.first().map(String::as_str), Some("wrong plan"));
    let episode = agent.episode();
    assert_eq!(episode.status, AgentStatus::Finished);
    let step = &episode.trajectory[0];
    assert_eq!(step.content, "Action: finished()");
    assert_eq!(step.thought, None);
    assert_eq!(step.vlm_call_history.len(), 2);
}

#[tokio::test]
async fn run_follows_the_configured_stream_flag() {
    for stream in [true, false] {
        let vlm = ScriptedVlm::new(vec![Reply::Chunks(vec!["Thought: done\n", "Action: finished()"])]);
        let device = FakeDevice::new(100, 200);
        let cfg = AgentConfig {
            stream,
            ..config(5)
        };
        let mut agent = agent("default", cfg, vlm.clone(), device);

        let episode = agent.run("Go").await.unwrap();

        assert_eq!(*vlm.stream_flags.lock().unwrap(), vec![stream]);
        assert_eq!(episode.status, AgentStatus::Finished);
        assert_eq!(episode.trajectory[0].thought.as_deref(), Some("done"));
    }
}

#[tokio::test]
async fn retries_within_a_step_share_the_screenshot() {
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("no marker here"),
        Reply::Text("Action: finished()"),
    ]);
    let device = FakeDevice::new(100, 200);
    let mut agent = agent("default", config(5), vlm, device);

    let episode = agent.run("Open the Photos app").await.unwrap();

    let calls = &episode.trajectory[0].vlm_call_history;
    assert_eq!(calls.len(), 2);
    let first = first_image_url(&calls[0].messages).unwrap();
    let second = first_image_url(&calls[1].messages).unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    let live = first_image_url(agent.conversation().messages()).unwrap();
    assert!(Arc::ptr_eq(&first, &live));
}

#[tokio::test]
async fn failed_step_is_written_to_the_trajectory_file() {
    let dir = tempfile::tempdir().unwrap();
    let vlm = ScriptedVlm::new(vec![
        Reply::Text("Action: press_back()"),
        Reply::Fail("502 bad gateway"),
    ]);
    let device = FakeDevice::new(100, 200);
    let cfg = AgentConfig {
        max_retry_vlm: 1,
        record_trajectory: true,
        trajectory_dir: Some(dir.path().to_path_buf()),
        ..config(5)
    };
    let mut agent = agent("default", cfg, vlm, device);

    let episode = agent.run("Go back twice").await.unwrap();
    assert_eq!(episode.status, AgentStatus::Failed);
    assert_eq!(episode.trajectory.len(), 2);

    let path = dir.path().join(format!("episode_{}.jsonl", episode.episode_id));
    let text = std::fs::read_to_string(path).unwrap();
    let lines: Vec<serde_json::Value> = text
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[1]["step_idx"], 1);
    assert!(lines[1]["action"].is_null());
}
