use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use crate::agent_engine::context::Conversation;
use crate::agent_engine::episode::{EpisodeData, EpisodeOutcome, StepData, VlmCall};
use crate::agent_engine::history::{StepRecord, TrajectoryLog};
use crate::agent_engine::parser::{ParsedResponse, ThoughtTracker};
use crate::agent_engine::policy::{AgentPolicy, Observation, TurnInfo};
use crate::agent_engine::registry::build_policy;
use crate::agent_engine::state::{AgentState, AgentStatus, Disposition};
use crate::config::{AgentConfig, AppConfig};
use crate::environ::traits::Environment;
use crate::errors::{MobileUseError, MobileUseResult};
use crate::llm::provider::{Completion, DeltaStream, VlmProvider};
use crate::llm::providers::openai_compatible::OpenAiCompatibleProvider;

/// A screen agent bound to one VLM and one device.
///
/// Owns its episode and conversation exclusively; [`reset`](Agent::reset)
/// replaces both.
pub struct Agent {
    config: AgentConfig,
    policy: Box<dyn AgentPolicy>,
    vlm: Arc<dyn VlmProvider>,
    env: Arc<dyn Environment>,

    state: AgentState,
    status: AgentStatus,
    episode: EpisodeData,
    conversation: Conversation,
    curr_step_idx: usize,
    /// Human answer waiting to be shown to the model on the next step.
    user_input: Option<String>,
    trajectory_log: Option<TrajectoryLog>,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        policy: Box<dyn AgentPolicy>,
        vlm: Arc<dyn VlmProvider>,
        env: Arc<dyn Environment>,
    ) -> Self {
        Self {
            config,
            policy,
            vlm,
            env,
            state: AgentState::Ready,
            status: AgentStatus::Running,
            episode: EpisodeData::new(""),
            conversation: Conversation::new(),
            curr_step_idx: 0,
            user_input: None,
            trajectory_log: None,
        }
    }

    /// Build an agent from `config.toml` settings: the variant comes from the
    /// registry and the VLM is an OpenAI-compatible endpoint.
    pub fn from_config(config: &AppConfig, env: Arc<dyn Environment>) -> MobileUseResult<Self> {
        let policy = build_policy(&config.agent.variant)?;
        let vlm = Arc::new(OpenAiCompatibleProvider::from_config(&config.vlm));
        Ok(Self::new(config.agent.clone(), policy, vlm, env))
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    pub fn status(&self) -> AgentStatus {
        self.status
    }

    pub fn episode(&self) -> &EpisodeData {
        &self.episode
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    pub fn curr_step_idx(&self) -> usize {
        self.curr_step_idx
    }

    pub fn variant(&self) -> &'static str {
        self.policy.name()
    }

    /// Start a fresh episode for `goal`: `state → Running`.
    pub fn reset(&mut self, goal: &str) {
        self.episode = EpisodeData::new(goal);
        self.conversation.clear();
        self.state = AgentState::Running;
        self.status = AgentStatus::Running;
        self.curr_step_idx = 0;
        self.user_input = None;
        self.trajectory_log = self.config.record_trajectory.then(|| {
            TrajectoryLog::new(&self.episode.episode_id, self.config.trajectory_dir.as_deref())
        });
        tracing::info!(
            episode = %self.episode.episode_id,
            variant = self.policy.name(),
            max_steps = self.config.max_steps,
            "agent reset"
        );
    }

    /// Hand the human's answer to a suspended agent: `CallUser → Running`.
    pub fn answer_user(&mut self, answer: &str) -> MobileUseResult<()> {
        if self.state != AgentState::CallUser {
            return Err(MobileUseError::AgentState(format!(
                "no pending question for the user (state {:?})",
                self.state
            )));
        }
        tracing::info!(goal = %self.episode.goal, answer, "continue task with user input");
        self.user_input = Some(answer.to_string());
        self.state = AgentState::Running;
        Ok(())
    }

    /// Run a single step. Drive the returned producer with
    /// [`StepRun::next`]; it yields partial records while a streamed
    /// response reveals the rationale, then the finished record.
    ///
    /// Errors from the step are returned as-is; use [`iter_run`](Agent::iter_run)
    /// to have them folded into the episode outcome.
    pub fn step(&mut self, stream: bool) -> MobileUseResult<StepRun<'_>> {
        self.ensure_steppable()?;
        if self.curr_step_idx >= self.config.max_steps {
            return Err(MobileUseError::AgentState(format!(
                "step budget of {} exhausted",
                self.config.max_steps
            )));
        }
        Ok(StepRun {
            agent: self,
            stream,
            cursor: None,
            done: false,
        })
    }

    /// Start a new episode (when ready) or resume a suspended one with the
    /// user's answer, and return a producer over its steps.
    pub fn iter_run(&mut self, input: &str, stream: bool) -> MobileUseResult<EpisodeRun<'_>> {
        match self.state {
            AgentState::Ready => {
                self.reset(input);
                tracing::info!(goal = %input, max_steps = self.config.max_steps, "start task");
            }
            AgentState::CallUser => self.answer_user(input)?,
            AgentState::Running => {
                return Err(MobileUseError::AgentState(
                    "agent is already running an episode".into(),
                ))
            }
        }
        Ok(EpisodeRun {
            agent: self,
            stream,
            cursor: None,
            finished: false,
        })
    }

    /// Blocking form of [`iter_run`](Agent::iter_run); streams when
    /// `agent.stream` is set in the config.
    pub async fn run(&mut self, input: &str) -> MobileUseResult<EpisodeData> {
        let stream = self.config.stream;
        {
            let mut run = self.iter_run(input, stream)?;
            while run.next().await.is_some() {}
        }
        Ok(self.episode.clone())
    }

    fn ensure_steppable(&self) -> MobileUseResult<()> {
        match self.state {
            AgentState::Ready => Err(MobileUseError::AgentState(
                "no active episode; call reset first".into(),
            )),
            AgentState::CallUser => Err(MobileUseError::AgentState(
                "agent is waiting for the user's answer".into(),
            )),
            AgentState::Running if self.status != AgentStatus::Running => Err(
                MobileUseError::AgentState(format!("episode already ended as {:?}", self.status)),
            ),
            AgentState::Running => Ok(()),
        }
    }

    /// Call the VLM with the whole conversation, retrying failed attempts.
    async fn predict(&self, stream: bool) -> MobileUseResult<Completion> {
        let attempts = self.config.max_retry_vlm.max(1);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match self.vlm.predict(self.conversation.messages(), stream).await {
                Ok(completion) => return Ok(completion),
                Err(e) => {
                    tracing::warn!(
                        provider = self.vlm.name(),
                        attempt,
                        attempts,
                        error = %e,
                        "VLM call failed"
                    );
                    last_err = Some(e);
                    if attempt < attempts {
                        pause(self.config.retry_vlm_waiting_seconds).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| MobileUseError::VlmProvider("no VLM attempt was made".into())))
    }

    /// Apply a parsed action (or its absence) to the step and the device.
    async fn conclude_step(
        &mut self,
        step: &mut StepData,
        parsed: Option<&ParsedResponse>,
    ) -> MobileUseResult<()> {
        let Some(parsed) = parsed else {
            tracing::error!(step = step.step_idx, "action parse error after max retry");
            return Ok(());
        };

        let action = parsed.action.clone();
        step.action = Some(action.clone());
        if parsed.thought.is_some() {
            step.thought = parsed.thought.clone();
        }

        match self.policy.disposition(&action) {
            Disposition::Finish => {
                tracing::info!(%action, "finished");
                self.status = AgentStatus::Finished;
            }
            Disposition::Fail => {
                tracing::info!(%action, "model reports task failure");
                self.status = AgentStatus::Failed;
            }
            Disposition::CallUser => {
                tracing::info!(%action, "call for help from user");
                self.state = AgentState::CallUser;
            }
            Disposition::Execute => {
                tracing::info!(%action, "execute the action");
                match self.env.execute_action(&action).await {
                    Ok(()) => step.exec_env_state = Some(self.env.get_state().await?),
                    Err(e) => {
                        tracing::error!(%action, error = %e, "failed to execute the action");
                        step.exec_error = Some(e.to_string());
                    }
                }
            }
        }
        Ok(())
    }

    fn record(&self, step: &StepData) {
        if let Some(log) = &self.trajectory_log {
            if let Err(e) = log.append(&StepRecord::from_step(&self.episode.episode_id, step)) {
                tracing::warn!(error = %e, "trajectory record not written");
            }
        }
    }

    /// Append a finalized step to the trajectory and update episode bookkeeping.
    fn settle_step(&mut self, step: StepData) {
        self.record(&step);
        let step_idx = step.step_idx;
        self.episode.trajectory.push(step);
        self.episode.num_steps = step_idx + 1;
        self.episode.status = self.status;
        self.curr_step_idx = step_idx + 1;

        if self.status == AgentStatus::Finished {
            tracing::info!("agent indicates task is done");
            self.episode.message = "Agent indicates task is done".into();
            self.episode.outcome = Some(EpisodeOutcome::Finished);
            self.state = AgentState::Ready;
        } else if self.status == AgentStatus::Failed {
            tracing::info!("agent indicates task is failed");
            self.episode.message = "Agent indicates task is failed".into();
            self.episode.outcome = Some(EpisodeOutcome::Failed);
            self.state = AgentState::Ready;
        } else if self.state == AgentState::CallUser {
            tracing::info!("agent indicates to ask user for help");
            self.episode.message = "Agent is waiting for the user's answer".into();
            self.episode.outcome = Some(EpisodeOutcome::CallUser);
        } else {
            tracing::info!(step = step_idx, "agent indicates one step is done");
        }
    }

    /// Record an unrecoverable step error as the episode's end.
    fn fail_episode(&mut self, error: &MobileUseError, partial: Option<StepData>) {
        tracing::error!(step = self.curr_step_idx, error = %error, "step failed, ending episode");
        if let Some(step) = partial {
            self.record(&step);
            self.episode.trajectory.push(step);
        }
        self.status = AgentStatus::Failed;
        self.state = AgentState::Ready;
        self.episode.status = AgentStatus::Failed;
        self.episode.num_steps = self.curr_step_idx + 1;
        self.episode.message = error.to_string();
        self.episode.outcome = Some(EpisodeOutcome::Failed);
    }

    fn mark_exhausted(&mut self) {
        tracing::warn!(max_steps = self.config.max_steps, "agent reached max number of steps");
        self.episode.status = self.status;
        self.episode.message = format!("Reached max number of steps: {}", self.config.max_steps);
        self.episode.outcome = Some(EpisodeOutcome::StepsExhausted);
        self.state = AgentState::Ready;
    }

    fn is_episode_over(&self) -> bool {
        self.status != AgentStatus::Running || self.state == AgentState::CallUser
    }
}

async fn pause(seconds: f64) {
    if seconds > 0.0 {
        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    }
}

enum Phase {
    Request,
    Streaming(DeltaStream),
    Parse,
    Done,
}

enum StepEvent {
    Partial(StepData),
    Completed(StepData),
}

/// The in-flight state of one step, kept apart from the agent borrow so
/// both producers can drive it.
struct StepCursor {
    stream: bool,
    phase: Phase,
    step: StepData,
    tracker: ThoughtTracker,
    displayed: (u32, u32),
    raw: (u32, u32),
    reflections_left: u32,
}

impl StepCursor {
    /// Observe the device (or take the pending user answer) and add this
    /// step's turn to the conversation.
    async fn start(agent: &mut Agent, stream: bool) -> MobileUseResult<Self> {
        let step_idx = agent.curr_step_idx;
        tracing::info!(step = step_idx, "step start");

        let answer = agent.user_input.take();
        let curr_env_state = match (&answer, agent.episode.trajectory.last()) {
            // The screen has not changed since the step that asked the user.
            (Some(_), Some(prev)) => prev.curr_env_state.clone(),
            _ => agent.env.get_state().await?,
        };
        let raw = curr_env_state.size();
        let displayed = agent.policy.displayed_size(raw)?;

        let observation = match &answer {
            Some(text) => Observation::UserAnswer(text),
            None => Observation::Screenshot(&*curr_env_state.pixels),
        };
        let turn = TurnInfo {
            goal: &agent.episode.goal,
            step_idx,
            displayed,
        };
        agent.policy.begin_step(&mut agent.conversation, turn, observation)?;
        agent.conversation.prune_images(agent.config.num_latest_screenshot);

        let (start, end) = agent.policy.thought_markers();
        Ok(Self {
            stream,
            phase: Phase::Request,
            step: StepData::new(step_idx, curr_env_state),
            tracker: ThoughtTracker::new(start, end),
            displayed,
            raw,
            reflections_left: agent.config.max_reflection_action,
        })
    }

    /// The step as far as it got, for recording after a failure.
    fn partial(&self) -> StepData {
        self.step.clone()
    }

    async fn advance(&mut self, agent: &mut Agent) -> MobileUseResult<Option<StepEvent>> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Done) {
                Phase::Request => self.request(agent).await?,
                Phase::Streaming(mut deltas) => match deltas.next().await {
                    Some(delta) => {
                        self.step.content.push_str(&delta?);
                        self.phase = Phase::Streaming(deltas);
                        if let Some(thought) = self.tracker.update(&self.step.content) {
                            self.step.thought = Some(thought);
                            return Ok(Some(StepEvent::Partial(self.step.clone())));
                        }
                    }
                    None => {
                        tracing::debug!(content = %self.step.content, "content from VLM");
                        self.phase = Phase::Parse;
                    }
                },
                Phase::Parse => {
                    if let Some(step) = self.parse(agent).await? {
                        return Ok(Some(StepEvent::Completed(step)));
                    }
                }
                Phase::Done => return Ok(None),
            }
        }
    }

    async fn request(&mut self, agent: &mut Agent) -> MobileUseResult<()> {
        let (start, end) = agent.policy.thought_markers();
        self.tracker = ThoughtTracker::new(start, end);
        self.step.content.clear();
        self.step.thought = None;

        match agent.predict(self.stream).await? {
            Completion::Stream(deltas) => self.phase = Phase::Streaming(deltas),
            complete => {
                self.step.content = complete.into_text().await?;
                self.step.thought = self.tracker.extract(&self.step.content);
                tracing::debug!(content = %self.step.content, "content from VLM");
                self.phase = Phase::Parse;
            }
        }
        Ok(())
    }

    /// Parse the latest response. Returns the finished step, or `None` after
    /// queueing a reflection retry.
    async fn parse(&mut self, agent: &mut Agent) -> MobileUseResult<Option<StepData>> {
        let content = self.step.content.clone();
        self.step.vlm_call_history.push(VlmCall {
            messages: agent.conversation.messages().into(),
            response: content.clone(),
        });

        let parsed = match agent.policy.parse(&content, self.displayed, self.raw) {
            Ok(parsed) => {
                tracing::info!(
                    reason = parsed.thought.as_deref().unwrap_or(""),
                    action = %parsed.action,
                    "response parsed"
                );
                Some(parsed)
            }
            Err(err) if self.reflections_left > 0 => {
                self.reflections_left -= 1;
                tracing::warn!(
                    error = %err,
                    retries_left = self.reflections_left,
                    "failed to parse the action, asking the model to reflect"
                );
                agent.policy.reflect(&mut agent.conversation, &content, &err);
                agent.conversation.prune_images(agent.config.num_latest_screenshot);
                pause(agent.config.reflection_action_waiting_seconds).await;
                self.phase = Phase::Request;
                return Ok(None);
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to parse the action, no retries left");
                None
            }
        };

        agent.conclude_step(&mut self.step, parsed.as_ref()).await?;
        let turn = TurnInfo {
            goal: &agent.episode.goal,
            step_idx: self.step.step_idx,
            displayed: self.displayed,
        };
        agent
            .policy
            .end_step(&mut agent.conversation, turn, &content, parsed.as_ref());

        self.phase = Phase::Done;
        let finished = self.step.clone();
        agent.settle_step(finished.clone());
        Ok(Some(finished))
    }
}

/// Producer over one step. See [`Agent::step`].
pub struct StepRun<'a> {
    agent: &'a mut Agent,
    stream: bool,
    cursor: Option<StepCursor>,
    done: bool,
}

impl StepRun<'_> {
    pub async fn next(&mut self) -> Option<MobileUseResult<StepData>> {
        if self.done {
            return None;
        }
        if self.cursor.is_none() {
            match StepCursor::start(self.agent, self.stream).await {
                Ok(cursor) => self.cursor = Some(cursor),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
        let cursor = self.cursor.as_mut()?;
        match cursor.advance(self.agent).await {
            Ok(Some(StepEvent::Partial(step))) => Some(Ok(step)),
            Ok(Some(StepEvent::Completed(step))) => {
                self.done = true;
                Some(Ok(step))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Producer over the steps of an episode. See [`Agent::iter_run`].
///
/// Yields partial and finished step records. Stops when the episode
/// finishes, fails, suspends for the user, or runs out of steps; step errors
/// end the episode as `Failed` instead of escaping.
pub struct EpisodeRun<'a> {
    agent: &'a mut Agent,
    stream: bool,
    cursor: Option<StepCursor>,
    finished: bool,
}

impl EpisodeRun<'_> {
    pub async fn next(&mut self) -> Option<StepData> {
        loop {
            if self.finished {
                return None;
            }

            if self.cursor.is_none() {
                if self.agent.curr_step_idx >= self.agent.config.max_steps {
                    self.agent.mark_exhausted();
                    self.finished = true;
                    return None;
                }
                match StepCursor::start(self.agent, self.stream).await {
                    Ok(cursor) => self.cursor = Some(cursor),
                    Err(e) => {
                        self.agent.fail_episode(&e, None);
                        self.finished = true;
                        return None;
                    }
                }
            }

            let cursor = self.cursor.as_mut()?;
            match cursor.advance(self.agent).await {
                Ok(Some(StepEvent::Partial(step))) => return Some(step),
                Ok(Some(StepEvent::Completed(step))) => {
                    self.cursor = None;
                    if self.agent.is_episode_over() {
                        self.finished = true;
                    }
                    return Some(step);
                }
                Ok(None) => self.cursor = None,
                Err(e) => {
                    let partial = cursor.partial();
                    self.agent.fail_episode(&e, Some(partial.clone()));
                    self.cursor = None;
                    self.finished = true;
                    return Some(partial);
                }
            }
        }
    }

    /// Drain the producer and return the episode record.
    pub async fn collect(mut self) -> EpisodeData {
        while self.next().await.is_some() {}
        self.agent.episode.clone()
    }
}
