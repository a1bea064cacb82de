use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::{MobileUseError, MobileUseResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub vlm: VlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VlmConfig {
    /// Full chat-completions endpoint, e.g. `https://host/v1/chat/completions`.
    pub api_base: String,
    pub model: String,
    #[serde(default = "default_temperature")]
    pub temperature: f64,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Optional API key stored in config.toml (overridden by env var VLM_API_KEY).
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_temperature() -> f64 {
    0.0
}

/// Knobs of the agent control loop. Every field has a default so an empty
/// `[agent]` table is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Registry key of the agent variant (`default`, `qwen`).
    #[serde(default = "default_variant")]
    pub variant: String,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// How many of the most recent screenshots stay attached to the conversation.
    #[serde(default = "default_num_latest_screenshot")]
    pub num_latest_screenshot: usize,
    /// Re-prompts allowed after the first unparseable response of a step.
    #[serde(default = "default_max_reflection_action")]
    pub max_reflection_action: u32,
    #[serde(default = "default_wait_seconds")]
    pub reflection_action_waiting_seconds: f64,
    /// Attempts per VLM call (1 = no retry).
    #[serde(default = "default_max_retry_vlm")]
    pub max_retry_vlm: u32,
    #[serde(default = "default_wait_seconds")]
    pub retry_vlm_waiting_seconds: f64,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub record_trajectory: bool,
    /// Where trajectory JSONL files go. Defaults to the platform data dir.
    #[serde(default)]
    pub trajectory_dir: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            variant: default_variant(),
            max_steps: default_max_steps(),
            num_latest_screenshot: default_num_latest_screenshot(),
            max_reflection_action: default_max_reflection_action(),
            reflection_action_waiting_seconds: default_wait_seconds(),
            max_retry_vlm: default_max_retry_vlm(),
            retry_vlm_waiting_seconds: default_wait_seconds(),
            stream: false,
            record_trajectory: false,
            trajectory_dir: None,
        }
    }
}

fn default_variant() -> String {
    "default".into()
}

fn default_max_steps() -> usize {
    10
}

fn default_num_latest_screenshot() -> usize {
    10
}

fn default_max_reflection_action() -> u32 {
    3
}

fn default_max_retry_vlm() -> u32 {
    3
}

fn default_wait_seconds() -> f64 {
    1.0
}

fn resolve_config_path() -> MobileUseResult<PathBuf> {
    if let Ok(exe) = std::env::current_exe() {
        if let Some(parent) = exe.parent() {
            let candidate = parent.join("config.toml");
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "config found next to executable");
                return Ok(candidate);
            }
        }
    }

    let cwd = std::env::current_dir()?;
    let candidate = cwd.join("config.toml");
    if candidate.exists() {
        tracing::debug!(path = %candidate.display(), "config found in working directory");
        return Ok(candidate);
    }

    Err(MobileUseError::Config(
        "config.toml not found next to executable or in working directory".into(),
    ))
}

pub fn load_config() -> MobileUseResult<AppConfig> {
    let path = resolve_config_path()?;
    load_config_from(&path)
}

/// Load a config file and apply the `VLM_API_KEY` / `VLM_BASE_URL` overrides.
pub fn load_config_from(path: &Path) -> MobileUseResult<AppConfig> {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    let content = std::fs::read_to_string(path)?;
    let mut config: AppConfig = toml::from_str(&content)?;
    apply_env_overrides(&mut config.vlm);
    tracing::info!(
        path = %path.display(),
        model = %config.vlm.model,
        variant = %config.agent.variant,
        "config loaded"
    );
    Ok(config)
}

fn apply_env_overrides(vlm: &mut VlmConfig) {
    if let Ok(key) = std::env::var("VLM_API_KEY") {
        if !key.is_empty() {
            vlm.api_key = Some(key);
        }
    }
    if let Ok(base) = std::env::var("VLM_BASE_URL") {
        if !base.is_empty() {
            vlm.api_base = base;
        }
    }
}

pub fn save_config(config: &AppConfig) -> MobileUseResult<()> {
    let path = resolve_config_path()?;
    save_config_to(config, &path)
}

pub fn save_config_to(config: &AppConfig, path: &Path) -> MobileUseResult<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    tracing::info!(path = %path.display(), "config saved");
    Ok(())
}
