use thiserror::Error;

#[derive(Debug, Error)]
pub enum MobileUseError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("VLM provider error: {0}")]
    VlmProvider(String),

    #[error("SSE parsing error: {0}")]
    SseParsing(String),

    #[error("Response parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("Environment error: {0}")]
    Environment(String),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    /// Usage error: the agent was driven from a state that does not allow it.
    #[error("Agent state error: {0}")]
    AgentState(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("TOML deserialize error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

/// Why a model response could not be turned into an action.
///
/// The `Display` text is quoted back to the model during reflection, so keep
/// it short and concrete.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("no `Action:` marker in the response")]
    MissingActionMarker,

    #[error("no action name after the `Action:` marker")]
    MissingActionName,

    #[error("action `{0}` is not in the action space")]
    UnknownAction(String),

    #[error("parameter `{key}` is not a valid coordinate: {value}")]
    MalformedCoordinate { key: String, value: String },

    #[error("cannot extract a mobile_use tool call from the response")]
    MissingToolCall,

    #[error("malformed tool call: {0}")]
    MalformedToolCall(String),
}

pub type MobileUseResult<T> = Result<T, MobileUseError>;
