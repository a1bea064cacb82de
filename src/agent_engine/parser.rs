//! Turns free-text model output into a rationale and a typed [`Action`].
//!
//! Everything here is pure: text plus image geometry in, a parsed response or a
//! [`ParseError`] out.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::agent_engine::state::{Action, ParamValue, Point};
use crate::errors::ParseError;

/// Parameters whose values are screen coordinates and must be rescaled.
pub const COORDINATE_KEYS: &[&str] = &[
    "point",
    "start_point",
    "end_point",
    "start_box",
    "end_box",
    "coordinate",
    "coordinate2",
];

const TOOL_CALL_PREFIX: &str = r#"{"name": "mobile_use","#;

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedResponse {
    pub thought: Option<String>,
    pub action: Action,
    /// The action as the model wrote it, for replaying into the progress log.
    pub raw_action: String,
    pub summary: Option<String>,
}

/// Map a point from the displayed image to device pixels:
/// `raw = round(displayed * raw_dim / displayed_dim)` per axis.
pub fn rescale(x: f64, y: f64, displayed: (u32, u32), raw: (u32, u32)) -> Point {
    let scale = |v: f64, d: u32, r: u32| (v * r as f64 / d as f64).round_ties_even() as i64;
    Point {
        x: scale(x, displayed.0, raw.0),
        y: scale(y, displayed.1, raw.1),
    }
}

fn react_thought_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)Thought:(.*)Action:").expect("static regex"))
}

fn react_action_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)Action:(.*)").expect("static regex"))
}

fn action_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z_]+").expect("static regex"))
}

fn react_param_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(\w+)='([^']*)'").expect("static regex"))
}

fn tool_call_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?s)\{"name": "mobile_use",(.*?)\}\}"#).expect("static regex"))
}

/// Parse `(x,y)`, `(x, y)` or `x,y` into a number pair.
fn parse_pair(value: &str) -> Option<(f64, f64)> {
    let inner = value
        .trim()
        .trim_start_matches(['(', '['])
        .trim_end_matches([')', ']']);
    let mut it = inner.split(',').map(|s| s.trim().parse::<f64>());
    match (it.next(), it.next(), it.next()) {
        (Some(Ok(x)), Some(Ok(y)), None) => Some((x, y)),
        _ => None,
    }
}

/// ReAct grammar:
///
/// ```text
/// Thought: ...
/// Action: click(point='(200,400)')
/// ```
pub fn parse_react(
    content: &str,
    displayed: (u32, u32),
    raw: (u32, u32),
    vocabulary: &[&str],
) -> Result<ParsedResponse, ParseError> {
    let thought = react_thought_re()
        .captures(content)
        .map(|c| c[1].trim().to_string());

    let action_s = react_action_re()
        .captures(content)
        .map(|c| c[1].trim().to_string())
        .ok_or(ParseError::MissingActionMarker)?;

    let lowered = action_s.to_lowercase();
    let name = action_name_re()
        .find(&lowered)
        .map(|m| m.as_str().to_string())
        .ok_or(ParseError::MissingActionName)?;

    let mut params = BTreeMap::new();
    for cap in react_param_re().captures_iter(&action_s) {
        let key = cap[1].to_string();
        let value = &cap[2];
        let parsed = if COORDINATE_KEYS.contains(&key.as_str()) {
            let (x, y) = parse_pair(value).ok_or_else(|| ParseError::MalformedCoordinate {
                key: key.clone(),
                value: value.to_string(),
            })?;
            ParamValue::Point(rescale(x, y, displayed, raw))
        } else {
            ParamValue::Text(value.trim().to_string())
        };
        params.insert(key, parsed);
    }

    let action = Action::new(name, params, vocabulary)?;
    Ok(ParsedResponse {
        thought,
        action,
        raw_action: action_s,
        summary: None,
    })
}

/// Tool-call grammar: a JSON object `{"name": "mobile_use", "arguments": {...}}`
/// somewhere in the text, usually inside `<tool_call>` tags, with a
/// `Thought:` line before it and a `Summary:` line after it.
pub fn parse_tool_call(
    content: &str,
    displayed: (u32, u32),
    raw: (u32, u32),
    vocabulary: &[&str],
) -> Result<ParsedResponse, ParseError> {
    let thought = tool_call_thought(content);
    let summary = line_after(content, "Summary:");

    let body = tool_call_re()
        .captures(content)
        .map(|c| c[1].trim().to_string())
        .ok_or(ParseError::MissingToolCall)?;
    let raw_action = format!("{TOOL_CALL_PREFIX}{body}}}}}");

    let call: serde_json::Value = serde_json::from_str(&raw_action)
        .map_err(|e| ParseError::MalformedToolCall(e.to_string()))?;
    let mut arguments = match call.get("arguments") {
        Some(serde_json::Value::Object(map)) => map.clone(),
        _ => return Err(ParseError::MalformedToolCall("`arguments` is not an object".into())),
    };
    let name = match arguments.remove("action") {
        Some(serde_json::Value::String(name)) => name,
        _ => return Err(ParseError::MissingActionName),
    };

    let mut params = BTreeMap::new();
    for (key, value) in arguments {
        let parsed = if COORDINATE_KEYS.contains(&key.as_str()) {
            let pair = value.as_array().and_then(|arr| match arr.as_slice() {
                [x, y] => Some((x.as_f64()?, y.as_f64()?)),
                _ => None,
            });
            let (x, y) = pair.ok_or_else(|| ParseError::MalformedCoordinate {
                key: key.clone(),
                value: value.to_string(),
            })?;
            ParamValue::Point(rescale(x, y, displayed, raw))
        } else {
            match value {
                serde_json::Value::String(s) => ParamValue::Text(s),
                serde_json::Value::Number(n) => match n.as_f64() {
                    Some(f) => ParamValue::Number(f),
                    None => ParamValue::Other(serde_json::Value::Number(n)),
                },
                other => ParamValue::Other(other),
            }
        };
        params.insert(key, parsed);
    }

    let action = Action::new(name, params, vocabulary)?;
    Ok(ParsedResponse {
        thought,
        action,
        raw_action,
        summary,
    })
}

/// Text after `Thought:` up to the first newline, `Action:`, `<tool_call>` or
/// the tool-call JSON, whichever comes first.
fn tool_call_thought(content: &str) -> Option<String> {
    let start = content.find("Thought:")? + "Thought:".len();
    let tail = &content[start..];
    let end = ["\n", "Action:", "<tool_call>", TOOL_CALL_PREFIX]
        .iter()
        .filter_map(|m| tail.find(m))
        .min()
        .unwrap_or(tail.len());
    non_empty(&tail[..end])
}

fn line_after(content: &str, marker: &str) -> Option<String> {
    let start = content.find(marker)? + marker.len();
    let line = content[start..].lines().next().unwrap_or("");
    non_empty(line)
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// Tracks the rationale while a response streams in, so it can be shown
/// before the action arrives.
#[derive(Debug, Clone)]
pub struct ThoughtTracker {
    start: &'static str,
    end: &'static str,
    closed: bool,
    current: Option<String>,
}

impl ThoughtTracker {
    pub fn new(start: &'static str, end: &'static str) -> Self {
        Self {
            start,
            end,
            closed: false,
            current: None,
        }
    }

    /// Feed the accumulated text; returns the rationale when it changed.
    pub fn update(&mut self, content: &str) -> Option<String> {
        if self.closed {
            return None;
        }
        let start = content.rfind(self.start)? + self.start.len();
        let tail = &content[start..];
        let thought = match tail.find(self.end) {
            Some(end) => {
                self.closed = true;
                &tail[..end]
            }
            None => tail,
        };
        let thought = thought.trim().to_string();
        if self.current.as_deref() == Some(thought.as_str()) {
            return None;
        }
        self.current = Some(thought.clone());
        Some(thought)
    }

    /// Rationale of a complete response, without streaming.
    pub fn extract(&self, content: &str) -> Option<String> {
        let mut tracker = self.clone();
        tracker.closed = false;
        tracker.current = None;
        tracker.update(content)
    }
}
