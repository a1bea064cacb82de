use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::errors::ParseError;

/// Whether the loop is waiting for a goal, stepping, or paused on a human answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Ready,
    Running,
    CallUser,
}

/// Episode-level outcome, orthogonal to [`AgentState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Running,
    Finished,
    Failed,
}

/// A screen coordinate in device pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Point {
    pub x: i64,
    pub y: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Point(Point),
    Text(String),
    Number(f64),
    Other(serde_json::Value),
}

impl ParamValue {
    pub fn as_point(&self) -> Option<Point> {
        match self {
            ParamValue::Point(p) => Some(*p),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ParamValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamValue::Point(p) => write!(f, "({},{})", p.x, p.y),
            ParamValue::Text(s) => write!(f, "'{s}'"),
            ParamValue::Number(n) => write!(f, "{n}"),
            ParamValue::Other(v) => write!(f, "{v}"),
        }
    }
}

/// One proposed device action. Only constructible through [`Action::new`],
/// which checks the name against the active vocabulary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    name: String,
    parameters: BTreeMap<String, ParamValue>,
}

impl Action {
    pub fn new(
        name: impl Into<String>,
        parameters: BTreeMap<String, ParamValue>,
        vocabulary: &[&str],
    ) -> Result<Self, ParseError> {
        let name = name.into();
        if !vocabulary.contains(&name.as_str()) {
            return Err(ParseError::UnknownAction(name));
        }
        Ok(Self { name, parameters })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parameters(&self) -> &BTreeMap<String, ParamValue> {
        &self.parameters
    }

    pub fn param(&self, key: &str) -> Option<&ParamValue> {
        self.parameters.get(key)
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.name)?;
        for (i, (k, v)) in self.parameters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str(")")
    }
}

/// What the control loop does with a parsed action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The task is done: `status → Finished`.
    Finish,
    /// The task failed by the model's own account: `status → Failed`.
    Fail,
    /// Suspend and wait for a human answer: `state → CallUser`.
    CallUser,
    /// Hand to the device.
    Execute,
}
