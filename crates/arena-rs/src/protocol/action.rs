//! Typed view of the contest actions.
//!
//! Parameters are checked against a JSON Schema generated from the
//! parameter structs before deserialization, so the agent gets a precise
//! message ("/hint_level: \"two\" is not of type \"integer\"") instead of a
//! serde error.

use super::AgentAction;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct ViewProblemParams {
    /// Id of the problem to view.
    pub problem_id: String,
}

fn default_hint_level() -> u8 {
    1
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct GetHintParams {
    /// Not needed for levels 0, 2 and 4.
    #[serde(default)]
    pub problem_id: Option<String>,
    /// 0 strategy, 1 textbook by problem, 2 textbook by knowledge,
    /// 3 similar problems, 4 examples by knowledge.
    #[serde(default = "default_hint_level")]
    #[schemars(range(min = 0, max = 4))]
    pub hint_level: u8,
    /// Topic to search for at levels 2 and 4.
    #[serde(default)]
    pub hint_knowledge: Option<String>,
}

fn default_language() -> String {
    "cpp".to_string()
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, PartialEq)]
pub struct SubmitSolutionParams {
    pub problem_id: String,
    /// Complete program source.
    pub solution: String,
    /// `cpp`, `java` or `python`.
    #[serde(default = "default_language")]
    pub language: String,
}

#[derive(Serialize, Deserialize, JsonSchema, Debug, Clone, Default, PartialEq)]
pub struct TerminateParams {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    ViewProblems,
    ViewProblem(ViewProblemParams),
    GetHint(GetHintParams),
    SubmitSolution(SubmitSolutionParams),
    ViewRankings,
    Terminate(TerminateParams),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ActionError {
    #[error("Unknown action: {0}")]
    Unknown(String),
    #[error("Invalid parameters for {action}: {details}")]
    InvalidParameters { action: String, details: String },
}

/// Canonical action names, as shown to agents.
pub const ACTION_NAMES: &[&str] = &[
    "VIEW_PROBLEMS",
    "VIEW_PROBLEM",
    "GET_HINT",
    "SUBMIT_SOLUTION",
    "VIEW_RANKINGS",
    "TERMINATE",
];

impl Action {
    pub fn name(&self) -> &'static str {
        match self {
            Action::ViewProblems => "VIEW_PROBLEMS",
            Action::ViewProblem(_) => "VIEW_PROBLEM",
            Action::GetHint(_) => "GET_HINT",
            Action::SubmitSolution(_) => "SUBMIT_SOLUTION",
            Action::ViewRankings => "VIEW_RANKINGS",
            Action::Terminate(_) => "TERMINATE",
        }
    }

    /// Interpret a parsed record. Names match case-insensitively and
    /// `SUBMISSION_SOLUTION` is accepted for `SUBMIT_SOLUTION`.
    pub fn from_agent_action(record: &AgentAction) -> Result<Self, ActionError> {
        let name = record.action.trim().to_ascii_uppercase();
        let params = Value::Object(record.parameters.clone());
        match name.as_str() {
            "VIEW_PROBLEMS" => Ok(Action::ViewProblems),
            "VIEW_PROBLEM" => Ok(Action::ViewProblem(typed("VIEW_PROBLEM", params)?)),
            "GET_HINT" => Ok(Action::GetHint(typed("GET_HINT", params)?)),
            "SUBMIT_SOLUTION" | "SUBMISSION_SOLUTION" => {
                Ok(Action::SubmitSolution(typed("SUBMIT_SOLUTION", params)?))
            }
            "VIEW_RANKINGS" => Ok(Action::ViewRankings),
            "TERMINATE" => Ok(Action::Terminate(typed("TERMINATE", params)?)),
            _ => Err(ActionError::Unknown(record.action.clone())),
        }
    }

    /// Parameter schemas of every action, keyed by action name.
    pub fn schema_catalog() -> Value {
        let empty = json!({"type": "object", "properties": {}});
        json!({
            "VIEW_PROBLEMS": empty.clone(),
            "VIEW_PROBLEM": crate::json_schema_for::<ViewProblemParams>(),
            "GET_HINT": crate::json_schema_for::<GetHintParams>(),
            "SUBMIT_SOLUTION": crate::json_schema_for::<SubmitSolutionParams>(),
            "VIEW_RANKINGS": empty,
            "TERMINATE": crate::json_schema_for::<TerminateParams>(),
        })
    }
}

/// Validate `params` against `T`'s schema, then deserialize.
fn typed<T: JsonSchema + DeserializeOwned>(action: &str, params: Value) -> Result<T, ActionError> {
    let schema = crate::json_schema_for::<T>();
    if let Ok(validator) = jsonschema::validator_for(&schema) {
        let errors: Vec<String> = validator
            .iter_errors(&params)
            .map(|e| format!("{}: {e}", e.instance_path()))
            .collect();
        if !errors.is_empty() {
            return Err(ActionError::InvalidParameters {
                action: action.to_string(),
                details: errors.join("; "),
            });
        }
    }
    serde_json::from_value(params).map_err(|e| ActionError::InvalidParameters {
        action: action.to_string(),
        details: e.to_string(),
    })
}
