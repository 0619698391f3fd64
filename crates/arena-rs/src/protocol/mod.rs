//! Action Protocol: free-form agent text to a structured `{action, parameters}` record.
//!
//! [`ActionParser::parse`] runs four layers in order:
//!
//! 1. [`extract`] picks the JSON candidate out of fenced blocks, handling
//!    code fences nested inside the JSON.
//! 2. [`repair`] decodes it tolerantly.
//! 3. The decoded value is validated; a non-object or a missing `action` /
//!    `parameters` key becomes a [`ParseOutcome::Fallback`] the caller can
//!    report back to the agent.
//! 4. Only when decoding fails outright, [`fallback`] recovers an action
//!    from keywords. If that fails too the result is
//!    [`ProtocolError::Unparseable`].
//!
//! Parsing is pure: the same text always yields the same outcome.

pub mod action;
pub mod extract;
pub mod fallback;
pub mod repair;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace};

pub use action::{Action, ActionError};
pub use fallback::{FallbackRule, FallbackTable};

/// A structured agent action as produced by the parser.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct AgentAction {
    pub action: String,
    pub parameters: Map<String, Value>,
}

impl AgentAction {
    pub fn new(action: &str, parameters: Map<String, Value>) -> Self {
        Self {
            action: action.to_string(),
            parameters,
        }
    }

    pub fn to_value(&self) -> Value {
        json!({"action": self.action, "parameters": self.parameters})
    }
}

/// Kind of a validation fallback.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackKind {
    InvalidFormat,
    MissingField,
}

impl fmt::Display for FallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FallbackKind::InvalidFormat => write!(f, "InvalidFormat"),
            FallbackKind::MissingField => write!(f, "MissingField"),
        }
    }
}

/// What parsing produced: an action to execute, or a typed fallback that
/// tells the agent what was wrong with its answer.
#[derive(Debug, Clone, PartialEq)]
pub enum ParseOutcome {
    Action(AgentAction),
    Fallback { kind: FallbackKind, message: String },
}

impl ParseOutcome {
    fn fallback(kind: FallbackKind, message: &str) -> Self {
        ParseOutcome::Fallback {
            kind,
            message: message.to_string(),
        }
    }

    /// The outcome as an `{action, parameters}` record. Fallbacks become
    /// `{"action": "<kind>", "parameters": {"message": ...}}`.
    pub fn to_record(&self) -> AgentAction {
        match self {
            ParseOutcome::Action(action) => action.clone(),
            ParseOutcome::Fallback { kind, message } => {
                let mut parameters = Map::new();
                parameters.insert("message".into(), Value::String(message.clone()));
                AgentAction::new(&kind.to_string(), parameters)
            }
        }
    }

    pub fn action(&self) -> Option<&AgentAction> {
        match self {
            ParseOutcome::Action(a) => Some(a),
            ParseOutcome::Fallback { .. } => None,
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("could not parse an action from the response")]
    Unparseable,
}

pub struct ActionParser {
    fallback: FallbackTable,
}

impl Default for ActionParser {
    fn default() -> Self {
        Self {
            fallback: FallbackTable::default(),
        }
    }
}

impl ActionParser {
    pub fn new(fallback: FallbackTable) -> Self {
        Self { fallback }
    }

    /// Build a parser from configured fallback rules.
    pub fn from_rules(rules: Vec<FallbackRule>) -> Result<Self, String> {
        Ok(Self::new(FallbackTable::compile(rules)?))
    }

    pub fn parse(&self, raw: &str) -> Result<ParseOutcome, ProtocolError> {
        let candidate = extract::extract_candidate(raw);
        trace!("Action candidate: {} bytes", candidate.len());

        match repair::parse_lenient(&candidate) {
            Ok(value) => Ok(validate(value)),
            Err(e) => {
                debug!("Structural parse failed ({e}), trying keyword fallback");
                self.fallback
                    .recover(raw)
                    .map(ParseOutcome::Action)
                    .ok_or(ProtocolError::Unparseable)
            }
        }
    }
}

fn validate(value: Value) -> ParseOutcome {
    let Value::Object(mut map) = value else {
        return ParseOutcome::fallback(FallbackKind::InvalidFormat, "Response is not valid");
    };
    let Some(action) = map.remove("action") else {
        return ParseOutcome::fallback(FallbackKind::MissingField, "Missing 'action' field");
    };
    let Some(parameters) = map.remove("parameters") else {
        return ParseOutcome::fallback(FallbackKind::MissingField, "Missing 'parameters' field");
    };
    let Value::String(action) = action else {
        return ParseOutcome::fallback(FallbackKind::InvalidFormat, "'action' must be a string");
    };
    let parameters = match parameters {
        Value::Object(p) => p,
        Value::Null => Map::new(),
        _ => {
            return ParseOutcome::fallback(
                FallbackKind::InvalidFormat,
                "'parameters' must be an object",
            );
        }
    };
    ParseOutcome::Action(AgentAction { action, parameters })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<ParseOutcome, ProtocolError> {
        ActionParser::default().parse(text)
    }

    #[test]
    fn fenced_terminate() {
        let text = "```json\n{\"action\":\"TERMINATE\",\"parameters\":{\"reason\":\"done\"}}\n```";
        let outcome = parse(text).unwrap();
        let action = outcome.action().unwrap();
        assert_eq!(action.action, "TERMINATE");
        assert_eq!(action.parameters["reason"], "done");
    }

    #[test]
    fn nested_solution_fence_kept_whole() {
        let source = "#include <iostream>\nint main() {\n  std::cout << 42 << std::endl;\n  return 0;\n}";
        let text = format!(
            "My answer:\n```json\n{{\"action\": \"SUBMIT_SOLUTION\", \"parameters\": {{\"problem_id\": \"p1\", \"solution\": \"```cpp\n{source}\n```\", \"language\": \"cpp\"}}}}\n```"
        );
        let outcome = parse(&text).unwrap();
        let action = outcome.action().unwrap();
        assert_eq!(action.action, "SUBMIT_SOLUTION");
        assert_eq!(action.parameters["language"], "cpp");
        let solution = action.parameters["solution"].as_str().unwrap();
        assert!(solution.contains("std::cout << 42 << std::endl;"));
        assert!(solution.trim_end().ends_with('}'));
        assert_eq!(solution.trim(), source);
    }

    #[test]
    fn validation_fallbacks_are_distinct() {
        assert_eq!(
            parse("[1, 2]").unwrap(),
            ParseOutcome::Fallback {
                kind: FallbackKind::InvalidFormat,
                message: "Response is not valid".into()
            }
        );
        assert_eq!(
            parse("{\"parameters\": {}}").unwrap().to_record().parameters["message"],
            "Missing 'action' field"
        );
        assert_eq!(
            parse("{\"action\": \"VIEW_RANKINGS\"}").unwrap().to_record().parameters["message"],
            "Missing 'parameters' field"
        );
    }

    #[test]
    fn fallback_record_shape() {
        let record = parse("{\"parameters\": {}}").unwrap().to_record();
        assert_eq!(
            record.to_value(),
            json!({"action": "MissingField", "parameters": {"message": "Missing 'action' field"}})
        );
    }

    #[test]
    fn null_parameters_become_empty() {
        let outcome = parse("{\"action\": \"VIEW_PROBLEMS\", \"parameters\": null}").unwrap();
        assert!(outcome.action().unwrap().parameters.is_empty());
    }

    #[test]
    fn keyword_fallback_only_on_decode_error() {
        let outcome = parse("I'd like to view_problem problem_id: p7").unwrap();
        assert_eq!(outcome.action().unwrap().action, "VIEW_PROBLEM");
        assert_eq!(parse("no idea what to do"), Err(ProtocolError::Unparseable));
    }

    #[test]
    fn parsing_is_idempotent() {
        let parser = ActionParser::default();
        for text in [
            "```json\n{\"action\": \"VIEW_PROBLEMS\", \"parameters\": {},}\n```",
            "terminate please",
            "{'action': 'GET_HINT', 'parameters': {'problem_id': 'p1', 'hint_level': 1}",
        ] {
            assert_eq!(parser.parse(text), parser.parse(text));
        }
    }
}
