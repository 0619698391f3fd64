//! Keyword/regex recovery for agent text that contains no JSON at all.
//!
//! Each [`FallbackRule`] has a keyword set (any one must appear in the
//! lowercased text) and an optional regex whose capture groups fill typed
//! parameters. Rules are tried in order; a rule whose keywords match but
//! whose regex does not is skipped. Matching runs on an ASCII-lowercased
//! copy, which keeps byte offsets, so captures are sliced from the original
//! text and submitted code keeps its case.

use super::AgentAction;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// How a capture group becomes a parameter value.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CaptureKind {
    /// Verbatim text.
    Text,
    /// Text, lowercased.
    Lowercase,
    /// Integer; a rule whose capture does not parse does not match.
    Integer,
    /// Source code, trimmed.
    Code,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CaptureField {
    pub name: String,
    pub kind: CaptureKind,
}

impl CaptureField {
    pub fn new(name: &str, kind: CaptureKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FallbackRule {
    /// Action name emitted on a match (e.g. `"VIEW_PROBLEM"`).
    pub action: String,
    /// Lowercase keywords; any one enables the rule.
    pub keywords: Vec<String>,
    /// Regex run over the lowercased text. `None` matches on keywords alone.
    #[serde(default)]
    pub pattern: Option<String>,
    /// Parameter per capture group, in group order.
    #[serde(default)]
    pub captures: Vec<CaptureField>,
}

impl FallbackRule {
    fn new(action: &str, keywords: &[&str]) -> Self {
        Self {
            action: action.to_string(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            pattern: None,
            captures: Vec::new(),
        }
    }

    fn with_pattern(mut self, pattern: &str, captures: Vec<CaptureField>) -> Self {
        self.pattern = Some(pattern.to_string());
        self.captures = captures;
        self
    }
}

/// The built-in rule table.
pub fn default_rules() -> Vec<FallbackRule> {
    use CaptureKind::*;
    let problem_id = r#"problem_id["']?\s*:\s*["']?(\w+)["']?"#;
    vec![
        FallbackRule::new(
            "VIEW_PROBLEM",
            &["view problem", "view_problem", "look at problem", "look_at_problem"],
        )
        .with_pattern(problem_id, vec![CaptureField::new("problem_id", Text)]),
        FallbackRule::new(
            "GET_HINT",
            &["get hint", "request hint", "get_hint", "request_hint"],
        )
        .with_pattern(
            &format!(r#"{problem_id}.*?hint_level["']?\s*:\s*(\d+)"#),
            vec![
                CaptureField::new("problem_id", Text),
                CaptureField::new("hint_level", Integer),
            ],
        ),
        FallbackRule::new(
            "SUBMIT_SOLUTION",
            &[
                "submission solution",
                "submission code",
                "submission_solution",
                "submission_code",
                "submit solution",
                "submit_solution",
            ],
        )
        .with_pattern(
            &format!(
                r#"{problem_id}.*?solution["']?\s*:\s*["']?```(?:python|cpp|java)?\n(.*?)```["']?.*?language["']?\s*:\s*["']?(python|cpp|java)["']?"#
            ),
            vec![
                CaptureField::new("problem_id", Text),
                CaptureField::new("solution", Code),
                CaptureField::new("language", Lowercase),
            ],
        ),
        FallbackRule::new("VIEW_RANKINGS", &["view rankings", "check rankings", "view_rankings"]),
        FallbackRule::new("TERMINATE", &["terminate", "stop", "end"]),
    ]
}

struct CompiledRule {
    rule: FallbackRule,
    regex: Option<Regex>,
}

/// Compiled rule table.
pub struct FallbackTable {
    rules: Vec<CompiledRule>,
}

impl FallbackTable {
    pub fn compile(rules: Vec<FallbackRule>) -> Result<Self, String> {
        let rules = rules
            .into_iter()
            .map(|rule| {
                let regex = match &rule.pattern {
                    Some(p) => Some(
                        Regex::new(&format!("(?s){p}"))
                            .map_err(|e| format!("invalid fallback pattern for {}: {e}", rule.action))?,
                    ),
                    None => None,
                };
                Ok(CompiledRule { rule, regex })
            })
            .collect::<Result<Vec<_>, String>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// First rule that matches `text`, as an action record.
    pub fn recover(&self, text: &str) -> Option<AgentAction> {
        let lower = text.to_ascii_lowercase();
        self.rules.iter().find_map(|c| {
            if !c.rule.keywords.iter().any(|k| lower.contains(k.as_str())) {
                return None;
            }
            let parameters = match &c.regex {
                None => Map::new(),
                Some(re) => captures_to_parameters(&c.rule, re, text, &lower)?,
            };
            debug!("Recovered {} from unstructured text", c.rule.action);
            Some(AgentAction::new(&c.rule.action, parameters))
        })
    }
}

impl Default for FallbackTable {
    fn default() -> Self {
        Self::compile(default_rules()).expect("built-in fallback rules compile")
    }
}

fn captures_to_parameters(
    rule: &FallbackRule,
    re: &Regex,
    original: &str,
    lower: &str,
) -> Option<Map<String, Value>> {
    let caps = re.captures(lower)?;
    let mut parameters = Map::new();
    for (i, field) in rule.captures.iter().enumerate() {
        let Some(m) = caps.get(i + 1) else {
            continue;
        };
        let raw = original.get(m.range()).unwrap_or(m.as_str());
        let value = match field.kind {
            CaptureKind::Text => Value::String(raw.to_string()),
            CaptureKind::Lowercase => Value::String(raw.to_lowercase()),
            CaptureKind::Code => Value::String(raw.trim().to_string()),
            CaptureKind::Integer => Value::from(raw.trim().parse::<i64>().ok()?),
        };
        parameters.insert(field.name.clone(), value);
    }
    Some(parameters)
}
