//! Prompts sent to agents on each turn.
//!
//! The system prompt is fixed per run. The turn prompt is rebuilt from the
//! competition snapshot every turn and ends with the result of the
//! previous action, so the agent never has to remember state.

use crate::economy;
use crate::model::{Competition, Participant};
use crate::protocol::Action;
use serde_json::Value;
use std::fmt::Write;

const SYSTEM_PROMPT: &str = "You are a competitive programming agent in a coding competition. \
Each turn you receive the competition state and the result of your previous action. \
Maximize your score while managing your token budget: every response you write and \
every hint you buy is paid from it, and running out ends your participation.\n\n\
Respond with exactly one JSON object with an \"action\" field and a \"parameters\" object.";

/// Outcome of the previous turn, shown at the end of the next prompt.
#[derive(Debug, Clone, PartialEq)]
pub enum Feedback {
    Success { action: String, content: Value },
    Error { message: String },
}

impl Feedback {
    pub fn error(message: impl Into<String>) -> Self {
        Feedback::Error {
            message: message.into(),
        }
    }
}

/// System prompt with the action catalog appended.
pub fn system_prompt() -> String {
    let catalog = serde_json::to_string_pretty(&Action::schema_catalog()).unwrap_or_default();
    format!(
        "{SYSTEM_PROMPT}\n\n## Actions and their parameters\n```json\n{catalog}\n```\n\n\
         Example:\n```json\n{{\"action\": \"VIEW_PROBLEM\", \"parameters\": {{\"problem_id\": \"p1\"}}}}\n```"
    )
}

/// Turn prompt for `participant`, built from the current snapshot.
pub fn turn_prompt(
    competition: &Competition,
    participant: &Participant,
    feedback: Option<&Feedback>,
) -> String {
    let rules = &competition.rules;
    let mut out = String::from("# Competition State\n\n");
    let _ = writeln!(out, "## Competition: {}", competition.title);
    if !competition.description.is_empty() {
        let _ = writeln!(out, "{}", competition.description);
    }

    out.push_str("\n## Rules\n");
    for (level, points) in &rules.scoring {
        let _ = writeln!(out, "- {level} problems: {points} points, proportional to tests passed");
    }
    for (verdict, points) in &rules.penalties {
        let _ = writeln!(out, "- {verdict} submission: -{points} points");
    }
    let _ = writeln!(
        out,
        "- First accepted solution of a problem: +{} points",
        rules.bonus_for_first_ac
    );
    let _ = writeln!(
        out,
        "- Hint costs by level 0-4: {}",
        rules
            .hint_costs
            .iter()
            .map(u64::to_string)
            .collect::<Vec<_>>()
            .join(", ")
    );
    let _ = writeln!(
        out,
        "- Final score = score + remaining_tokens / initial_tokens * {}",
        rules.lambda
    );

    let solved = participant.solved_problems();
    out.push_str("\n## Your Status\n");
    let _ = writeln!(out, "- Name: {}", participant.name);
    let _ = writeln!(
        out,
        "- Remaining tokens: {} of {}",
        participant.remaining_tokens, participant.token_limit
    );
    let _ = writeln!(
        out,
        "- Solved problems: {}",
        if solved.is_empty() {
            "none".to_string()
        } else {
            solved.join(", ")
        }
    );
    let _ = writeln!(out, "- Current score: {}", participant.score);

    out.push_str("\n## Problems\n");
    for problem in &competition.problems {
        let mark = if solved.contains(&problem.id) { " (solved)" } else { "" };
        let _ = write!(
            out,
            "- {}: {} [{}, {} points]{mark}",
            problem.id,
            problem.title,
            problem.level,
            rules.max_score(problem.level)
        );
        match problem.first_to_solve() {
            Some(_) => out.push_str(", first-solve bonus taken\n"),
            None => out.push('\n'),
        }
    }

    out.push_str("\n## Rankings\n");
    for entry in economy::rankings(competition) {
        let you = if entry.participant_id == participant.id { " (you)" } else { "" };
        let _ = writeln!(
            out,
            "{}. {}{you}: {} points, {} solved",
            entry.rank,
            entry.name,
            entry.score,
            entry.solved_problems.len()
        );
    }

    if let Some(feedback) = feedback {
        out.push_str("\n# Last Action Result\n\n");
        match feedback {
            Feedback::Success { action, content } => {
                let body = serde_json::to_string_pretty(content).unwrap_or_default();
                let _ = write!(out, "## Success {action}\n```json\n{body}\n```\n");
            }
            Feedback::Error { message } => {
                let _ = writeln!(out, "## Error\n{message}");
            }
        }
    }
    out
}
