//! Scoring and the token economy.
//!
//! All functions here are synchronous and operate on borrowed model data.
//! Callers that share a [`Competition`] across tasks must hold its lock
//! around [`apply_verdict`] and the token functions so that first-to-solve
//! and budget updates are serialized.

pub mod tokens;

use crate::model::{Competition, Participant, Submission, TerminationReason};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::info;

pub use tokens::{HintDecision, TokenCharge, TokenUsage, charge_tokens, grant_hint};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EconomyError {
    #[error("unknown participant: {0}")]
    UnknownParticipant(String),
    #[error("unknown problem: {0}")]
    UnknownProblem(String),
    #[error("submission is still pending")]
    NotJudged,
}

/// Record a judged submission: award the first-to-solve bonus if it is the
/// first accepted solution of the problem, append it to the participant and
/// recompute the participant's score.
pub fn apply_verdict(
    competition: &mut Competition,
    mut submission: Submission,
) -> Result<(Submission, Participant), EconomyError> {
    if !submission.status.is_terminal() {
        return Err(EconomyError::NotJudged);
    }
    if competition.participant(&submission.participant_id).is_none() {
        return Err(EconomyError::UnknownParticipant(
            submission.participant_id.clone(),
        ));
    }
    let bonus = competition.rules.bonus_for_first_ac;
    let problem = competition
        .problem_mut(&submission.problem_id)
        .ok_or_else(|| EconomyError::UnknownProblem(submission.problem_id.clone()))?;

    if submission.status.is_accepted() && problem.claim_first_solve(&submission.participant_id) {
        submission.score = submission.score.saturating_add(bonus);
        submission.first_to_solve_bonus = bonus;
        info!(
            participant = %submission.participant_id,
            problem = %submission.problem_id,
            "First to solve, +{bonus} bonus"
        );
    }

    let participant = competition
        .participant_mut(&submission.participant_id)
        .ok_or_else(|| EconomyError::UnknownParticipant(submission.participant_id.clone()))?;
    participant.submissions.push(submission.clone());
    recompute_score(participant);
    Ok((submission, participant.clone()))
}

/// Best submission per problem: highest score, earliest on exact ties.
pub fn best_submissions(participant: &Participant) -> HashMap<&str, &Submission> {
    let mut best: HashMap<&str, &Submission> = HashMap::new();
    for s in &participant.submissions {
        let better = best
            .get(s.problem_id.as_str())
            .is_none_or(|current| s.score > current.score);
        if better {
            best.insert(&s.problem_id, s);
        }
    }
    best
}

/// `Σ best score per problem − Σ penalties`, stored on the participant.
pub fn recompute_score(participant: &mut Participant) -> i64 {
    let best: i64 = best_submissions(participant)
        .values()
        .map(|s| s.score as i64)
        .sum();
    let penalties: i64 = participant
        .submissions
        .iter()
        .map(|s| s.penalty as i64)
        .sum();
    participant.score = best - penalties;
    participant.score
}

/// Score plus the unspent share of the budget weighted by `lambda`.
pub fn final_score(participant: &Participant, lambda: f64) -> f64 {
    let base = participant.score as f64;
    if participant.token_limit == 0 {
        return base;
    }
    base + participant.remaining_tokens as f64 / participant.token_limit as f64 * lambda
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RankingEntry {
    pub rank: usize,
    pub participant_id: String,
    pub name: String,
    pub score: i64,
    pub final_score: f64,
    pub solved_problems: Vec<String>,
    pub remaining_tokens: u64,
    pub llm_tokens: u64,
    pub hint_tokens: u64,
    pub submission_count: usize,
    pub is_running: bool,
    pub termination_reason: Option<TerminationReason>,
}

/// Participants ordered by score, highest first, with 1-based ranks.
/// Equal scores go to the higher final score, so the participant who kept
/// more of the budget ranks first.
pub fn rankings(competition: &Competition) -> Vec<RankingEntry> {
    let lambda = competition.rules.lambda;
    let mut entries: Vec<RankingEntry> = competition
        .participants
        .iter()
        .map(|p| RankingEntry {
            rank: 0,
            participant_id: p.id.clone(),
            name: p.name.clone(),
            score: p.score,
            final_score: final_score(p, lambda),
            solved_problems: p.solved_problems(),
            remaining_tokens: p.remaining_tokens,
            llm_tokens: p.llm_tokens,
            hint_tokens: p.hint_tokens,
            submission_count: p.submissions.len(),
            is_running: p.is_running,
            termination_reason: p.termination_reason,
        })
        .collect();
    entries.sort_by(|a, b| {
        b.score
            .cmp(&a.score)
            .then(b.final_score.total_cmp(&a.final_score))
    });
    for (i, entry) in entries.iter_mut().enumerate() {
        entry.rank = i + 1;
    }
    entries
}
