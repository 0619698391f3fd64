//! Competition data model: problems, submissions, participants and rules.
//!
//! These are plain serde structs. The only behavior here is what protects an
//! invariant of the data itself (e.g. [`Problem::claim_first_solve`] can
//! succeed at most once); scoring and budget rules live in
//! [`economy`](crate::economy) and judging in [`judge`](crate::judge).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Number of hint levels (0..=4).
pub const HINT_LEVELS: usize = 5;

/// Generate a unique id with the given prefix (`"sub"`, `"p"`, ...).
pub fn generate_id(prefix: &str) -> String {
    let ts = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}-{ts:x}-{count:04x}")
}

// ── Verdicts ───────────────────────────────────────────────────────

/// Outcome of running a submission (or a single test case).
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verdict {
    #[serde(rename = "AC")]
    Accepted,
    #[serde(rename = "WA")]
    WrongAnswer,
    #[serde(rename = "RE")]
    RuntimeError,
    #[serde(rename = "CE")]
    CompilationError,
    #[serde(rename = "TLE")]
    TimeLimitExceeded,
    #[serde(rename = "MLE")]
    MemoryLimitExceeded,
    #[serde(rename = "PENDING")]
    Pending,
}

impl Verdict {
    /// Short wire code (`"AC"`, `"WA"`, ...).
    pub fn code(self) -> &'static str {
        match self {
            Verdict::Accepted => "AC",
            Verdict::WrongAnswer => "WA",
            Verdict::RuntimeError => "RE",
            Verdict::CompilationError => "CE",
            Verdict::TimeLimitExceeded => "TLE",
            Verdict::MemoryLimitExceeded => "MLE",
            Verdict::Pending => "PENDING",
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Verdict::Pending
    }

    pub fn is_accepted(self) -> bool {
        self == Verdict::Accepted
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Difficulty tier of a problem.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    Bronze,
    Silver,
    Gold,
    Platinum,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Bronze => write!(f, "bronze"),
            Level::Silver => write!(f, "silver"),
            Level::Gold => write!(f, "gold"),
            Level::Platinum => write!(f, "platinum"),
        }
    }
}

// ── Problems ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct TestCase {
    pub id: String,
    #[serde(alias = "input_data")]
    pub input: String,
    pub expected_output: String,
}

impl TestCase {
    pub fn new(
        id: impl Into<String>,
        input: impl Into<String>,
        expected_output: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            input: input.into(),
            expected_output: expected_output.into(),
        }
    }
}

fn default_time_limit_ms() -> u64 {
    1000
}

fn default_memory_limit_mb() -> u64 {
    256
}

/// A contest problem. `test_cases` are hidden from agents; `sample_cases`
/// are shown in problem views.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Problem {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub level: Level,
    #[serde(default = "default_time_limit_ms")]
    pub time_limit_ms: u64,
    #[serde(default = "default_memory_limit_mb")]
    pub memory_limit_mb: u64,
    #[serde(default)]
    pub test_cases: Vec<TestCase>,
    #[serde(default)]
    pub sample_cases: Vec<TestCase>,
    #[serde(default)]
    first_to_solve: Option<String>,
}

impl Problem {
    pub fn new(id: impl Into<String>, title: impl Into<String>, level: Level) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            description: String::new(),
            level,
            time_limit_ms: default_time_limit_ms(),
            memory_limit_mb: default_memory_limit_mb(),
            test_cases: Vec::new(),
            sample_cases: Vec::new(),
            first_to_solve: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_test_cases(mut self, cases: Vec<TestCase>) -> Self {
        self.test_cases = cases;
        self
    }

    pub fn with_sample_cases(mut self, cases: Vec<TestCase>) -> Self {
        self.sample_cases = cases;
        self
    }

    pub fn with_limits(mut self, time_limit_ms: u64, memory_limit_mb: u64) -> Self {
        self.time_limit_ms = time_limit_ms;
        self.memory_limit_mb = memory_limit_mb;
        self
    }

    /// Participant id of the first accepted solver, if any.
    pub fn first_to_solve(&self) -> Option<&str> {
        self.first_to_solve.as_deref()
    }

    /// Record `participant_id` as the first solver. Returns `false` (and
    /// changes nothing) if the problem was already claimed.
    pub fn claim_first_solve(&mut self, participant_id: &str) -> bool {
        if self.first_to_solve.is_some() {
            return false;
        }
        self.first_to_solve = Some(participant_id.to_string());
        true
    }

    /// Memory limit in KB, as reported by the sandbox.
    pub fn memory_limit_kb(&self) -> u64 {
        self.memory_limit_mb.saturating_mul(1024)
    }

    /// View shown to agents: everything except the hidden test cases.
    pub fn public_view(&self, max_score: u32) -> ProblemView {
        ProblemView {
            id: self.id.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            level: self.level,
            time_limit_ms: self.time_limit_ms,
            memory_limit_mb: self.memory_limit_mb,
            sample_cases: self.sample_cases.clone(),
            first_to_solve: self.first_to_solve.clone(),
            max_score,
        }
    }
}

/// Agent-facing projection of a [`Problem`].
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ProblemView {
    pub id: String,
    pub title: String,
    pub description: String,
    pub level: Level,
    pub time_limit_ms: u64,
    pub memory_limit_mb: u64,
    pub sample_cases: Vec<TestCase>,
    pub first_to_solve: Option<String>,
    pub max_score: u32,
}

// ── Submissions ────────────────────────────────────────────────────

/// Result of running one test case.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct TestResult {
    pub test_case_id: String,
    #[serde(rename = "status")]
    pub verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_time_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_used_kb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl TestResult {
    pub fn new(test_case_id: impl Into<String>, verdict: Verdict) -> Self {
        Self {
            test_case_id: test_case_id.into(),
            verdict,
            execution_time_ms: None,
            memory_used_kb: None,
            output: None,
            error_message: None,
        }
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Submission {
    pub id: String,
    pub competition_id: String,
    pub participant_id: String,
    pub problem_id: String,
    pub code: String,
    pub language: String,
    pub submitted_at: DateTime<Utc>,
    pub status: Verdict,
    #[serde(default)]
    pub test_results: Vec<TestResult>,
    #[serde(default)]
    pub score: u32,
    #[serde(default)]
    pub penalty: u32,
    /// Bonus included in `score` for being the first to solve the problem.
    #[serde(default)]
    pub first_to_solve_bonus: u32,
}

impl Submission {
    /// A fresh, not yet judged submission.
    pub fn pending(
        competition_id: impl Into<String>,
        participant_id: impl Into<String>,
        problem_id: impl Into<String>,
        code: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            id: generate_id("sub"),
            competition_id: competition_id.into(),
            participant_id: participant_id.into(),
            problem_id: problem_id.into(),
            code: code.into(),
            language: language.into(),
            submitted_at: Utc::now(),
            status: Verdict::Pending,
            test_results: Vec::new(),
            score: 0,
            penalty: 0,
            first_to_solve_bonus: 0,
        }
    }

    pub fn passed_count(&self) -> usize {
        self.test_results
            .iter()
            .filter(|r| r.verdict.is_accepted())
            .count()
    }
}

// ── Participants ───────────────────────────────────────────────────

/// Where a participant's LLM lives. Opaque to the engine apart from the
/// model id, which selects token multipliers.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ProviderEndpoint {
    pub api_base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub model_id: String,
}

/// Why a participant stopped competing.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    OutOfTokens,
    CompetitorTerminated,
    AllProblemsSolved,
    RelayFailure,
    /// The run reached its configured turn cap.
    TurnLimit,
    Error,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TerminationReason::OutOfTokens => "out_of_tokens",
            TerminationReason::CompetitorTerminated => "competitor_terminated",
            TerminationReason::AllProblemsSolved => "all_problems_solved",
            TerminationReason::RelayFailure => "relay_failure",
            TerminationReason::TurnLimit => "turn_limit",
            TerminationReason::Error => "error",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Participant {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub provider: ProviderEndpoint,
    pub token_limit: u64,
    pub remaining_tokens: u64,
    /// Adjusted tokens consumed by LLM calls.
    #[serde(default)]
    pub llm_tokens: u64,
    /// Tokens spent on hints.
    #[serde(default)]
    pub hint_tokens: u64,
    #[serde(default)]
    pub submissions: Vec<Submission>,
    /// Derived; see [`economy::recompute_score`](crate::economy::recompute_score).
    #[serde(default)]
    pub score: i64,
    #[serde(default = "default_running")]
    pub is_running: bool,
    #[serde(default)]
    pub termination_reason: Option<TerminationReason>,
}

fn default_running() -> bool {
    true
}

impl Participant {
    pub fn new(name: impl Into<String>, provider: ProviderEndpoint, token_limit: u64) -> Self {
        Self {
            id: generate_id("p"),
            name: name.into(),
            provider,
            token_limit,
            remaining_tokens: token_limit,
            llm_tokens: 0,
            hint_tokens: 0,
            submissions: Vec::new(),
            score: 0,
            is_running: true,
            termination_reason: None,
        }
    }

    /// Stop the participant. The first reason recorded wins.
    pub fn terminate(&mut self, reason: TerminationReason) {
        if self.is_running {
            self.is_running = false;
            self.termination_reason = Some(reason);
        }
    }

    /// Ids of problems with at least one accepted submission, in first-solve order.
    pub fn solved_problems(&self) -> Vec<String> {
        let mut solved: Vec<String> = Vec::new();
        for s in &self.submissions {
            if s.status.is_accepted() && !solved.contains(&s.problem_id) {
                solved.push(s.problem_id.clone());
            }
        }
        solved
    }
}

// ── Rules and competition ──────────────────────────────────────────

fn default_scoring() -> BTreeMap<Level, u32> {
    BTreeMap::from([
        (Level::Bronze, 100),
        (Level::Silver, 200),
        (Level::Gold, 500),
        (Level::Platinum, 1000),
    ])
}

fn default_penalties() -> BTreeMap<Verdict, u32> {
    BTreeMap::from([
        (Verdict::WrongAnswer, 10),
        (Verdict::RuntimeError, 10),
        (Verdict::CompilationError, 5),
        (Verdict::TimeLimitExceeded, 10),
        (Verdict::MemoryLimitExceeded, 10),
    ])
}

fn default_bonus() -> u32 {
    100
}

fn default_hint_costs() -> [u64; HINT_LEVELS] {
    [100, 100, 300, 600, 1000]
}

fn default_lambda() -> f64 {
    100.0
}

/// Competition rules. Fixed at creation and shared read-only by the judge
/// and the economy.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Rules {
    /// Maximum score per problem level.
    #[serde(default = "default_scoring")]
    pub scoring: BTreeMap<Level, u32>,
    /// Penalty per final verdict. Missing verdicts cost nothing.
    #[serde(default = "default_penalties")]
    pub penalties: BTreeMap<Verdict, u32>,
    #[serde(default = "default_bonus")]
    pub bonus_for_first_ac: u32,
    #[serde(default)]
    pub input_token_multipliers: HashMap<String, f64>,
    #[serde(default)]
    pub output_token_multipliers: HashMap<String, f64>,
    /// Token cost of a hint, indexed by hint level.
    #[serde(default = "default_hint_costs")]
    pub hint_costs: [u64; HINT_LEVELS],
    /// Weight of the unspent budget in the final score.
    #[serde(default = "default_lambda")]
    pub lambda: f64,
}

impl Default for Rules {
    fn default() -> Self {
        Self {
            scoring: default_scoring(),
            penalties: default_penalties(),
            bonus_for_first_ac: default_bonus(),
            input_token_multipliers: HashMap::new(),
            output_token_multipliers: HashMap::new(),
            hint_costs: default_hint_costs(),
            lambda: default_lambda(),
        }
    }
}

impl Rules {
    pub fn max_score(&self, level: Level) -> u32 {
        self.scoring.get(&level).copied().unwrap_or(0)
    }

    /// Penalty for a final verdict. Accepted and pending never cost anything.
    pub fn penalty_for(&self, verdict: Verdict) -> u32 {
        match verdict {
            Verdict::Accepted | Verdict::Pending => 0,
            v => self.penalties.get(&v).copied().unwrap_or(0),
        }
    }

    pub fn hint_cost(&self, level: u8) -> Option<u64> {
        self.hint_costs.get(level as usize).copied()
    }

    /// Set input and output multipliers for one model.
    pub fn with_multipliers(mut self, model_id: &str, input: f64, output: f64) -> Self {
        self.input_token_multipliers
            .insert(model_id.to_string(), input);
        self.output_token_multipliers
            .insert(model_id.to_string(), output);
        self
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Competition {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub rules: Rules,
    #[serde(default)]
    pub problems: Vec<Problem>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    pub max_tokens_per_participant: u64,
    pub created_at: DateTime<Utc>,
}

impl Competition {
    pub fn new(title: impl Into<String>, rules: Rules, max_tokens_per_participant: u64) -> Self {
        Self {
            id: generate_id("c"),
            title: title.into(),
            description: String::new(),
            rules,
            problems: Vec::new(),
            participants: Vec::new(),
            max_tokens_per_participant,
            created_at: Utc::now(),
        }
    }

    pub fn with_problems(mut self, problems: Vec<Problem>) -> Self {
        self.problems = problems;
        self
    }

    pub fn problem(&self, problem_id: &str) -> Option<&Problem> {
        self.problems.iter().find(|p| p.id == problem_id)
    }

    pub fn problem_mut(&mut self, problem_id: &str) -> Option<&mut Problem> {
        self.problems.iter_mut().find(|p| p.id == problem_id)
    }

    pub fn participant(&self, participant_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.id == participant_id)
    }

    pub fn participant_mut(&mut self, participant_id: &str) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| p.id == participant_id)
    }

    /// Whether the participant has an accepted submission for every problem.
    pub fn all_solved_by(&self, participant_id: &str) -> bool {
        let Some(participant) = self.participant(participant_id) else {
            return false;
        };
        let solved = participant.solved_problems();
        !self.problems.is_empty() && self.problems.iter().all(|p| solved.contains(&p.id))
    }

    pub fn is_active(&self) -> bool {
        self.participants.iter().any(|p| p.is_running)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_wire_codes() {
        assert_eq!(serde_json::to_string(&Verdict::Accepted).unwrap(), "\"AC\"");
        let v: Verdict = serde_json::from_str("\"TLE\"").unwrap();
        assert_eq!(v, Verdict::TimeLimitExceeded);
        assert!(!Verdict::Pending.is_terminal());
    }

    #[test]
    fn first_solve_claimed_once() {
        let mut p = Problem::new("p1", "A+B", Level::Bronze);
        assert!(p.claim_first_solve("alice"));
        assert!(!p.claim_first_solve("bob"));
        assert_eq!(p.first_to_solve(), Some("alice"));
    }

    #[test]
    fn rules_default_penalties() {
        let rules = Rules::default();
        assert_eq!(rules.penalty_for(Verdict::WrongAnswer), 10);
        assert_eq!(rules.penalty_for(Verdict::CompilationError), 5);
        assert_eq!(rules.penalty_for(Verdict::Accepted), 0);
        assert_eq!(rules.max_score(Level::Gold), 500);
        assert_eq!(rules.hint_cost(5), None);
    }

    #[test]
    fn rules_round_trip_through_json_maps() {
        let rules = Rules::default().with_multipliers("gpt-4o", 2.5, 10.0);
        let json = serde_json::to_value(&rules).unwrap();
        assert_eq!(json["scoring"]["bronze"], 100);
        assert_eq!(json["penalties"]["WA"], 10);
        let back: Rules = serde_json::from_value(json).unwrap();
        assert_eq!(back.input_token_multipliers["gpt-4o"], 2.5);
    }

    #[test]
    fn terminate_keeps_first_reason() {
        let mut p = Participant::new("a", ProviderEndpoint::default(), 10);
        p.terminate(TerminationReason::OutOfTokens);
        p.terminate(TerminationReason::Error);
        assert!(!p.is_running);
        assert_eq!(p.termination_reason, Some(TerminationReason::OutOfTokens));
    }

    #[test]
    fn public_view_hides_test_cases() {
        let p = Problem::new("p1", "A+B", Level::Bronze)
            .with_test_cases(vec![TestCase::new("t1", "1 2", "3")])
            .with_sample_cases(vec![TestCase::new("s1", "5 7", "12")]);
        let view = serde_json::to_value(p.public_view(100)).unwrap();
        assert!(view.get("test_cases").is_none());
        assert_eq!(view["sample_cases"][0]["expected_output"], "12");
    }

    #[test]
    fn generated_ids_are_unique() {
        assert_ne!(generate_id("sub"), generate_id("sub"));
        assert!(generate_id("p").starts_with("p-"));
    }
}
