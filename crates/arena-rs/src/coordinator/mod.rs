//! Turn Coordinator: the per-competition state owner.
//!
//! [`Arena`] holds every loaded competition behind its own
//! `tokio::sync::Mutex`. That lock is the only place participant budgets,
//! submissions and `first_to_solve` change, so two near-simultaneous
//! accepted submissions resolve to exactly one bonus. Judging and provider
//! calls run with the lock released; each participant has at most one
//! request in flight, enforced by the competition's [`TurnGate`].
//!
//! ```ignore
//! let arena = Arena::from_config(ArenaConfig::load(path)?, Arc::new(LoggingHandler))?;
//! let comp = arena.create_competition(NewCompetition::new("Spring", problems)).await?;
//! let alice = arena.add_participant(&comp.id, NewParticipant::new("alice", provider)).await?;
//! let report = arena.submit_solution(&comp.id, &alice.id, "p1", code, "cpp").await?;
//! ```

pub mod prompt;
pub mod runner;

pub use runner::{AgentSession, TurnOutcome};

use crate::config::ArenaConfig;
use crate::economy::{self, EconomyError, HintDecision, RankingEntry, TokenCharge, TokenUsage};
use crate::events::{ArenaEvent, EventHandler, NoopHandler};
use crate::hints::{HintComposer, KeywordRetriever};
use crate::judge::{HttpSandbox, Judge};
use crate::model::{
    Competition, Participant, Problem, ProblemView, ProviderEndpoint, Rules, Submission,
    TerminationReason, TestResult, Verdict,
};
use crate::protocol::ActionParser;
use crate::relay::{
    AgentRelay, ChargeFuture, ForwardError, HttpTransport, ProviderRequest, RelayError, UsageSink,
};
use crate::storage::{JsonSnapshotStore, MemoryStore, Store, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

// ── Errors ─────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum ArenaError {
    #[error("Competition with ID {0} not found")]
    UnknownCompetition(String),
    #[error("Participant with ID {0} not found")]
    UnknownParticipant(String),
    #[error("Problem with ID {0} not found")]
    UnknownProblem(String),
    #[error("Participant {participant} is not running, termination_reason: {reason}")]
    ParticipantInactive { participant: String, reason: String },
    #[error("Participant {0} already has a request in flight")]
    Busy(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// The provider answered a forwarded call with a non-2xx status.
    #[error("upstream HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("agent request failed: {0}")]
    Forward(String),
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Economy(#[from] EconomyError),
    #[error("competition registry lock poisoned")]
    Poisoned,
}

impl From<ForwardError> for ArenaError {
    fn from(e: ForwardError) -> Self {
        match e {
            ForwardError::Upstream { status, body } => ArenaError::Upstream { status, body },
            other => ArenaError::Forward(other.to_string()),
        }
    }
}

// ── Turn gate ──────────────────────────────────────────────────────

/// Participants with a request in flight.
#[derive(Default, Clone)]
pub struct TurnGate {
    in_flight: Arc<StdMutex<HashSet<String>>>,
}

/// Held while a participant's request runs; releases the gate on drop.
pub struct TurnPermit {
    in_flight: Arc<StdMutex<HashSet<String>>>,
    participant_id: String,
}

impl TurnGate {
    /// `None` when the participant already holds a permit.
    pub fn try_acquire(&self, participant_id: &str) -> Option<TurnPermit> {
        let mut in_flight = self.in_flight.lock().ok()?;
        if !in_flight.insert(participant_id.to_string()) {
            return None;
        }
        Some(TurnPermit {
            in_flight: self.in_flight.clone(),
            participant_id: participant_id.to_string(),
        })
    }

    pub fn is_busy(&self, participant_id: &str) -> bool {
        self.in_flight
            .lock()
            .map(|s| s.contains(participant_id))
            .unwrap_or(true)
    }
}

impl Drop for TurnPermit {
    fn drop(&mut self) {
        if let Ok(mut in_flight) = self.in_flight.lock() {
            in_flight.remove(&self.participant_id);
        }
    }
}

// ── Requests and replies ───────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewCompetition {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub problems: Vec<Problem>,
    /// Falls back to the configured defaults.
    #[serde(default)]
    pub rules: Option<Rules>,
    #[serde(default)]
    pub max_tokens_per_participant: Option<u64>,
}

impl NewCompetition {
    pub fn new(title: impl Into<String>, problems: Vec<Problem>) -> Self {
        Self {
            title: title.into(),
            description: String::new(),
            problems,
            rules: None,
            max_tokens_per_participant: None,
        }
    }

    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn with_max_tokens(mut self, tokens: u64) -> Self {
        self.max_tokens_per_participant = Some(tokens);
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct NewParticipant {
    pub name: String,
    #[serde(flatten)]
    pub provider: ProviderEndpoint,
    /// Defaults to the competition's per-participant budget.
    #[serde(default)]
    pub token_limit: Option<u64>,
}

impl NewParticipant {
    pub fn new(name: impl Into<String>, provider: ProviderEndpoint) -> Self {
        Self {
            name: name.into(),
            provider,
            token_limit: None,
        }
    }

    pub fn with_token_limit(mut self, limit: u64) -> Self {
        self.token_limit = Some(limit);
        self
    }
}

/// What the agent learns about a judged submission.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SubmissionReport {
    pub submission_id: String,
    pub problem_id: String,
    pub status: Verdict,
    pub score: u32,
    pub penalty: u32,
    #[serde(default)]
    pub first_to_solve_bonus: u32,
    pub passed_tests: usize,
    pub total_tests: usize,
    pub test_results: Vec<TestResult>,
}

impl SubmissionReport {
    fn new(submission: &Submission, total_tests: usize) -> Self {
        Self {
            submission_id: submission.id.clone(),
            problem_id: submission.problem_id.clone(),
            status: submission.status,
            score: submission.score,
            penalty: submission.penalty,
            first_to_solve_bonus: submission.first_to_solve_bonus,
            passed_tests: submission.passed_count(),
            total_tests,
            test_results: submission.test_results.clone(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HintRequest {
    #[serde(default)]
    pub problem_id: Option<String>,
    pub hint_level: u8,
    #[serde(default)]
    pub hint_knowledge: Option<String>,
}

impl HintRequest {
    pub fn new(problem_id: Option<&str>, hint_level: u8) -> Self {
        Self {
            problem_id: problem_id.map(str::to_string),
            hint_level,
            hint_knowledge: None,
        }
    }

    pub fn with_knowledge(mut self, knowledge: impl Into<String>) -> Self {
        self.hint_knowledge = Some(knowledge.into());
        self
    }
}

/// A hint decision with its content. Denials carry no content.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct HintReply {
    pub problem_id: Option<String>,
    #[serde(flatten)]
    pub decision: HintDecision,
    pub hint_content: Option<Value>,
}

/// A provider call an agent wants made with its own credentials.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RelayRequest {
    #[serde(default = "default_method")]
    pub method: String,
    /// Absolute URL, or a path appended to the participant's base URL.
    /// Empty uses the configured request template's path.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub json: Value,
    /// Seconds.
    #[serde(default)]
    pub timeout: Option<f64>,
}

fn default_method() -> String {
    "POST".to_string()
}

impl RelayRequest {
    pub fn new(json: Value) -> Self {
        Self {
            method: default_method(),
            url: String::new(),
            headers: BTreeMap::new(),
            json,
            timeout: None,
        }
    }

    /// Resolve against the participant's endpoint. The participant's key is
    /// sent unless the agent set its own `Authorization` header.
    fn to_provider_request(
        &self,
        provider: &ProviderEndpoint,
        default_url: String,
        default_timeout: Duration,
    ) -> Result<ProviderRequest, ArenaError> {
        let url = if self.url.is_empty() {
            default_url
        } else if self.url.starts_with("http://") || self.url.starts_with("https://") {
            self.url.clone()
        } else if self.url.starts_with('/') {
            format!("{}{}", provider.api_base_url.trim_end_matches('/'), self.url)
        } else {
            return Err(ArenaError::InvalidRequest(format!(
                "url must be absolute or start with '/': {}",
                self.url
            )));
        };

        let mut headers: Vec<(String, String)> = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let has = |name: &str| headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name));
        let needs_auth = !has("authorization") && !provider.api_key.is_empty();
        let needs_type = !has("content-type");
        if needs_auth {
            headers.push((
                "Authorization".to_string(),
                format!("Bearer {}", provider.api_key),
            ));
        }
        if needs_type {
            headers.push(("Content-Type".to_string(), "application/json".to_string()));
        }

        let timeout = self
            .timeout
            .filter(|t| t.is_finite() && *t > 0.0)
            .map(Duration::from_secs_f64)
            .unwrap_or(default_timeout);

        Ok(ProviderRequest {
            method: self.method.to_ascii_uppercase(),
            url,
            headers,
            body: self.json.clone(),
            timeout,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct UsageSummary {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Adjusted tokens charged for the call.
    pub total_tokens: u64,
    pub remaining_tokens: u64,
}

impl From<&TokenCharge> for UsageSummary {
    fn from(charge: &TokenCharge) -> Self {
        Self {
            prompt_tokens: charge.adjusted_prompt_tokens,
            completion_tokens: charge.adjusted_completion_tokens,
            total_tokens: charge.adjusted_total(),
            remaining_tokens: charge.remaining_tokens,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RelayedResponse {
    pub status: u16,
    /// Provider envelope, unchanged apart from SSE folding.
    pub content: Value,
    pub usage: UsageSummary,
}

// ── Arena ──────────────────────────────────────────────────────────

pub struct CompetitionHandle {
    competition: Mutex<Competition>,
    gate: TurnGate,
}

impl CompetitionHandle {
    fn new(competition: Competition) -> Self {
        Self {
            competition: Mutex::new(competition),
            gate: TurnGate::default(),
        }
    }

    pub fn gate(&self) -> &TurnGate {
        &self.gate
    }
}

pub struct Arena {
    competitions: RwLock<HashMap<String, Arc<CompetitionHandle>>>,
    judge: Judge,
    relay: AgentRelay,
    hints: HintComposer,
    store: Arc<dyn Store>,
    events: Arc<dyn EventHandler>,
    config: ArenaConfig,
}

impl Arena {
    pub fn new(config: ArenaConfig, judge: Judge, relay: AgentRelay) -> Self {
        Self {
            competitions: RwLock::new(HashMap::new()),
            judge,
            relay,
            hints: HintComposer::default(),
            store: Arc::new(MemoryStore::new()),
            events: Arc::new(NoopHandler),
            config,
        }
    }

    /// Wire the HTTP sandbox, HTTP transport and configured store.
    pub fn from_config(config: ArenaConfig, events: Arc<dyn EventHandler>) -> Result<Self, String> {
        let sandbox = HttpSandbox::new(&config.judge)?;
        let transport = HttpTransport::new()?;
        let parser = ActionParser::from_rules(config.protocol.fallback_rules.clone())?;
        let relay = AgentRelay::from_config(&config.relay, Arc::new(transport))
            .with_parser(Arc::new(parser))
            .with_event_handler(events.clone());

        let store: Arc<dyn Store> = match &config.storage.snapshot_dir {
            Some(dir) => Arc::new(JsonSnapshotStore::new(dir).map_err(|e| e.to_string())?),
            None => Arc::new(MemoryStore::new()),
        };
        let hints = match &config.hints.corpus_path {
            Some(path) => HintComposer::new(Arc::new(KeywordRetriever::load(path)?)),
            None => HintComposer::default(),
        };

        Ok(Self::new(config, Judge::new(Arc::new(sandbox)), relay)
            .with_store(store)
            .with_hints(hints)
            .with_event_handler(events))
    }

    pub fn with_store(mut self, store: Arc<dyn Store>) -> Self {
        self.store = store;
        self
    }

    pub fn with_hints(mut self, hints: HintComposer) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &ArenaConfig {
        &self.config
    }

    pub fn judge(&self) -> &Judge {
        &self.judge
    }

    pub fn relay(&self) -> &AgentRelay {
        &self.relay
    }

    /// Load every stored competition. Returns how many were loaded.
    pub fn restore(&self) -> Result<usize, ArenaError> {
        let stored = self.store.list_competitions()?;
        let count = stored.len();
        let mut map = self.competitions.write().map_err(|_| ArenaError::Poisoned)?;
        for competition in stored {
            map.entry(competition.id.clone())
                .or_insert_with(|| Arc::new(CompetitionHandle::new(competition)));
        }
        drop(map);
        info!("Restored {count} competition(s)");
        Ok(count)
    }

    pub fn competition_ids(&self) -> Vec<String> {
        self.competitions
            .read()
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Loaded handle, or the stored snapshot loaded on first use.
    pub fn handle(&self, competition_id: &str) -> Result<Arc<CompetitionHandle>, ArenaError> {
        if let Some(handle) = self
            .competitions
            .read()
            .ok()
            .and_then(|map| map.get(competition_id).cloned())
        {
            return Ok(handle);
        }
        let stored = self
            .store
            .load_competition(competition_id)?
            .ok_or_else(|| ArenaError::UnknownCompetition(competition_id.to_string()))?;
        let handle = Arc::new(CompetitionHandle::new(stored));
        let mut map = self
            .competitions
            .write()
            .map_err(|_| ArenaError::Poisoned)?;
        Ok(map
            .entry(competition_id.to_string())
            .or_insert(handle)
            .clone())
    }

    fn persist(&self, competition: &Competition) {
        if let Err(e) = self.store.save_competition(competition) {
            error!(competition = %competition.id, "Failed to persist competition: {e}");
        }
    }

    fn permit(&self, handle: &CompetitionHandle, participant_id: &str) -> Result<TurnPermit, ArenaError> {
        handle
            .gate
            .try_acquire(participant_id)
            .ok_or_else(|| ArenaError::Busy(participant_id.to_string()))
    }

    // ── Management ─────────────────────────────────────────────────

    pub async fn create_competition(&self, new: NewCompetition) -> Result<Competition, ArenaError> {
        if new.title.trim().is_empty() {
            return Err(ArenaError::InvalidRequest("title must not be empty".into()));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = new.problems.iter().find(|p| !seen.insert(p.id.as_str())) {
            return Err(ArenaError::InvalidRequest(format!(
                "duplicate problem id: {}",
                dup.id
            )));
        }

        let defaults = &self.config.competition;
        let mut competition = Competition::new(
            new.title,
            new.rules.unwrap_or_else(|| defaults.rules.clone()),
            new.max_tokens_per_participant
                .unwrap_or(defaults.max_tokens_per_participant),
        )
        .with_problems(new.problems);
        competition.description = new.description;

        self.store.save_competition(&competition)?;
        if let Ok(mut map) = self.competitions.write() {
            map.insert(
                competition.id.clone(),
                Arc::new(CompetitionHandle::new(competition.clone())),
            );
        }
        info!(
            competition = %competition.id,
            "Created competition '{}' with {} problem(s)",
            competition.title,
            competition.problems.len()
        );
        Ok(competition)
    }

    pub async fn add_participant(
        &self,
        competition_id: &str,
        new: NewParticipant,
    ) -> Result<Participant, ArenaError> {
        if new.name.trim().is_empty() {
            return Err(ArenaError::InvalidRequest("name must not be empty".into()));
        }
        let handle = self.handle(competition_id)?;
        let mut competition = handle.competition.lock().await;
        let limit = new
            .token_limit
            .unwrap_or(competition.max_tokens_per_participant);
        let participant = Participant::new(new.name, new.provider, limit);
        competition.participants.push(participant.clone());
        self.persist(&competition);
        info!(
            competition = %competition_id,
            participant = %participant.id,
            "Registered '{}' with {limit} tokens",
            participant.name
        );
        Ok(participant)
    }

    /// Snapshot of the competition.
    pub async fn competition(&self, competition_id: &str) -> Result<Competition, ArenaError> {
        let handle = self.handle(competition_id)?;
        let competition = handle.competition.lock().await;
        Ok(competition.clone())
    }

    pub async fn participant(
        &self,
        competition_id: &str,
        participant_id: &str,
    ) -> Result<Participant, ArenaError> {
        let handle = self.handle(competition_id)?;
        let competition = handle.competition.lock().await;
        competition
            .participant(participant_id)
            .cloned()
            .ok_or_else(|| ArenaError::UnknownParticipant(participant_id.to_string()))
    }

    /// Public views of every problem; hidden test cases are left out.
    pub async fn problems(&self, competition_id: &str) -> Result<Vec<ProblemView>, ArenaError> {
        let handle = self.handle(competition_id)?;
        let competition = handle.competition.lock().await;
        Ok(competition
            .problems
            .iter()
            .map(|p| p.public_view(competition.rules.max_score(p.level)))
            .collect())
    }

    pub async fn problem(
        &self,
        competition_id: &str,
        problem_id: &str,
    ) -> Result<ProblemView, ArenaError> {
        let handle = self.handle(competition_id)?;
        let competition = handle.competition.lock().await;
        competition
            .problem(problem_id)
            .map(|p| p.public_view(competition.rules.max_score(p.level)))
            .ok_or_else(|| ArenaError::UnknownProblem(problem_id.to_string()))
    }

    pub async fn rankings(&self, competition_id: &str) -> Result<Vec<RankingEntry>, ArenaError> {
        let handle = self.handle(competition_id)?;
        let competition = handle.competition.lock().await;
        Ok(economy::rankings(&competition))
    }

    pub async fn terminate_participant(
        &self,
        competition_id: &str,
        participant_id: &str,
        reason: TerminationReason,
    ) -> Result<Participant, ArenaError> {
        let handle = self.handle(competition_id)?;
        let mut competition = handle.competition.lock().await;
        if competition.participant(participant_id).is_none() {
            return Err(ArenaError::UnknownParticipant(participant_id.to_string()));
        }
        if self.terminate_locked(&mut competition, participant_id, reason) {
            self.persist(&competition);
        }
        competition
            .participant(participant_id)
            .cloned()
            .ok_or_else(|| ArenaError::UnknownParticipant(participant_id.to_string()))
    }

    /// Returns whether the participant was still running.
    fn terminate_locked(
        &self,
        competition: &mut Competition,
        participant_id: &str,
        reason: TerminationReason,
    ) -> bool {
        let Some(participant) = competition.participant_mut(participant_id) else {
            return false;
        };
        if !participant.is_running {
            return false;
        }
        participant.terminate(reason);
        self.events.on_event(&ArenaEvent::ParticipantTerminated {
            participant: participant_id,
            reason,
        });
        true
    }

    // ── Submissions ────────────────────────────────────────────────

    pub async fn submit_solution(
        &self,
        competition_id: &str,
        participant_id: &str,
        problem_id: &str,
        code: &str,
        language: &str,
    ) -> Result<SubmissionReport, ArenaError> {
        let handle = self.handle(competition_id)?;
        let _permit = self.permit(&handle, participant_id)?;
        self.judge_submission(&handle, participant_id, problem_id, code, language)
            .await
    }

    async fn judge_submission(
        &self,
        handle: &CompetitionHandle,
        participant_id: &str,
        problem_id: &str,
        code: &str,
        language: &str,
    ) -> Result<SubmissionReport, ArenaError> {
        let (pending, problem, rules) = {
            let competition = handle.competition.lock().await;
            active(&competition, participant_id)?;
            let problem = competition
                .problem(problem_id)
                .cloned()
                .ok_or_else(|| ArenaError::UnknownProblem(problem_id.to_string()))?;
            let pending =
                Submission::pending(&competition.id, participant_id, problem_id, code, language);
            (pending, problem, competition.rules.clone())
        };

        let judged = self.judge.evaluate(&pending, &problem, &rules).await;

        let mut competition = handle.competition.lock().await;
        let (recorded, participant) = economy::apply_verdict(&mut competition, judged)?;
        self.events.on_event(&ArenaEvent::SubmissionJudged {
            participant: participant_id,
            submission: &recorded,
        });
        debug!(
            participant = %participant_id,
            "Score is now {} after {} submission(s)",
            participant.score,
            participant.submissions.len()
        );
        if competition.all_solved_by(participant_id) {
            self.terminate_locked(
                &mut competition,
                participant_id,
                TerminationReason::AllProblemsSolved,
            );
        }
        self.persist(&competition);
        Ok(SubmissionReport::new(&recorded, problem.test_cases.len()))
    }

    // ── Hints ──────────────────────────────────────────────────────

    pub async fn request_hint(
        &self,
        competition_id: &str,
        participant_id: &str,
        request: HintRequest,
    ) -> Result<HintReply, ArenaError> {
        let handle = self.handle(competition_id)?;
        let _permit = self.permit(&handle, participant_id)?;
        self.grant_hint(&handle, participant_id, request).await
    }

    async fn grant_hint(
        &self,
        handle: &CompetitionHandle,
        participant_id: &str,
        request: HintRequest,
    ) -> Result<HintReply, ArenaError> {
        let level = request.hint_level;
        let (decision, problem, exclude) = {
            let mut guard = handle.competition.lock().await;
            active(&guard, participant_id)?;
            let problem = match &request.problem_id {
                Some(id) => Some(
                    guard
                        .problem(id)
                        .cloned()
                        .ok_or_else(|| ArenaError::UnknownProblem(id.clone()))?,
                ),
                None => None,
            };

            let competition = &mut *guard;
            let participant = competition
                .participants
                .iter_mut()
                .find(|p| p.id == participant_id)
                .ok_or_else(|| ArenaError::UnknownParticipant(participant_id.to_string()))?;
            let decision = economy::grant_hint(participant, level, &competition.rules);
            let exhausted = decision.is_granted() && participant.remaining_tokens == 0;
            self.events.on_event(&ArenaEvent::HintDecided {
                participant: participant_id,
                problem_id: request.problem_id.as_deref().unwrap_or_default(),
                decision: &decision,
            });

            if exhausted {
                self.terminate_locked(competition, participant_id, TerminationReason::OutOfTokens);
            }
            if decision.is_granted() {
                self.persist(competition);
            }
            let exclude: Vec<String> = competition.problems.iter().map(|p| p.id.clone()).collect();
            (decision, problem, exclude)
        };

        let hint_content = decision.is_granted().then(|| {
            self.hints.compose(
                problem.as_ref(),
                level,
                request.hint_knowledge.as_deref(),
                &exclude,
            )
        });
        Ok(HintReply {
            problem_id: request.problem_id,
            decision,
            hint_content,
        })
    }

    // ── Token accounting ───────────────────────────────────────────

    /// Charge one LLM call. A budget that reaches zero terminates the
    /// participant with `out_of_tokens`.
    pub async fn charge_tokens(
        &self,
        competition_id: &str,
        participant_id: &str,
        usage: TokenUsage,
        model_id: &str,
    ) -> Result<TokenCharge, ArenaError> {
        let handle = self.handle(competition_id)?;
        let mut competition = handle.competition.lock().await;
        self.charge_locked(&mut competition, participant_id, usage, model_id)
    }

    fn charge_locked(
        &self,
        competition: &mut Competition,
        participant_id: &str,
        usage: TokenUsage,
        model_id: &str,
    ) -> Result<TokenCharge, ArenaError> {
        let Competition {
            rules,
            participants,
            ..
        } = &mut *competition;
        let participant = participants
            .iter_mut()
            .find(|p| p.id == participant_id)
            .ok_or_else(|| ArenaError::UnknownParticipant(participant_id.to_string()))?;
        let charge = economy::charge_tokens(participant, usage, model_id, rules);
        self.events.on_event(&ArenaEvent::TokensCharged {
            participant: participant_id,
            charge: &charge,
        });
        if charge.exhausted() {
            self.terminate_locked(competition, participant_id, TerminationReason::OutOfTokens);
        }
        self.persist(competition);
        Ok(charge)
    }

    // ── Forwarded agent requests ───────────────────────────────────

    /// Make one provider call for an agent that drives its own loop. No
    /// retries here; the agent retries. The call is charged from the
    /// envelope's usage, with multipliers chosen by the body's `model`
    /// (falling back to the participant's model id).
    pub async fn relay_agent_request(
        &self,
        competition_id: &str,
        participant_id: &str,
        request: RelayRequest,
    ) -> Result<RelayedResponse, ArenaError> {
        let handle = self.handle(competition_id)?;
        let _permit = self.permit(&handle, participant_id)?;

        let provider = {
            let competition = handle.competition.lock().await;
            active(&competition, participant_id)?.provider.clone()
        };
        let outbound = request.to_provider_request(
            &provider,
            self.relay.template().url_for(&provider),
            self.config.relay.attempt_timeout(),
        )?;
        let model_id = request
            .json
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or(&provider.model_id)
            .to_string();

        let reply = self.relay.forward(&outbound).await?;

        let mut competition = handle.competition.lock().await;
        let charge = self.charge_locked(&mut competition, participant_id, reply.usage, &model_id)?;
        Ok(RelayedResponse {
            status: reply.status,
            content: reply.envelope,
            usage: UsageSummary::from(&charge),
        })
    }

    /// Usage sink that charges turns of one competition.
    pub fn usage_sink<'a>(&'a self, competition_id: &'a str) -> ArenaSink<'a> {
        ArenaSink {
            arena: self,
            competition_id,
        }
    }
}

/// The participant, if it is still running.
fn active<'a>(competition: &'a Competition, participant_id: &str) -> Result<&'a Participant, ArenaError> {
    let participant = competition
        .participant(participant_id)
        .ok_or_else(|| ArenaError::UnknownParticipant(participant_id.to_string()))?;
    if !participant.is_running {
        return Err(ArenaError::ParticipantInactive {
            participant: participant_id.to_string(),
            reason: participant
                .termination_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "unknown".into()),
        });
    }
    Ok(participant)
}

/// Charges relay usage through the [`Arena`], under the competition lock.
pub struct ArenaSink<'a> {
    arena: &'a Arena,
    competition_id: &'a str,
}

impl UsageSink for ArenaSink<'_> {
    fn charge<'a>(&'a self, participant_id: &'a str, model_id: &'a str, usage: TokenUsage) -> ChargeFuture<'a> {
        Box::pin(async move {
            if let Err(e) = self
                .arena
                .charge_tokens(self.competition_id, participant_id, usage, model_id)
                .await
            {
                error!(participant = %participant_id, "Failed to charge tokens: {e}");
            }
        })
    }
}

// ── Test support ───────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::judge::sandbox::Sandbox;
    use crate::model::{Level, TestCase};
    use crate::relay::{RecordingSleeper, RetryPolicy, Transport};

    /// A+B problem with two hidden cases.
    pub fn adder_problem(id: &str, level: Level) -> Problem {
        Problem::new(id, format!("Sum {id}"), level)
            .with_description("Read two numbers and print their sum.")
            .with_test_cases(vec![
                TestCase::new("t1", "1 2", "3"),
                TestCase::new("t2", "5 7", "12"),
            ])
    }

    pub fn provider(model: &str) -> ProviderEndpoint {
        ProviderEndpoint {
            api_base_url: "http://provider.test".into(),
            api_key: "sk-test".into(),
            model_id: model.into(),
        }
    }

    pub fn arena(sandbox: Arc<dyn Sandbox>, transport: Arc<dyn Transport>) -> Arena {
        let config = ArenaConfig::default();
        let relay = AgentRelay::new(
            transport,
            config.relay.request_template.clone(),
            RetryPolicy::new(3, Duration::from_secs(10)),
        )
        .with_sleeper(Arc::new(RecordingSleeper::new()));
        Arena::new(config, Judge::new(sandbox), relay)
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{adder_problem, arena, provider};
    use super::*;
    use crate::judge::testing::AdderSandbox;
    use crate::model::Level;
    use crate::relay::TransportResponse;
    use crate::relay::testing::{ScriptedTransport, completion};
    use serde_json::json;

    const ADDER_CPP: &str = "int main(){long a,b;std::cin>>a>>b;std::cout<<a+b;}";

    async fn setup(tokens: u64) -> (Arena, Arc<ScriptedTransport>, String, Vec<String>) {
        let transport = Arc::new(ScriptedTransport::default());
        let arena = arena(Arc::new(AdderSandbox), transport.clone());
        let comp = arena
            .create_competition(
                NewCompetition::new("Spring", vec![adder_problem("p1", Level::Bronze)])
                    .with_max_tokens(tokens),
            )
            .await
            .unwrap();
        let mut ids = Vec::new();
        for name in ["alice", "bob"] {
            let p = arena
                .add_participant(&comp.id, NewParticipant::new(name, provider("model-a")))
                .await
                .unwrap();
            ids.push(p.id);
        }
        (arena, transport, comp.id, ids)
    }

    #[tokio::test]
    async fn concurrent_accepts_award_one_bonus() {
        let (arena, _, comp, ids) = setup(1000).await;
        let (a, b) = tokio::join!(
            arena.submit_solution(&comp, &ids[0], "p1", ADDER_CPP, "cpp"),
            arena.submit_solution(&comp, &ids[1], "p1", ADDER_CPP, "cpp"),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.status, Verdict::Accepted);
        assert_eq!(b.status, Verdict::Accepted);
        assert_eq!(a.first_to_solve_bonus + b.first_to_solve_bonus, 100);

        let snapshot = arena.competition(&comp).await.unwrap();
        let winner = snapshot.problems[0].first_to_solve().unwrap().to_string();
        let scores: Vec<i64> = ids
            .iter()
            .map(|id| snapshot.participant(id).unwrap().score)
            .collect();
        for (id, score) in ids.iter().zip(scores) {
            assert_eq!(score, if *id == winner { 200 } else { 100 });
        }
    }

    #[tokio::test]
    async fn solving_everything_terminates() {
        let (arena, _, comp, ids) = setup(1000).await;
        arena
            .submit_solution(&comp, &ids[0], "p1", ADDER_CPP, "cpp")
            .await
            .unwrap();
        let alice = arena.participant(&comp, &ids[0]).await.unwrap();
        assert!(!alice.is_running);
        assert_eq!(
            alice.termination_reason,
            Some(TerminationReason::AllProblemsSolved)
        );

        let err = arena
            .submit_solution(&comp, &ids[0], "p1", ADDER_CPP, "cpp")
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::ParticipantInactive { .. }));
    }

    #[tokio::test]
    async fn unknown_problem_and_participant() {
        let (arena, _, comp, ids) = setup(1000).await;
        assert!(matches!(
            arena.submit_solution(&comp, &ids[0], "nope", "", "cpp").await,
            Err(ArenaError::UnknownProblem(_))
        ));
        assert!(matches!(
            arena.submit_solution(&comp, "ghost", "p1", "", "cpp").await,
            Err(ArenaError::UnknownParticipant(_))
        ));
        assert!(matches!(
            arena.problems("missing").await,
            Err(ArenaError::UnknownCompetition(_))
        ));
    }

    #[tokio::test]
    async fn busy_participant_is_refused() {
        let (arena, _, comp, ids) = setup(1000).await;
        let handle = arena.handle(&comp).unwrap();
        let permit = handle.gate().try_acquire(&ids[0]).unwrap();
        assert!(matches!(
            arena.submit_solution(&comp, &ids[0], "p1", ADDER_CPP, "cpp").await,
            Err(ArenaError::Busy(_))
        ));
        drop(permit);
        assert!(!handle.gate().is_busy(&ids[0]));
        assert!(arena.submit_solution(&comp, &ids[0], "p1", ADDER_CPP, "cpp").await.is_ok());
    }

    #[tokio::test]
    async fn hint_denied_without_budget() {
        let (arena, _, comp, ids) = setup(250).await;
        let reply = arena
            .request_hint(&comp, &ids[0], HintRequest::new(Some("p1"), 3))
            .await
            .unwrap();
        assert_eq!(
            reply.decision,
            HintDecision::Denied {
                level: 3,
                cost: 300,
                remaining_tokens: 250
            }
        );
        assert!(reply.hint_content.is_none());

        let granted = arena
            .request_hint(&comp, &ids[0], HintRequest::new(Some("p1"), 1))
            .await
            .unwrap();
        assert!(granted.decision.is_granted());
        assert_eq!(granted.hint_content.unwrap()["current_problem"]["id"], "p1");
        assert_eq!(arena.participant(&comp, &ids[0]).await.unwrap().remaining_tokens, 150);
    }

    #[tokio::test]
    async fn hint_spending_last_tokens_terminates() {
        let (arena, _, comp, ids) = setup(100).await;
        let reply = arena
            .request_hint(&comp, &ids[0], HintRequest::new(None, 0))
            .await
            .unwrap();
        assert!(reply.decision.is_granted());
        let alice = arena.participant(&comp, &ids[0]).await.unwrap();
        assert_eq!(alice.termination_reason, Some(TerminationReason::OutOfTokens));
    }

    #[tokio::test]
    async fn charge_applies_multipliers_and_clamps() {
        let transport = Arc::new(ScriptedTransport::default());
        let arena = arena(Arc::new(AdderSandbox), transport);
        let rules = Rules::default().with_multipliers("model-a", 2.0, 0.5);
        let comp = arena
            .create_competition(
                NewCompetition::new("Rules", vec![]).with_rules(rules).with_max_tokens(1000),
            )
            .await
            .unwrap();
        let p = arena
            .add_participant(&comp.id, NewParticipant::new("alice", provider("model-a")))
            .await
            .unwrap();

        let charge = arena
            .charge_tokens(&comp.id, &p.id, TokenUsage::new(100, 101), "model-a")
            .await
            .unwrap();
        assert_eq!(charge.adjusted_prompt_tokens, 200);
        assert_eq!(charge.adjusted_completion_tokens, 50);
        assert_eq!(charge.remaining_tokens, 750);

        let charge = arena
            .charge_tokens(&comp.id, &p.id, TokenUsage::new(1000, 0), "model-a")
            .await
            .unwrap();
        assert_eq!(charge.remaining_tokens, 0);
        let alice = arena.participant(&comp.id, &p.id).await.unwrap();
        assert_eq!(alice.termination_reason, Some(TerminationReason::OutOfTokens));
    }

    #[tokio::test]
    async fn relayed_request_is_charged_and_uses_participant_key() {
        let (arena, transport, comp, ids) = setup(1000).await;
        transport.push(Ok(completion("hello", 30, 12)));

        let mut request = RelayRequest::new(json!({"model": "model-a", "messages": []}));
        request.url = "/v1/chat/completions".into();
        let reply = arena
            .relay_agent_request(&comp, &ids[0], request)
            .await
            .unwrap();
        assert_eq!(reply.status, 200);
        assert_eq!(reply.content["choices"][0]["message"]["content"], "hello");
        assert_eq!(reply.usage.total_tokens, 42);
        assert_eq!(reply.usage.remaining_tokens, 958);

        let sent = transport.requests.lock().unwrap()[0].clone();
        assert_eq!(sent.url, "http://provider.test/v1/chat/completions");
        assert!(
            sent.headers
                .iter()
                .any(|(k, v)| k == "Authorization" && v == "Bearer sk-test")
        );
    }

    #[tokio::test]
    async fn relayed_upstream_failure_is_mirrored_without_charge() {
        let (arena, transport, comp, ids) = setup(1000).await;
        transport.push(Ok(TransportResponse::new(429, "slow down")));
        let err = arena
            .relay_agent_request(&comp, &ids[0], RelayRequest::new(json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::Upstream { status: 429, .. }));
        assert_eq!(arena.participant(&comp, &ids[0]).await.unwrap().remaining_tokens, 1000);
    }

    #[tokio::test]
    async fn relative_url_must_start_with_slash() {
        let (arena, _, comp, ids) = setup(1000).await;
        let mut request = RelayRequest::new(json!({}));
        request.url = "v1/chat".into();
        assert!(matches!(
            arena.relay_agent_request(&comp, &ids[0], request).await,
            Err(ArenaError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn competitions_reload_from_store() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let first = arena(Arc::new(AdderSandbox), Arc::new(ScriptedTransport::default()))
            .with_store(store.clone());
        let comp = first
            .create_competition(NewCompetition::new("Saved", vec![adder_problem("p1", Level::Silver)]))
            .await
            .unwrap();

        let second = arena(Arc::new(AdderSandbox), Arc::new(ScriptedTransport::default()))
            .with_store(store);
        assert_eq!(second.restore().unwrap(), 1);
        assert_eq!(second.problem(&comp.id, "p1").await.unwrap().max_score, 200);
    }

    #[tokio::test]
    async fn corrupt_snapshot_is_a_store_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("comp-broken.json"), "{ not json").unwrap();
        let arena = arena(Arc::new(AdderSandbox), Arc::new(ScriptedTransport::default()))
            .with_store(Arc::new(JsonSnapshotStore::new(dir.path()).unwrap()));

        let err = arena.competition("comp-broken").await.unwrap_err();
        assert!(matches!(err, ArenaError::Store(StoreError::Format { .. })));
        assert!(matches!(
            arena.competition("comp-missing").await.unwrap_err(),
            ArenaError::UnknownCompetition(_)
        ));
    }

    #[tokio::test]
    async fn rejects_duplicate_problem_ids() {
        let arena = arena(Arc::new(AdderSandbox), Arc::new(ScriptedTransport::default()));
        let err = arena
            .create_competition(NewCompetition::new(
                "Dup",
                vec![adder_problem("p1", Level::Bronze), adder_problem("p1", Level::Gold)],
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, ArenaError::InvalidRequest(_)));
    }
}
