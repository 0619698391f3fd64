//! Engine-driven turns: prompt, relay, parse, dispatch.
//!
//! Each participant runs its turns strictly in sequence; participants of a
//! competition run concurrently. A turn that cannot reach the provider is
//! failed, and `max_consecutive_failures` failed turns in a row terminate
//! the participant with `relay_failure`.

use super::prompt::{self, Feedback};
use super::{Arena, ArenaError, CompetitionHandle, HintRequest};
use crate::economy::RankingEntry;
use crate::events::ArenaEvent;
use crate::model::{Participant, TerminationReason};
use crate::protocol::{Action, AgentAction, FallbackKind, ParseOutcome, ProtocolError};
use crate::relay::{AgentRef, Conversation, RelayError};
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

const UNPARSEABLE_FEEDBACK: &str = "No action could be read from your response. \
Reply with one JSON object containing \"action\" and \"parameters\".";

/// Engine-side state of one participant's run.
pub struct AgentSession {
    pub competition_id: String,
    pub participant_id: String,
    conversation: Conversation,
    feedback: Option<Feedback>,
    turn: u32,
    consecutive_failures: u32,
}

impl AgentSession {
    pub fn new(
        competition_id: impl Into<String>,
        participant_id: impl Into<String>,
        history_turns: usize,
    ) -> Self {
        Self {
            competition_id: competition_id.into(),
            participant_id: participant_id.into(),
            conversation: Conversation::new(prompt::system_prompt(), history_turns),
            feedback: None,
            turn: 0,
            consecutive_failures: 0,
        }
    }

    pub fn turn(&self) -> u32 {
        self.turn
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// Result of the last turn, shown in the next prompt.
    pub fn feedback(&self) -> Option<&Feedback> {
        self.feedback.as_ref()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// The action ran.
    Acted { action: String },
    /// The action was read but could not run.
    Rejected { action: String, message: String },
    /// The reply decoded but was not a valid action record.
    Fallback { kind: FallbackKind, message: String },
    /// Nothing could be read from the reply. The tokens are spent anyway.
    Wasted,
    /// The provider could not be reached.
    Failed { error: String },
    Finished { reason: TerminationReason },
}

impl TurnOutcome {
    pub fn is_finished(&self) -> bool {
        matches!(self, TurnOutcome::Finished { .. })
    }
}

fn to_json<T: Serialize>(value: &T) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

impl Arena {
    /// Play one turn for the session's participant.
    pub async fn take_turn(&self, session: &mut AgentSession) -> Result<TurnOutcome, ArenaError> {
        let handle = self.handle(&session.competition_id)?;
        let _permit = self.permit(&handle, &session.participant_id)?;

        let (prompt, provider) = {
            let competition = handle.competition.lock().await;
            let participant = competition
                .participant(&session.participant_id)
                .ok_or_else(|| ArenaError::UnknownParticipant(session.participant_id.clone()))?;
            if let Some(reason) = stopped(participant) {
                return Ok(TurnOutcome::Finished { reason });
            }
            let cap = self.config.relay.max_turns;
            if cap > 0 && session.turn >= cap {
                drop(competition);
                return Ok(self.turn_limit_reached(&handle, session).await);
            }
            (
                prompt::turn_prompt(&competition, participant, session.feedback.as_ref()),
                participant.provider.clone(),
            )
        };

        session.turn += 1;
        self.events.on_event(&ArenaEvent::TurnStarted {
            participant: &session.participant_id,
            turn: session.turn,
        });

        let sink = self.usage_sink(&session.competition_id);
        let agent = AgentRef {
            participant_id: &session.participant_id,
            provider: &provider,
        };
        let relayed = self
            .relay
            .request_turn(agent, &mut session.conversation, &prompt, &sink)
            .await;
        let reply = match relayed {
            Ok(reply) => reply,
            Err(e) => return self.turn_failed(&handle, session, e).await,
        };
        session.consecutive_failures = 0;

        // The charge for this reply may have used up the budget.
        if let Some(reason) = self.stop_reason(&handle, &session.participant_id).await {
            return Ok(TurnOutcome::Finished { reason });
        }

        let participant = session.participant_id.clone();
        let outcome = match reply.outcome {
            Ok(ParseOutcome::Action(record)) => {
                self.events.on_event(&ArenaEvent::ActionReceived {
                    participant: &participant,
                    action: &record,
                });
                self.dispatch(&handle, session, &record).await
            }
            Ok(ParseOutcome::Fallback { kind, message }) => {
                self.events.on_event(&ArenaEvent::ParseFallback {
                    participant: &participant,
                    kind,
                    message: &message,
                });
                session.feedback = Some(Feedback::error(&message));
                TurnOutcome::Fallback { kind, message }
            }
            Err(ProtocolError::Unparseable) => {
                self.events.on_event(&ArenaEvent::Unparseable {
                    participant: &participant,
                });
                session.feedback = Some(Feedback::error(UNPARSEABLE_FEEDBACK));
                TurnOutcome::Wasted
            }
        };

        if let Some(reason) = self.stop_reason(&handle, &participant).await {
            return Ok(TurnOutcome::Finished { reason });
        }
        Ok(outcome)
    }

    async fn turn_failed(
        &self,
        handle: &CompetitionHandle,
        session: &mut AgentSession,
        error: RelayError,
    ) -> Result<TurnOutcome, ArenaError> {
        session.consecutive_failures += 1;
        let limit = self.config.relay.max_consecutive_failures.max(1);
        warn!(
            participant = %session.participant_id,
            "Turn {} failed ({}/{limit}): {error}",
            session.turn,
            session.consecutive_failures
        );
        if session.consecutive_failures < limit {
            return Ok(TurnOutcome::Failed {
                error: error.to_string(),
            });
        }

        let mut competition = handle.competition.lock().await;
        let reason = TerminationReason::RelayFailure;
        if self.terminate_locked(&mut competition, &session.participant_id, reason) {
            self.persist(&competition);
        }
        Ok(TurnOutcome::Finished { reason })
    }

    async fn turn_limit_reached(
        &self,
        handle: &CompetitionHandle,
        session: &AgentSession,
    ) -> TurnOutcome {
        warn!(
            participant = %session.participant_id,
            "Turn cap of {} reached",
            session.turn
        );
        let mut competition = handle.competition.lock().await;
        let reason = TerminationReason::TurnLimit;
        if self.terminate_locked(&mut competition, &session.participant_id, reason) {
            self.persist(&competition);
        }
        TurnOutcome::Finished { reason }
    }

    async fn stop_reason(
        &self,
        handle: &CompetitionHandle,
        participant_id: &str,
    ) -> Option<TerminationReason> {
        let competition = handle.competition.lock().await;
        competition.participant(participant_id).and_then(stopped)
    }

    /// Run a parsed action and record its result as the next feedback.
    async fn dispatch(
        &self,
        handle: &CompetitionHandle,
        session: &mut AgentSession,
        record: &AgentAction,
    ) -> TurnOutcome {
        let action = match Action::from_agent_action(record) {
            Ok(action) => action,
            Err(e) => {
                let message = e.to_string();
                session.feedback = Some(Feedback::error(&message));
                return TurnOutcome::Rejected {
                    action: record.action.clone(),
                    message,
                };
            }
        };

        let name = action.name();
        let competition_id = session.competition_id.as_str();
        let participant_id = session.participant_id.as_str();
        let result = match action {
            Action::ViewProblems => self.problems(competition_id).await.map(|v| to_json(&v)),
            Action::ViewProblem(p) => self
                .problem(competition_id, &p.problem_id)
                .await
                .map(|v| to_json(&v)),
            Action::GetHint(p) => {
                let request = HintRequest {
                    problem_id: p.problem_id.filter(|id| !id.is_empty()),
                    hint_level: p.hint_level,
                    hint_knowledge: p.hint_knowledge,
                };
                self.grant_hint(handle, participant_id, request)
                    .await
                    .map(|v| to_json(&v))
            }
            Action::SubmitSolution(p) => self
                .judge_submission(handle, participant_id, &p.problem_id, &p.solution, &p.language)
                .await
                .map(|v| to_json(&v)),
            Action::ViewRankings => self.rankings(competition_id).await.map(|v| to_json(&v)),
            Action::Terminate(p) => {
                info!(
                    participant = %participant_id,
                    "Agent ended its run: {}",
                    p.reason.as_deref().unwrap_or("no reason given")
                );
                self.terminate_participant(
                    competition_id,
                    participant_id,
                    TerminationReason::CompetitorTerminated,
                )
                .await
                .map(|p| json!({"final_score": p.score, "remaining_tokens": p.remaining_tokens}))
            }
        };

        match result {
            Ok(content) => {
                session.feedback = Some(Feedback::Success {
                    action: name.to_string(),
                    content,
                });
                TurnOutcome::Acted {
                    action: name.to_string(),
                }
            }
            Err(e) => {
                let message = e.to_string();
                session.feedback = Some(Feedback::error(&message));
                TurnOutcome::Rejected {
                    action: name.to_string(),
                    message,
                }
            }
        }
    }

    /// Play turns until the participant stops.
    pub async fn run_participant(
        &self,
        competition_id: &str,
        participant_id: &str,
    ) -> Result<Participant, ArenaError> {
        let mut session = AgentSession::new(
            competition_id,
            participant_id,
            self.config.relay.history_turns,
        );
        loop {
            let outcome = match self.take_turn(&mut session).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.abort_run(competition_id, participant_id, &e).await;
                    return Err(e);
                }
            };
            if let TurnOutcome::Finished { reason } = outcome {
                info!(
                    participant = %participant_id,
                    "Finished after {} turn(s): {reason}",
                    session.turn
                );
                break;
            }
            debug!(participant = %participant_id, "Turn {}: {outcome:?}", session.turn);
        }
        self.participant(competition_id, participant_id).await
    }

    /// Record why a run ended early. A busy participant belongs to another
    /// run and is left alone.
    async fn abort_run(&self, competition_id: &str, participant_id: &str, error: &ArenaError) {
        if matches!(error, ArenaError::Busy(_)) {
            return;
        }
        error!(participant = %participant_id, "Run aborted: {error}");
        if let Err(e) = self
            .terminate_participant(competition_id, participant_id, TerminationReason::Error)
            .await
        {
            warn!(participant = %participant_id, "Could not mark participant stopped: {e}");
        }
    }

    /// Run every active participant concurrently and return the rankings.
    pub async fn run_competition(&self, competition_id: &str) -> Result<Vec<RankingEntry>, ArenaError> {
        let ids: Vec<String> = self
            .competition(competition_id)
            .await?
            .participants
            .iter()
            .filter(|p| p.is_running)
            .map(|p| p.id.clone())
            .collect();
        info!(competition = %competition_id, "Running {} participant(s)", ids.len());

        let runs = ids.iter().map(|id| self.run_participant(competition_id, id));
        let results = futures::future::join_all(runs).await;
        for (id, result) in ids.iter().zip(results) {
            if let Err(e) = result {
                debug!(participant = %id, "Run ended with error: {e}");
            }
        }
        self.rankings(competition_id).await
    }
}

fn stopped(participant: &Participant) -> Option<TerminationReason> {
    (!participant.is_running).then(|| {
        participant
            .termination_reason
            .unwrap_or(TerminationReason::Error)
    })
}

#[cfg(test)]
mod tests {
    use super::super::testing::{adder_problem, arena, provider};
    use super::super::{NewCompetition, NewParticipant};
    use super::*;
    use crate::judge::testing::AdderSandbox;
    use crate::model::Level;
    use crate::relay::testing::{ScriptedTransport, completion};
    use std::sync::Arc;

    async fn setup(tokens: u64) -> (Arena, Arc<ScriptedTransport>, String, String) {
        let transport = Arc::new(ScriptedTransport::default());
        let arena = arena(Arc::new(AdderSandbox), transport.clone());
        let comp = arena
            .create_competition(
                NewCompetition::new(
                    "Spring",
                    vec![adder_problem("p1", Level::Bronze), adder_problem("p2", Level::Silver)],
                )
                .with_max_tokens(tokens),
            )
            .await
            .unwrap();
        let p = arena
            .add_participant(&comp.id, NewParticipant::new("alice", provider("model-a")))
            .await
            .unwrap();
        (arena, transport, comp.id, p.id)
    }

    fn last_user_message(transport: &ScriptedTransport, request: usize) -> String {
        let requests = transport.requests.lock().unwrap();
        let messages = requests[request].body["messages"].as_array().unwrap().clone();
        messages
            .iter()
            .rev()
            .find(|m| m["role"] == "user")
            .and_then(|m| m["content"].as_str())
            .unwrap()
            .to_string()
    }

    #[tokio::test]
    async fn action_result_feeds_next_prompt() {
        let (arena, transport, comp, pid) = setup(10_000).await;
        transport.push(Ok(completion(
            r#"{"action": "VIEW_PROBLEM", "parameters": {"problem_id": "p2"}}"#,
            100,
            20,
        )));
        transport.push(Ok(completion(
            r#"{"action": "TERMINATE", "parameters": {"reason": "done"}}"#,
            100,
            20,
        )));

        let mut session = AgentSession::new(&comp, &pid, 10);
        let first = arena.take_turn(&mut session).await.unwrap();
        assert_eq!(first, TurnOutcome::Acted { action: "VIEW_PROBLEM".into() });

        let second = arena.take_turn(&mut session).await.unwrap();
        assert_eq!(
            second,
            TurnOutcome::Finished {
                reason: TerminationReason::CompetitorTerminated
            }
        );
        assert!(last_user_message(&transport, 1).contains("## Success VIEW_PROBLEM"));

        let alice = arena.participant(&comp, &pid).await.unwrap();
        assert_eq!(alice.remaining_tokens, 10_000 - 240);
        assert_eq!(alice.llm_tokens, 240);
    }

    #[tokio::test]
    async fn fallback_message_reported_back() {
        let (arena, transport, comp, pid) = setup(10_000).await;
        transport.push(Ok(completion(r#"{"action": "VIEW_PROBLEMS"}"#, 10, 5)));
        transport.push(Ok(completion("just thinking out loud", 10, 5)));
        transport.push(Ok(completion(r#"{"action": "DANCE", "parameters": {}}"#, 10, 5)));

        let mut session = AgentSession::new(&comp, &pid, 10);
        let outcome = arena.take_turn(&mut session).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Fallback {
                kind: FallbackKind::MissingField,
                message: "Missing 'parameters' field".into()
            }
        );

        assert_eq!(arena.take_turn(&mut session).await.unwrap(), TurnOutcome::Wasted);
        assert!(last_user_message(&transport, 1).contains("Missing 'parameters' field"));

        let rejected = arena.take_turn(&mut session).await.unwrap();
        assert!(matches!(rejected, TurnOutcome::Rejected { ref message, .. } if message.contains("DANCE")));
        // Unreadable turns still cost tokens.
        assert_eq!(arena.participant(&comp, &pid).await.unwrap().remaining_tokens, 10_000 - 45);
    }

    #[tokio::test]
    async fn submission_through_turn() {
        let (arena, transport, comp, pid) = setup(10_000).await;
        let submit = |problem: &str| {
            serde_json::json!({
                "action": "SUBMIT_SOLUTION",
                "parameters": {"problem_id": problem, "solution": "int main(){}", "language": "cpp"}
            })
            .to_string()
        };
        transport.push(Ok(completion(&submit("p1"), 10, 10)));
        transport.push(Ok(completion(&submit("p2"), 10, 10)));

        let mut session = AgentSession::new(&comp, &pid, 10);
        arena.take_turn(&mut session).await.unwrap();
        match session.feedback().unwrap() {
            Feedback::Success { content, .. } => assert_eq!(content["status"], "AC"),
            other => panic!("unexpected feedback {other:?}"),
        }
        let outcome = arena.take_turn(&mut session).await.unwrap();
        assert_eq!(
            outcome,
            TurnOutcome::Finished {
                reason: TerminationReason::AllProblemsSolved
            }
        );
        assert_eq!(arena.participant(&comp, &pid).await.unwrap().score, 200 + 300);
    }

    #[tokio::test]
    async fn budget_spent_by_reply_ends_run() {
        let (arena, transport, comp, pid) = setup(40).await;
        transport.push(Ok(completion(
            r#"{"action": "VIEW_PROBLEMS", "parameters": {}}"#,
            30,
            12,
        )));
        let mut session = AgentSession::new(&comp, &pid, 10);
        assert_eq!(
            arena.take_turn(&mut session).await.unwrap(),
            TurnOutcome::Finished {
                reason: TerminationReason::OutOfTokens
            }
        );
    }

    #[tokio::test]
    async fn repeated_relay_failures_terminate() {
        let (arena, transport, comp, pid) = setup(10_000).await;
        let mut session = AgentSession::new(&comp, &pid, 10);
        for _ in 0..2 {
            assert!(matches!(
                arena.take_turn(&mut session).await.unwrap(),
                TurnOutcome::Failed { .. }
            ));
        }
        assert_eq!(
            arena.take_turn(&mut session).await.unwrap(),
            TurnOutcome::Finished {
                reason: TerminationReason::RelayFailure
            }
        );
        // Three turns of three attempts each.
        assert_eq!(transport.request_count(), 9);
        let alice = arena.participant(&comp, &pid).await.unwrap();
        assert_eq!(alice.remaining_tokens, 10_000);
    }

    #[tokio::test]
    async fn competition_runs_everyone_to_the_end() {
        let (arena, transport, comp, _) = setup(10_000).await;
        arena
            .add_participant(&comp, NewParticipant::new("bob", provider("model-b")))
            .await
            .unwrap();
        for _ in 0..2 {
            transport.push(Ok(completion(r#"{"action": "TERMINATE", "parameters": {}}"#, 5, 5)));
        }

        let rankings = arena.run_competition(&comp).await.unwrap();
        assert_eq!(rankings.len(), 2);
        assert!(rankings.iter().all(|r| !r.is_running
            && r.termination_reason == Some(TerminationReason::CompetitorTerminated)));
    }

    #[tokio::test]
    async fn zero_usage_provider_stops_at_turn_cap() {
        let (mut arena, transport, comp, pid) = setup(10_000).await;
        arena.config.relay.max_turns = 2;
        for _ in 0..3 {
            transport.push(Ok(completion(r#"{"action": "VIEW_PROBLEMS", "parameters": {}}"#, 0, 0)));
        }

        let alice = arena.run_participant(&comp, &pid).await.unwrap();
        assert!(!alice.is_running);
        assert_eq!(alice.termination_reason, Some(TerminationReason::TurnLimit));
        assert_eq!(alice.remaining_tokens, 10_000);
        assert_eq!(transport.request_count(), 2);
    }

    #[tokio::test]
    async fn aborted_run_records_error() {
        let (arena, _, comp, pid) = setup(10_000).await;
        arena
            .abort_run(&comp, &pid, &ArenaError::Forward("connection reset".into()))
            .await;
        let alice = arena.participant(&comp, &pid).await.unwrap();
        assert!(!alice.is_running);
        assert_eq!(alice.termination_reason, Some(TerminationReason::Error));
    }

    #[tokio::test]
    async fn busy_participant_left_running() {
        let (arena, transport, comp, pid) = setup(10_000).await;
        let handle = arena.handle(&comp).unwrap();
        let _held = arena.permit(&handle, &pid).unwrap();

        let err = arena.run_participant(&comp, &pid).await.unwrap_err();
        assert!(matches!(err, ArenaError::Busy(_)));
        assert_eq!(transport.request_count(), 0);
        let alice = arena.participant(&comp, &pid).await.unwrap();
        assert!(alice.is_running);
        assert_eq!(alice.termination_reason, None);
    }
}
