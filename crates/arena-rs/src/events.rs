//! Observable engine events and handlers.
//!
//! The relay and the coordinator report what they do through
//! [`ArenaEvent`]s. Implement [`EventHandler`] to drive dashboards, collect
//! metrics, or assert on behavior in tests.
//!
//! | Handler | Use case |
//! |---------|----------|
//! | [`NoopHandler`] | Default; ignores everything |
//! | [`LoggingHandler`] | Structured logging via `tracing` |
//! | [`FnEventHandler`] | Quick closures |
//! | [`CompositeEventHandler`] | Fan out to several handlers in order |

use crate::economy::{HintDecision, TokenCharge};
use crate::model::{Submission, TerminationReason};
use crate::protocol::{AgentAction, FallbackKind};
use crate::relay::{AttemptFailure, RelayState};
use tracing::{debug, info, warn};

// ── Events ─────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ArenaEvent<'a> {
    /// A participant's turn is starting.
    TurnStarted { participant: &'a str, turn: u32 },
    /// The relay moved to a new state.
    Relay {
        participant: &'a str,
        state: RelayState,
    },
    /// One provider attempt failed.
    AttemptFailed {
        participant: &'a str,
        attempt: u32,
        error: &'a AttemptFailure,
    },
    /// Provider usage was charged to the participant.
    TokensCharged {
        participant: &'a str,
        charge: &'a TokenCharge,
    },
    /// The agent's reply parsed to an action.
    ActionReceived {
        participant: &'a str,
        action: &'a AgentAction,
    },
    /// The agent's reply decoded but failed validation.
    ParseFallback {
        participant: &'a str,
        kind: FallbackKind,
        message: &'a str,
    },
    /// No action could be recovered from the reply.
    Unparseable { participant: &'a str },
    SubmissionJudged {
        participant: &'a str,
        submission: &'a Submission,
    },
    HintDecided {
        participant: &'a str,
        problem_id: &'a str,
        decision: &'a HintDecision,
    },
    ParticipantTerminated {
        participant: &'a str,
        reason: TerminationReason,
    },
}

impl ArenaEvent<'_> {
    /// Participant the event concerns.
    pub fn participant(&self) -> &str {
        match self {
            ArenaEvent::TurnStarted { participant, .. }
            | ArenaEvent::Relay { participant, .. }
            | ArenaEvent::AttemptFailed { participant, .. }
            | ArenaEvent::TokensCharged { participant, .. }
            | ArenaEvent::ActionReceived { participant, .. }
            | ArenaEvent::ParseFallback { participant, .. }
            | ArenaEvent::Unparseable { participant }
            | ArenaEvent::SubmissionJudged { participant, .. }
            | ArenaEvent::HintDecided { participant, .. }
            | ArenaEvent::ParticipantTerminated { participant, .. } => *participant,
        }
    }
}

// ── Handlers ───────────────────────────────────────────────────────

pub trait EventHandler: Send + Sync {
    fn on_event(&self, event: &ArenaEvent<'_>) {
        let _ = event;
    }
}

pub struct NoopHandler;
impl EventHandler for NoopHandler {}

/// An event handler backed by a closure.
///
/// ```ignore
/// let handler = FnEventHandler::new(|event| {
///     if let ArenaEvent::SubmissionJudged { submission, .. } = event {
///         println!("{} -> {}", submission.problem_id, submission.status);
///     }
/// });
/// ```
pub struct FnEventHandler<F>(F)
where
    F: Fn(&ArenaEvent<'_>) + Send + Sync;

impl<F> FnEventHandler<F>
where
    F: Fn(&ArenaEvent<'_>) + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

impl<F> EventHandler for FnEventHandler<F>
where
    F: Fn(&ArenaEvent<'_>) + Send + Sync,
{
    fn on_event(&self, event: &ArenaEvent<'_>) {
        (self.0)(event)
    }
}

/// Dispatches every event to each inner handler in registration order.
pub struct CompositeEventHandler {
    handlers: Vec<Box<dyn EventHandler>>,
}

impl CompositeEventHandler {
    pub fn new() -> Self {
        Self {
            handlers: Vec::new(),
        }
    }

    pub fn with(mut self, handler: impl EventHandler + 'static) -> Self {
        self.handlers.push(Box::new(handler));
        self
    }

    /// Add `handler` only when `condition` holds.
    pub fn with_if(self, condition: bool, handler: impl EventHandler + 'static) -> Self {
        if condition { self.with(handler) } else { self }
    }

    pub fn with_opt(self, handler: Option<impl EventHandler + 'static>) -> Self {
        match handler {
            Some(h) => self.with(h),
            None => self,
        }
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for CompositeEventHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHandler for CompositeEventHandler {
    fn on_event(&self, event: &ArenaEvent<'_>) {
        for handler in &self.handlers {
            handler.on_event(event);
        }
    }
}

/// Logs events via `tracing`.
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn on_event(&self, event: &ArenaEvent<'_>) {
        match event {
            ArenaEvent::TurnStarted { participant, turn } => {
                info!(participant = %participant, "Turn {turn} started");
            }
            ArenaEvent::Relay { participant, state } => {
                debug!(participant = %participant, "Relay state: {state:?}");
            }
            ArenaEvent::AttemptFailed {
                participant,
                attempt,
                error,
            } => {
                warn!(participant = %participant, attempt = attempt, "Provider attempt failed: {error}");
            }
            ArenaEvent::TokensCharged {
                participant,
                charge,
            } => {
                debug!(
                    participant = %participant,
                    "Charged {} tokens, {} remaining",
                    charge.deducted,
                    charge.remaining_tokens
                );
            }
            ArenaEvent::ActionReceived {
                participant,
                action,
            } => {
                info!(participant = %participant, "Action: {}", action.action);
            }
            ArenaEvent::ParseFallback {
                participant,
                kind,
                message,
            } => {
                warn!(participant = %participant, "Malformed action ({kind}): {message}");
            }
            ArenaEvent::Unparseable { participant } => {
                warn!(participant = %participant, "No action found in reply, turn wasted");
            }
            ArenaEvent::SubmissionJudged {
                participant,
                submission,
            } => {
                info!(
                    participant = %participant,
                    problem = %submission.problem_id,
                    "Submission {}: score {}, penalty {}",
                    submission.status,
                    submission.score,
                    submission.penalty
                );
            }
            ArenaEvent::HintDecided {
                participant,
                problem_id,
                decision,
            } => {
                debug!(participant = %participant, problem = %problem_id, "Hint: {decision:?}");
            }
            ArenaEvent::ParticipantTerminated {
                participant,
                reason,
            } => {
                info!(participant = %participant, "Participant terminated: {reason}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn composite_dispatches_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let a = seen.clone();
        let b = seen.clone();
        let handler = CompositeEventHandler::new()
            .with(FnEventHandler::new(move |e| {
                a.lock().unwrap().push(format!("a:{}", e.participant()))
            }))
            .with_if(false, LoggingHandler)
            .with_opt(Some(FnEventHandler::new(move |e| {
                b.lock().unwrap().push(format!("b:{}", e.participant()))
            })));
        assert_eq!(handler.len(), 2);

        handler.on_event(&ArenaEvent::Unparseable { participant: "p1" });
        assert_eq!(*seen.lock().unwrap(), vec!["a:p1", "b:p1"]);
    }

    #[test]
    fn logging_handler_accepts_every_event() {
        LoggingHandler.on_event(&ArenaEvent::ParticipantTerminated {
            participant: "p1",
            reason: TerminationReason::OutOfTokens,
        });
        LoggingHandler.on_event(&ArenaEvent::Relay {
            participant: "p1",
            state: RelayState::Idle,
        });
    }
}
