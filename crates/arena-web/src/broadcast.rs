//! [`EventHandler`] that turns engine events into WebSocket messages.
//!
//! [`WebBroadcastHandler`] converts borrowed [`ArenaEvent`]s into owned
//! [`WsMessage`] values and sends them to every connected client through a
//! `tokio::sync::broadcast` channel.

use arena_rs::economy::{HintDecision, TokenCharge};
use arena_rs::events::{ArenaEvent, EventHandler};
use arena_rs::model::{TerminationReason, Verdict};
use arena_rs::relay::RelayState;
use serde::Serialize;
use tokio::sync::broadcast;

/// Longest fallback message forwarded to clients.
const MAX_WS_MESSAGE_CHARS: usize = 2_000;

/// A message sent from the server to WebSocket clients.
///
/// Discriminated on the `type` field when serialized to JSON.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    /// Sent on connect and after a client falls behind.
    Snapshot { competitions: Vec<String> },
    TurnStarted { participant: String, turn: u32 },
    /// Relay state change, rendered as text.
    Relay { participant: String, state: String },
    AttemptFailed {
        participant: String,
        attempt: u32,
        error: String,
    },
    TokensCharged {
        participant: String,
        charge: TokenCharge,
    },
    Action {
        participant: String,
        action: String,
    },
    ParseFallback {
        participant: String,
        kind: String,
        message: String,
    },
    Unparseable { participant: String },
    Submission {
        participant: String,
        problem_id: String,
        status: Verdict,
        score: u32,
        penalty: u32,
    },
    Hint {
        participant: String,
        problem_id: String,
        decision: HintDecision,
    },
    Terminated {
        participant: String,
        reason: TerminationReason,
    },
}

impl WsMessage {
    pub fn from_event(event: &ArenaEvent<'_>) -> Self {
        let participant = event.participant().to_string();
        match event {
            ArenaEvent::TurnStarted { turn, .. } => WsMessage::TurnStarted {
                participant,
                turn: *turn,
            },
            ArenaEvent::Relay { state, .. } => WsMessage::Relay {
                participant,
                state: relay_state_label(state),
            },
            ArenaEvent::AttemptFailed { attempt, error, .. } => WsMessage::AttemptFailed {
                participant,
                attempt: *attempt,
                error: error.to_string(),
            },
            ArenaEvent::TokensCharged { charge, .. } => WsMessage::TokensCharged {
                participant,
                charge: **charge,
            },
            ArenaEvent::ActionReceived { action, .. } => WsMessage::Action {
                participant,
                action: action.action.clone(),
            },
            ArenaEvent::ParseFallback { kind, message, .. } => WsMessage::ParseFallback {
                participant,
                kind: kind.to_string(),
                message: message.chars().take(MAX_WS_MESSAGE_CHARS).collect(),
            },
            ArenaEvent::Unparseable { .. } => WsMessage::Unparseable { participant },
            ArenaEvent::SubmissionJudged { submission, .. } => WsMessage::Submission {
                participant,
                problem_id: submission.problem_id.clone(),
                status: submission.status,
                score: submission.score,
                penalty: submission.penalty,
            },
            ArenaEvent::HintDecided {
                problem_id,
                decision,
                ..
            } => WsMessage::Hint {
                participant,
                problem_id: problem_id.to_string(),
                decision: **decision,
            },
            ArenaEvent::ParticipantTerminated { reason, .. } => WsMessage::Terminated {
                participant,
                reason: *reason,
            },
        }
    }
}

fn relay_state_label(state: &RelayState) -> String {
    match state {
        RelayState::Idle => "idle".into(),
        RelayState::Sending { attempt } => format!("sending (attempt {attempt})"),
        RelayState::Retrying { attempt, wait } => {
            format!("retrying after attempt {attempt} in {}ms", wait.as_millis())
        }
        RelayState::Succeeded { attempt } => format!("succeeded on attempt {attempt}"),
        RelayState::Exhausted { attempts } => format!("exhausted after {attempts} attempts"),
    }
}

/// Event handler that broadcasts engine events to WebSocket clients.
///
/// Compose alongside [`LoggingHandler`](arena_rs::events::LoggingHandler)
/// in a [`CompositeEventHandler`](arena_rs::events::CompositeEventHandler):
///
/// ```ignore
/// let handler = CompositeEventHandler::new()
///     .with(LoggingHandler)
///     .with(WebBroadcastHandler::new(ws_sender));
/// ```
pub struct WebBroadcastHandler {
    sender: broadcast::Sender<WsMessage>,
}

impl WebBroadcastHandler {
    pub fn new(sender: broadcast::Sender<WsMessage>) -> Self {
        Self { sender }
    }
}

impl EventHandler for WebBroadcastHandler {
    fn on_event(&self, event: &ArenaEvent<'_>) {
        // No receivers is fine.
        let _ = self.sender.send(WsMessage::from_event(event));
    }
}
