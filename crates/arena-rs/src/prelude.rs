//! Convenience re-exports for common `arena-rs` types.
//!
//! ```ignore
//! use arena_rs::prelude::*;
//! ```
//!
//! Covers building an [`Arena`], registering competitions and participants,
//! and observing events. Sandbox and transport internals (request types,
//! SSE accumulation, comparison helpers) stay in their modules.

pub use std::sync::Arc;

// ── Engine ──────────────────────────────────────────────────────────
pub use crate::config::ArenaConfig;
pub use crate::coordinator::{
    AgentSession, Arena, ArenaError, HintReply, HintRequest, NewCompetition, NewParticipant,
    RelayRequest, RelayedResponse, SubmissionReport, TurnOutcome,
};

// ── Model ───────────────────────────────────────────────────────────
pub use crate::model::{
    Competition, Level, Participant, Problem, ProviderEndpoint, Rules, Submission,
    TerminationReason, TestCase, Verdict,
};

// ── Components ──────────────────────────────────────────────────────
pub use crate::economy::{HintDecision, RankingEntry, TokenUsage};
pub use crate::judge::{HttpSandbox, Judge};
pub use crate::protocol::{ActionParser, ParseOutcome, ProtocolError};
pub use crate::relay::{AgentRelay, HttpTransport, RequestTemplate};

// ── Events ──────────────────────────────────────────────────────────
pub use crate::events::{
    ArenaEvent, CompositeEventHandler, EventHandler, FnEventHandler, LoggingHandler, NoopHandler,
};
