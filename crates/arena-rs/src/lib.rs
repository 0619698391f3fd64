//! Evaluation and token-economy engine for LLM programming contests.
//!
//! Agents compete on a set of problems under a finite token budget. Each
//! turn an agent views problems, buys hints, submits code, or stops; every
//! LLM call and every hint is paid from its budget, and every submission is
//! judged against hidden test cases in an external sandbox.
//!
//! # Getting started
//!
//! ```ignore
//! use arena_rs::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), String> {
//!     let config = ArenaConfig::load("arena.json".as_ref())?;
//!     let arena = Arena::from_config(config, Arc::new(LoggingHandler))?;
//!
//!     let comp = arena
//!         .create_competition(NewCompetition::new("Spring", problems))
//!         .await
//!         .map_err(|e| e.to_string())?;
//!     arena
//!         .add_participant(&comp.id, NewParticipant::new("alice", provider))
//!         .await
//!         .map_err(|e| e.to_string())?;
//!
//!     for entry in arena.run_competition(&comp.id).await.map_err(|e| e.to_string())? {
//!         println!("{}. {} {}", entry.rank, entry.name, entry.score);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Where to find things
//!
//! - **Judge a submission:** [`Judge::evaluate`](judge::Judge::evaluate)
//!   against any [`Sandbox`](judge::sandbox::Sandbox);
//!   [`HttpSandbox`](judge::HttpSandbox) talks to the compile-and-run service.
//!
//! - **Score and charge:** [`economy::apply_verdict`],
//!   [`economy::charge_tokens`], [`economy::grant_hint`] and
//!   [`economy::rankings`]. All are synchronous; callers serialize them.
//!
//! - **Read agent output:** [`ActionParser`](protocol::ActionParser) turns
//!   free-form model text into an action, a typed fallback, or
//!   [`ProtocolError::Unparseable`](protocol::ProtocolError::Unparseable).
//!
//! - **Call providers:** [`AgentRelay`](relay::AgentRelay) renders a
//!   [`RequestTemplate`](relay::RequestTemplate), retries, handles SSE, and
//!   reports usage to a [`UsageSink`](relay::UsageSink).
//!
//! - **Run a competition:** [`Arena`](coordinator::Arena) owns competitions
//!   and exposes every operation the HTTP surface needs, plus
//!   [`run_competition`](coordinator::Arena::run_competition) for engine
//!   driven agents.
//!
//! - **Observe:** implement [`EventHandler`](events::EventHandler) or use
//!   [`LoggingHandler`](events::LoggingHandler).
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`model`] | Problems, submissions, participants, rules |
//! | [`judge`] | Sandbox seam, verdict classification, output comparison |
//! | [`economy`] | Scores, first-to-solve bonus, token charges, hints, rankings |
//! | [`protocol`] | Action extraction, JSON repair, fallback rules, typed actions |
//! | [`relay`] | Provider templates, retries, streaming, conversation window |
//! | [`coordinator`] | [`Arena`](coordinator::Arena), turns, per-participant gate |
//! | [`hints`] | Hint content and the retrieval seam |
//! | [`storage`] | Competition snapshots |
//! | [`events`] | Engine events and handlers |
//! | [`config`] | [`ArenaConfig`](config::ArenaConfig) |

pub mod config;
pub mod coordinator;
pub mod economy;
pub mod events;
pub mod hints;
pub mod judge;
pub mod model;
pub mod prelude;
pub mod protocol;
pub mod relay;
pub mod storage;

use schemars::JsonSchema;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. Action parameters are validated against these
/// schemas, and the same schemas are shown to agents in the system prompt.
///
/// # Example
///
/// ```
/// use arena_rs::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct ViewArgs {
///     problem_id: String,
///     #[serde(default)]
///     verbose: Option<bool>,
/// }
///
/// let schema = json_schema_for::<ViewArgs>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"problem_id".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}
