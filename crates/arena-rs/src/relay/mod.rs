//! Agent Request Relay: the retried provider call behind one agent turn.
//!
//! [`AgentRelay::request_turn`] appends the prompt to the agent's
//! [`Conversation`], renders the [`RequestTemplate`], and sends it until an
//! attempt succeeds or the [`RetryPolicy`] runs out:
//!
//! ```text
//! Idle -> Sending -> Succeeded
//!            |
//!            +-> Retrying -> Sending ...
//!            +-> Exhausted
//! ```
//!
//! A successful attempt is charged through the [`UsageSink`] before the
//! reply is handed to the Action Protocol, so a reply that does not parse
//! still costs tokens. Exhaustion is the only error a caller sees.

pub mod conversation;
pub mod retry;
pub mod streaming;
pub mod template;
pub mod transport;

pub use conversation::{ChatMessage, Conversation, Role};
pub use retry::{RecordingSleeper, RetryPolicy, Sleeper, TokioSleeper};
pub use template::{DotPath, ProviderAnswer, ProviderRequest, RequestTemplate};
pub use transport::{HttpTransport, Transport, TransportError, TransportResponse};

use crate::config::RelayConfig;
use crate::economy::TokenUsage;
use crate::events::{ArenaEvent, EventHandler, NoopHandler};
use crate::model::ProviderEndpoint;
use crate::protocol::{ActionParser, ParseOutcome, ProtocolError};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// ── Errors and state ───────────────────────────────────────────────

/// Why one provider attempt failed. Every variant is retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AttemptFailure {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("provider error: {0}")]
    Provider(String),
}

impl AttemptFailure {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, AttemptFailure::Status { status: 429, .. })
    }
}

impl From<TransportError> for AttemptFailure {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Timeout(d) => AttemptFailure::Timeout(d),
            other => AttemptFailure::Transport(other.to_string()),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("invalid request template: {0}")]
    Template(String),
    #[error("provider unavailable after {attempts} attempt(s): {last_error}")]
    Exhausted { attempts: u32, last_error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Sending { attempt: u32 },
    Retrying { attempt: u32, wait: Duration },
    Succeeded { attempt: u32 },
    Exhausted { attempts: u32 },
}

// ── Usage sink ─────────────────────────────────────────────────────

/// Boxed future returned by [`UsageSink::charge`].
pub type ChargeFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Receives the raw usage of every successful provider attempt.
pub trait UsageSink: Send + Sync {
    fn charge<'a>(&'a self, participant_id: &'a str, model_id: &'a str, usage: TokenUsage) -> ChargeFuture<'a>;
}

/// Discards usage.
pub struct NoCharge;

impl UsageSink for NoCharge {
    fn charge<'a>(&'a self, _: &'a str, _: &'a str, _: TokenUsage) -> ChargeFuture<'a> {
        Box::pin(std::future::ready(()))
    }
}

// ── Relay ──────────────────────────────────────────────────────────

/// Who the relay is calling for.
#[derive(Debug, Clone, Copy)]
pub struct AgentRef<'a> {
    pub participant_id: &'a str,
    pub provider: &'a ProviderEndpoint,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnReply {
    /// Answer text, without reasoning.
    pub text: String,
    pub reasoning: Option<String>,
    /// Raw usage as reported by the provider.
    pub usage: TokenUsage,
    pub outcome: Result<ParseOutcome, ProtocolError>,
    pub attempts: u32,
}

/// A forwarded call made on an agent's behalf, after accounting.
#[derive(Debug, Clone, PartialEq)]
pub struct ForwardedReply {
    pub status: u16,
    pub envelope: Value,
    pub usage: TokenUsage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForwardError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("upstream HTTP {status}: {body}")]
    Upstream { status: u16, body: String },
    #[error("malformed upstream response: {0}")]
    Decode(String),
}

pub struct AgentRelay {
    transport: Arc<dyn Transport>,
    sleeper: Arc<dyn Sleeper>,
    parser: Arc<ActionParser>,
    events: Arc<dyn EventHandler>,
    template: RequestTemplate,
    policy: RetryPolicy,
    attempt_timeout: Duration,
}

impl AgentRelay {
    pub fn new(transport: Arc<dyn Transport>, template: RequestTemplate, policy: RetryPolicy) -> Self {
        Self {
            transport,
            sleeper: Arc::new(TokioSleeper),
            parser: Arc::new(ActionParser::default()),
            events: Arc::new(NoopHandler),
            template,
            policy,
            attempt_timeout: RelayConfig::default().attempt_timeout(),
        }
    }

    pub fn from_config(config: &RelayConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            transport,
            config.request_template.clone(),
            RetryPolicy::from_config(config),
        )
        .with_attempt_timeout(config.attempt_timeout())
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_parser(mut self, parser: Arc<ActionParser>) -> Self {
        self.parser = parser;
        self
    }

    pub fn with_event_handler(mut self, events: Arc<dyn EventHandler>) -> Self {
        self.events = events;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    pub fn template(&self) -> &RequestTemplate {
        &self.template
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn state(&self, participant: &str, state: RelayState) {
        self.events.on_event(&ArenaEvent::Relay { participant, state });
    }

    /// Run one agent turn against the provider.
    pub async fn request_turn(
        &self,
        agent: AgentRef<'_>,
        conversation: &mut Conversation,
        prompt: &str,
        sink: &dyn UsageSink,
    ) -> Result<TurnReply, RelayError> {
        let participant = agent.participant_id;
        self.state(participant, RelayState::Idle);

        conversation.push_user(prompt);
        let request = self
            .template
            .render(agent.provider, &conversation.messages(), self.attempt_timeout)
            .map_err(RelayError::Template)?;
        debug!(
            participant = %participant,
            "Relaying turn to {} ({} messages)",
            request.url,
            conversation.messages().len()
        );

        let mut last_error = String::new();
        for attempt in 1..=self.policy.max_attempts {
            self.state(participant, RelayState::Sending { attempt });
            match self.attempt(&request).await {
                Ok(answer) => {
                    let usage = answer.usage.unwrap_or_else(|| {
                        debug!(participant = %participant, "Provider reported no usage");
                        TokenUsage::default()
                    });
                    sink.charge(participant, &agent.provider.model_id, usage).await;
                    self.state(participant, RelayState::Succeeded { attempt });

                    let outcome = self.parser.parse(&answer.content);
                    conversation.push_assistant(answer.transcript());
                    info!(
                        participant = %participant,
                        attempt = attempt,
                        "Provider answered ({} chars, {}+{} tokens)",
                        answer.content.len(),
                        usage.prompt_tokens,
                        usage.completion_tokens
                    );
                    return Ok(TurnReply {
                        text: answer.content,
                        reasoning: answer.reasoning,
                        usage,
                        outcome,
                        attempts: attempt,
                    });
                }
                Err(failure) => {
                    warn!(
                        participant = %participant,
                        attempt = attempt,
                        "Try {attempt}/{} failed: {failure}",
                        self.policy.max_attempts
                    );
                    self.events.on_event(&ArenaEvent::AttemptFailed {
                        participant,
                        attempt,
                        error: &failure,
                    });
                    last_error = failure.to_string();
                    if let Some(wait) = self.policy.delay_after(attempt, &failure) {
                        self.state(participant, RelayState::Retrying { attempt, wait });
                        self.sleeper.sleep(wait).await;
                    }
                }
            }
        }

        let attempts = self.policy.max_attempts;
        self.state(participant, RelayState::Exhausted { attempts });
        Err(RelayError::Exhausted {
            attempts,
            last_error,
        })
    }

    async fn attempt(&self, request: &ProviderRequest) -> Result<ProviderAnswer, AttemptFailure> {
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(AttemptFailure::Status {
                status: response.status,
                body: response.body,
            });
        }

        if self.template.streaming {
            let streamed = streaming::accumulate(
                &response.body,
                self.template.usage_path.clone(),
                self.template.error_path.clone(),
            );
            if let Some(message) = streamed.error {
                return Err(AttemptFailure::Provider(message));
            }
            if streamed.chunks == 0 {
                return Err(AttemptFailure::Decode("stream carried no data chunks".into()));
            }
            return Ok(ProviderAnswer {
                content: streamed.content,
                reasoning: (!streamed.reasoning.is_empty()).then_some(streamed.reasoning),
                usage: streamed.usage,
            });
        }

        let envelope: Value = serde_json::from_str(&response.body)
            .map_err(|e| AttemptFailure::Decode(e.to_string()))?;
        self.template.read_answer(&envelope).map_err(|e| {
            if e.starts_with("provider error") {
                AttemptFailure::Provider(e)
            } else {
                AttemptFailure::Decode(e)
            }
        })
    }

    /// Forward a single agent-built request, without retries, and report
    /// its usage. SSE bodies are folded into a chat-completion envelope.
    pub async fn forward(&self, request: &ProviderRequest) -> Result<ForwardedReply, ForwardError> {
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            return Err(ForwardError::Upstream {
                status: response.status,
                body: response.body,
            });
        }

        let envelope = match serde_json::from_str::<Value>(&response.body) {
            Ok(v) => v,
            Err(_) if streaming::looks_like_sse(&response.body) => {
                let streamed = streaming::accumulate(
                    &response.body,
                    self.template.usage_path.clone(),
                    self.template.error_path.clone(),
                );
                let usage = streamed.usage.unwrap_or_default();
                json!({
                    "choices": [{
                        "message": {
                            "role": "assistant",
                            "content": streamed.content,
                            "reasoning_content": streamed.reasoning,
                        }
                    }],
                    "usage": {
                        "prompt_tokens": usage.prompt_tokens,
                        "completion_tokens": usage.completion_tokens,
                    }
                })
            }
            Err(e) => return Err(ForwardError::Decode(e.to_string())),
        };
        let usage = self.template.usage(&envelope).unwrap_or_default();
        Ok(ForwardedReply {
            status: response.status,
            envelope,
            usage,
        })
    }
}

// ── Test doubles ───────────────────────────────────────────────────
