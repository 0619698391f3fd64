//! Engine configuration.
//!
//! [`ArenaConfig`] is built once at the composition root (a JSON file, or
//! `ArenaConfig::default()` plus `with_*` overrides) and handed to each
//! component at construction. Every field has a default, so a config file
//! only needs the keys it changes.
//!
//! ```json
//! {
//!   "judge": { "sandbox_url": "http://localhost:9000/2015-03-31/functions/function/invocations" },
//!   "relay": { "max_attempts": 5, "retry_delay_ms": 2000 },
//!   "competition": { "max_tokens_per_participant": 200000 }
//! }
//! ```

use crate::model::Rules;
use crate::protocol::fallback::{FallbackRule, default_rules};
use crate::relay::template::RequestTemplate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

// ── Judge ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct JudgeConfig {
    /// Compile-and-execute endpoint.
    pub sandbox_url: String,
    /// Wrap requests in the Lambda invocation envelope.
    pub lambda_envelope: bool,
    /// HTTP timeout for one sandbox call.
    pub request_timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            sandbox_url: "http://localhost:9000/2015-03-31/functions/function/invocations"
                .to_string(),
            lambda_envelope: true,
            request_timeout_secs: 60,
        }
    }
}

// ── Relay ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RelayConfig {
    /// Attempts per turn before giving up (including the first).
    pub max_attempts: u32,
    /// Wait between attempts.
    pub retry_delay_ms: u64,
    /// Factor applied to the wait after an HTTP 429.
    pub rate_limit_multiplier: u32,
    /// Timeout of a single provider call; a timeout is retried.
    pub attempt_timeout_secs: u64,
    /// Turn pairs kept in the conversation besides the system prompt.
    pub history_turns: usize,
    /// Failed turns in a row before the participant is terminated.
    pub max_consecutive_failures: u32,
    /// Turns an engine-driven run may take; 0 means no cap.
    pub max_turns: u32,
    /// Provider request shape.
    pub request_template: RequestTemplate,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            retry_delay_ms: 10_000,
            rate_limit_multiplier: 2,
            attempt_timeout_secs: 300,
            history_turns: 10,
            max_consecutive_failures: 3,
            max_turns: 500,
            request_template: RequestTemplate::default(),
        }
    }
}

impl RelayConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_secs)
    }
}

// ── Protocol ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Keyword/regex rules for text without JSON, tried in order.
    pub fallback_rules: Vec<FallbackRule>,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            fallback_rules: default_rules(),
        }
    }
}

// ── Storage ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct StorageConfig {
    /// Snapshot directory. `None` keeps competitions in memory only.
    pub snapshot_dir: Option<PathBuf>,
}

// ── Hints ──────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct HintsConfig {
    /// JSON file with the hint corpora. `None` serves hints without
    /// retrieved material.
    pub corpus_path: Option<PathBuf>,
}

// ── Competition defaults ───────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct CompetitionDefaults {
    pub rules: Rules,
    pub max_tokens_per_participant: u64,
}

impl Default for CompetitionDefaults {
    fn default() -> Self {
        Self {
            rules: Rules::default(),
            max_tokens_per_participant: 100_000,
        }
    }
}

// ── ArenaConfig ────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct ArenaConfig {
    pub judge: JudgeConfig,
    pub relay: RelayConfig,
    pub protocol: ProtocolConfig,
    pub storage: StorageConfig,
    pub hints: HintsConfig,
    pub competition: CompetitionDefaults,
}

impl ArenaConfig {
    /// Load a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config '{}': {e}", path.display()))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("failed to parse config '{}': {e}", path.display()))
    }

    pub fn with_sandbox_url(mut self, url: impl Into<String>) -> Self {
        self.judge.sandbox_url = url.into();
        self
    }

    pub fn with_lambda_envelope(mut self, enabled: bool) -> Self {
        self.judge.lambda_envelope = enabled;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.relay.max_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.relay.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_request_template(mut self, template: RequestTemplate) -> Self {
        self.relay.request_template = template;
        self
    }

    pub fn with_snapshot_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.storage.snapshot_dir = Some(dir.into());
        self
    }

    pub fn with_rules(mut self, rules: Rules) -> Self {
        self.competition.rules = rules;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_relay_contract() {
        let config = ArenaConfig::default();
        assert_eq!(config.relay.max_attempts, 20);
        assert_eq!(config.relay.retry_delay(), Duration::from_secs(10));
        assert_eq!(config.relay.rate_limit_multiplier, 2);
        assert_eq!(config.protocol.fallback_rules.len(), 5);
        assert!(config.judge.lambda_envelope);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"relay": {{"max_attempts": 3}}, "competition": {{"rules": {{"lambda": 50.0}}}}}}"#
        )
        .unwrap();
        let config = ArenaConfig::load(file.path()).unwrap();
        assert_eq!(config.relay.max_attempts, 3);
        assert_eq!(config.relay.retry_delay_ms, 10_000);
        assert_eq!(config.competition.rules.lambda, 50.0);
        assert_eq!(config.competition.rules.bonus_for_first_ac, 100);
    }

    #[test]
    fn load_reports_missing_file() {
        let err = ArenaConfig::load(Path::new("/nonexistent/arena.json")).unwrap_err();
        assert!(err.contains("failed to read config"));
    }

    #[test]
    fn builders_chain() {
        let config = ArenaConfig::default()
            .with_sandbox_url("http://sandbox")
            .with_max_attempts(2)
            .with_retry_delay(Duration::from_millis(5));
        assert_eq!(config.judge.sandbox_url, "http://sandbox");
        assert_eq!(config.relay.max_attempts, 2);
        assert_eq!(config.relay.retry_delay_ms, 5);
    }
}
