//! Compile-and-execute sandbox contract and its HTTP client.
//!
//! The sandbox is an external service: one request compiles the source and
//! runs it against a single stdin. [`HttpSandbox`] speaks the JSON contract,
//! optionally wrapped in the Lambda-style invocation envelope the online
//! judge container expects. Responses may carry the real payload as a
//! JSON-encoded string under `body`; [`SandboxResponse::decode`] unwraps it.

use crate::config::JudgeConfig;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, trace};

/// Path the Lambda envelope routes to.
const COMPILE_AND_EXECUTE_PATH: &str = "/compile-and-execute";

/// Boxed future returned by [`Sandbox::run`].
pub type SandboxFuture<'a> =
    Pin<Box<dyn Future<Output = Result<SandboxResponse, SandboxError>> + Send + 'a>>;

/// Anything that can compile and execute one program against one input.
pub trait Sandbox: Send + Sync {
    fn run(&self, request: &SandboxRequest) -> SandboxFuture<'_>;
}

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("sandbox request failed: {0}")]
    Request(String),
    #[error("sandbox HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed sandbox response: {0}")]
    Decode(String),
}

// ── Request ────────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CompileRequest {
    pub source_code: String,
    pub compiler_options: String,
    pub language: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ExecuteRequest {
    pub stdin: String,
    pub timeout_ms: u64,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SandboxRequest {
    pub compile: CompileRequest,
    pub execute: ExecuteRequest,
}

impl SandboxRequest {
    /// Build a request for `language` (a user-facing tag such as `"cpp"`).
    pub fn new(code: &str, language: &str, stdin: &str, timeout_ms: u64) -> Self {
        let (language, compiler_options) = sandbox_language(language);
        Self {
            compile: CompileRequest {
                source_code: code.to_string(),
                compiler_options,
                language,
            },
            execute: ExecuteRequest {
                stdin: stdin.to_string(),
                timeout_ms,
            },
        }
    }
}

/// Map a language tag to the sandbox's language code and compiler options.
/// Unknown tags pass through lowercased with no options.
pub fn sandbox_language(tag: &str) -> (String, String) {
    let tag = tag.trim().to_lowercase();
    match tag.as_str() {
        "cpp" | "c++" => ("cpp".into(), "-O2 -std=c++17".into()),
        "java" => ("java21".into(), String::new()),
        "python" | "python3" => ("py12".into(), String::new()),
        _ => (tag, String::new()),
    }
}

// ── Response ───────────────────────────────────────────────────────

/// A numeric field that some sandboxes send as a string.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum Measure {
    Number(f64),
    Text(String),
}

impl Measure {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Measure::Number(n) => Some(*n),
            Measure::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct CompileOutcome {
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct ExecuteOutcome {
    #[serde(default)]
    pub exit_code: Option<i64>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
    #[serde(default)]
    pub verdict: Option<String>,
    /// Seconds.
    #[serde(default)]
    pub wall_time: Option<Measure>,
    /// KB.
    #[serde(default)]
    pub memory_usage: Option<Measure>,
}

impl ExecuteOutcome {
    pub fn wall_time_ms(&self) -> Option<u64> {
        let secs = self.wall_time.as_ref()?.as_f64()?;
        (secs.is_finite() && secs >= 0.0).then(|| (secs * 1000.0) as u64)
    }

    pub fn memory_kb(&self) -> Option<u64> {
        let kb = self.memory_usage.as_ref()?.as_f64()?;
        (kb.is_finite() && kb >= 0.0).then_some(kb as u64)
    }

    pub fn stdout(&self) -> &str {
        self.stdout.as_deref().unwrap_or_default()
    }

    pub fn stderr(&self) -> &str {
        self.stderr.as_deref().unwrap_or_default()
    }
}

#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct SandboxResponse {
    #[serde(default)]
    pub compile: Option<CompileOutcome>,
    #[serde(default)]
    pub execute: Option<ExecuteOutcome>,
}

impl SandboxResponse {
    /// Decode a raw response, unwrapping one level of string-encoded `body`.
    pub fn decode(raw: Value) -> Result<Self, SandboxError> {
        let payload = match raw.get("body") {
            Some(Value::String(body)) => serde_json::from_str::<Value>(body)
                .map_err(|e| SandboxError::Decode(format!("undecodable body: {e}")))?,
            _ => raw,
        };
        if !payload.is_object() {
            return Err(SandboxError::Decode(format!(
                "expected a JSON object, got {payload}"
            )));
        }
        serde_json::from_value(payload).map_err(|e| SandboxError::Decode(e.to_string()))
    }

    pub fn compile_failed(&self) -> bool {
        self.compile
            .as_ref()
            .and_then(|c| c.exit_code)
            .is_some_and(|code| code != 0)
    }

    pub fn compile_stderr(&self) -> &str {
        self.compile
            .as_ref()
            .and_then(|c| c.stderr.as_deref())
            .unwrap_or_default()
    }
}

// ── HTTP client ────────────────────────────────────────────────────

/// Sandbox reached over HTTP.
pub struct HttpSandbox {
    client: reqwest::Client,
    endpoint: String,
    lambda_envelope: bool,
}

impl HttpSandbox {
    pub fn new(config: &JudgeConfig) -> Result<Self, String> {
        let client = reqwest::Client::builder()
            .user_agent("arena-judge/0.1")
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| format!("failed to build HTTP client: {e}"))?;
        Ok(Self {
            client,
            endpoint: config.sandbox_url.clone(),
            lambda_envelope: config.lambda_envelope,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn payload(&self, request: &SandboxRequest) -> Result<Value, SandboxError> {
        if !self.lambda_envelope {
            return serde_json::to_value(request)
                .map_err(|e| SandboxError::Request(format!("failed to serialize request: {e}")));
        }
        let body = serde_json::to_string(request)
            .map_err(|e| SandboxError::Request(format!("failed to serialize request: {e}")))?;
        Ok(lambda_envelope(body))
    }

    async fn send(&self, request: &SandboxRequest) -> Result<SandboxResponse, SandboxError> {
        let payload = self.payload(request)?;
        trace!(
            "Sandbox payload: language={}, {} bytes of source",
            request.compile.language,
            request.compile.source_code.len()
        );

        let start = Instant::now();
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&payload)
            .send()
            .await
            .map_err(|e| SandboxError::Request(e.to_string()))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| SandboxError::Request(format!("failed to read response: {e}")))?;
        debug!(
            "Sandbox response: HTTP {} in {:.2}s ({} bytes)",
            status,
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(SandboxError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        let raw: Value =
            serde_json::from_str(&text).map_err(|e| SandboxError::Decode(e.to_string()))?;
        SandboxResponse::decode(raw)
    }
}

impl Sandbox for HttpSandbox {
    fn run(&self, request: &SandboxRequest) -> SandboxFuture<'_> {
        let request = request.clone();
        Box::pin(async move { self.send(&request).await })
    }
}

/// Wrap a serialized request in the Lambda HTTP-API invocation shape.
pub fn lambda_envelope(body: String) -> Value {
    json!({
        "version": "2.0",
        "rawPath": COMPILE_AND_EXECUTE_PATH,
        "requestContext": {
            "http": {
                "method": "POST",
                "path": COMPILE_AND_EXECUTE_PATH,
            }
        },
        "headers": {"Content-Type": "application/json"},
        "body": body,
        "isBase64Encoded": false,
    })
}
