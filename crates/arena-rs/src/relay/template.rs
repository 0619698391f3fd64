//! Declarative provider request and response shapes.
//!
//! A [`RequestTemplate`] describes how to call a chat-completions style
//! provider: the path appended to the participant's base URL, the method,
//! headers (with `{api_key}` substituted) and a JSON body template whose
//! strings may contain `{messages}` and `{model_id}`. The response side is
//! described by [`DotPath`]s such as `choices[0].message.content`, which
//! are parsed once and then looked up without panicking.

use super::conversation::ChatMessage;
use crate::economy::TokenUsage;
use crate::model::ProviderEndpoint;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

// ── Dot paths ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Key(String),
    Index(usize),
}

/// A parsed `a.b[0].c` path into a JSON value. The empty path selects the
/// whole value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DotPath {
    raw: String,
    segments: Vec<Segment>,
}

impl DotPath {
    pub fn parse(path: &str) -> Result<Self, String> {
        let mut segments = Vec::new();
        for part in path.split('.').filter(|p| !p.is_empty()) {
            let (key, mut rest) = match part.find('[') {
                Some(i) => part.split_at(i),
                None => (part, ""),
            };
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            }
            while let Some(stripped) = rest.strip_prefix('[') {
                let close = stripped
                    .find(']')
                    .ok_or_else(|| format!("unclosed '[' in path '{path}'"))?;
                let (index, tail) = stripped.split_at(close);
                let index = index
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| format!("bad index '{index}' in path '{path}': {e}"))?;
                segments.push(Segment::Index(index));
                rest = tail.strip_prefix(']').unwrap_or(tail);
            }
            if !rest.is_empty() {
                return Err(format!("unexpected '{rest}' in path '{path}'"));
            }
        }
        Ok(Self {
            raw: path.to_string(),
            segments,
        })
    }

    pub fn lookup<'a>(&self, value: &'a Value) -> Option<&'a Value> {
        self.segments
            .iter()
            .try_fold(value, |current, segment| match segment {
                Segment::Key(key) => current.get(key.as_str()),
                Segment::Index(i) => current.get(*i),
            })
    }

    /// Lookup that only accepts a string value.
    pub fn lookup_str<'a>(&self, value: &'a Value) -> Option<&'a str> {
        self.lookup(value).and_then(Value::as_str)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for DotPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl TryFrom<String> for DotPath {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        DotPath::parse(&value)
    }
}

impl From<DotPath> for String {
    fn from(path: DotPath) -> Self {
        path.raw
    }
}

fn path(raw: &str) -> DotPath {
    DotPath::parse(raw).unwrap_or_else(|_| DotPath {
        raw: raw.to_string(),
        segments: Vec::new(),
    })
}

// ── Usage ──────────────────────────────────────────────────────────

/// Read `{prompt_tokens, completion_tokens}` from a usage object, folding
/// `completion_tokens_details.reasoning_tokens` into the completion count.
pub fn usage_from(usage: &Value) -> Option<TokenUsage> {
    if !usage.is_object() {
        return None;
    }
    let count = |v: Option<&Value>| v.and_then(Value::as_u64).unwrap_or(0);
    let prompt = count(usage.get("prompt_tokens"));
    let completion = count(usage.get("completion_tokens"));
    let reasoning = count(
        usage
            .get("completion_tokens_details")
            .and_then(|d| d.get("reasoning_tokens")),
    );
    Some(TokenUsage::new(prompt, completion.saturating_add(reasoning)))
}

// ── Template ───────────────────────────────────────────────────────

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct RequestTemplate {
    /// Appended to the participant's `api_base_url`; an absolute URL is
    /// used as is.
    pub path: String,
    pub method: String,
    pub headers: BTreeMap<String, String>,
    /// Body with `"{messages}"` and `{model_id}` placeholders.
    pub body: Value,
    /// Read the response as server-sent events.
    pub streaming: bool,
    pub response_path: DotPath,
    pub reasoning_path: DotPath,
    pub usage_path: DotPath,
    pub error_path: DotPath,
}

impl Default for RequestTemplate {
    fn default() -> Self {
        Self {
            path: "/v1/chat/completions".to_string(),
            method: "POST".to_string(),
            headers: BTreeMap::from([
                ("Content-Type".to_string(), "application/json".to_string()),
                ("Authorization".to_string(), "Bearer {api_key}".to_string()),
            ]),
            body: json!({
                "messages": "{messages}",
                "model": "{model_id}",
                "temperature": 0.7,
            }),
            streaming: false,
            response_path: path("choices[0].message.content"),
            reasoning_path: path("choices[0].message.reasoning"),
            usage_path: path("usage"),
            error_path: path("error.message"),
        }
    }
}

/// A provider call ready to send.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Value,
    pub timeout: Duration,
}

/// What a successful provider response carried.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderAnswer {
    pub content: String,
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl ProviderAnswer {
    /// The assistant turn as stored in the conversation.
    pub fn transcript(&self) -> String {
        match self.reasoning.as_deref() {
            Some(r) if !r.is_empty() => format!("<thinking>{r}</thinking>\n\n{}", self.content),
            _ => self.content.clone(),
        }
    }
}

impl RequestTemplate {
    /// The default shape with SSE streaming and usage reporting enabled.
    pub fn streaming() -> Self {
        let mut template = Self::default();
        template.streaming = true;
        if let Value::Object(body) = &mut template.body {
            body.insert("stream".into(), Value::Bool(true));
            body.insert("stream_options".into(), json!({"include_usage": true}));
        }
        template
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn url_for(&self, provider: &ProviderEndpoint) -> String {
        if self.path.starts_with("http://") || self.path.starts_with("https://") {
            return self.path.clone();
        }
        let base = provider.api_base_url.trim_end_matches('/');
        if self.path.is_empty() {
            base.to_string()
        } else if self.path.starts_with('/') {
            format!("{base}{}", self.path)
        } else {
            format!("{base}/{}", self.path)
        }
    }

    /// Fill the template for one call.
    pub fn render(
        &self,
        provider: &ProviderEndpoint,
        messages: &[ChatMessage],
        timeout: Duration,
    ) -> Result<ProviderRequest, String> {
        if !self.body.is_object() {
            return Err("body template must be a JSON object".to_string());
        }
        let messages = serde_json::to_value(messages)
            .map_err(|e| format!("failed to serialize messages: {e}"))?;
        let body = fill(&self.body, &messages, &provider.model_id);
        let headers = self
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.replace("{api_key}", &provider.api_key)))
            .collect();
        Ok(ProviderRequest {
            method: self.method.to_ascii_uppercase(),
            url: self.url_for(provider),
            headers,
            body,
            timeout,
        })
    }

    /// Provider-reported error message inside a 2xx envelope, if any.
    pub fn error_message(&self, envelope: &Value) -> Option<String> {
        if self.error_path.as_str().is_empty() {
            return None;
        }
        self.error_path.lookup_str(envelope).map(str::to_string)
    }

    pub fn usage(&self, envelope: &Value) -> Option<TokenUsage> {
        self.usage_path.lookup(envelope).and_then(usage_from)
    }

    /// Answer of a non-streaming response envelope.
    pub fn read_answer(&self, envelope: &Value) -> Result<ProviderAnswer, String> {
        if let Some(message) = self.error_message(envelope) {
            return Err(format!("provider error: {message}"));
        }
        let content = self
            .response_path
            .lookup_str(envelope)
            .ok_or_else(|| format!("no text at '{}'", self.response_path))?;
        let reasoning = self
            .reasoning_path
            .lookup_str(envelope)
            .filter(|r| !r.is_empty())
            .map(str::to_string);
        Ok(ProviderAnswer {
            content: content.to_string(),
            reasoning,
            usage: self.usage(envelope),
        })
    }
}

fn fill(template: &Value, messages: &Value, model_id: &str) -> Value {
    match template {
        Value::String(s) if s.trim() == "{messages}" => messages.clone(),
        Value::String(s) => Value::String(s.replace("{model_id}", model_id)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|v| fill(v, messages, model_id))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), fill(v, messages, model_id)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> ProviderEndpoint {
        ProviderEndpoint {
            api_base_url: "https://llm.example/".into(),
            api_key: "sk-test".into(),
            model_id: "m-1".into(),
        }
    }

    #[test]
    fn dot_path_lookup() {
        let v = json!({"choices": [{"message": {"content": "hi"}}], "grid": [[1, 2], [3, 4]]});
        assert_eq!(DotPath::parse("choices[0].message.content").unwrap().lookup_str(&v), Some("hi"));
        assert_eq!(DotPath::parse("grid[1][0]").unwrap().lookup(&v), Some(&json!(3)));
        assert_eq!(DotPath::parse("").unwrap().lookup(&v), Some(&v));
        assert!(DotPath::parse("choices[5].message").unwrap().lookup(&v).is_none());
        assert!(DotPath::parse("choices[0].message.content.x").unwrap().lookup(&v).is_none());
    }

    #[test]
    fn dot_path_rejects_malformed() {
        assert!(DotPath::parse("choices[0").is_err());
        assert!(DotPath::parse("choices[x]").is_err());
        assert!(DotPath::parse("choices[0]x").is_err());
    }

    #[test]
    fn dot_path_serde_as_string() {
        let p: DotPath = serde_json::from_value(json!("a[2].b")).unwrap();
        assert_eq!(serde_json::to_value(&p).unwrap(), json!("a[2].b"));
        assert!(serde_json::from_value::<DotPath>(json!("a[")).is_err());
    }

    #[test]
    fn render_substitutes_placeholders() {
        let messages = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let req = RequestTemplate::default()
            .render(&provider(), &messages, Duration::from_secs(5))
            .unwrap();
        assert_eq!(req.url, "https://llm.example/v1/chat/completions");
        assert_eq!(req.method, "POST");
        assert!(req.headers.contains(&("Authorization".into(), "Bearer sk-test".into())));
        assert_eq!(req.body["model"], "m-1");
        assert_eq!(req.body["temperature"], 0.7);
        assert_eq!(req.body["messages"][1], json!({"role": "user", "content": "u"}));
    }

    #[test]
    fn streaming_variant_requests_usage() {
        let t = RequestTemplate::streaming();
        assert!(t.streaming);
        assert_eq!(t.body["stream"], true);
        assert_eq!(t.body["stream_options"]["include_usage"], true);
    }

    #[test]
    fn read_answer_with_reasoning_tokens() {
        let envelope = json!({
            "choices": [{"message": {"content": "{}", "reasoning": "think"}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5,
                      "completion_tokens_details": {"reasoning_tokens": 3}}
        });
        let answer = RequestTemplate::default().read_answer(&envelope).unwrap();
        assert_eq!(answer.usage, Some(TokenUsage::new(10, 8)));
        assert_eq!(answer.transcript(), "<thinking>think</thinking>\n\n{}");
    }

    #[test]
    fn read_answer_errors() {
        let t = RequestTemplate::default();
        let err = t.read_answer(&json!({"error": {"message": "quota"}})).unwrap_err();
        assert!(err.contains("quota"));
        let err = t.read_answer(&json!({"choices": []})).unwrap_err();
        assert!(err.contains("choices[0].message.content"));
    }

    #[test]
    fn template_from_config_json() {
        let t: RequestTemplate = serde_json::from_value(json!({
            "path": "https://other.example/chat",
            "response_path": "output.text"
        }))
        .unwrap();
        assert_eq!(t.url_for(&provider()), "https://other.example/chat");
        assert_eq!(t.response_path.as_str(), "output.text");
        assert_eq!(t.usage_path.as_str(), "usage");
    }
}
