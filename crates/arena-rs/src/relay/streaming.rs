//! Server-sent-event accumulation for streaming provider responses.
//!
//! [`SseAccumulator`] takes the response body as it arrives, splits it into
//! lines, and folds every `data:` chunk into separate reasoning and answer
//! buffers until the `[DONE]` sentinel. Usage comes from the last chunk that
//! carries one.

use super::template::{DotPath, usage_from};
use crate::economy::TokenUsage;
use serde_json::Value;
use tracing::{debug, trace, warn};

const DONE_SENTINEL: &str = "[DONE]";

/// Final result of a stream.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StreamedAnswer {
    pub content: String,
    pub reasoning: String,
    pub usage: Option<TokenUsage>,
    /// Error reported inside the stream, if any.
    pub error: Option<String>,
    /// Number of `data:` chunks decoded.
    pub chunks: usize,
    pub done: bool,
}

#[derive(Debug)]
pub struct SseAccumulator {
    buffer: Vec<u8>,
    usage_path: DotPath,
    error_path: DotPath,
    answer: StreamedAnswer,
}

impl SseAccumulator {
    pub fn new(usage_path: DotPath, error_path: DotPath) -> Self {
        Self {
            buffer: Vec::new(),
            usage_path,
            error_path,
            answer: StreamedAnswer::default(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.answer.done
    }

    /// Feed raw body bytes. Complete lines are processed immediately; a
    /// partial line (possibly a split UTF-8 sequence) waits for more input.
    pub fn push(&mut self, bytes: &[u8]) {
        if self.answer.done {
            return;
        }
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.extend_from_slice(bytes);
        let mut start = 0;
        while let Some(offset) = buffer[start..].iter().position(|b| *b == b'\n') {
            let end = start + offset;
            self.line(String::from_utf8_lossy(&buffer[start..end]).trim());
            start = end + 1;
            if self.answer.done {
                return;
            }
        }
        buffer.drain(..start);
        self.buffer = buffer;
    }

    /// Process any trailing partial line and return the result.
    pub fn finish(mut self) -> StreamedAnswer {
        let remaining = std::mem::take(&mut self.buffer);
        self.line(String::from_utf8_lossy(&remaining).trim());
        debug!(
            "Stream finished: {} chunk(s), {} answer chars, {} reasoning chars",
            self.answer.chunks,
            self.answer.content.len(),
            self.answer.reasoning.len()
        );
        self.answer
    }

    fn line(&mut self, line: &str) {
        if self.answer.done || line.is_empty() || line.starts_with(':') {
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            trace!("Ignoring SSE line: {line}");
            return;
        };
        let data = data.trim();
        if data == DONE_SENTINEL {
            self.answer.done = true;
            return;
        }
        match serde_json::from_str::<Value>(data) {
            Ok(chunk) => self.chunk(&chunk),
            Err(e) => warn!("Failed to parse SSE chunk: {e}: data: {data}"),
        }
    }

    fn chunk(&mut self, chunk: &Value) {
        self.answer.chunks += 1;
        if let Some(message) = self.error_path.lookup_str(chunk) {
            self.answer.error = Some(message.to_string());
        }
        if let Some(usage) = self.usage_path.lookup(chunk).and_then(usage_from) {
            self.answer.usage = Some(usage);
        }
        let Some(delta) = chunk.pointer("/choices/0/delta") else {
            return;
        };
        let text = |key: &str| delta.get(key).and_then(Value::as_str).filter(|s| !s.is_empty());
        if let Some(r) = text("reasoning_content").or_else(|| text("reasoning")) {
            self.answer.reasoning.push_str(r);
        }
        if let Some(c) = text("content") {
            self.answer.content.push_str(c);
        }
    }
}

/// Whether a body looks like an SSE stream rather than a JSON envelope.
pub fn looks_like_sse(body: &str) -> bool {
    body.lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with(':'))
        .is_some_and(|l| l.starts_with("data:"))
}

/// Accumulate a complete body in one go.
pub fn accumulate(body: &str, usage_path: DotPath, error_path: DotPath) -> StreamedAnswer {
    let mut acc = SseAccumulator::new(usage_path, error_path);
    acc.push(body.as_bytes());
    acc.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acc() -> SseAccumulator {
        SseAccumulator::new(
            DotPath::parse("usage").unwrap(),
            DotPath::parse("error.message").unwrap(),
        )
    }

    const STREAM: &str = concat!(
        ": keep-alive\n",
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"Let me \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"reasoning_content\":\"think.\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"{\\\"action\\\":\"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"\\\"VIEW_PROBLEMS\\\"}\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":40,\"completion_tokens\":12,",
        "\"completion_tokens_details\":{\"reasoning_tokens\":8}}}\n\n",
        "data: [DONE]\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n",
    );

    #[test]
    fn separates_reasoning_from_answer() {
        let mut a = acc();
        a.push(STREAM.as_bytes());
        assert!(a.is_done());
        let answer = a.finish();
        assert_eq!(answer.reasoning, "Let me think.");
        assert_eq!(answer.content, "{\"action\":\"VIEW_PROBLEMS\"}");
        assert_eq!(answer.usage, Some(TokenUsage::new(40, 20)));
        assert_eq!(answer.chunks, 5);
    }

    #[test]
    fn chunks_split_mid_line() {
        let mut a = acc();
        for piece in STREAM.as_bytes().chunks(7) {
            a.push(piece);
        }
        let answer = a.finish();
        assert_eq!(answer.content, "{\"action\":\"VIEW_PROBLEMS\"}");
        assert!(answer.done);
    }

    #[test]
    fn last_usage_wins_and_trailing_line_kept() {
        let body = "data: {\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1}}\n\
                    data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}],\"usage\":{\"prompt_tokens\":9,\"completion_tokens\":3}}";
        let answer = accumulate(body, DotPath::parse("usage").unwrap(), DotPath::parse("error.message").unwrap());
        assert_eq!(answer.usage, Some(TokenUsage::new(9, 3)));
        assert_eq!(answer.content, "x");
        assert!(!answer.done);
    }

    #[test]
    fn malformed_chunk_skipped_and_error_recorded() {
        let body = "data: {not json}\ndata: {\"error\":{\"message\":\"overloaded\"}}\ndata: [DONE]\n";
        let answer = accumulate(body, DotPath::parse("usage").unwrap(), DotPath::parse("error.message").unwrap());
        assert_eq!(answer.error.as_deref(), Some("overloaded"));
        assert_eq!(answer.chunks, 1);
    }

    #[test]
    fn whole_body_in_one_push() {
        let mut body = String::new();
        for _ in 0..2_000 {
            body.push_str("data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\n");
        }
        body.push_str("data: [DONE]\n");
        let mut a = acc();
        a.push(body.as_bytes());
        let answer = a.finish();
        assert_eq!(answer.chunks, 2_000);
        assert_eq!(answer.content.len(), 2_000);
        assert!(answer.done);
    }

    #[test]
    fn sse_detection() {
        assert!(looks_like_sse(": ping\n\ndata: {}\n"));
        assert!(!looks_like_sse("{\"choices\": []}"));
        assert!(!looks_like_sse(""));
    }
}
