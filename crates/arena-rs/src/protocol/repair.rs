//! Fault-tolerant JSON decoding for LLM output.
//!
//! [`parse_lenient`] first tries a strict parse. If that fails it parses
//! again from the first `{` or `[`, repairing what models commonly get
//! wrong: trailing commas, missing closing brackets, unterminated strings,
//! raw newlines inside strings, single quotes, unquoted keys, Python
//! literals and prose after the value. Text with no opening bracket is a
//! decode error, which is what sends the caller to the keyword fallback.

use serde_json::{Map, Number, Value};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("no JSON object or array found")]
    NoStructure,
    #[error("unrecoverable JSON at offset {0}")]
    Unrecoverable(usize),
}

/// Parse `text` as JSON, repairing common malformations.
pub fn parse_lenient(text: &str) -> Result<Value, DecodeError> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    let start = trimmed
        .char_indices()
        .find(|(_, c)| *c == '{' || *c == '[')
        .map(|(i, _)| i)
        .ok_or(DecodeError::NoStructure)?;
    let chars: Vec<char> = trimmed.get(start..).unwrap_or_default().chars().collect();
    let mut parser = Repairer { chars, pos: 0, depth: 0 };
    parser.value()
}

/// Nesting limit so adversarial input cannot overflow the stack.
const MAX_DEPTH: usize = 256;

struct Repairer {
    chars: Vec<char>,
    pos: usize,
    depth: usize,
}

impl Repairer {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_ws(&mut self) {
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
            } else if c == '/' && self.peek_at(1) == Some('/') {
                while let Some(c) = self.peek() {
                    if c == '\n' {
                        break;
                    }
                    self.pos += 1;
                }
            } else {
                break;
            }
        }
    }

    /// Next non-whitespace char at or after `from`, with its index.
    fn next_significant(&self, from: usize) -> Option<(usize, char)> {
        self.chars
            .iter()
            .enumerate()
            .skip(from)
            .find(|(_, c)| !c.is_whitespace())
            .map(|(i, c)| (i, *c))
    }

    fn value(&mut self) -> Result<Value, DecodeError> {
        self.skip_ws();
        match self.peek() {
            None => Ok(Value::Null),
            Some('{') => self.object(),
            Some('[') => self.array(),
            Some(q @ ('"' | '\'')) => Ok(Value::String(self.string(q, false))),
            Some(c) if c == '-' || c.is_ascii_digit() => Ok(self.number()),
            Some(c) if c.is_alphabetic() || c == '_' => Ok(self.bare_word()),
            Some(_) => Err(DecodeError::Unrecoverable(self.pos)),
        }
    }

    fn enter(&mut self) -> Result<(), DecodeError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(DecodeError::Unrecoverable(self.pos));
        }
        Ok(())
    }

    fn object(&mut self) -> Result<Value, DecodeError> {
        self.enter()?;
        self.pos += 1;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => break,
                Some('}') => {
                    self.pos += 1;
                    break;
                }
                Some(',') => {
                    self.pos += 1;
                    continue;
                }
                Some(']') => {
                    // Mismatched closer: treat as the end of this object.
                    self.pos += 1;
                    break;
                }
                _ => {}
            }

            let key = match self.peek() {
                Some(q @ ('"' | '\'')) => self.string(q, true),
                _ => self.bare_key(),
            };
            if key.is_empty() && self.peek().is_some_and(|c| c != ':') {
                return Err(DecodeError::Unrecoverable(self.pos));
            }

            self.skip_ws();
            if self.peek() == Some(':') {
                self.pos += 1;
            }
            self.skip_ws();
            let value = match self.peek() {
                None | Some(',') | Some('}') => Value::Null,
                _ => self.value()?,
            };
            map.insert(key, value);
        }
        self.depth -= 1;
        Ok(Value::Object(map))
    }

    fn array(&mut self) -> Result<Value, DecodeError> {
        self.enter()?;
        self.pos += 1;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => break,
                Some(']') | Some('}') => {
                    self.pos += 1;
                    break;
                }
                Some(',') => {
                    self.pos += 1;
                }
                _ => items.push(self.value()?),
            }
        }
        self.depth -= 1;
        Ok(Value::Array(items))
    }

    /// Whether a quote at `self.pos` really closes a value string. Unescaped
    /// quotes inside source code are kept unless what follows looks like
    /// the continuation of the enclosing structure.
    fn closes_value(&self) -> bool {
        match self.next_significant(self.pos + 1) {
            None => true,
            Some((_, '}' | ']' | ':')) => true,
            Some((i, ',')) => match self.next_significant(i + 1) {
                None | Some((_, '"' | '\'' | '}' | ']' | '{' | '[')) => true,
                Some((j, _)) => self.looks_like_key(j),
            },
            _ => false,
        }
    }

    /// An unquoted identifier followed by `:` starting at `from`.
    fn looks_like_key(&self, from: usize) -> bool {
        let end = self
            .chars
            .iter()
            .skip(from)
            .position(|c| !(c.is_alphanumeric() || *c == '_'))
            .map_or(self.chars.len(), |n| from + n);
        end > from && matches!(self.next_significant(end), Some((_, ':')))
    }

    fn string(&mut self, quote: char, is_key: bool) -> String {
        self.pos += 1;
        let mut out = String::new();
        while let Some(c) = self.peek() {
            if c == '\\' {
                self.pos += 1;
                match self.peek() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('b') => out.push('\u{8}'),
                    Some('f') => out.push('\u{c}'),
                    Some('u') => {
                        if let Some(ch) = self.unicode_escape() {
                            out.push(ch);
                            continue;
                        }
                        out.push_str("\\u");
                    }
                    Some(other) => out.push(other),
                    None => break,
                }
                self.pos += 1;
                continue;
            }
            if c == quote && (is_key || self.closes_value()) {
                self.pos += 1;
                return out;
            }
            out.push(c);
            self.pos += 1;
        }
        out
    }

    /// Decode `uXXXX` (cursor on the `u`), consuming it on success.
    fn unicode_escape(&mut self) -> Option<char> {
        let hex: String = self.chars.get(self.pos + 1..self.pos + 5)?.iter().collect();
        let code = u32::from_str_radix(&hex, 16).ok()?;
        let ch = char::from_u32(code).unwrap_or('\u{FFFD}');
        self.pos += 5;
        Some(ch)
    }

    fn number(&mut self) -> Value {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E') {
                self.pos += 1;
            } else {
                break;
            }
        }
        let raw: String = self.chars.get(start..self.pos).unwrap_or_default().iter().collect();
        if let Ok(i) = raw.parse::<i64>() {
            return Value::Number(i.into());
        }
        match raw.parse::<f64>().ok().and_then(Number::from_f64) {
            Some(n) => Value::Number(n),
            None => Value::String(raw),
        }
    }

    /// Literals (`true`, Python's `True`, `None`...) or an unquoted string
    /// running to the next delimiter.
    fn bare_word(&mut self) -> Value {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if matches!(c, ',' | '}' | ']' | '\n') {
                break;
            }
            self.pos += 1;
        }
        let raw: String = self.chars.get(start..self.pos).unwrap_or_default().iter().collect();
        match raw.trim() {
            "true" | "True" => Value::Bool(true),
            "false" | "False" => Value::Bool(false),
            "null" | "None" => Value::Null,
            other => Value::String(other.to_string()),
        }
    }

    fn bare_key(&mut self) -> String {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == ':' || c == '}' || c == ',' || c.is_whitespace() {
                break;
            }
            self.pos += 1;
        }
        self.chars.get(start..self.pos).unwrap_or_default().iter().collect()
    }
}
