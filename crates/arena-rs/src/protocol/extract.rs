//! Locating the JSON candidate inside free-form agent text.
//!
//! Agents are asked to answer with a fenced JSON block, and the `solution`
//! field of a submission often carries its own fenced code block. A naive
//! "first fence to next fence" extraction would stop at the inner fence, so
//! when the second fence opens a code block (a language tag follows it) and
//! there are at least four fences, the candidate spans the first to the
//! fourth fence with the inner fence markers spliced out.

use regex::Regex;
use std::sync::LazyLock;

const FENCE: &str = "```";

/// Language tags recognised after a nested fence, longest first so that
/// `javascript` is not read as `java`.
const LANGUAGE_TAGS: &[&str] = &["javascript", "python", "java", "cpp", "c++", "js"];

static LAST_FENCED_BLOCK: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)```(?:json)?\s*(.+?)\s*```").expect("fenced block pattern is valid")
});

/// Byte offsets of every fence in `text`.
fn fence_positions(text: &str) -> Vec<usize> {
    text.match_indices(FENCE).map(|(i, _)| i).collect()
}

/// Language tag at the start of `text` (after leading whitespace), if any.
fn leading_language(text: &str) -> Option<&'static str> {
    let head = text.trim_start();
    LANGUAGE_TAGS.iter().copied().find(|tag| {
        head.get(..tag.len())
            .is_some_and(|h| h.eq_ignore_ascii_case(tag))
    })
}

/// Strip a leading `json` tag (any case).
fn strip_json_tag(text: &str) -> &str {
    match text.get(..4) {
        Some(tag) if tag.eq_ignore_ascii_case("json") => text.get(4..).unwrap_or_default().trim(),
        _ => text,
    }
}

/// Remove the first inner fenced block's markers (and its language tag),
/// keeping the code between them.
fn splice_inner_fences(content: &str) -> String {
    let Some(open) = content.find(FENCE) else {
        return content.to_string();
    };
    let after_open = open + FENCE.len();
    let Some(close) = content
        .get(after_open..)
        .and_then(|rest| rest.find(FENCE))
        .map(|i| after_open + i)
    else {
        return content.to_string();
    };

    let inner = content.get(after_open..close).unwrap_or_default();
    let inner = match leading_language(inner) {
        Some(tag) => {
            let trimmed = inner.trim_start();
            trimmed.get(tag.len()..).unwrap_or_default()
        }
        None => inner,
    };

    let mut out = String::with_capacity(content.len());
    out.push_str(content.get(..open).unwrap_or_default());
    out.push_str(inner);
    out.push_str(content.get(close + FENCE.len()..).unwrap_or_default());
    out
}

/// Pick the text most likely to contain the agent's JSON action.
pub fn extract_candidate(text: &str) -> String {
    let fences = fence_positions(text);
    if fences.len() < 2 {
        return text.to_string();
    }

    let after_second = text.get(fences[1] + FENCE.len()..).unwrap_or_default();
    if fences.len() >= 4 && leading_language(after_second).is_some() {
        let span = text
            .get(fences[0] + FENCE.len()..fences[3])
            .unwrap_or_default()
            .trim();
        return splice_inner_fences(strip_json_tag(span));
    }

    LAST_FENCED_BLOCK
        .captures_iter(text)
        .last()
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| text.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unfenced_text_is_whole_candidate() {
        assert_eq!(extract_candidate("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(extract_candidate("one ``` fence"), "one ``` fence");
    }

    #[test]
    fn simple_json_block() {
        let text = "Here you go:\n```json\n{\"action\":\"TERMINATE\"}\n```\nbye";
        assert_eq!(extract_candidate(text), "{\"action\":\"TERMINATE\"}");
    }

    #[test]
    fn last_block_wins() {
        let text = "```json\n{\"n\":1}\n```\nthen\n```json\n{\"n\":2}\n```";
        assert_eq!(extract_candidate(text), "{\"n\":2}");
    }

    #[test]
    fn nested_code_block_is_spliced() {
        let text = "```json\n{\"solution\": \"```cpp\nint main() { return 0; }\n```\", \"language\": \"cpp\"}\n```";
        let candidate = extract_candidate(text);
        assert_eq!(
            candidate,
            "{\"solution\": \"\nint main() { return 0; }\n\", \"language\": \"cpp\"}"
        );
    }

    #[test]
    fn javascript_tag_not_cut_as_java() {
        let text = "```json\n{\"solution\": \"```javascript\nx()\n```\"}\n```";
        assert_eq!(extract_candidate(text), "{\"solution\": \"\nx()\n\"}");
    }

    #[test]
    fn second_fence_without_language_uses_last_block() {
        let text = "```\n{\"a\": 1}\n```\n```\n{\"b\": 2}\n```";
        assert_eq!(extract_candidate(text), "{\"b\": 2}");
    }
}
