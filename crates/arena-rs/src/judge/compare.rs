//! Output comparison used to decide ACCEPTED vs WRONG_ANSWER.

/// Absolute tolerance for numeric answers.
pub const FLOAT_TOLERANCE: f64 = 1e-6;

/// Whether `actual` stdout matches `expected`.
///
/// Tried in order: exact match after CRLF normalization and trimming, match
/// after collapsing whitespace runs, then numeric match within
/// [`FLOAT_TOLERANCE`] when both sides parse as a single float.
pub fn outputs_match(actual: &str, expected: &str) -> bool {
    let actual = normalize_line_endings(actual);
    let expected = normalize_line_endings(expected);
    let actual = actual.trim();
    let expected = expected.trim();

    if actual == expected {
        return true;
    }

    if collapse_whitespace(actual) == collapse_whitespace(expected) {
        return true;
    }

    match (actual.parse::<f64>(), expected.parse::<f64>()) {
        (Ok(a), Ok(e)) => (a - e).abs() < FLOAT_TOLERANCE,
        _ => false,
    }
}

fn normalize_line_endings(s: &str) -> String {
    s.replace("\r\n", "\n")
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_after_trim_and_crlf() {
        assert!(outputs_match("12\r\n", "12"));
        assert!(outputs_match("  a\r\nb \n", "a\nb"));
    }

    #[test]
    fn whitespace_runs_collapse() {
        assert!(outputs_match("1   2\n3", "1 2 3"));
        assert!(outputs_match("1\t2", "1 2"));
        assert!(!outputs_match("12", "1 2"));
    }

    #[test]
    fn floats_within_tolerance() {
        assert!(outputs_match("0.3333333", "0.33333333"));
        assert!(outputs_match("1.0", "1"));
        assert!(!outputs_match("0.3334", "0.3333"));
    }

    #[test]
    fn non_numeric_mismatch() {
        assert!(!outputs_match("YES", "NO"));
        assert!(!outputs_match("", "0"));
    }
}
