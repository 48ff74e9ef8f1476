//! Lenient JSON extraction for model output.
//!
//! Generated text often wraps JSON in markdown fences, prefixes it with
//! prose, uses typographic quotes or leaves trailing commas. [`parse_json`]
//! repairs those cases; stages choose their own fallback with
//! [`parse_json_or`].

use crate::errors::ParseError;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

static FENCE_REGEX: OnceLock<Regex> = OnceLock::new();
static TRAILING_COMMA_REGEX: OnceLock<Regex> = OnceLock::new();

fn fence_regex() -> &'static Regex {
    FENCE_REGEX.get_or_init(|| {
        Regex::new(r"(?s)```[A-Za-z]*\s*(.*?)```").expect("FENCE_REGEX is valid")
    })
}

fn trailing_comma_regex() -> &'static Regex {
    TRAILING_COMMA_REGEX
        .get_or_init(|| Regex::new(r",(\s*[}\]])").expect("TRAILING_COMMA_REGEX is valid"))
}

/// Parses the first JSON value found in `text`.
///
/// # Errors
///
/// [`ParseError::NoJson`] if no object or array is present,
/// [`ParseError::Invalid`] if the repaired candidate still fails to parse.
pub fn parse_json(text: &str) -> Result<Value, ParseError> {
    let body = fence_regex()
        .captures(text)
        .and_then(|c| c.get(1))
        .map_or(text, |m| m.as_str());
    let body = normalize_quotes(body.trim());

    if let Ok(value) = serde_json::from_str::<Value>(&body) {
        return Ok(value);
    }

    let candidate = extract_json(&body).ok_or(ParseError::NoJson)?;
    let repaired = trailing_comma_regex().replace_all(candidate, "$1");
    serde_json::from_str(&repaired).map_err(|e| {
        debug!(error = %e, "JSON repair failed");
        ParseError::Invalid(e.to_string())
    })
}

/// Parses JSON from `text`, returning `fallback` on failure.
pub fn parse_json_or(text: &str, fallback: Value) -> Value {
    parse_json(text).unwrap_or(fallback)
}

fn normalize_quotes(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' => '"',
            '\u{2018}' | '\u{2019}' => '\'',
            other => other,
        })
        .collect()
}

/// Slices from the first opening bracket to the last matching closer.
fn extract_json(text: &str) -> Option<&str> {
    let start = text.find(['{', '['])?;
    let closer = if text[start..].starts_with('{') { '}' } else { ']' };
    let end = text.rfind(closer)?;
    (end > start).then(|| &text[start..=end])
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_plain_json() {
        assert_eq!(parse_json(r#"{"a": 1}"#).unwrap(), json!({"a": 1}));
    }

    #[test]
    fn test_fenced_json() {
        let text = "Here are the charts:\n```json\n[{\"type\": \"bar\"}]\n```\nLet me know.";
        assert_eq!(parse_json(text).unwrap(), json!([{"type": "bar"}]));
    }

    #[test]
    fn test_prose_and_trailing_commas() {
        let text = "Sure! {\"companies\": [\"CATL\", \"LG\",], \"count\": 2,} Hope that helps";
        assert_eq!(
            parse_json(text).unwrap(),
            json!({"companies": ["CATL", "LG"], "count": 2})
        );
    }

    #[test]
    fn test_smart_quotes() {
        let text = "{\u{201C}title\u{201D}: \u{201C}Market share\u{201D}}";
        assert_eq!(parse_json(text).unwrap(), json!({"title": "Market share"}));
    }

    #[test]
    fn test_no_json() {
        assert!(matches!(parse_json("no structured data"), Err(ParseError::NoJson)));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(parse_json("{not: valid}"), Err(ParseError::Invalid(_))));
    }

    #[test]
    fn test_fallback() {
        let fallback = json!([{"title": "Company Comparison"}]);
        assert_eq!(parse_json_or("garbage", fallback.clone()), fallback);
    }
}
