//! Local repair of near-valid model output
//!
//! Models often wrap JSON in Markdown fences or surround it with prose.
//! These helpers recover the object without another model call.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static FENCED: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").ok());

/// Strip a surrounding code fence, if any
#[must_use]
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    FENCED
        .as_ref()
        .and_then(|re| re.captures(trimmed))
        .and_then(|c| c.get(1))
        .map_or(trimmed, |m| m.as_str().trim())
}

/// Slice from the first `{` to the last `}`
#[must_use]
pub fn outermost_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    (end > start).then(|| &text[start..=end])
}

/// Best-effort extraction of a JSON object from free text
#[must_use]
pub fn extract_json(text: &str) -> Option<Value> {
    let unfenced = strip_fences(text);
    if let Ok(v) = serde_json::from_str::<Value>(unfenced) {
        if v.is_object() {
            return Some(v);
        }
    }
    outermost_object(unfenced)
        .or_else(|| outermost_object(text))
        .and_then(|slice| serde_json::from_str::<Value>(slice).ok())
        .filter(Value::is_object)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_object_passes_through() {
        assert_eq!(extract_json(r#"{"score": 80}"#), Some(json!({"score": 80})));
    }

    #[test]
    fn fenced_object_is_unwrapped() {
        let text = "Here you go:\n```json\n{\"method\": \"chain\"}\n```\nThanks";
        assert_eq!(extract_json(text), Some(json!({"method": "chain"})));
    }

    #[test]
    fn prose_around_object_is_dropped() {
        let text = "The result is {\"a\": {\"b\": 1}} as requested.";
        assert_eq!(extract_json(text), Some(json!({"a": {"b": 1}})));
    }

    #[test]
    fn hopeless_text_yields_none() {
        assert_eq!(extract_json("no json here"), None);
        assert_eq!(extract_json("} backwards {"), None);
        assert_eq!(extract_json("[1, 2, 3]"), None);
    }
}
