//! Content previews for event payloads.

use serde_json::Value;

/// Default preview length for inputs and outputs.
pub const DEFAULT_PREVIEW_LENGTH: usize = 150;

/// Preview length for report chapters.
pub const CHAPTER_PREVIEW_LENGTH: usize = 200;

/// Preview length for tool results.
pub const TOOL_RESULT_PREVIEW_LENGTH: usize = 500;

/// Truncate at a character boundary, marking the cut.
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let head: String = text.chars().take(max_chars).collect();
    format!("{head}...")
}

/// Preview an arbitrary JSON value. Strings preview their content; anything
/// else previews its compact JSON form.
pub fn value_preview(value: &Value, max_chars: usize) -> String {
    match value {
        Value::String(s) => preview(s, max_chars),
        Value::Null => String::new(),
        other => preview(&other.to_string(), max_chars),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn short_text_passes_through() {
        assert_eq!(preview("kort", 10), "kort");
    }

    #[test]
    fn long_text_is_cut_with_marker() {
        let cut = preview(&"x".repeat(200), 150);
        assert_eq!(cut.chars().count(), 153);
        assert!(cut.ends_with("..."));
    }

    #[test]
    fn multibyte_text_cuts_on_char_boundary() {
        let text = "é".repeat(40);
        let cut = preview(&text, 10);
        assert!(cut.starts_with(&"é".repeat(10)));
    }

    #[test]
    fn values_preview_compact_json() {
        assert_eq!(value_preview(&json!({"a": 1}), 50), r#"{"a":1}"#);
        assert_eq!(value_preview(&json!("tekst"), 50), "tekst");
        assert_eq!(value_preview(&Value::Null, 50), "");
    }
}
