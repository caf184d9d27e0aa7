//! Shared best-effort JSON extraction from a free-text agent reply.
//!
//! Used by the Orchestrator Router (§4.8) and the Planning Controller
//! (§4.10), which both need to pull a JSON object out of a reply that might
//! be raw JSON, a fenced markdown code block, or prose with a JSON object
//! embedded somewhere inside it.

/// Tries, in order: the whole trimmed text as JSON; the contents of a
/// ```` ```json ... ``` ```` or plain ```` ``` ... ``` ```` fenced block; the
/// first balanced `{ … }` substring. Returns `None` if nothing parses.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
        return Some(value);
    }

    if let Some(fenced) = extract_fenced_block(trimmed) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(fenced.trim()) {
            return Some(value);
        }
    }

    if let Some(substring) = extract_first_braced_substring(trimmed) {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(&substring) {
            return Some(value);
        }
    }

    None
}

fn extract_fenced_block(text: &str) -> Option<&str> {
    let start = text.find("```")?;
    let after_marker = &text[start + 3..];
    let after_lang = after_marker.strip_prefix("json").unwrap_or(after_marker);
    let end = after_lang.find("```")?;
    Some(&after_lang[..end])
}

/// Finds the first `{ ... }` span with balanced braces, ignoring braces
/// inside string literals.
fn extract_first_braced_substring(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let start = text.find('{')?;
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        let c = b as char;
        if in_string {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(text[start..start + offset + 1].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_raw_json() {
        let value = extract_json_object(r#"{"action":"fallback"}"#).unwrap();
        assert_eq!(value["action"], "fallback");
    }

    #[test]
    fn parses_fenced_json_block() {
        let text = "here you go:\n```json\n{\"action\": \"dispatch_to_programmer\"}\n```\nthanks";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["action"], "dispatch_to_programmer");
    }

    #[test]
    fn parses_first_braced_substring_in_prose() {
        let text = "Sure, my decision is {\"action\": \"send_to_review\", \"reasoning\": \"looks done\"} — let me know.";
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["action"], "send_to_review");
    }

    #[test]
    fn returns_none_for_non_json_text() {
        assert!(extract_json_object("just thinking out loud").is_none());
    }

    #[test]
    fn ignores_braces_inside_string_literals() {
        let text = r#"{"reasoning": "uses a { brace } inside a string", "action": "fallback"}"#;
        let value = extract_json_object(text).unwrap();
        assert_eq!(value["action"], "fallback");
    }
}
