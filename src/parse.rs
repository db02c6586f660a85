use serde_json::Value;

use crate::error::RelayError;

/// Remove code-fence markers models like to wrap JSON in.
pub fn strip_fences(text: &str) -> String {
    text.replace("```json", "")
        .replace("```html", "")
        .replace("```", "")
        .trim()
        .to_string()
}

/// Run the local parse ladder: direct parse after fence stripping, then the
/// literal fixes, then re-extraction of a fenced block.
///
/// The error carries the message of the first (direct) parse failure, which
/// is what the repair agent gets as context.
pub fn parse_document(raw: &str) -> Result<Value, RelayError> {
    let cleaned = strip_fences(raw);
    let first_error = match serde_json::from_str::<Value>(&cleaned) {
        Ok(value) => return Ok(value),
        Err(e) => e,
    };
    tracing::debug!(error = %first_error, len = raw.len(), "direct JSON parse failed");

    if let Some(value) = literal_fix(&cleaned, &first_error) {
        tracing::debug!("JSON recovered by literal fix");
        return Ok(value);
    }

    if let Some(value) = fenced_block(raw).and_then(|block| serde_json::from_str(block).ok()) {
        tracing::debug!("JSON recovered from fenced block");
        return Ok(value);
    }

    Err(RelayError::Parse {
        message: first_error.to_string(),
    })
}

fn literal_fix(cleaned: &str, error: &serde_json::Error) -> Option<Value> {
    if error.to_string().contains("control character") {
        let escaped = escape_control_chars_in_strings(cleaned);
        if let Ok(value) = serde_json::from_str(&escaped) {
            return Some(value);
        }
    }
    if cleaned.contains('\\') {
        return serde_json::from_str(&cleaned.replace('\\', "")).ok();
    }
    None
}

/// Body of the first ```json block, or of the first bare ``` block.
fn fenced_block(raw: &str) -> Option<&str> {
    let (_, after) = raw
        .split_once("```json")
        .or_else(|| raw.split_once("```"))?;
    let body = after.split("```").next()?;
    Some(body.trim())
}

/// Escape raw control characters that appear inside string literals.
fn escape_control_chars_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            } else if (ch as u32) < 0x20 {
                match ch {
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    '\t' => out.push_str("\\t"),
                    other => out.push_str(&format!("\\u{:04x}", other as u32)),
                }
                continue;
            }
        } else if ch == '"' {
            in_string = true;
        }
        out.push(ch);
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_only_inside_strings() {
        let input = "{\n\"a\": \"line1\nline2\"\n}";
        assert_eq!(
            escape_control_chars_in_strings(input),
            "{\n\"a\": \"line1\\nline2\"\n}"
        );
    }

    #[test]
    fn fenced_block_prefers_json_fence() {
        let raw = "Sure!\n```json\n{\"a\": 1}\n```\nbye";
        assert_eq!(fenced_block(raw), Some("{\"a\": 1}"));
        assert_eq!(fenced_block("no fences"), None);
    }
}
