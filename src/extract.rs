//! Incremental extraction of one string field from a JSON document that is
//! still arriving over the wire.
//!
//! The extractor is fed arbitrary fragments and pushes `(delta, is_complete)`
//! pairs to a callback. `delta` is always new, already unescaped text;
//! `is_complete` is true on exactly one call at most.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractMode {
    /// Looking for `"field"` `:` `"` in the text seen so far.
    Seeking,
    /// Inside the field's string value.
    InValue,
    /// Terminal. No further input is processed.
    Done,
}

/// Mutable state of one extraction. Owned by a single streaming call.
#[derive(Debug, Clone)]
pub struct StreamState {
    /// Document text seen so far. Only grows while seeking.
    pub accumulated: String,
    pub mode: ExtractMode,
    pub escape_pending: bool,
    /// Raw (still escaped) value text.
    pub buffer: String,
    /// Bytes of `buffer` already emitted. Never decreases, never exceeds `buffer.len()`.
    pub emitted: usize,
}

impl StreamState {
    fn new() -> Self {
        Self {
            accumulated: String::new(),
            mode: ExtractMode::Seeking,
            escape_pending: false,
            buffer: String::new(),
            emitted: 0,
        }
    }
}

pub struct StreamFieldExtractor<F>
where
    F: FnMut(&str, bool),
{
    field: String,
    state: StreamState,
    on_update: F,
}

impl<F> StreamFieldExtractor<F>
where
    F: FnMut(&str, bool),
{
    pub fn new(field: impl Into<String>, on_update: F) -> Self {
        Self {
            field: field.into(),
            state: StreamState::new(),
            on_update,
        }
    }

    pub fn state(&self) -> &StreamState {
        &self.state
    }

    pub fn is_complete(&self) -> bool {
        self.state.mode == ExtractMode::Done
    }

    /// Unescaped value extracted so far, including text not yet emitted.
    pub fn value(&self) -> String {
        decode_lossy(&self.state.buffer)
    }

    /// Feed the next fragment of the document.
    pub fn process_chunk(&mut self, chunk: &str) {
        if self.state.mode == ExtractMode::Done {
            return;
        }

        for ch in chunk.chars() {
            match self.state.mode {
                ExtractMode::Seeking => self.seek(ch),
                ExtractMode::InValue => {
                    if self.state.escape_pending {
                        self.state.escape_pending = false;
                        self.state.buffer.push(ch);
                    } else if ch == '\\' {
                        self.state.escape_pending = true;
                        self.state.buffer.push(ch);
                    } else if ch == '"' {
                        self.finish();
                        return;
                    } else {
                        self.state.buffer.push(ch);
                    }
                }
                ExtractMode::Done => return,
            }
        }

        self.flush();
    }

    /// Stream ended. Emits whatever is pending and reports completion once.
    /// Content completed this way may be truncated.
    pub fn force_complete(&mut self) {
        if self.state.mode == ExtractMode::Done {
            return;
        }
        if self.state.mode == ExtractMode::InValue {
            tracing::debug!(
                field = self.field.as_str(),
                "stream ended inside field value, emitting best-effort content"
            );
        }
        self.state.mode = ExtractMode::Done;
        let rest = decode_lossy(&self.state.buffer[self.state.emitted..]);
        self.state.emitted = self.state.buffer.len();
        (self.on_update)(&rest, true);
    }

    fn seek(&mut self, ch: char) {
        self.state.accumulated.push(ch);

        if self.state.escape_pending {
            self.state.escape_pending = false;
            return;
        }
        match ch {
            '\\' => self.state.escape_pending = true,
            '"' => {
                if opens_field(&self.state.accumulated, &self.field) {
                    tracing::debug!(field = self.field.as_str(), "found field start in stream");
                    self.state.mode = ExtractMode::InValue;
                }
            }
            _ => {}
        }
    }

    /// Emit the newly settled part of the value, if any.
    fn flush(&mut self) {
        if self.state.mode != ExtractMode::InValue {
            return;
        }
        let pending = &self.state.buffer[self.state.emitted..];
        let (text, used) = decode_settled(pending);
        if used == 0 {
            return;
        }
        self.state.emitted += used;
        if !text.is_empty() {
            (self.on_update)(&text, false);
        }
    }

    fn finish(&mut self) {
        self.state.mode = ExtractMode::Done;
        let rest = decode_lossy(&self.state.buffer[self.state.emitted..]);
        self.state.emitted = self.state.buffer.len();
        tracing::debug!(
            field = self.field.as_str(),
            len = self.state.buffer.len(),
            "field extraction complete"
        );
        (self.on_update)(&rest, true);
    }
}

/// True when `text` ends with `"field"`, optional whitespace, `:`, optional
/// whitespace and an opening quote.
fn opens_field(text: &str, field: &str) -> bool {
    let Some(rest) = text.strip_suffix('"') else {
        return false;
    };
    let Some(rest) = rest.trim_end_matches(is_json_ws).strip_suffix(':') else {
        return false;
    };
    let Some(rest) = rest.trim_end_matches(is_json_ws).strip_suffix('"') else {
        return false;
    };
    let Some(rest) = rest.strip_suffix(field) else {
        return false;
    };
    rest.ends_with('"') && !ends_with_odd_backslashes(&rest[..rest.len() - 1])
}

fn is_json_ws(c: char) -> bool {
    matches!(c, ' ' | '\t' | '\n' | '\r')
}

fn ends_with_odd_backslashes(s: &str) -> bool {
    s.chars().rev().take_while(|&c| c == '\\').count() % 2 == 1
}

/// Decode the longest prefix of `raw` that contains no incomplete escape.
/// Returns the decoded text and the number of raw bytes consumed.
pub(crate) fn decode_settled(raw: &str) -> (String, usize) {
    let mut out = String::with_capacity(raw.len());
    let mut used = 0;
    let bytes = raw.as_bytes();

    while used < raw.len() {
        let rest = &raw[used..];
        if bytes[used] != b'\\' {
            let next = rest.find('\\').unwrap_or(rest.len());
            out.push_str(&rest[..next]);
            used += next;
            continue;
        }
        match decode_escape(rest) {
            Escape::Decoded(ch, len) => {
                out.push(ch);
                used += len;
            }
            Escape::Incomplete => break,
        }
    }

    (out, used)
}

/// Decode everything. An incomplete trailing escape loses its backslash.
pub(crate) fn decode_lossy(raw: &str) -> String {
    let (mut text, used) = decode_settled(raw);
    text.push_str(raw[used..].trim_start_matches('\\'));
    text
}

enum Escape {
    /// Decoded character and raw length of the escape sequence.
    Decoded(char, usize),
    Incomplete,
}

/// `rest` starts with a backslash.
fn decode_escape(rest: &str) -> Escape {
    let Some(kind) = rest[1..].chars().next() else {
        return Escape::Incomplete;
    };
    let simple = match kind {
        'n' => Some('\n'),
        'r' => Some('\r'),
        't' => Some('\t'),
        '"' => Some('"'),
        '\\' => Some('\\'),
        '/' => Some('/'),
        'b' => Some('\u{8}'),
        'f' => Some('\u{c}'),
        'u' => None,
        other => return Escape::Decoded(other, 1 + other.len_utf8()),
    };
    if let Some(ch) = simple {
        return Escape::Decoded(ch, 2);
    }

    let Some(high) = hex4(rest, 2) else {
        return if rest.len() < 6 {
            Escape::Incomplete
        } else {
            Escape::Decoded(char::REPLACEMENT_CHARACTER, 2)
        };
    };
    if !(0xD800..0xDC00).contains(&high) {
        return Escape::Decoded(
            char::from_u32(high).unwrap_or(char::REPLACEMENT_CHARACTER),
            6,
        );
    }

    // High surrogate: the low half must follow as another \uXXXX.
    if rest.len() < 12 {
        let tail = &rest[6..];
        if tail
            .get(..tail.len().min(2))
            .is_some_and(|head| "\\u".starts_with(head))
        {
            return Escape::Incomplete;
        }
        return Escape::Decoded(char::REPLACEMENT_CHARACTER, 6);
    }
    match (rest.get(6..8), hex4(rest, 8)) {
        (Some("\\u"), Some(low)) if (0xDC00..0xE000).contains(&low) => {
            let code = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
            Escape::Decoded(
                char::from_u32(code).unwrap_or(char::REPLACEMENT_CHARACTER),
                12,
            )
        }
        _ => Escape::Decoded(char::REPLACEMENT_CHARACTER, 6),
    }
}

fn hex4(s: &str, at: usize) -> Option<u32> {
    let digits = s.get(at..at + 4)?;
    if !digits.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_settled_holds_back_lone_backslash() {
        assert_eq!(decode_settled("ab\\"), ("ab".to_string(), 2));
        assert_eq!(decode_settled("ab\\n"), ("ab\n".to_string(), 4));
    }

    #[test]
    fn decode_settled_holds_back_partial_unicode() {
        assert_eq!(decode_settled("x\\u00"), ("x".to_string(), 1));
        assert_eq!(decode_settled("x\\u00e9"), ("xé".to_string(), 7));
    }

    #[test]
    fn decode_settled_joins_surrogate_pairs() {
        assert_eq!(decode_settled("\\ud83d"), (String::new(), 0));
        assert_eq!(decode_settled("\\ud83d\\u"), (String::new(), 0));
        assert_eq!(decode_settled("\\ud83d\\ude00!"), ("😀!".to_string(), 13));
    }

    #[test]
    fn opens_field_requires_exact_key() {
        assert!(opens_field(r#"{"story": ""#, "story"));
        assert!(opens_field("{\"story\"\n :\t\"", "story"));
        assert!(!opens_field(r#"{"backstory": ""#, "story"));
        assert!(!opens_field(r#"{"story": "#, "story"));
    }
}
