//! Tests for incremental narrative-field extraction from a streaming JSON document.

use storyrelay::extract::{ExtractMode, StreamFieldExtractor};

/// Feed `chunks` and return (deltas, completion flags) as emitted.
fn run(field: &str, chunks: &[&str], force: bool) -> (Vec<String>, Vec<bool>) {
    let mut deltas = Vec::new();
    let mut flags = Vec::new();
    {
        let mut extractor = StreamFieldExtractor::new(field, |delta: &str, done: bool| {
            deltas.push(delta.to_string());
            flags.push(done);
        });
        for chunk in chunks {
            extractor.process_chunk(chunk);
        }
        if force {
            extractor.force_complete();
        }
    }
    (deltas, flags)
}

fn completions(flags: &[bool]) -> usize {
    flags.iter().filter(|f| **f).count()
}

// ---------------------------------------------------------------------------
// Chunk boundaries
// ---------------------------------------------------------------------------

#[test]
fn one_char_at_a_time_unescapes_quotes() {
    let doc = r#"{"story": "Hello, \"world\"!"}"#;
    let chars: Vec<String> = doc.chars().map(String::from).collect();
    let chunks: Vec<&str> = chars.iter().map(String::as_str).collect();

    let (deltas, flags) = run("story", &chunks, true);

    assert_eq!(deltas.concat(), "Hello, \"world\"!");
    assert_eq!(completions(&flags), 1);
    assert_eq!(flags.last(), Some(&true));
}

#[test]
fn every_two_and_three_way_split_yields_same_value() {
    let doc = r#"{"title": "a \"story\": x", "story": "Line\none\té \\ 😀 end", "n": 1}"#;
    let expected = "Line\none\té \\ 😀 end";
    let boundaries: Vec<usize> = (0..=doc.len()).filter(|i| doc.is_char_boundary(*i)).collect();

    for &i in &boundaries {
        for &j in boundaries.iter().filter(|j| **j >= i) {
            let chunks = [&doc[..i], &doc[i..j], &doc[j..]];
            let (deltas, flags) = run("story", &chunks, true);
            assert_eq!(deltas.concat(), expected, "split at {i}/{j}");
            assert_eq!(completions(&flags), 1, "split at {i}/{j}");
        }
    }
}

#[test]
fn field_name_split_across_chunks_is_found() {
    let (deltas, flags) = run("story", &["{\"sto", "ry\"", " :", " \"abc", "\"}"], false);
    assert_eq!(deltas.concat(), "abc");
    assert_eq!(completions(&flags), 1);
}

#[test]
fn similar_key_is_not_matched() {
    let (deltas, _) = run(
        "story",
        &[r#"{"backstory": "no", "story": "yes"}"#],
        false,
    );
    assert_eq!(deltas.concat(), "yes");
}

#[test]
fn deltas_never_repeat_text() {
    let (deltas, _) = run("story", &[r#"{"story": "ab"#, "cd", "ef\"}"], false);
    assert_eq!(deltas, vec!["ab", "cd", "ef"]);
}

// ---------------------------------------------------------------------------
// Completion
// ---------------------------------------------------------------------------

#[test]
fn force_complete_is_idempotent() {
    let mut flags = Vec::new();
    let mut extractor = StreamFieldExtractor::new("story", |_: &str, done: bool| flags.push(done));
    extractor.process_chunk(r#"{"story": "partial"#);
    extractor.force_complete();
    extractor.force_complete();
    assert!(extractor.is_complete());
    drop(extractor);

    assert_eq!(completions(&flags), 1);
}

#[test]
fn force_complete_after_done_is_noop() {
    let (deltas, flags) = run("story", &[r#"{"story": "full"}"#], true);
    assert_eq!(deltas.concat(), "full");
    assert_eq!(completions(&flags), 1);
}

#[test]
fn truncated_value_is_emitted_on_force_complete() {
    let (deltas, flags) = run("story", &[r#"{"story": "cut off mid\"#], true);
    assert_eq!(deltas.concat(), "cut off mid");
    assert_eq!(flags.last(), Some(&true));
}

#[test]
fn force_complete_while_seeking_reports_empty_completion() {
    let (deltas, flags) = run("story", &[r#"{"title": "no story here""#], true);
    assert_eq!(deltas, vec![String::new()]);
    assert_eq!(flags, vec![true]);
}

#[test]
fn input_after_done_is_ignored() {
    let mut deltas = Vec::new();
    let mut extractor =
        StreamFieldExtractor::new("story", |d: &str, _: bool| deltas.push(d.to_string()));
    extractor.process_chunk(r#"{"story": "one"}"#);
    let emitted = extractor.state().emitted;
    extractor.process_chunk(r#"{"story": "two"}"#);

    assert_eq!(extractor.state().mode, ExtractMode::Done);
    assert_eq!(extractor.state().emitted, emitted);
    assert!(extractor.state().emitted <= extractor.state().buffer.len());
    drop(extractor);
    assert_eq!(deltas.concat(), "one");
}
