//! Text processing between the LLM stream and TTS.
//!
//! The chunker splits a growing buffer into complete sentences on `. ! ? ~`
//! followed by whitespace (or end of a later flush), returning the unsplit
//! remainder for the next call. Concatenating the sentences and the remainder
//! reproduces the input modulo whitespace normalization.

/// Force-flush threshold for a remainder with no sentence terminator, so TTS
/// never stalls on a runaway no-terminator output.
pub const MAX_BUFFER_CHARS: usize = 2000;

fn is_terminator(c: char) -> bool {
    matches!(c, '.' | '!' | '?' | '~')
}

/// Split `text` into complete sentences and an unterminated remainder.
///
/// A sentence ends at a terminator followed by whitespace. The remainder
/// carries no terminator-plus-whitespace boundary; if it exceeds
/// [`MAX_BUFFER_CHARS`] it is force-flushed as a final sentence.
pub fn chunk_sentences(text: &str) -> (Vec<String>, String) {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return (Vec::new(), String::new());
    }

    let mut sentences = Vec::new();
    let mut start = 0usize;
    let mut last_was_terminator = false;

    for (i, c) in trimmed.char_indices() {
        if last_was_terminator && c.is_whitespace() {
            let sentence = trimmed[start..i].trim();
            if !sentence.is_empty() {
                sentences.push(sentence.to_owned());
            }
            start = i;
        }
        last_was_terminator = is_terminator(c);
    }

    let tail = trimmed[start..].trim();
    // A fully terminated tail is a complete sentence, not a remainder.
    if tail.ends_with(is_terminator) {
        if !tail.is_empty() {
            sentences.push(tail.to_owned());
        }
        return (sentences, String::new());
    }

    if tail.chars().count() > MAX_BUFFER_CHARS {
        sentences.push(tail.to_owned());
        return (sentences, String::new());
    }

    (sentences, tail.to_owned())
}

/// Strip markdown decoration the TTS voice would read aloud.
pub fn sanitize_for_tts(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' | '_' | '#' | '`' | '~' | '[' | ']' | '(' | ')' | '{' | '}' | '|' | '>' => {}
            '-' | '\u{2022}' => {
                // Bullet marker only when followed by a space.
                if chars.peek() == Some(&' ') {
                    let _ = chars.next();
                } else {
                    out.push(c);
                }
            }
            d if d.is_ascii_digit() => {
                // Drop "1. " style list numbering; keep plain numbers.
                let mut digits = String::from(d);
                while let Some(&n) = chars.peek() {
                    if n.is_ascii_digit() {
                        digits.push(n);
                        let _ = chars.next();
                    } else {
                        break;
                    }
                }
                if chars.peek() == Some(&'.') {
                    let mut lookahead = chars.clone();
                    let _ = lookahead.next();
                    if lookahead.peek().is_some_and(|c| c.is_whitespace()) {
                        let _ = chars.next();
                        let _ = chars.next();
                        continue;
                    }
                }
                out.push_str(&digits);
            }
            other => out.push(other),
        }
    }
    out.trim().to_owned()
}

/// Truncate trailing text after the last sentence terminator.
///
/// Returns the input unchanged when it carries no terminator at all.
pub fn ensure_complete_sentence(text: &str) -> &str {
    match text.rfind(is_terminator) {
        Some(pos) => &text[..pos + text[pos..].chars().next().map_or(1, char::len_utf8)],
        None => text,
    }
}

/// Flatten message content to plain text for archival.
///
/// Block lists are flattened to a space-joined string of their text blocks;
/// non-text blocks contribute nothing.
pub fn content_to_text(content: &crate::context::Content) -> String {
    use crate::context::{Content, ContentBlock};
    match content {
        Content::Text(text) => text.clone(),
        Content::Blocks(blocks) => blocks
            .iter()
            .filter_map(ContentBlock::text)
            .collect::<Vec<_>>()
            .join(" "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_period() {
        let (sentences, remainder) = chunk_sentences("First sentence. Second sentence.");
        assert_eq!(sentences, vec!["First sentence.", "Second sentence."]);
        assert_eq!(remainder, "");
    }

    #[test]
    fn splits_on_question_mark() {
        let (sentences, remainder) = chunk_sentences("뭐해? 나는 잘 지내.");
        assert_eq!(sentences, vec!["뭐해?", "나는 잘 지내."]);
        assert_eq!(remainder, "");
    }

    #[test]
    fn handles_empty_string() {
        let (sentences, remainder) = chunk_sentences("");
        assert!(sentences.is_empty());
        assert_eq!(remainder, "");
    }

    #[test]
    fn preserves_single_sentence() {
        let (sentences, remainder) = chunk_sentences("하나의 문장만.");
        assert_eq!(sentences, vec!["하나의 문장만."]);
        assert_eq!(remainder, "");
    }

    #[test]
    fn retains_incomplete_trailing_text() {
        let (sentences, remainder) = chunk_sentences("완성된 문장. 미완성 텍스트");
        assert_eq!(sentences, vec!["완성된 문장."]);
        assert_eq!(remainder, "미완성 텍스트");
    }

    #[test]
    fn all_incomplete() {
        let (sentences, remainder) = chunk_sentences("문장 종결 없는 텍스트");
        assert!(sentences.is_empty());
        assert_eq!(remainder, "문장 종결 없는 텍스트");
    }

    #[test]
    fn multiple_with_trailing() {
        let (sentences, remainder) = chunk_sentences("첫째. 둘째! 셋째는 아직");
        assert_eq!(sentences, vec!["첫째.", "둘째!"]);
        assert_eq!(remainder, "셋째는 아직");
    }

    #[test]
    fn tilde_is_a_terminator() {
        let (sentences, remainder) = chunk_sentences("좋아~ 그러면 간다.");
        assert_eq!(sentences, vec!["좋아~", "그러면 간다."]);
        assert_eq!(remainder, "");
    }

    #[test]
    fn period_without_space_is_not_a_boundary() {
        let (sentences, remainder) = chunk_sentences("version 1.2 of the");
        assert!(sentences.is_empty());
        assert_eq!(remainder, "version 1.2 of the");
    }

    #[test]
    fn concat_round_trip() {
        let input = "First. Second! Third is still going";
        let (sentences, remainder) = chunk_sentences(input);
        let mut rebuilt = sentences.join(" ");
        if !remainder.is_empty() {
            rebuilt.push(' ');
            rebuilt.push_str(&remainder);
        }
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn force_flush_oversized_remainder() {
        let long = "a".repeat(MAX_BUFFER_CHARS + 10);
        let (sentences, remainder) = chunk_sentences(&long);
        assert_eq!(sentences.len(), 1);
        assert_eq!(sentences[0].chars().count(), MAX_BUFFER_CHARS + 10);
        assert_eq!(remainder, "");
    }

    #[test]
    fn sanitize_strips_markdown_bold() {
        assert_eq!(sanitize_for_tts("이건 **중요한** 내용이야"), "이건 중요한 내용이야");
    }

    #[test]
    fn sanitize_strips_numbered_list() {
        assert_eq!(sanitize_for_tts("1. 첫째\n2. 둘째"), "첫째\n둘째");
    }

    #[test]
    fn sanitize_strips_bullets() {
        assert_eq!(sanitize_for_tts("- 항목\n• 항목"), "항목\n항목");
    }

    #[test]
    fn sanitize_keeps_plain_numbers() {
        assert_eq!(sanitize_for_tts("we have 42 items"), "we have 42 items");
    }

    #[test]
    fn sanitize_passthrough_clean_text() {
        assert_eq!(sanitize_for_tts("오늘 날씨 좋다."), "오늘 날씨 좋다.");
    }

    #[test]
    fn ensure_complete_truncates_at_last_period() {
        assert_eq!(ensure_complete_sentence("안녕하세요. 오늘은"), "안녕하세요.");
    }

    #[test]
    fn ensure_complete_returns_text_without_punctuation() {
        assert_eq!(ensure_complete_sentence("문장부호없음"), "문장부호없음");
    }
}
