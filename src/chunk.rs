//! Sentence-boundary text chunker.
//!
//! Splits document text into [`Chunk`]s that respect a `max_tokens` limit,
//! with each subsequent chunk repeating up to `overlap_tokens` of the
//! previous chunk's tail so context survives a boundary.
//!
//! Split points prefer sentence and paragraph boundaries. Only a sentence
//! that is itself larger than `max_tokens` is cut inside, and then at a word
//! boundary nearest the token limit.
//!
//! # Token rule
//!
//! Token counting is a fixed, deterministic approximation: a token is a
//! maximal run of alphanumeric characters, or a single non-alphanumeric,
//! non-whitespace character. Whitespace never produces tokens. The same rule
//! governs the context builder's token budget.

use crate::error::MapError;
use crate::models::Chunk;

/// Count tokens in `text` under the crate's tokenization rule.
pub fn count_tokens(text: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    for c in text.chars() {
        if c.is_alphanumeric() {
            if !in_word {
                count += 1;
                in_word = true;
            }
        } else {
            in_word = false;
            if !c.is_whitespace() {
                count += 1;
            }
        }
    }
    count
}

/// A splittable unit of the document: a sentence, or a word-bounded piece of
/// an oversized sentence. Spans are contiguous — each segment's `end` is the
/// next segment's `start`, so trailing whitespace belongs to the segment
/// before it.
#[derive(Debug, Clone, Copy)]
struct Segment {
    start: usize,
    end: usize,
    tokens: usize,
}

/// Split `text` into chunks of at most `max_tokens` tokens.
///
/// Returns a single zero-index chunk when the whole document fits. Fails
/// with [`MapError::InvalidInput`] when the text is empty or shorter than
/// `min_chars` characters.
///
/// Deterministic: the same inputs always produce the same chunk sequence.
/// Concatenating each chunk's text past its `overlap_prefix_len` (and the
/// first chunk whole) reconstructs the input exactly.
pub fn chunk_text(
    source: &str,
    text: &str,
    max_tokens: usize,
    overlap_tokens: usize,
    min_chars: usize,
) -> Result<Vec<Chunk>, MapError> {
    if text.trim().is_empty() {
        return Err(MapError::InvalidInput("document text is empty".to_string()));
    }
    if text.chars().count() < min_chars {
        return Err(MapError::InvalidInput(format!(
            "document text is too short (< {} characters)",
            min_chars
        )));
    }

    let total_tokens = count_tokens(text);
    if total_tokens <= max_tokens {
        return Ok(vec![Chunk {
            source: source.to_string(),
            chunk_index: 0,
            text: text.to_string(),
            token_count: total_tokens,
            overlap_prefix_len: 0,
            has_leading_overlap: false,
            has_trailing_overlap: false,
        }]);
    }

    let segments = build_segments(text, max_tokens);

    let mut chunks: Vec<Chunk> = Vec::new();
    // Segments carried into the chunk currently being built.
    let mut current: Vec<Segment> = Vec::new();
    let mut current_tokens = 0usize;
    // Byte length of the leading portion of `current` duplicated from the
    // previous chunk.
    let mut overlap_prefix_len = 0usize;

    for seg in &segments {
        if !current.is_empty() && current_tokens + seg.tokens > max_tokens {
            push_chunk(source, text, &mut chunks, &current, overlap_prefix_len);

            // Carry whole trailing segments into the next chunk, up to the
            // overlap budget and without crowding out the incoming segment.
            let mut overlap: Vec<Segment> = Vec::new();
            let mut overlap_token_count = 0usize;
            for prev in current.iter().rev() {
                if overlap_token_count + prev.tokens > overlap_tokens {
                    break;
                }
                overlap.push(*prev);
                overlap_token_count += prev.tokens;
            }
            overlap.reverse();
            while !overlap.is_empty() && overlap_token_count + seg.tokens > max_tokens {
                let dropped = overlap.remove(0);
                overlap_token_count -= dropped.tokens;
            }

            overlap_prefix_len = if overlap.is_empty() {
                0
            } else {
                overlap.last().map(|s| s.end).unwrap_or(0)
                    - overlap.first().map(|s| s.start).unwrap_or(0)
            };
            current = overlap;
            current_tokens = overlap_token_count;
        }

        current.push(*seg);
        current_tokens += seg.tokens;
    }

    if !current.is_empty() {
        push_chunk(source, text, &mut chunks, &current, overlap_prefix_len);
    }

    // Mark chunks whose tail is repeated by their successor.
    for i in 0..chunks.len() {
        if i + 1 < chunks.len() && chunks[i + 1].has_leading_overlap {
            chunks[i].has_trailing_overlap = true;
        }
    }

    Ok(chunks)
}

fn push_chunk(
    source: &str,
    text: &str,
    chunks: &mut Vec<Chunk>,
    segments: &[Segment],
    overlap_prefix_len: usize,
) {
    let start = segments.first().map(|s| s.start).unwrap_or(0);
    let end = segments.last().map(|s| s.end).unwrap_or(0);
    let chunk_text = &text[start..end];

    chunks.push(Chunk {
        source: source.to_string(),
        chunk_index: chunks.len(),
        text: chunk_text.to_string(),
        token_count: count_tokens(chunk_text),
        overlap_prefix_len,
        has_leading_overlap: overlap_prefix_len > 0,
        has_trailing_overlap: false,
    });
}

/// Sentence segments, with oversized sentences further split at word
/// boundaries so every segment fits `max_tokens` (a single word larger than
/// the limit stands alone as the only exception).
fn build_segments(text: &str, max_tokens: usize) -> Vec<Segment> {
    let mut segments = Vec::new();
    for (start, end) in sentence_spans(text) {
        let tokens = count_tokens(&text[start..end]);
        if tokens <= max_tokens {
            segments.push(Segment { start, end, tokens });
        } else {
            split_oversized(text, start, end, max_tokens, &mut segments);
        }
    }
    if segments.is_empty() {
        segments.push(Segment {
            start: 0,
            end: text.len(),
            tokens: count_tokens(text),
        });
    }
    segments
}

/// Sentence spans covering the whole text. A sentence ends after a run of
/// `.`/`!`/`?` followed by whitespace, or at a paragraph break (a whitespace
/// run containing two or more newlines). Each span includes its trailing
/// whitespace, so spans are contiguous and cover `[0, text.len())`.
fn sentence_spans(text: &str) -> Vec<(usize, usize)> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut spans = Vec::new();
    let mut start = 0usize;
    let mut i = 0usize;

    while i < chars.len() {
        let c = chars[i].1;

        if matches!(c, '.' | '!' | '?') {
            let mut j = i + 1;
            while j < chars.len() && matches!(chars[j].1, '.' | '!' | '?') {
                j += 1;
            }
            if j < chars.len() && chars[j].1.is_whitespace() {
                let mut k = j;
                while k < chars.len() && chars[k].1.is_whitespace() {
                    k += 1;
                }
                let boundary = if k < chars.len() { chars[k].0 } else { text.len() };
                spans.push((start, boundary));
                start = boundary;
                i = k;
                continue;
            }
            i = j;
            continue;
        }

        if c.is_whitespace() {
            let mut k = i;
            let mut newlines = 0usize;
            while k < chars.len() && chars[k].1.is_whitespace() {
                if chars[k].1 == '\n' {
                    newlines += 1;
                }
                k += 1;
            }
            if newlines >= 2 {
                let boundary = if k < chars.len() { chars[k].0 } else { text.len() };
                if boundary > start {
                    spans.push((start, boundary));
                    start = boundary;
                }
            }
            i = k;
            continue;
        }

        i += 1;
    }

    if start < text.len() {
        spans.push((start, text.len()));
    }
    spans
}

/// Split one oversized sentence into word-bounded segments of at most
/// `max_tokens` tokens each.
fn split_oversized(
    text: &str,
    start: usize,
    end: usize,
    max_tokens: usize,
    out: &mut Vec<Segment>,
) {
    let slice = &text[start..end];

    // Word spans relative to `slice`: [content_start, content_end).
    let mut words: Vec<(usize, usize)> = Vec::new();
    let mut word_start: Option<usize> = None;
    for (idx, c) in slice.char_indices() {
        if c.is_whitespace() {
            if let Some(ws) = word_start.take() {
                words.push((ws, idx));
            }
        } else if word_start.is_none() {
            word_start = Some(idx);
        }
    }
    if let Some(ws) = word_start {
        words.push((ws, slice.len()));
    }
    if words.is_empty() {
        out.push(Segment {
            start,
            end,
            tokens: count_tokens(slice),
        });
        return;
    }

    // Extend each word through its trailing whitespace so the pieces tile
    // the sentence; the first piece also absorbs any leading whitespace.
    let mut seg_start = 0usize;
    let mut seg_tokens = 0usize;
    for (ws, we) in words.iter() {
        let word_tokens = count_tokens(&slice[*ws..*we]);

        if seg_tokens > 0 && seg_tokens + word_tokens > max_tokens {
            out.push(Segment {
                start: start + seg_start,
                end: start + ws,
                tokens: seg_tokens,
            });
            seg_start = *ws;
            seg_tokens = 0;
        }
        seg_tokens += word_tokens;
    }
    out.push(Segment {
        start: start + seg_start,
        end,
        tokens: seg_tokens,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    const SRC: &str = "doc";

    fn chunk(text: &str, max_tokens: usize, overlap: usize) -> Vec<Chunk> {
        chunk_text(SRC, text, max_tokens, overlap, 1).unwrap()
    }

    #[test]
    fn empty_text_is_invalid_input() {
        let err = chunk_text(SRC, "", 500, 50, 100).unwrap_err();
        assert!(matches!(err, MapError::InvalidInput(_)));
    }

    #[test]
    fn short_text_is_invalid_input() {
        let err = chunk_text(SRC, "too short", 500, 50, 100).unwrap_err();
        assert!(matches!(err, MapError::InvalidInput(_)));
    }

    #[test]
    fn token_rule_counts_words_and_punctuation() {
        assert_eq!(count_tokens(""), 0);
        assert_eq!(count_tokens("hello world"), 2);
        assert_eq!(count_tokens("hello, world!"), 4);
        assert_eq!(count_tokens("don't"), 3);
        assert_eq!(count_tokens("  spaced   out  "), 2);
        assert_eq!(count_tokens("T1566.001"), 3);
    }

    #[test]
    fn small_text_single_chunk_no_overlap() {
        let text = "The attackers sent phishing emails. Persistence followed.";
        let chunks = chunk(text, 500, 50);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[0].text, text);
        assert!(!chunks[0].has_leading_overlap);
        assert!(!chunks[0].has_trailing_overlap);
        assert_eq!(chunks[0].overlap_prefix_len, 0);
    }

    #[test]
    fn long_text_splits_on_sentence_boundaries() {
        let text = "Alpha one two three. Bravo four five six. Charlie seven eight nine. \
                    Delta ten eleven twelve.";
        // Each sentence is 5 tokens (4 words + period); limit of 11 fits two.
        let chunks = chunk(text, 11, 0);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.token_count <= 11, "chunk over limit: {:?}", c.text);
            // No mid-sentence cut: every chunk ends with a terminator.
            assert!(c.text.trim_end().ends_with('.'));
        }
    }

    #[test]
    fn chunk_indices_contiguous() {
        let text = (0..40)
            .map(|i| format!("Sentence number {} is here.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk(&text, 20, 5);
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(c.chunk_index, i, "index mismatch at position {}", i);
        }
    }

    #[test]
    fn overlap_repeats_previous_tail() {
        let text = "Alpha one two three. Bravo four five six. Charlie seven eight nine. \
                    Delta ten eleven twelve.";
        let chunks = chunk(text, 11, 6);
        assert!(chunks.len() > 1);
        for pair in chunks.windows(2) {
            let (prev, next) = (&pair[0], &pair[1]);
            if next.has_leading_overlap {
                assert!(prev.has_trailing_overlap);
                let prefix = &next.text[..next.overlap_prefix_len];
                assert!(
                    prev.text.ends_with(prefix),
                    "overlap prefix {:?} not a suffix of {:?}",
                    prefix,
                    prev.text
                );
            }
        }
    }

    #[test]
    fn reconstruction_minus_overlap_is_exact() {
        let text = (0..30)
            .map(|i| format!("Sentence number {} talks about item {}.", i, i * 7))
            .collect::<Vec<_>>()
            .join(" ");
        for overlap in [0usize, 5, 10] {
            let chunks = chunk(&text, 25, overlap);
            let mut rebuilt = String::new();
            for c in &chunks {
                rebuilt.push_str(&c.text[c.overlap_prefix_len..]);
            }
            assert_eq!(rebuilt, text, "reconstruction failed at overlap {}", overlap);
        }
    }

    #[test]
    fn oversized_sentence_cut_at_word_boundary() {
        let words: Vec<String> = (0..50).map(|i| format!("word{}", i)).collect();
        let text = format!("{}.", words.join(" "));
        let chunks = chunk(&text, 10, 0);
        assert!(chunks.len() >= 5);
        for c in &chunks {
            // Word-boundary cuts only: no chunk starts or ends mid-word.
            assert!(!c.text.starts_with(char::is_whitespace) || c.chunk_index == 0);
            assert!(c.token_count <= 10 || c.text.split_whitespace().count() == 1);
        }
        let mut rebuilt = String::new();
        for c in &chunks {
            rebuilt.push_str(&c.text[c.overlap_prefix_len..]);
        }
        assert_eq!(rebuilt, text);
    }

    #[test]
    fn paragraph_break_is_a_boundary() {
        let text = "First paragraph without terminator\n\nSecond paragraph follows here";
        let spans = sentence_spans(text);
        assert_eq!(spans.len(), 2);
        assert!(text[spans[0].0..spans[0].1].starts_with("First"));
        assert!(text[spans[1].0..spans[1].1].starts_with("Second"));
    }

    #[test]
    fn deterministic() {
        let text = (0..20)
            .map(|i| format!("Deterministic sentence {}.", i))
            .collect::<Vec<_>>()
            .join(" ");
        let a = chunk(&text, 15, 4);
        let b = chunk(&text, 15, 4);
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.text, y.text);
            assert_eq!(x.token_count, y.token_count);
            assert_eq!(x.overlap_prefix_len, y.overlap_prefix_len);
        }
    }

    #[test]
    fn abbreviation_without_space_does_not_split() {
        // "T1566.001" has dots not followed by whitespace.
        let text = "The actor used T1566.001 against the target. A second sentence.";
        let spans = sentence_spans(text);
        assert_eq!(spans.len(), 2);
    }
}
