//! Splits narration text into backend-sized chunks
//!
//! Speech backends have per-request limits (the synthesis endpoint rejects
//! long payloads, platform speech engines drop long utterances). Chunks are
//! cut at sentence ends when possible, then at commas or semicolons, then at
//! the last space before the limit. A word is never split: a single token
//! longer than the limit becomes its own oversized chunk.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::types::TextChunk;

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?]\s").expect("valid regex"));
static PHRASE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[,;]\s").expect("valid regex"));

/// Size limit and split preference for one backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkerPreset {
    /// Maximum characters per chunk
    pub max_chars: usize,
    /// Prefer sentence and phrase ends over the last space
    pub prefer_sentence_boundary: bool,
}

impl ChunkerPreset {
    /// Remote synthesis endpoint (hard limit is 3,000 characters)
    pub const SYNTHESIS: Self = Self {
        max_chars: 2500,
        prefer_sentence_boundary: true,
    };

    /// Platform speech engines, conservative for mobile
    pub const WEB_SPEECH: Self = Self {
        max_chars: 2000,
        prefer_sentence_boundary: true,
    };

    /// Platform speech engines on desktop
    pub const WEB_SPEECH_DESKTOP: Self = Self {
        max_chars: 4000,
        prefer_sentence_boundary: true,
    };

    pub const fn new(max_chars: usize, prefer_sentence_boundary: bool) -> Self {
        Self {
            max_chars,
            prefer_sentence_boundary,
        }
    }
}

impl Default for ChunkerPreset {
    fn default() -> Self {
        Self::WEB_SPEECH
    }
}

/// Collapse every whitespace run into one space and trim both ends
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Count whitespace-delimited words
pub fn count_words(text: &str) -> usize {
    text.split_whitespace().count()
}

/// Split `text` into chunks no longer than `preset.max_chars`.
///
/// The text is whitespace-normalized first, so joining the chunk texts with a
/// single space reproduces `normalize_whitespace(text)`.
pub fn split_into_chunks(text: &str, preset: ChunkerPreset) -> Vec<TextChunk> {
    let normalized = normalize_whitespace(text);
    let max_chars = preset.max_chars.max(1);

    let mut chunks = Vec::new();
    let mut offset = 0;
    let mut word_offset = 0;

    while offset < normalized.len() {
        let remaining = &normalized[offset..];
        let take = if remaining.chars().count() <= max_chars {
            remaining.len()
        } else {
            find_break(remaining, max_chars, preset.prefer_sentence_boundary)
        };

        let piece = &remaining[..take];
        let words = count_words(piece);

        chunks.push(TextChunk {
            text: piece.to_string(),
            start_word_index: word_offset,
            end_word_index: word_offset + words - 1,
            start_char: offset,
            end_char: offset + take,
        });

        word_offset += words;
        offset += take;

        // Normalized text has exactly one separating space
        if normalized[offset..].starts_with(' ') {
            offset += 1;
        }
    }

    chunks
}

/// Find the chunk that owns a global word index
pub fn chunk_for_word(chunks: &[TextChunk], word_index: usize) -> Option<usize> {
    chunks.iter().position(|c| c.contains_word(word_index))
}

/// Text of `chunk` starting at the global `word_index`
pub fn text_from_word(chunk: &TextChunk, word_index: usize) -> String {
    let skip = word_index.saturating_sub(chunk.start_word_index);
    chunk
        .text
        .split_whitespace()
        .skip(skip)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Byte length of the best chunk cut inside `remaining`
fn find_break(remaining: &str, max_chars: usize, prefer_sentence_boundary: bool) -> usize {
    let limit = remaining
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(remaining.len());

    if prefer_sentence_boundary {
        if let Some(end) = last_match_end(&SENTENCE_END, remaining, limit) {
            return end;
        }
        if let Some(end) = last_match_end(&PHRASE_END, remaining, limit) {
            return end;
        }
    }

    break_at_space(remaining, limit)
}

/// End (just past the punctuation) of the last match that fits in `limit`
fn last_match_end(pattern: &Regex, remaining: &str, limit: usize) -> Option<usize> {
    let mut best = None;
    for m in pattern.find_iter(remaining) {
        // Punctuation is a single ASCII byte
        let end = m.start() + 1;
        if end > limit {
            break;
        }
        best = Some(end);
    }
    best
}

fn break_at_space(remaining: &str, limit: usize) -> usize {
    if remaining[limit..].starts_with(' ') {
        return limit;
    }

    match remaining[..limit].rfind(' ') {
        Some(space) if space > 0 => space,
        // The first token alone exceeds the limit: keep it whole
        _ => remaining.find(' ').unwrap_or(remaining.len()),
    }
}
