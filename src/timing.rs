//! Word timing helpers: speech-mark parsing, offsetting and lookup

use serde::Deserialize;
use tracing::trace;

use crate::types::{Token, WordTiming};

/// One `word` line of a synthesis response's speech marks
#[derive(Debug, Clone, PartialEq)]
pub struct SpeechMark {
    pub word: String,
    pub start_ms: u64,
}

#[derive(Debug, Deserialize)]
struct RawMark {
    #[serde(rename = "type")]
    kind: String,
    time: f64,
    value: String,
}

/// Parse newline-delimited JSON speech marks.
///
/// Lines that are not valid JSON, or are not `word` marks with a numeric
/// `time` and a string `value`, are skipped.
pub fn parse_speech_marks(jsonl: &str) -> Vec<SpeechMark> {
    jsonl
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<RawMark>(line) {
            Ok(mark) if mark.kind == "word" && mark.time.is_finite() => Some(SpeechMark {
                word: mark.value,
                start_ms: mark.time.max(0.0) as u64,
            }),
            Ok(_) => None,
            Err(e) => {
                trace!(line = %line, error = %e, "Skipping malformed speech mark");
                None
            }
        })
        .collect()
}

/// Turn one chunk's marks into timings on the concatenated timeline.
///
/// Mark `i` becomes word `first_word_index + i`; each word ends where the next
/// one starts and the last one ends with the chunk audio.
pub fn chunk_timings(
    marks: &[SpeechMark],
    first_word_index: usize,
    offset_ms: u64,
    chunk_duration_ms: u64,
) -> Vec<WordTiming> {
    marks
        .iter()
        .enumerate()
        .map(|(i, mark)| {
            let end = marks
                .get(i + 1)
                .map(|next| next.start_ms)
                .unwrap_or(chunk_duration_ms.max(mark.start_ms));
            WordTiming {
                word_index: first_word_index + i,
                start_ms: offset_ms + mark.start_ms,
                end_ms: offset_ms + end,
            }
        })
        .collect()
}

/// Keep the timings of words that exist in the token list.
///
/// Marks past the last token are dropped rather than folded onto it, so word
/// indices stay unique. The last kept window is stretched over the dropped
/// ones to keep the audio tail covered.
pub fn align_to_tokens(timings: Vec<WordTiming>, tokens: &[Token]) -> Vec<WordTiming> {
    let tail_end = timings.iter().map(|t| t.end_ms).max();
    let mut aligned = sanitize(
        timings
            .into_iter()
            .filter(|t| t.word_index < tokens.len())
            .collect(),
    );

    if let (Some(last), Some(end)) = (aligned.last_mut(), tail_end) {
        last.end_ms = last.end_ms.max(end);
    }
    aligned
}

/// Sort by start time and keep the first timing of each word index
pub fn sanitize(mut timings: Vec<WordTiming>) -> Vec<WordTiming> {
    timings.sort_by_key(|t| t.start_ms);
    let mut seen = std::collections::HashSet::new();
    timings.retain(|t| seen.insert(t.word_index));
    timings
}

/// Sorted by start, no overlapping windows, no repeated word index
pub fn is_monotonic(timings: &[WordTiming]) -> bool {
    let mut seen = std::collections::HashSet::new();
    timings.iter().all(|t| seen.insert(t.word_index))
        && timings
            .windows(2)
            .all(|w| w[0].start_ms <= w[1].start_ms && w[0].end_ms <= w[1].start_ms)
}

/// Latest timing whose start is not after `time_ms`
pub fn active_timing(timings: &[WordTiming], time_ms: u64) -> Option<&WordTiming> {
    timings
        .iter()
        .filter(|t| t.start_ms <= time_ms)
        .max_by_key(|t| t.start_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_speech_marks_skips_malformed_lines() {
        let jsonl = concat!(
            "{\"type\":\"word\",\"time\":0,\"value\":\"Ginger\"}\n",
            "{not json\n",
            "{\"type\":\"sentence\",\"time\":0,\"value\":\"Ginger the giraffe.\"}\n",
            "\n",
            "{\"type\":\"word\",\"time\":\"late\",\"value\":\"the\"}\n",
            "{\"type\":\"word\",\"time\":412,\"value\":\"giraffe\"}\n",
        );

        let marks = parse_speech_marks(jsonl);
        assert_eq!(
            marks,
            vec![
                SpeechMark { word: "Ginger".to_string(), start_ms: 0 },
                SpeechMark { word: "giraffe".to_string(), start_ms: 412 },
            ]
        );
    }

    #[test]
    fn test_chunk_timings_offsets_and_ends() {
        let marks = vec![
            SpeechMark { word: "a".to_string(), start_ms: 0 },
            SpeechMark { word: "b".to_string(), start_ms: 250 },
            SpeechMark { word: "c".to_string(), start_ms: 600 },
        ];

        let timings = chunk_timings(&marks, 10, 5_000, 900);
        assert_eq!(
            timings,
            vec![
                WordTiming { word_index: 10, start_ms: 5_000, end_ms: 5_250 },
                WordTiming { word_index: 11, start_ms: 5_250, end_ms: 5_600 },
                WordTiming { word_index: 12, start_ms: 5_600, end_ms: 5_900 },
            ]
        );
        assert!(is_monotonic(&timings));
    }

    #[test]
    fn test_align_to_tokens_drops_extra_marks() {
        let tokens: Vec<Token> = ["Hello", "there."]
            .iter()
            .enumerate()
            .map(|(word_index, text)| Token { word_index, text: text.to_string() })
            .collect();
        let timings = vec![
            WordTiming { word_index: 0, start_ms: 0, end_ms: 300 },
            WordTiming { word_index: 1, start_ms: 300, end_ms: 500 },
            WordTiming { word_index: 2, start_ms: 500, end_ms: 900 },
        ];

        let aligned = align_to_tokens(timings, &tokens);

        assert_eq!(
            aligned,
            vec![
                WordTiming { word_index: 0, start_ms: 0, end_ms: 300 },
                WordTiming { word_index: 1, start_ms: 300, end_ms: 900 },
            ]
        );
        assert!(is_monotonic(&aligned));
        assert!(align_to_tokens(aligned, &[]).is_empty());
    }

    #[test]
    fn test_sanitize_sorts_and_dedups() {
        let timings = vec![
            WordTiming { word_index: 1, start_ms: 300, end_ms: 500 },
            WordTiming { word_index: 0, start_ms: 0, end_ms: 300 },
            WordTiming { word_index: 1, start_ms: 500, end_ms: 600 },
        ];
        let clean = sanitize(timings);
        assert_eq!(clean.len(), 2);
        assert!(is_monotonic(&clean));
        assert_eq!(clean[1].start_ms, 300);
    }

    #[test]
    fn test_active_timing_lookup() {
        let timings = vec![
            WordTiming { word_index: 0, start_ms: 100, end_ms: 400 },
            WordTiming { word_index: 1, start_ms: 400, end_ms: 900 },
        ];
        assert!(active_timing(&timings, 50).is_none());
        assert_eq!(active_timing(&timings, 100).map(|t| t.word_index), Some(0));
        assert_eq!(active_timing(&timings, 650).map(|t| t.word_index), Some(1));
        assert_eq!(active_timing(&timings, 5_000).map(|t| t.word_index), Some(1));
    }
}
