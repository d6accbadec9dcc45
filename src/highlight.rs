//! Maps playback position to the word that should be highlighted
//!
//! The derivation is pure: the same [`HighlightInput`] always yields the same
//! word, so it can be recomputed on every tick without hidden state.

use crate::timing::active_timing;
use crate::types::{PlaybackState, WordTiming};

/// Everything the highlighter needs to pick a word
#[derive(Debug, Clone, Copy)]
pub struct HighlightInput<'a> {
    pub state: PlaybackState,
    pub current_time_sec: f64,
    pub word_timings: Option<&'a [WordTiming]>,
    pub token_count: usize,
    pub duration_ms: Option<u64>,
    /// Last index reported by a native word-boundary callback
    pub boundary_word_index: Option<usize>,
}

/// Word index to highlight now, or `None` when nothing should be highlighted.
///
/// Priority: boundary callback, then the timing table, then a proportional
/// estimate from the duration.
pub fn highlighted_word(input: &HighlightInput<'_>) -> Option<usize> {
    if input.token_count == 0 {
        return None;
    }

    let fresh_start = input.state == PlaybackState::Stopped
        && input.current_time_sec <= 0.0
        && input.boundary_word_index.is_none();
    if fresh_start {
        return None;
    }

    let last = input.token_count - 1;

    if let Some(boundary) = input.boundary_word_index {
        return Some(boundary.min(last));
    }

    let elapsed_ms = (input.current_time_sec.max(0.0) * 1000.0) as u64;

    if let Some(timings) = input.word_timings.filter(|t| !t.is_empty()) {
        let index = active_timing(timings, elapsed_ms)
            .or_else(|| timings.iter().min_by_key(|t| t.start_ms))
            .map(|t| t.word_index)
            .unwrap_or(0);
        return Some(index.min(last));
    }

    match input.duration_ms {
        Some(duration) if duration > 0 => {
            let ms_per_word = duration as f64 / input.token_count as f64;
            let estimate = (elapsed_ms as f64 / ms_per_word).floor() as usize;
            Some(estimate.min(last))
        }
        _ => Some(0),
    }
}

/// Duration estimate for text read at `words_per_minute`
pub fn estimated_duration_ms(token_count: usize, words_per_minute: u32) -> Option<u64> {
    if words_per_minute == 0 || token_count == 0 {
        return None;
    }
    Some((token_count as u64 * 60_000) / words_per_minute as u64)
}
