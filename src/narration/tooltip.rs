//! Short narrations for word cards

use super::NarrationProvider;
use crate::types::{NarrationError, PrepareInput, Token};

/// Spoken content of a word card
#[derive(Debug, Clone, Default)]
pub struct WordInsight {
    pub word: String,
    pub pronunciation: Option<String>,
    pub definition: String,
    pub examples: Vec<String>,
}

impl WordInsight {
    /// Non-empty parts in speaking order
    pub fn parts(&self) -> Vec<String> {
        let pronunciation = self
            .pronunciation
            .as_ref()
            .filter(|p| !p.is_empty())
            .map(|p| format!("Pronounced: {}", p));

        std::iter::once(self.word.clone())
            .chain(pronunciation)
            .chain(std::iter::once(self.definition.clone()))
            .chain(self.examples.iter().cloned())
            .filter(|part| !part.trim().is_empty())
            .collect()
    }
}

/// One token per part, so highlighting moves part by part
fn part_input(content_id: &str, parts: Vec<String>, separator: &str) -> PrepareInput {
    PrepareInput {
        content_id: content_id.to_string(),
        raw_text: parts.join(separator),
        tokens: parts
            .into_iter()
            .enumerate()
            .map(|(word_index, text)| Token { word_index, text })
            .collect(),
        speed: Some(1.0),
    }
}

/// Speak word, pronunciation, definition and examples in sequence
pub async fn play_word_insight(
    insight: &WordInsight,
    provider: &mut dyn NarrationProvider,
) -> Result<(), NarrationError> {
    let input = part_input("tooltip", insight.parts(), ". ");
    provider.prepare(&input).await?;
    provider.play().await;
    Ok(())
}

pub async fn play_word_only(
    word: &str,
    provider: &mut dyn NarrationProvider,
) -> Result<(), NarrationError> {
    let input = part_input("tooltip-word", vec![word.to_string()], "");
    provider.prepare(&input).await?;
    provider.play().await;
    Ok(())
}

pub async fn play_sentence(
    sentence: &str,
    provider: &mut dyn NarrationProvider,
) -> Result<(), NarrationError> {
    let input = part_input("tooltip-sentence", vec![sentence.to_string()], "");
    provider.prepare(&input).await?;
    provider.play().await;
    Ok(())
}

pub fn stop_tooltip(provider: &mut dyn NarrationProvider) {
    provider.stop();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::narration::speech::SpeechProvider;
    use crate::test_support::FakeSpeech;

    fn insight() -> WordInsight {
        WordInsight {
            word: "curious".to_string(),
            pronunciation: Some("KYOOR-ee-uhs".to_string()),
            definition: "Wanting to know more".to_string(),
            examples: vec!["The curious cat peeked in".to_string(), String::new()],
        }
    }

    #[test]
    fn test_parts_skip_empty() {
        assert_eq!(
            insight().parts(),
            vec![
                "curious",
                "Pronounced: KYOOR-ee-uhs",
                "Wanting to know more",
                "The curious cat peeked in"
            ]
        );

        let bare = WordInsight {
            word: "cat".to_string(),
            ..WordInsight::default()
        };
        assert_eq!(bare.parts(), vec!["cat"]);
    }

    #[tokio::test]
    async fn test_play_word_insight_speaks_joined_parts() {
        let speech = FakeSpeech::new(true);
        let mut provider = SpeechProvider::new(Box::new(speech.clone()));

        play_word_insight(&insight(), &mut provider).await.unwrap();

        assert_eq!(
            speech.last_text().as_deref(),
            Some("curious. Pronounced: KYOOR-ee-uhs. Wanting to know more. The curious cat peeked in")
        );
    }

    #[tokio::test]
    async fn test_word_and_sentence_then_stop() {
        let speech = FakeSpeech::new(true);
        let mut provider = SpeechProvider::new(Box::new(speech.clone()));

        play_word_only("cat", &mut provider).await.unwrap();
        play_sentence("The cat sat.", &mut provider).await.unwrap();
        assert_eq!(speech.spoken_texts(), vec!["cat", "The cat sat."]);

        stop_tooltip(&mut provider);
        assert!(speech.cancel_count() >= 1);
    }
}
