//! World generation over an LLM
//!
//! Asks the model for a fixed set of usage contexts ("worlds") per canonical
//! phrase and validates the JSON it returns.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use nko_core::{CanonicalPhrase, LlmClient, NkoError, Result, World, WorldGenerator};

/// Variant names requested, in order
pub const WORLD_VARIANTS: [&str; 5] = ["everyday", "formal", "storytelling", "proverb", "educational"];

/// Generates worlds by prompting an LLM client
pub struct LlmWorldGenerator {
    llm: Arc<dyn LlmClient>,
    worlds_per_phrase: usize,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WorldsPayload {
    Wrapped { worlds: Vec<World> },
    Bare(Vec<World>),
}

impl LlmWorldGenerator {
    /// Create a generator
    pub fn new(llm: Arc<dyn LlmClient>, worlds_per_phrase: usize) -> Self {
        Self {
            llm,
            worlds_per_phrase,
        }
    }

    /// Variant names requested for one phrase
    fn variants(&self) -> Vec<&'static str> {
        WORLD_VARIANTS
            .iter()
            .cycle()
            .take(self.worlds_per_phrase)
            .copied()
            .collect()
    }

    /// Build the generation prompt
    pub fn build_prompt(&self, phrase: &CanonicalPhrase) -> String {
        let mut prompt = String::new();
        prompt.push_str(
            "You are helping build learning material for the N'Ko script (Manding languages).\n\n",
        );
        prompt.push_str(&format!("Phrase (N'Ko): {}\n", phrase.nko_text));
        if let Some(latin) = &phrase.latin_transliteration {
            prompt.push_str(&format!("Transliteration: {latin}\n"));
        }
        if let Some(english) = &phrase.english_translation {
            prompt.push_str(&format!("Translation: {english}\n"));
        }
        prompt.push_str(&format!(
            "\nWrite exactly {} usage contexts, one per variant, in this order: {}.\n",
            self.worlds_per_phrase,
            self.variants().join(", ")
        ));
        prompt.push_str(
            "Respond with JSON only: {\"worlds\": [{\"variant\": \"...\", \"scenario\": \"...\", \
             \"nko_sentence\": \"...\", \"translation\": \"...\"}]}\n",
        );
        prompt
    }

    /// Parse and validate the model output
    pub fn parse_worlds(&self, raw: &str) -> Result<Vec<World>> {
        let body = strip_code_fence(raw);
        let payload: WorldsPayload = serde_json::from_str(body)
            .map_err(|e| NkoError::Llm(format!("Unparsable world payload: {e}")))?;

        let worlds = match payload {
            WorldsPayload::Wrapped { worlds } => worlds,
            WorldsPayload::Bare(worlds) => worlds,
        };

        if worlds.len() != self.worlds_per_phrase {
            return Err(NkoError::Llm(format!(
                "Expected {} worlds, got {}",
                self.worlds_per_phrase,
                worlds.len()
            )));
        }
        if let Some(empty) = worlds.iter().position(|w| w.nko_sentence.trim().is_empty()) {
            return Err(NkoError::Llm(format!("World {} has no N'Ko sentence", empty + 1)));
        }

        Ok(worlds)
    }
}

#[async_trait]
impl WorldGenerator for LlmWorldGenerator {
    async fn generate(&self, phrase: &CanonicalPhrase) -> Result<Vec<World>> {
        let prompt = self.build_prompt(phrase);
        let raw = self.llm.generate(&prompt).await?;
        let worlds = self.parse_worlds(&raw)?;
        tracing::debug!(
            phrase = %phrase.nko_text,
            llm = self.llm.name(),
            worlds = worlds.len(),
            "Generated worlds"
        );
        Ok(worlds)
    }
}

/// Remove a surrounding Markdown code fence, if present
fn strip_code_fence(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // drop the info string ("json") up to the first newline
    let rest = match rest.find('\n') {
        Some(newline) => &rest[newline + 1..],
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    struct CannedLlm {
        reply: String,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl LlmClient for CannedLlm {
        async fn generate(&self, prompt: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }

        fn name(&self) -> &str {
            "canned"
        }
    }

    fn phrase() -> CanonicalPhrase {
        CanonicalPhrase {
            nko_text: "ߒߞߏ".to_string(),
            latin_transliteration: Some("n'ko".to_string()),
            english_translation: Some("I say".to_string()),
            confidence: 0.9,
            occurrences: 2,
            sources: BTreeSet::new(),
            variants: Vec::new(),
        }
    }

    fn worlds_json(count: usize) -> String {
        let worlds: Vec<String> = (0..count)
            .map(|i| {
                format!(
                    r#"{{"variant":"{}","scenario":"s{i}","nko_sentence":"ߒߞߏ {i}","translation":"t{i}"}}"#,
                    WORLD_VARIANTS[i % 5]
                )
            })
            .collect();
        format!("{{\"worlds\":[{}]}}", worlds.join(","))
    }

    fn generator(worlds: usize) -> LlmWorldGenerator {
        LlmWorldGenerator::new(
            Arc::new(CannedLlm {
                reply: String::new(),
                prompts: Mutex::new(Vec::new()),
            }),
            worlds,
        )
    }

    #[test]
    fn test_prompt_mentions_phrase_and_count() {
        let prompt = generator(5).build_prompt(&phrase());
        assert!(prompt.contains("ߒߞߏ"));
        assert!(prompt.contains("Transliteration: n'ko"));
        assert!(prompt.contains("exactly 5"));
        assert!(prompt.contains("everyday, formal, storytelling, proverb, educational"));
    }

    #[test]
    fn test_parse_wrapped_and_fenced() {
        let generator = generator(5);
        assert_eq!(generator.parse_worlds(&worlds_json(5)).unwrap().len(), 5);

        let fenced = format!("```json\n{}\n```", worlds_json(5));
        assert_eq!(generator.parse_worlds(&fenced).unwrap().len(), 5);
    }

    #[test]
    fn test_parse_bare_array() {
        let generator = generator(1);
        let raw = r#"[{"variant":"everyday","scenario":"x","nko_sentence":"ߒ","translation":"y"}]"#;
        assert_eq!(generator.parse_worlds(raw).unwrap()[0].variant, "everyday");
    }

    #[test]
    fn test_parse_rejects_wrong_count_and_garbage() {
        let generator = generator(5);
        assert!(matches!(
            generator.parse_worlds(&worlds_json(4)),
            Err(NkoError::Llm(_))
        ));
        assert!(matches!(
            generator.parse_worlds("not json"),
            Err(NkoError::Llm(_))
        ));
    }

    #[tokio::test]
    async fn test_generate_uses_llm() {
        let llm = Arc::new(CannedLlm {
            reply: worlds_json(5),
            prompts: Mutex::new(Vec::new()),
        });
        let generator = LlmWorldGenerator::new(llm.clone(), 5);

        let worlds = generator.generate(&phrase()).await.unwrap();
        assert_eq!(worlds.len(), 5);
        assert_eq!(llm.prompts.lock().unwrap().len(), 1);
    }
}
