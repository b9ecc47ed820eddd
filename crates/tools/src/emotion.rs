//! Emotion classification for free text.

use std::sync::Arc;

use async_trait::async_trait;
use healmate_common::Result;
use healmate_llm::{ChatMessage, LlmClient, LlmRequest};
use healmate_memory::MoodLabel;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmotionReading {
    pub label: MoodLabel,
    /// In [0, 1].
    pub confidence: f32,
    /// 1 (faint) to 10 (overwhelming).
    pub intensity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[async_trait]
pub trait EmotionClassifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<EmotionReading>;
}

const LEXICON: &[(MoodLabel, &[&str])] = &[
    (MoodLabel::Sad, &["難過", "傷心", "想哭", "心痛", "失落", "sad", "upset"]),
    (MoodLabel::Anxious, &["焦慮", "緊張", "擔心", "害怕", "不安", "anxious", "worried", "nervous"]),
    (MoodLabel::Angry, &["生氣", "憤怒", "火大", "氣死", "angry", "furious"]),
    (MoodLabel::Frustrated, &["沮喪", "挫折", "無力", "煩", "frustrated"]),
    (MoodLabel::Lonely, &["孤單", "寂寞", "孤獨", "lonely"]),
    (MoodLabel::Tired, &["好累", "疲憊", "疲倦", "累了", "沒力", "tired", "exhausted"]),
    (MoodLabel::Confused, &["困惑", "迷惘", "不知道該", "confused", "lost"]),
    (MoodLabel::Happy, &["開心", "快樂", "高興", "好棒", "happy", "glad"]),
    (MoodLabel::Excited, &["興奮", "期待", "excited"]),
    (MoodLabel::Grateful, &["感謝", "感恩", "謝謝", "grateful", "thankful"]),
    (MoodLabel::Calm, &["平靜", "放鬆", "安心", "calm", "relaxed"]),
];

const INTENSIFIERS: &[&str] = &["好", "很", "超", "非常", "太", "真的", "very", "so ", "really"];

/// Keyword classifier; deterministic and offline.
pub struct LexiconClassifier;

impl LexiconClassifier {
    pub fn classify_text(text: &str) -> EmotionReading {
        let lower = text.to_lowercase();
        let best = LEXICON
            .iter()
            .map(|(label, words)| {
                let hits = words.iter().filter(|w| lower.contains(*w)).count();
                (*label, hits)
            })
            .filter(|(_, hits)| *hits > 0)
            .max_by_key(|(_, hits)| *hits);

        let Some((label, hits)) = best else {
            return EmotionReading {
                label: MoodLabel::Calm,
                confidence: 0.3,
                intensity: 3,
                reason: None,
            };
        };

        let boost = INTENSIFIERS.iter().filter(|w| lower.contains(*w)).count() as u8;
        EmotionReading {
            label,
            confidence: (0.5 + 0.15 * hits as f32).min(0.9),
            intensity: (5 + 2 * boost).min(10),
            reason: Some("keyword match".to_string()),
        }
    }
}

#[async_trait]
impl EmotionClassifier for LexiconClassifier {
    async fn classify(&self, text: &str) -> Result<EmotionReading> {
        Ok(Self::classify_text(text))
    }
}

const EMOTION_SYSTEM_PROMPT: &str = r#"You are an emotion analysis assistant. Read the user's message (often Traditional Chinese) and name the single dominant emotion.

Respond with ONLY a JSON object:
{"label": "<one of: happy, calm, grateful, excited, sad, anxious, angry, frustrated, confused, lonely, tired>", "confidence": <0.0-1.0>, "intensity": <1-10>, "reason": "<one short sentence>"}"#;

#[derive(Deserialize)]
struct RawReading {
    label: String,
    #[serde(default)]
    confidence: f32,
    #[serde(default = "default_intensity")]
    intensity: i64,
    #[serde(default)]
    reason: Option<String>,
}

fn default_intensity() -> i64 {
    5
}

/// LLM-backed classifier; falls back to the lexicon on malformed output.
pub struct LlmEmotionClassifier {
    client: Arc<dyn LlmClient>,
}

impl LlmEmotionClassifier {
    pub fn new(client: Arc<dyn LlmClient>) -> Self {
        Self { client }
    }

    fn parse(content: &str) -> Option<EmotionReading> {
        let start = content.find('{')?;
        let end = content.rfind('}')?;
        let raw: RawReading = serde_json::from_str(content.get(start..=end)?).ok()?;
        Some(EmotionReading {
            label: MoodLabel::parse(&raw.label)?,
            confidence: if raw.confidence.is_finite() {
                raw.confidence.clamp(0.0, 1.0)
            } else {
                0.0
            },
            intensity: raw.intensity.clamp(1, 10) as u8,
            reason: raw.reason.filter(|r| !r.trim().is_empty()),
        })
    }
}

#[async_trait]
impl EmotionClassifier for LlmEmotionClassifier {
    async fn classify(&self, text: &str) -> Result<EmotionReading> {
        let request = LlmRequest::new(EMOTION_SYSTEM_PROMPT, vec![ChatMessage::user(text)])
            .with_temperature(0.0)
            .with_max_tokens(200)
            .json();

        let response = self.client.complete(request).await?;
        match Self::parse(&response.content) {
            Some(reading) => {
                debug!(label = %reading.label, confidence = reading.confidence, "Classified emotion");
                Ok(reading)
            }
            None => {
                warn!(
                    response_len = response.content.len(),
                    "Unparseable emotion classification, using lexicon"
                );
                Ok(LexiconClassifier::classify_text(text))
            }
        }
    }
}
