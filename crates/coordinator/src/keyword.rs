//! Deterministic keyword router, used when the model routing call fails.

use std::collections::BTreeMap;

use healmate_memory::KnowledgeDomain;
use healmate_tools::{LexiconClassifier, ToolName, ZodiacSign, diary::MAX_NOTE_CHARS};
use serde_json::json;

use crate::routing::{Action, RouteDecision};

pub const ZODIAC_FACT: &str = "zodiac_sign";

const RECORD_PHRASES: &[&str] = &["記錄心情", "記錄一下心情", "幫我記下", "幫我記錄", "record my mood"];
const TAROT_WORDS: &[&str] = &["抽牌", "塔羅", "占卜", "tarot"];
const FORTUNE_WORDS: &[&str] = &["運勢", "運氣", "horoscope"];
const DAY_WORDS: &[&str] = &["今天", "明天"];
const HISTORY_WORDS: &[&str] = &["心情紀錄", "心情記錄", "最近心情", "心情歷史", "mood history"];
const DISTRESS_WORDS: &[&str] = &[
    "難過", "傷心", "焦慮", "沮喪", "孤單", "好累", "生氣", "sad", "anxious",
];

pub const FALLBACK_REPLY: &str = "我在這裡陪著你。可以多告訴我一些你現在的狀況或想聊的事嗎？";

fn contains_any(text: &str, words: &[&str]) -> bool {
    words.iter().any(|w| text.contains(w))
}

/// Route `message` by keywords. `facts` supplies a remembered zodiac sign.
pub fn keyword_route(message: &str, facts: &BTreeMap<String, String>) -> RouteDecision {
    let lower = message.to_lowercase();

    if contains_any(&lower, RECORD_PHRASES) {
        let reading = LexiconClassifier::classify_text(message);
        if reading.reason.is_some() {
            let note: String = message.chars().take(MAX_NOTE_CHARS).collect();
            return RouteDecision::actions(
                vec![Action::required_tool(
                    ToolName::RecordMood,
                    json!({
                        "mood": reading.label,
                        "intensity": reading.intensity,
                        "note": note,
                    }),
                )],
                "Explicit request to record a mood",
                0.7,
            );
        }
    }

    if contains_any(&lower, TAROT_WORDS) || (message.contains('抽') && message.contains('牌')) {
        let spread = if message.contains("十張") || message.contains("凱爾特") {
            "ten-card-cross"
        } else if message.contains("三張") {
            "three-card"
        } else {
            "single"
        };
        return RouteDecision::actions(
            vec![Action::tool(ToolName::DrawTarot, json!({ "spread": spread }))],
            "Detected tarot request",
            0.75,
        );
    }

    // A named sign pairs with any day word; a remembered one needs an explicit ask.
    let fortune_asked = contains_any(&lower, FORTUNE_WORDS);
    let sign = match ZodiacSign::detect(message) {
        Some(sign) if fortune_asked || contains_any(&lower, DAY_WORDS) => Some(sign),
        Some(_) => None,
        None if fortune_asked => facts.get(ZODIAC_FACT).and_then(|s| ZodiacSign::parse(s)),
        None => None,
    };
    if let Some(sign) = sign {
        return RouteDecision::actions(
            vec![Action::tool(ToolName::LookupHoroscope, json!({ "sign": sign }))],
            "Detected horoscope request",
            0.7,
        );
    }

    if contains_any(&lower, HISTORY_WORDS) {
        return RouteDecision::actions(
            vec![Action::tool(ToolName::QueryMoodHistory, json!({}))],
            "Detected mood history request",
            0.7,
        );
    }

    if contains_any(&lower, DISTRESS_WORDS) {
        return RouteDecision::actions(
            vec![
                Action::tool(ToolName::ClassifyEmotion, json!({ "text": message })),
                Action::retrieve(message, Some(KnowledgeDomain::Coping)),
            ],
            "Detected emotional distress",
            0.6,
        );
    }

    RouteDecision {
        reasoning: "No keyword matched".into(),
        confidence: 0.3,
        ..RouteDecision::direct(FALLBACK_REPLY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::Route;

    fn actions(decision: &RouteDecision) -> &[Action] {
        match &decision.route {
            Route::Actions { actions } => actions,
            Route::Direct { .. } => panic!("expected actions"),
        }
    }

    #[test]
    fn test_tarot_spreads() {
        let none = BTreeMap::new();
        let decision = keyword_route("我想抽一張牌", &none);
        assert_eq!(
            actions(&decision),
            &[Action::tool(ToolName::DrawTarot, json!({"spread": "single"}))]
        );
        let decision = keyword_route("幫我用塔羅抽三張", &none);
        assert_eq!(
            actions(&decision),
            &[Action::tool(ToolName::DrawTarot, json!({"spread": "three-card"}))]
        );
        let decision = keyword_route("凱爾特十字占卜", &none);
        assert_eq!(
            actions(&decision),
            &[Action::tool(ToolName::DrawTarot, json!({"spread": "ten-card-cross"}))]
        );
    }

    #[test]
    fn test_horoscope_uses_remembered_sign() {
        let mut facts = BTreeMap::new();
        let decision = keyword_route("今天運勢如何", &facts);
        assert!(matches!(decision.route, Route::Direct { .. }));

        facts.insert(ZODIAC_FACT.to_string(), "leo".to_string());
        let decision = keyword_route("今天運勢如何", &facts);
        assert_eq!(
            actions(&decision),
            &[Action::tool(ToolName::LookupHoroscope, json!({"sign": "leo"}))]
        );

        let decision = keyword_route("雙魚座明天運氣", &facts);
        assert_eq!(
            actions(&decision),
            &[Action::tool(ToolName::LookupHoroscope, json!({"sign": "pisces"}))]
        );
    }

    #[test]
    fn test_distress_classifies_without_recording() {
        let decision = keyword_route("今天好難過", &BTreeMap::new());
        let names = decision.tool_names();
        assert_eq!(names, vec![ToolName::ClassifyEmotion]);
        assert!(actions(&decision).iter().any(|a| matches!(
            a,
            Action::Retrieve { domain: Some(KnowledgeDomain::Coping), .. }
        )));
    }

    #[test]
    fn test_explicit_record_is_required() {
        let decision = keyword_route("幫我記下，今天很焦慮", &BTreeMap::new());
        match &actions(&decision)[0] {
            Action::Tool {
                name,
                arguments,
                required,
            } => {
                assert_eq!(*name, ToolName::RecordMood);
                assert!(*required);
                assert_eq!(arguments["mood"], "anxious");
            }
            other => panic!("unexpected action {other:?}"),
        }
    }

    #[test]
    fn test_history_and_default() {
        let decision = keyword_route("看一下我最近心情", &BTreeMap::new());
        assert_eq!(decision.tool_names(), vec![ToolName::QueryMoodHistory]);

        let decision = keyword_route("你好", &BTreeMap::new());
        assert_eq!(decision.route, Route::Direct { reply: FALLBACK_REPLY.into() });
    }
}
