//! Integration tests for the turn orchestrator.
//!
//! The model gateway is scripted, so these run without any LLM, embedding
//! service or vector database.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use healmate_common::{
    HealmateError, Result, RetryPolicy, RouteKind, ToolCallStatus, Turn, TurnInput,
};
use healmate_coordinator::{
    Action, FinalizeInput, HEALTH_DISCLAIMER, ModelGateway, Orchestrator, OrchestratorConfig,
    PromptContext, RouteDecision, ZODIAC_FACT, keyword_route,
};
use healmate_memory::{
    Embedder, InMemoryKnowledgeStore, InMemoryMoodRepository, KnowledgeDomain, MemoryConfig,
    MemoryStore,
    RetrievalComposer, RetrievalConfig, Summarizer,
};
use healmate_tools::{
    AlmanacProvider, CachedHoroscopeProvider, DECK_SIZE, EmotionClassifier, EmotionReading,
    LexiconClassifier, SequentialSeedSource, ToolName, ToolRegistry, tarot,
};
use serde_json::json;

// ============================================================================
// Test doubles
// ============================================================================

enum Step {
    Decide(RouteDecision),
    Fail,
}

/// Routes from a script, falling back to keyword routing once it runs out.
/// Finalize cites every passage and describes every tool result.
#[derive(Default)]
struct StubGateway {
    script: parking_lot::Mutex<VecDeque<Step>>,
    fail_finalize: bool,
    delay: Duration,
    route_calls: AtomicU32,
    finalize_calls: AtomicU32,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
    last_message: parking_lot::Mutex<String>,
    finalize_passages: AtomicU32,
}

impl StubGateway {
    fn scripted(steps: Vec<Step>) -> Self {
        Self {
            script: parking_lot::Mutex::new(steps.into()),
            ..Default::default()
        }
    }

    fn model_calls(&self) -> u32 {
        self.route_calls.load(Ordering::SeqCst) + self.finalize_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelGateway for StubGateway {
    async fn route(&self, ctx: &PromptContext) -> Result<RouteDecision> {
        self.route_calls.fetch_add(1, Ordering::SeqCst);
        *self.last_message.lock() = ctx.message.clone();

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let step = self.script.lock().pop_front();
        match step {
            Some(Step::Decide(decision)) => Ok(decision),
            Some(Step::Fail) => Err(HealmateError::upstream("gateway", "connection refused")),
            None => Ok(keyword_route(&ctx.message, &ctx.facts)),
        }
    }

    async fn finalize(&self, _ctx: &PromptContext, input: &FinalizeInput) -> Result<String> {
        self.finalize_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_finalize {
            return Err(HealmateError::rate_limited("gateway", Some(30_000)));
        }
        self.finalize_passages
            .store(input.passages.len() as u32, Ordering::SeqCst);
        let mut parts: Vec<String> = input
            .tool_results
            .iter()
            .filter_map(|r| r.output().map(|o| o.describe()))
            .collect();
        parts.extend(input.passages.iter().map(|p| format!("[{}]", p.source_id)));
        Ok(parts.join("\n"))
    }
}

struct JoinSummarizer;

#[async_trait]
impl Summarizer for JoinSummarizer {
    async fn summarize(&self, previous: &str, evicted: &[Turn]) -> Result<String> {
        let mut parts = vec![previous.to_string()];
        parts.extend(evicted.iter().map(|t| t.user_text.clone()));
        Ok(parts.join(" "))
    }
}

/// One dimension per tarot card (matched by English name) plus one for
/// distress words. Unrelated text embeds to the zero vector.
struct StubEmbedder;

const COPING_DIM: usize = DECK_SIZE;
const COPING_WORDS: &[&str] = &["難過", "焦慮", "sad", "coping"];

#[async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut v = vec![0.0; DECK_SIZE + 1];
        for card in tarot::deck() {
            if text.contains(card.name_en.as_str()) {
                v[card.id as usize] = 1.0;
            }
        }
        if COPING_WORDS.iter().any(|w| text.contains(w)) {
            v[COPING_DIM] = 1.0;
        }
        Ok(v)
    }

    fn dimension(&self) -> usize {
        DECK_SIZE + 1
    }
}

struct StalledSummarizer;

#[async_trait]
impl Summarizer for StalledSummarizer {
    async fn summarize(&self, _previous: &str, _evicted: &[Turn]) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(600)).await;
        Ok(String::new())
    }
}

struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _previous: &str, _evicted: &[Turn]) -> Result<String> {
        Err(HealmateError::upstream("summarizer", "model offline"))
    }
}

struct FailingClassifier;

#[async_trait]
impl EmotionClassifier for FailingClassifier {
    async fn classify(&self, _text: &str) -> Result<EmotionReading> {
        Err(HealmateError::upstream("emotion", "model offline"))
    }
}

async fn seeded_knowledge() -> Arc<InMemoryKnowledgeStore> {
    let store = Arc::new(InMemoryKnowledgeStore::new());
    for card in tarot::deck() {
        let text = format!("{}: {} 的牌義", card.name_en, card.name_zh);
        let embedding = StubEmbedder.embed(&text).await.unwrap();
        store.insert(format!("tarot-{}", card.id), text, Some("tarot"), embedding);
    }
    let text = "難過或焦慮時，試試 4-7-8 呼吸法，並寫下此刻的感受。";
    let embedding = StubEmbedder.embed(text).await.unwrap();
    store.insert("coping-breathing", text, Some("coping"), embedding);
    store
}

struct Harness {
    orchestrator: Arc<Orchestrator>,
    gateway: Arc<StubGateway>,
    moods: Arc<InMemoryMoodRepository>,
}

async fn harness_with(
    gateway: StubGateway,
    config: OrchestratorConfig,
    classifier: Arc<dyn EmotionClassifier>,
) -> Harness {
    let memory_config = MemoryConfig {
        window_size: config.window_size,
        ..Default::default()
    };
    harness_with_memory(
        gateway,
        config,
        classifier,
        memory_config,
        Arc::new(JoinSummarizer),
    )
    .await
}

async fn harness_with_memory(
    gateway: StubGateway,
    config: OrchestratorConfig,
    classifier: Arc<dyn EmotionClassifier>,
    memory_config: MemoryConfig,
    summarizer: Arc<dyn Summarizer>,
) -> Harness {
    let gateway = Arc::new(gateway);
    let moods = Arc::new(InMemoryMoodRepository::new());
    let memory = Arc::new(MemoryStore::new(memory_config, summarizer).unwrap());
    let tools = Arc::new(
        ToolRegistry::new(
            moods.clone(),
            Arc::new(CachedHoroscopeProvider::new(AlmanacProvider)),
            classifier,
        )
        .with_seed_source(Arc::new(SequentialSeedSource::new(7)))
        .with_timeout(Duration::from_millis(config.tool_timeout_ms))
        .with_retry(RetryPolicy::none()),
    );
    let retrieval = Arc::new(RetrievalComposer::new(
        Arc::new(StubEmbedder),
        seeded_knowledge().await,
        RetrievalConfig {
            retry: RetryPolicy::none(),
            ..Default::default()
        },
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        config,
        gateway.clone(),
        memory,
        tools,
        retrieval,
    ));
    Harness {
        orchestrator,
        gateway,
        moods,
    }
}

async fn harness(gateway: StubGateway) -> Harness {
    harness_with(
        gateway,
        OrchestratorConfig::default(),
        Arc::new(LexiconClassifier),
    )
    .await
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_tarot_turn_cites_drawn_card() {
    let h = harness(StubGateway::default()).await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "我想抽一張牌"))
        .await
        .unwrap();

    assert_eq!(reply.route, RouteKind::Actions);
    assert!(!reply.degraded);
    assert_eq!(reply.tool_calls.len(), 1);
    let call = &reply.tool_calls[0];
    assert_eq!(call.tool, "draw-tarot");
    assert_eq!(call.status, ToolCallStatus::Succeeded);
    assert_eq!(call.idempotency_key, format!("u1:{}:draw-tarot", reply.turn_id));

    let card_id = call.output["cards"][0]["card_id"].as_u64().unwrap();
    let citation = format!("tarot-{card_id}");
    assert!(reply.citations.contains(&citation));
    assert!(reply.reply.contains(&format!("[{citation}]")));
    assert!(reply.reply.contains("你抽到的牌"));

    assert_eq!(h.gateway.model_calls(), 2);
}

#[tokio::test]
async fn test_sad_turn_grounds_on_coping_without_recording() {
    let h = harness(StubGateway::default()).await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "今天好難過"))
        .await
        .unwrap();

    assert_eq!(reply.route, RouteKind::Actions);
    let tools: Vec<&str> = reply.tool_calls.iter().map(|c| c.tool.as_str()).collect();
    assert_eq!(tools, vec!["classify-emotion"]);
    assert_eq!(reply.tool_calls[0].output["label"], "sad");
    assert!(reply.citations.contains(&"coping-breathing".to_string()));
    assert_eq!(h.moods.count("u1"), 0);
    assert_eq!(h.gateway.model_calls(), 2);
}

#[tokio::test]
async fn test_direct_route_uses_one_model_call() {
    let h = harness(StubGateway::scripted(vec![Step::Decide(
        RouteDecision::direct("你好，今天過得如何？"),
    )]))
    .await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "嗨"))
        .await
        .unwrap();

    assert_eq!(reply.route, RouteKind::Direct);
    assert_eq!(reply.reply, "你好，今天過得如何？");
    assert!(reply.tool_calls.is_empty());
    assert!(reply.citations.is_empty());
    assert_eq!(h.gateway.route_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.gateway.finalize_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_routing_failure_falls_back_to_keywords() {
    let h = harness(StubGateway::scripted(vec![Step::Fail])).await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "幫我抽塔羅"))
        .await
        .unwrap();

    assert_eq!(reply.route, RouteKind::Fallback);
    assert!(reply.degraded);
    assert_eq!(reply.tool_calls[0].tool, "draw-tarot");

    let session = h.orchestrator.memory().load_session("u1").await.unwrap();
    assert_eq!(session.window.len(), 1);
    assert_eq!(session.window[0].route, RouteKind::Fallback);
}

#[tokio::test]
async fn test_finalize_failure_renders_template() {
    let h = harness(StubGateway {
        fail_finalize: true,
        ..Default::default()
    })
    .await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "我想抽一張牌"))
        .await
        .unwrap();

    assert!(reply.degraded);
    assert!(reply.reply.contains("你抽到的牌"));
    assert!(reply.reply.contains("參考資料 [tarot-"));
    assert_eq!(h.gateway.model_calls(), 2);
}

#[tokio::test]
async fn test_optional_tool_failure_degrades() {
    let h = harness_with(
        StubGateway::scripted(vec![Step::Decide(RouteDecision::actions(
            vec![
                Action::tool(ToolName::ClassifyEmotion, json!({"text": "心情不好"})),
                Action::tool(ToolName::DrawTarot, json!({})),
            ],
            "emotion and tarot",
            0.8,
        ))]),
        OrchestratorConfig::default(),
        Arc::new(FailingClassifier),
    )
    .await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "心情不好，抽張牌吧"))
        .await
        .unwrap();

    assert!(reply.degraded);
    assert_eq!(reply.tool_calls.len(), 2);
    assert_eq!(reply.tool_calls[0].status, ToolCallStatus::Failed);
    assert!(reply.tool_calls[0].error.is_some());
    assert_eq!(reply.tool_calls[1].status, ToolCallStatus::Succeeded);
}

#[tokio::test]
async fn test_required_tool_failure_aborts_turn() {
    let h = harness_with(
        StubGateway::scripted(vec![Step::Decide(RouteDecision::actions(
            vec![Action::required_tool(
                ToolName::ClassifyEmotion,
                json!({"text": "心情不好"}),
            )],
            "classification required",
            0.8,
        ))]),
        OrchestratorConfig::default(),
        Arc::new(FailingClassifier),
    )
    .await;

    let err = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "心情不好"))
        .await
        .unwrap_err();

    match err {
        HealmateError::RequiredToolFailed { tool, .. } => assert_eq!(tool, "classify-emotion"),
        other => panic!("unexpected error {other:?}"),
    }
    let session = h.orchestrator.memory().load_session("u1").await.unwrap();
    assert!(session.window.is_empty());
    assert_eq!(h.gateway.finalize_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_invalid_required_arguments_surface_as_validation() {
    let h = harness(StubGateway::scripted(vec![Step::Decide(RouteDecision::actions(
        vec![Action::required_tool(
            ToolName::RecordMood,
            json!({"mood": "sad", "intensity": 42}),
        )],
        "record",
        0.9,
    ))]))
    .await;

    let err = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "幫我記下"))
        .await
        .unwrap_err();

    assert!(matches!(err, HealmateError::Validation(_)));
    assert_eq!(h.moods.count("u1"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_turn_deadline_leaves_window_unchanged() {
    let h = harness_with(
        StubGateway {
            delay: Duration::from_secs(5),
            ..Default::default()
        },
        OrchestratorConfig {
            turn_deadline_ms: 1_000,
            ..Default::default()
        },
        Arc::new(LexiconClassifier),
    )
    .await;

    let err = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "我想抽一張牌"))
        .await
        .unwrap_err();

    assert!(matches!(err, HealmateError::TurnTimeout(1_000)));
    let session = h.orchestrator.memory().load_session("u1").await.unwrap();
    assert!(session.window.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_same_session_turns_serialize() {
    let h = harness(StubGateway {
        delay: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    let a = h.orchestrator.handle_turn(TurnInput::text("u1", "你好"));
    let b = h.orchestrator.handle_turn(TurnInput::text("u1", "還在嗎"));
    let (a, b) = tokio::join!(a, b);
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.turn_id, b.turn_id);
    assert_eq!(h.gateway.max_in_flight.load(Ordering::SeqCst), 1);

    let session = h.orchestrator.memory().load_session("u1").await.unwrap();
    let ids: Vec<u64> = session.window.iter().map(|t| t.id).collect();
    assert_eq!(ids.len(), 2);
    assert!(ids[0] < ids[1]);
}

#[tokio::test(start_paused = true)]
async fn test_different_sessions_run_concurrently() {
    let h = harness(StubGateway {
        delay: Duration::from_millis(200),
        ..Default::default()
    })
    .await;

    let a = h.orchestrator.handle_turn(TurnInput::text("u1", "你好"));
    let b = h.orchestrator.handle_turn(TurnInput::text("u2", "你好"));
    let (a, b) = tokio::join!(a, b);
    a.unwrap();
    b.unwrap();

    assert_eq!(h.gateway.max_in_flight.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_window_stays_bounded_and_summarized() {
    let h = harness_with(
        StubGateway::default(),
        OrchestratorConfig {
            window_size: 3,
            prompt_turns: 2,
            ..Default::default()
        },
        Arc::new(LexiconClassifier),
    )
    .await;

    for i in 0..5 {
        h.orchestrator
            .handle_turn(TurnInput::text("u1", format!("第{i}句")))
            .await
            .unwrap();
    }

    let session = h.orchestrator.memory().load_session("u1").await.unwrap();
    assert_eq!(session.window.len(), 3);
    assert_eq!(session.evicted_turns, 2);
    assert!(session.summary.contains("第0句"));
    assert!(session.summary.contains("第1句"));
    assert_eq!(session.window[0].user_text, "第2句");
}

#[tokio::test]
async fn test_health_reply_gets_disclaimer_and_cap() {
    let h = harness_with(
        StubGateway::scripted(vec![
            Step::Decide(RouteDecision::direct("多休息、多喝水。")),
            Step::Decide(RouteDecision::direct("好".repeat(200))),
            Step::Decide(RouteDecision::direct("好".repeat(200))),
        ]),
        OrchestratorConfig {
            reply_char_limit: 60,
            ..Default::default()
        },
        Arc::new(LexiconClassifier),
    )
    .await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "打完疫苗要注意什麼"))
        .await
        .unwrap();
    assert!(reply.reply.starts_with("多休息"));
    assert!(reply.reply.ends_with(HEALTH_DISCLAIMER));

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "說點什麼"))
        .await
        .unwrap();
    assert_eq!(reply.reply.chars().count(), 60);

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "我生病了"))
        .await
        .unwrap();
    assert!(reply.reply.chars().count() <= 60);
    assert!(reply.reply.ends_with(HEALTH_DISCLAIMER));
}

#[tokio::test]
async fn test_remembered_sign_fills_horoscope_lookup() {
    let h = harness(StubGateway::scripted(vec![
        Step::Decide(RouteDecision::direct("很高興認識你！")),
        Step::Decide(RouteDecision::actions(
            vec![Action::tool(ToolName::LookupHoroscope, json!({}))],
            "horoscope",
            0.9,
        )),
    ]))
    .await;

    h.orchestrator
        .handle_turn(TurnInput::text("u1", "我是獅子座的"))
        .await
        .unwrap();
    let session = h.orchestrator.memory().load_session("u1").await.unwrap();
    assert_eq!(session.fact(ZODIAC_FACT), Some("leo"));

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "今天運勢如何"))
        .await
        .unwrap();
    let call = &reply.tool_calls[0];
    assert_eq!(call.status, ToolCallStatus::Succeeded);
    assert_eq!(call.arguments["sign"], "leo");
}

#[tokio::test]
async fn test_actions_beyond_limit_are_dropped() {
    let h = harness_with(
        StubGateway::scripted(vec![Step::Decide(RouteDecision::actions(
            vec![
                Action::tool(ToolName::DrawTarot, json!({})),
                Action::tool(ToolName::QueryMoodHistory, json!({})),
                Action::tool(ToolName::ClassifyEmotion, json!({"text": "還好"})),
            ],
            "many",
            0.5,
        ))]),
        OrchestratorConfig {
            max_actions: 2,
            ..Default::default()
        },
        Arc::new(LexiconClassifier),
    )
    .await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "都來吧"))
        .await
        .unwrap();
    let tools: Vec<&str> = reply.tool_calls.iter().map(|c| c.tool.as_str()).collect();
    assert_eq!(tools, vec!["draw-tarot", "query-mood-history"]);
}

#[tokio::test]
async fn test_image_only_turn_uses_default_prompt() {
    let h = harness(StubGateway::scripted(vec![Step::Decide(
        RouteDecision::direct("這張照片很溫暖。"),
    )]))
    .await;

    let input = TurnInput::text("u1", "").with_attachment(healmate_common::Attachment::image(
        "https://cdn.example.com/photo.jpg",
    ));
    h.orchestrator.handle_turn(input).await.unwrap();

    assert_eq!(
        *h.gateway.last_message.lock(),
        healmate_common::message::IMAGE_ONLY_PROMPT
    );
}

#[tokio::test]
async fn test_recorded_mood_is_persisted_once() {
    let h = harness(StubGateway::default()).await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "幫我記下，今天很焦慮"))
        .await
        .unwrap();

    assert_eq!(reply.tool_calls[0].tool, "record-mood");
    assert_eq!(reply.tool_calls[0].output["replayed"], false);
    assert_eq!(h.moods.count("u1"), 1);
}

#[tokio::test]
async fn test_empty_message_is_rejected() {
    let h = harness(StubGateway::default()).await;
    let err = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "   "))
        .await
        .unwrap_err();
    assert!(matches!(err, HealmateError::Validation(_)));
    assert_eq!(h.gateway.model_calls(), 0);
}

#[tokio::test]
async fn test_several_retrievals_merge_within_k() {
    let names: Vec<&str> = tarot::deck()[..9]
        .iter()
        .map(|c| c.name_en.as_str())
        .collect();
    let actions = names
        .chunks(3)
        .map(|chunk| Action::retrieve(chunk.join(" "), Some(KnowledgeDomain::Tarot)))
        .collect();
    let h = harness(StubGateway::scripted(vec![Step::Decide(
        RouteDecision::actions(actions, "compare cards", 0.9),
    )]))
    .await;

    let reply = h
        .orchestrator
        .handle_turn(TurnInput::text("u1", "這幾張牌各代表什麼？"))
        .await
        .unwrap();

    let k = RetrievalConfig::default().k;
    assert_eq!(reply.citations.len(), k);
    assert_eq!(h.gateway.finalize_passages.load(Ordering::SeqCst) as usize, k);
    let mut unique = reply.citations.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), k);
    assert!(!reply.degraded);
}

#[tokio::test(start_paused = true)]
async fn test_stalled_summary_releases_session_within_deadline() {
    let config = OrchestratorConfig {
        window_size: 1,
        turn_deadline_ms: 1_000,
        ..Default::default()
    };
    let memory_config = MemoryConfig {
        window_size: 1,
        summary_timeout_ms: 300,
        ..Default::default()
    };
    let h = harness_with_memory(
        StubGateway::default(),
        config,
        Arc::new(LexiconClassifier),
        memory_config,
        Arc::new(StalledSummarizer),
    )
    .await;
    let orchestrator = &h.orchestrator;

    orchestrator
        .handle_turn(TurnInput::text("u1", "第0句"))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let (second, third) = tokio::join!(
        orchestrator.handle_turn(TurnInput::text("u1", "第1句")),
        orchestrator.handle_turn(TurnInput::text("u1", "第2句")),
    );
    second.unwrap();
    third.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1_000));

    let memory = orchestrator.memory();
    assert_eq!(memory.summary_failures(), 2);
    let session = memory.load_session("u1").await.unwrap();
    assert_eq!(session.window.len(), 1);
    assert_eq!(session.evicted_turns, 2);
    assert!(session.summary.is_empty());
}

#[tokio::test]
async fn test_failed_summary_keeps_window_bounded() {
    let config = OrchestratorConfig {
        window_size: 2,
        ..Default::default()
    };
    let memory_config = MemoryConfig {
        window_size: 2,
        ..Default::default()
    };
    let h = harness_with_memory(
        StubGateway::default(),
        config,
        Arc::new(LexiconClassifier),
        memory_config,
        Arc::new(FailingSummarizer),
    )
    .await;

    for i in 0..4 {
        let reply = h
            .orchestrator
            .handle_turn(TurnInput::text("u1", format!("第{i}句")))
            .await
            .unwrap();
        assert!(!reply.reply.is_empty());
    }

    let memory = h.orchestrator.memory();
    assert_eq!(memory.summary_failures(), 2);
    let session = memory.load_session("u1").await.unwrap();
    assert_eq!(session.window.len(), 2);
    assert_eq!(session.window[0].user_text, "第2句");
    assert!(session.summary.is_empty());
}

#[tokio::test]
async fn test_sign_names_inside_words_set_no_zodiac_fact() {
    let h = harness(StubGateway::default()).await;

    h.orchestrator
        .handle_turn(TurnInput::text("u1", "I keep rereading my old diaries"))
        .await
        .unwrap();

    let session = h.orchestrator.memory().load_session("u1").await.unwrap();
    assert!(!session.facts.contains_key(ZODIAC_FACT));
}
