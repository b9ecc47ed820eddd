//! Integration tests for session memory and retrieval composition.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use healmate_common::{HealmateError, Result, RouteKind, Turn};
use healmate_memory::{
    Embedder, InMemoryKnowledgeStore, KnowledgeDomain, KnowledgeStore, MemoryConfig, MemoryStore,
    RetrievalComposer, RetrievalConfig, RetrievedPassage, SearchFilter, Summarizer,
};
use tempfile::TempDir;

// ============================================================================
// Test doubles
// ============================================================================

/// Appends evicted user texts in order, so the summary is a transcript.
struct TranscriptSummarizer {
    calls: AtomicU32,
}

impl TranscriptSummarizer {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Summarizer for TranscriptSummarizer {
    async fn summarize(&self, previous: &str, evicted: &[Turn]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut parts: Vec<String> = Vec::new();
        if !previous.is_empty() {
            parts.push(previous.to_string());
        }
        parts.extend(evicted.iter().map(|t| t.user_text.clone()));
        Ok(parts.join("|"))
    }
}

struct FailingSummarizer;

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _previous: &str, _evicted: &[Turn]) -> Result<String> {
        Err(HealmateError::upstream("llm", "unavailable"))
    }
}

struct SlowSummarizer;

#[async_trait]
impl Summarizer for SlowSummarizer {
    async fn summarize(&self, previous: &str, evicted: &[Turn]) -> Result<String> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(format!("{previous}+{}", evicted.len()))
    }
}

/// Embeds by keyword presence along two axes: tarot-ness and distress.
struct KeywordEmbedder;

#[async_trait]
impl Embedder for KeywordEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let tarot = if text.contains("牌") || text.contains("tarot") { 1.0 } else { 0.1 };
        let sad = if text.contains("難過") || text.contains("sad") { 1.0 } else { 0.1 };
        Ok(vec![tarot, sad])
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct DownEmbedder;

#[async_trait]
impl Embedder for DownEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        Err(HealmateError::upstream("embedding", "connection refused"))
    }

    fn dimension(&self) -> usize {
        2
    }
}

struct DownStore {
    calls: AtomicU32,
}

#[async_trait]
impl KnowledgeStore for DownStore {
    async fn search(
        &self,
        _embedding: &[f32],
        _filter: Option<&SearchFilter>,
        _k: usize,
    ) -> Result<Vec<RetrievedPassage>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(HealmateError::upstream("qdrant", "503"))
    }
}

fn turn(id: u64) -> Turn {
    Turn {
        id,
        timestamp: Utc::now(),
        user_text: format!("m{id}"),
        attachments: vec![],
        route: RouteKind::Direct,
        tool_calls: vec![],
        passage_ids: vec![],
        reply: format!("r{id}"),
        degraded: false,
    }
}

fn memory(window: usize, summarizer: Arc<dyn Summarizer>) -> MemoryStore {
    MemoryStore::new(
        MemoryConfig {
            window_size: window,
            ..Default::default()
        },
        summarizer,
    )
    .unwrap()
}

fn seeded_knowledge() -> Arc<InMemoryKnowledgeStore> {
    let store = InMemoryKnowledgeStore::new();
    store.insert("tarot-fool", "愚者：新的開始", Some("tarot"), vec![1.0, 0.0]);
    store.insert("tarot-star", "星星：希望", Some("tarot"), vec![0.9, 0.2]);
    store.insert("coping-breath", "深呼吸練習", Some("coping"), vec![0.1, 1.0]);
    store.insert("coping-journal", "寫下感受", Some("coping"), vec![0.3, 0.9]);
    store.insert("coping-walk", "出門散步", Some("coping"), vec![0.2, 0.8]);
    Arc::new(store)
}

// ============================================================================
// Memory store
// ============================================================================

#[tokio::test]
async fn window_never_exceeds_n() {
    let store = memory(3, Arc::new(TranscriptSummarizer::new()));
    for id in 1..=20 {
        store.append_turn("alice", turn(id)).await.unwrap();
        let session = store.load_session("alice").await.unwrap();
        assert!(session.window.len() <= 3);
    }
}

#[tokio::test]
async fn summary_reflects_evictions_in_order() {
    let summarizer = Arc::new(TranscriptSummarizer::new());
    let store = memory(2, summarizer.clone());
    for id in 1..=5 {
        store.append_turn("alice", turn(id)).await.unwrap();
    }
    let session = store.load_session("alice").await.unwrap();
    assert_eq!(session.summary, "m1|m2|m3");
    let ids: Vec<u64> = session.window.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![4, 5]);
    // One batched call per evicting append.
    assert_eq!(summarizer.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn replay_yields_identical_summary() {
    let a = memory(2, Arc::new(TranscriptSummarizer::new()));
    let b = memory(2, Arc::new(TranscriptSummarizer::new()));
    for id in 1..=9 {
        a.append_turn("s", turn(id)).await.unwrap();
        b.append_turn("s", turn(id)).await.unwrap();
    }
    assert_eq!(
        a.load_session("s").await.unwrap().summary,
        b.load_session("s").await.unwrap().summary
    );
}

#[tokio::test]
async fn failed_summary_drops_turns_and_counts() {
    let store = memory(2, Arc::new(FailingSummarizer));
    for id in 1..=4 {
        let outcome = store.append_turn("alice", turn(id)).await.unwrap();
        assert!(!outcome.summarized);
    }
    let session = store.load_session("alice").await.unwrap();
    assert_eq!(session.window.len(), 2);
    assert!(session.summary.is_empty());
    assert_eq!(store.summary_failures(), 2);
}

#[tokio::test(start_paused = true)]
async fn load_does_not_wait_for_summarizer() {
    let store = Arc::new(memory(1, Arc::new(SlowSummarizer)));
    store.append_turn("alice", turn(1)).await.unwrap();

    let appender = {
        let store = store.clone();
        tokio::spawn(async move { store.append_turn("alice", turn(2)).await })
    };
    tokio::task::yield_now().await;

    let session = tokio::time::timeout(Duration::from_millis(10), store.load_session("alice"))
        .await
        .expect("load blocked on summarizer")
        .unwrap();
    assert_eq!(session.window.len(), 1);

    appender.await.unwrap().unwrap();
    assert_eq!(store.load_session("alice").await.unwrap().summary, "+1");
}

#[tokio::test]
async fn snapshots_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = MemoryConfig {
        window_size: 2,
        snapshot_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };

    {
        let store = MemoryStore::new(config.clone(), Arc::new(TranscriptSummarizer::new())).unwrap();
        for id in 1..=3 {
            store.append_turn("U123", turn(id)).await.unwrap();
        }
        store.set_fact("U123", "zodiac_sign", "leo").await.unwrap();
    }

    let reopened = MemoryStore::new(config, Arc::new(TranscriptSummarizer::new())).unwrap();
    let session = reopened.load_session("U123").await.unwrap();
    assert_eq!(session.window.len(), 2);
    assert_eq!(session.summary, "m1");
    assert_eq!(session.fact("zodiac_sign"), Some("leo"));
    assert_eq!(reopened.reserve_turn_id("U123").await.unwrap(), 4);
}

// ============================================================================
// Retrieval composer
// ============================================================================

#[tokio::test]
async fn composer_caps_at_k_without_duplicates() {
    let composer = RetrievalComposer::new(
        Arc::new(KeywordEmbedder),
        seeded_knowledge(),
        RetrievalConfig {
            k: 2,
            min_score: 0.0,
            ..Default::default()
        },
    );

    let context = composer.compose("今天好難過", Some(KnowledgeDomain::Coping)).await;
    assert!(!context.degraded);
    assert_eq!(context.passages.len(), 2);
    let mut ids = context.passage_ids();
    ids.dedup();
    assert_eq!(ids.len(), 2);
    assert!(context.passages.iter().all(|p| p.source_id.starts_with("coping")));
    assert!(context.text.contains("[coping-breath]"));
}

#[tokio::test]
async fn composer_domain_query_surfaces_filtered_sources() {
    let composer = RetrievalComposer::new(
        Arc::new(KeywordEmbedder),
        seeded_knowledge(),
        RetrievalConfig {
            k: 3,
            min_score: 0.5,
            ..Default::default()
        },
    );
    let context = composer.compose("抽一張牌", Some(KnowledgeDomain::Tarot)).await;
    assert!(context.passages.iter().any(|p| p.source_id == "tarot-fool"));
    assert!(context.passages.len() <= 3);
}

#[tokio::test]
async fn composer_respects_char_budget() {
    let composer = RetrievalComposer::new(
        Arc::new(KeywordEmbedder),
        seeded_knowledge(),
        RetrievalConfig {
            k: 5,
            context_char_budget: 25,
            min_score: 0.0,
            ..Default::default()
        },
    );
    let context = composer.compose("sad", None).await;
    assert!(context.text.chars().count() <= 25);
}

#[tokio::test(start_paused = true)]
async fn store_outage_yields_degraded_empty_context() {
    let store = Arc::new(DownStore {
        calls: AtomicU32::new(0),
    });
    let composer = RetrievalComposer::new(
        Arc::new(KeywordEmbedder),
        store.clone(),
        RetrievalConfig::default(),
    );

    let context = composer.compose("抽牌", Some(KnowledgeDomain::Tarot)).await;
    assert!(context.degraded);
    assert!(context.is_empty());
    // Two queries, each retried once.
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);
}

#[tokio::test(start_paused = true)]
async fn embedding_outage_yields_degraded_empty_context() {
    let composer = RetrievalComposer::new(
        Arc::new(DownEmbedder),
        seeded_knowledge(),
        RetrievalConfig::default(),
    );
    let context = composer.compose("hello", None).await;
    assert!(context.degraded);
    assert!(context.text.is_empty());
}
