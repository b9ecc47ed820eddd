//! Session state and memory configuration.

use std::collections::{BTreeMap, VecDeque};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use healmate_common::{RetryPolicy, Turn};
use serde::{Deserialize, Serialize};

/// Conversational state for one user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,

    /// Most recent raw turns, oldest first. Never longer than the configured window.
    #[serde(default)]
    pub window: VecDeque<Turn>,

    /// Rolling summary of every turn evicted from the window.
    #[serde(default)]
    pub summary: String,

    /// Structured facts such as `zodiac_sign`.
    #[serde(default)]
    pub facts: BTreeMap<String, String>,

    /// Next turn id to hand out. Ids are reserved before a turn runs, so a
    /// turn that times out leaves a gap rather than a reused id.
    #[serde(default = "first_turn_id")]
    pub next_turn_id: u64,

    /// Turns evicted over the session's lifetime.
    #[serde(default)]
    pub evicted_turns: u64,
}

fn first_turn_id() -> u64 {
    1
}

impl Session {
    pub fn new(user_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            user_id: user_id.into(),
            created_at: now,
            last_active: now,
            window: VecDeque::new(),
            summary: String::new(),
            facts: BTreeMap::new(),
            next_turn_id: first_turn_id(),
            evicted_turns: 0,
        }
    }

    /// The last `k` turns, oldest first.
    pub fn recent_turns(&self, k: usize) -> impl Iterator<Item = &Turn> {
        let skip = self.window.len().saturating_sub(k);
        self.window.iter().skip(skip)
    }

    pub fn fact(&self, key: &str) -> Option<&str> {
        self.facts.get(key).map(String::as_str)
    }

    pub fn is_new(&self) -> bool {
        self.window.is_empty() && self.summary.is_empty()
    }
}

/// Configuration for the session memory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Rolling window size (N).
    #[serde(default = "default_window_size")]
    pub window_size: usize,

    /// When set, sessions are snapshotted to `<dir>/<user>.json`.
    #[serde(default)]
    pub snapshot_dir: Option<PathBuf>,

    /// Retry policy for snapshot reads and writes.
    #[serde(default = "RetryPolicy::persistence")]
    pub retry: RetryPolicy,

    /// A summary taking longer than this counts as failed.
    #[serde(default = "default_summary_timeout_ms")]
    pub summary_timeout_ms: u64,
}

fn default_window_size() -> usize {
    10
}

fn default_summary_timeout_ms() -> u64 {
    15_000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            snapshot_dir: None,
            retry: RetryPolicy::persistence(),
            summary_timeout_ms: default_summary_timeout_ms(),
        }
    }
}

/// Configuration for the retrieval composer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Maximum passages in a grounded context (K).
    #[serde(default = "default_k")]
    pub k: usize,

    /// Character budget for the rendered context block.
    #[serde(default = "default_context_char_budget")]
    pub context_char_budget: usize,

    /// Passages scoring below this are discarded.
    #[serde(default = "default_min_score")]
    pub min_score: f32,

    #[serde(default = "RetryPolicy::knowledge_store")]
    pub retry: RetryPolicy,
}

fn default_k() -> usize {
    4
}

fn default_context_char_budget() -> usize {
    2000
}

fn default_min_score() -> f32 {
    0.5
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            context_char_budget: default_context_char_budget(),
            min_score: default_min_score(),
            retry: RetryPolicy::knowledge_store(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KnowledgeBackend {
    Memory,
    Qdrant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeConfig {
    #[serde(default = "default_backend")]
    pub backend: KnowledgeBackend,
    #[serde(default = "default_qdrant_url")]
    pub url: String,
    #[serde(default = "default_collection")]
    pub collection: String,
    pub api_key: Option<String>,
    /// Per-request HTTP timeout for searches.
    #[serde(default = "default_knowledge_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_knowledge_timeout_ms() -> u64 {
    5_000
}

fn default_backend() -> KnowledgeBackend {
    KnowledgeBackend::Memory
}

fn default_qdrant_url() -> String {
    "http://localhost:6333".into()
}

fn default_collection() -> String {
    "healmate_knowledge".into()
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            url: default_qdrant_url(),
            collection: default_collection(),
            api_key: None,
            timeout_ms: default_knowledge_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub url: String,
    #[serde(default = "default_embedding_model")]
    pub model: String,
    #[serde(default = "default_embedding_dim")]
    pub dimension: usize,
    /// Per-request HTTP timeout.
    #[serde(default = "default_embedding_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_embedding_timeout_ms() -> u64 {
    10_000
}

fn default_embedding_url() -> String {
    "http://localhost:11434".into()
}

fn default_embedding_model() -> String {
    "nomic-embed-text".into()
}

fn default_embedding_dim() -> usize {
    768
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            url: default_embedding_url(),
            model: default_embedding_model(),
            dimension: default_embedding_dim(),
            timeout_ms: default_embedding_timeout_ms(),
        }
    }
}
