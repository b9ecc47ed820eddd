//! Memory and knowledge for HealMate.
//!
//! This crate owns everything the orchestrator remembers or looks up:
//!
//! - **Session memory**: a bounded rolling window of raw turns per user,
//!   folded into a rolling summary on eviction
//! - **Knowledge**: read-only similarity search over tarot meanings and
//!   coping-strategy articles
//! - **Mood diary**: create/read persistence for mood entries
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    MEMORY & KNOWLEDGE                    │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ MemoryStore (per session)                          │  │
//! │  │  window: VecDeque<Turn>  (len ≤ N)                 │  │
//! │  │  summary ◄── Summarizer (one call per eviction)    │  │
//! │  │  facts, snapshots (optional JSON dir)              │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                                                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │ RetrievalComposer                                  │  │
//! │  │  Embedder ──► KnowledgeStore (top-K + domain)      │  │
//! │  │  merge/dedupe ──► char budget ──► GroundedContext  │  │
//! │  └────────────────────────────────────────────────────┘  │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//! ```

pub mod embedding;
pub mod knowledge;
pub mod mood;
pub mod retrieval;
pub mod store;
pub mod types;

pub use embedding::{Embedder, EmbeddingError, OllamaEmbedder};
pub use knowledge::{
    InMemoryKnowledgeStore, KnowledgeDomain, KnowledgeStore, QdrantKnowledgeStore,
    RetrievedPassage, SearchFilter,
};
pub use mood::{
    InMemoryMoodRepository, MOOD_TAGS, MoodEntry, MoodLabel, MoodQuery, MoodRepository,
    mood_distribution,
};
pub use retrieval::{GroundedContext, RetrievalComposer};
pub use store::{AppendOutcome, MemoryStore, PendingSummary, Summarizer};
pub use types::{
    EmbeddingConfig, KnowledgeBackend, KnowledgeConfig, MemoryConfig, RetrievalConfig, Session,
};
