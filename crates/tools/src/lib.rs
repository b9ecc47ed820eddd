//! Built-in tools the orchestrator can invoke.
//!
//! This crate provides the closed set of tools exposed to the model:
//!
//! - **record-mood**: Save a mood diary entry (idempotent write)
//! - **query-mood-history**: Recent entries plus a mood distribution
//! - **draw-tarot**: Seeded draws over the 78-card deck (non-idempotent)
//! - **lookup-horoscope**: Daily fortune per zodiac sign, cached per day
//! - **classify-emotion**: LLM classifier with a lexicon fallback
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      TOOL REGISTRY                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │   name + JSON args ──▶ ToolRequest::parse (validation)      │
//! │                              │                              │
//! │                              ▼                              │
//! │   ToolRegistry::execute ── write lock (write classes)       │
//! │                         ── idempotency ledger (record-mood) │
//! │                         ── per-tool timeout + retry         │
//! │                              │                              │
//! │        ┌──────────┬──────────┼───────────┬──────────┐       │
//! │        ▼          ▼          ▼           ▼          ▼       │
//! │    MoodRepo   MoodRepo   TarotDraw   Horoscope  Classifier  │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod diary;
pub mod emotion;
pub mod horoscope;
pub mod registry;
pub mod tarot;

pub use diary::{MoodHistory, MoodSummary, QueryMoodHistoryInput, RecordMoodInput};
pub use emotion::{EmotionClassifier, EmotionReading, LexiconClassifier, LlmEmotionClassifier};
pub use horoscope::{AlmanacProvider, CachedHoroscopeProvider, Fortune, HoroscopeProvider, ZodiacSign};
pub use registry::{
    ClassifyEmotionInput, DEFAULT_TOOL_TIMEOUT, DrawTarotInput, HoroscopeInput, IdempotencyClass,
    ToolContext, ToolName, ToolOutput, ToolRegistry, ToolRequest, ToolSpec, spec, tool_specs,
};
pub use tarot::{
    DECK_SIZE, DrawnCard, EntropySeedSource, Orientation, SeedSource, SequentialSeedSource,
    Spread, TarotCard, TarotDraw,
};
