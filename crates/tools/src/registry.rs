//! Tool catalog, argument validation and bounded execution.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};

use chrono::{NaiveDate, Utc};
use healmate_common::{HealmateError, Result, RetryPolicy, idempotency_key, with_retry};
use healmate_memory::{MoodEntry, MoodRepository};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{info, instrument, warn};

use crate::diary::{MoodHistory, QueryMoodHistoryInput, RecordMoodInput};
use crate::emotion::{EmotionClassifier, EmotionReading};
use crate::horoscope::{Fortune, HoroscopeProvider, ZodiacSign};
use crate::tarot::{EntropySeedSource, SeedSource, Spread, TarotDraw};

pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(8);
const MAX_CLASSIFY_CHARS: usize = 2000;
const LEDGER_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolName {
    RecordMood,
    QueryMoodHistory,
    DrawTarot,
    LookupHoroscope,
    ClassifyEmotion,
}

impl ToolName {
    /// In declaration order; indexes the tool-spec table.
    pub const ALL: [ToolName; 5] = [
        ToolName::RecordMood,
        ToolName::QueryMoodHistory,
        ToolName::DrawTarot,
        ToolName::LookupHoroscope,
        ToolName::ClassifyEmotion,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RecordMood => "record-mood",
            Self::QueryMoodHistory => "query-mood-history",
            Self::DrawTarot => "draw-tarot",
            Self::LookupHoroscope => "lookup-horoscope",
            Self::ClassifyEmotion => "classify-emotion",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }

    pub fn idempotency(&self) -> IdempotencyClass {
        match self {
            Self::RecordMood => IdempotencyClass::IdempotentWrite,
            Self::DrawTarot => IdempotencyClass::NonIdempotentWrite,
            Self::QueryMoodHistory | Self::LookupHoroscope | Self::ClassifyEmotion => {
                IdempotencyClass::ReadOnly
            }
        }
    }
}

impl fmt::Display for ToolName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum IdempotencyClass {
    ReadOnly,
    IdempotentWrite,
    NonIdempotentWrite,
}

impl IdempotencyClass {
    pub fn is_write(&self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolSpec {
    pub name: ToolName,
    pub description: &'static str,
    pub idempotency: IdempotencyClass,
    pub input_schema: Value,
    pub output_schema: Value,
}

static SPECS: LazyLock<Vec<ToolSpec>> = LazyLock::new(|| {
    ToolName::ALL
        .into_iter()
        .map(|name| match name {
            ToolName::RecordMood => ToolSpec {
                name,
                description: "Save a mood diary entry. Only when the user explicitly asks to record their mood.",
                idempotency: name.idempotency(),
                input_schema: json!({
                    "type": "object",
                    "required": ["mood", "intensity"],
                    "properties": {
                        "mood": { "enum": healmate_memory::MoodLabel::ALL.map(|m| m.as_str()) },
                        "intensity": { "type": "integer", "minimum": 1, "maximum": 10 },
                        "note": { "type": "string", "maxLength": crate::diary::MAX_NOTE_CHARS },
                        "tags": {
                            "type": "array",
                            "maxItems": crate::diary::MAX_TAGS,
                            "uniqueItems": true,
                            "items": { "enum": healmate_memory::MOOD_TAGS }
                        }
                    }
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": { "entry_id": { "type": "string" }, "replayed": { "type": "boolean" } }
                }),
            },
            ToolName::QueryMoodHistory => ToolSpec {
                name,
                description: "List the user's recent mood entries, most recent first, with a mood distribution.",
                idempotency: name.idempotency(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "from": { "type": "string", "format": "date" },
                        "to": { "type": "string", "format": "date" },
                        "limit": { "type": "integer", "minimum": 1, "maximum": crate::diary::MAX_HISTORY_LIMIT }
                    }
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "entries": { "type": "array" },
                        "distribution": { "type": "object" }
                    }
                }),
            },
            ToolName::DrawTarot => ToolSpec {
                name,
                description: "Draw tarot cards for a reading. Every call draws fresh cards.",
                idempotency: name.idempotency(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "spread": { "enum": ["single", "three-card", "ten-card-cross"], "default": "single" }
                    }
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "spread": { "type": "string" },
                        "cards": { "type": "array" },
                        "seed": { "type": "integer" }
                    }
                }),
            },
            ToolName::LookupHoroscope => ToolSpec {
                name,
                description: "Daily horoscope for a zodiac sign.",
                idempotency: name.idempotency(),
                input_schema: json!({
                    "type": "object",
                    "required": ["sign"],
                    "properties": {
                        "sign": { "enum": ZodiacSign::ALL.map(|s| s.en().to_lowercase()) },
                        "date": { "type": "string", "format": "date" }
                    }
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "overall": { "type": "integer" },
                        "love": { "type": "integer" },
                        "career": { "type": "integer" },
                        "wealth": { "type": "integer" },
                        "lucky_color": { "type": "string" },
                        "lucky_number": { "type": "integer" },
                        "summary": { "type": "string" }
                    }
                }),
            },
            ToolName::ClassifyEmotion => ToolSpec {
                name,
                description: "Identify the dominant emotion in a piece of text.",
                idempotency: name.idempotency(),
                input_schema: json!({
                    "type": "object",
                    "required": ["text"],
                    "properties": { "text": { "type": "string", "maxLength": MAX_CLASSIFY_CHARS } }
                }),
                output_schema: json!({
                    "type": "object",
                    "properties": {
                        "label": { "type": "string" },
                        "confidence": { "type": "number" },
                        "intensity": { "type": "integer" }
                    }
                }),
            },
        })
        .collect()
});

pub fn tool_specs() -> &'static [ToolSpec] {
    &SPECS
}

pub fn spec(name: ToolName) -> &'static ToolSpec {
    &SPECS[name as usize]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DrawTarotInput {
    #[serde(default = "default_spread")]
    pub spread: Spread,
}

fn default_spread() -> Spread {
    Spread::Single
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HoroscopeInput {
    pub sign: ZodiacSign,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassifyEmotionInput {
    pub text: String,
}

/// A validated tool invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolRequest {
    RecordMood(RecordMoodInput),
    QueryMoodHistory(QueryMoodHistoryInput),
    DrawTarot(DrawTarotInput),
    LookupHoroscope(HoroscopeInput),
    ClassifyEmotion(ClassifyEmotionInput),
}

fn from_args<T: DeserializeOwned>(name: ToolName, arguments: Value) -> Result<T> {
    serde_json::from_value(arguments)
        .map_err(|e| HealmateError::validation(format!("invalid arguments for {name}: {e}")))
}

impl ToolRequest {
    /// Deserialize and validate `arguments` against the tool's input schema.
    pub fn parse(name: ToolName, arguments: Value) -> Result<Self> {
        let arguments = if arguments.is_null() {
            json!({})
        } else {
            arguments
        };
        let request = match name {
            ToolName::RecordMood => Self::RecordMood(from_args(name, arguments)?),
            ToolName::QueryMoodHistory => Self::QueryMoodHistory(from_args(name, arguments)?),
            ToolName::DrawTarot => Self::DrawTarot(from_args(name, arguments)?),
            ToolName::LookupHoroscope => Self::LookupHoroscope(from_args(name, arguments)?),
            ToolName::ClassifyEmotion => Self::ClassifyEmotion(from_args(name, arguments)?),
        };
        request.validate()?;
        Ok(request)
    }

    pub fn name(&self) -> ToolName {
        match self {
            Self::RecordMood(_) => ToolName::RecordMood,
            Self::QueryMoodHistory(_) => ToolName::QueryMoodHistory,
            Self::DrawTarot(_) => ToolName::DrawTarot,
            Self::LookupHoroscope(_) => ToolName::LookupHoroscope,
            Self::ClassifyEmotion(_) => ToolName::ClassifyEmotion,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            Self::RecordMood(input) => input.validate(),
            Self::QueryMoodHistory(input) => input.validate(),
            Self::ClassifyEmotion(input) => {
                let chars = input.text.chars().count();
                if input.text.trim().is_empty() {
                    Err(HealmateError::validation("text to classify is empty"))
                } else if chars > MAX_CLASSIFY_CHARS {
                    Err(HealmateError::validation(format!(
                        "text exceeds {MAX_CLASSIFY_CHARS} characters"
                    )))
                } else {
                    Ok(())
                }
            }
            Self::DrawTarot(_) | Self::LookupHoroscope(_) => Ok(()),
        }
    }

    /// Canonical argument payload, used for audit records.
    pub fn arguments(&self) -> Value {
        let value = match self {
            Self::RecordMood(input) => serde_json::to_value(input),
            Self::QueryMoodHistory(input) => serde_json::to_value(input),
            Self::DrawTarot(input) => serde_json::to_value(input),
            Self::LookupHoroscope(input) => serde_json::to_value(input),
            Self::ClassifyEmotion(input) => serde_json::to_value(input),
        };
        value.unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolOutput {
    MoodRecorded { entry_id: String, replayed: bool },
    MoodHistory(MoodHistory),
    Tarot(TarotDraw),
    Horoscope(Fortune),
    Emotion(EmotionReading),
}

impl ToolOutput {
    /// Short Chinese rendering, used when the model cannot phrase the reply.
    pub fn describe(&self) -> String {
        match self {
            Self::MoodRecorded { .. } => "已幫你記下這次的心情。".to_string(),
            Self::MoodHistory(history) => {
                if history.entries.is_empty() {
                    return "目前還沒有心情紀錄。".to_string();
                }
                let recent: Vec<String> = history
                    .entries
                    .iter()
                    .map(|e| {
                        format!(
                            "{} {}（{}/10）",
                            e.created_at.format("%m/%d"),
                            e.mood.zh(),
                            e.intensity
                        )
                    })
                    .collect();
                format!("最近的心情紀錄：{}", recent.join("、"))
            }
            Self::Tarot(draw) => {
                let cards: Vec<String> = draw
                    .cards
                    .iter()
                    .map(|c| format!("{} {}", c.name, c.orientation.zh()))
                    .collect();
                format!("你抽到的牌：{}", cards.join("；"))
            }
            Self::Horoscope(f) => format!(
                "{} {} 整體運勢 {}：{} 幸運色：{}，幸運數字：{}",
                f.sign.zh(),
                f.date.format("%m/%d"),
                "★".repeat(f.overall as usize),
                f.summary,
                f.lucky_color,
                f.lucky_number
            ),
            Self::Emotion(reading) => format!(
                "聽起來你現在有些{}（強度 {}/10）。",
                reading.label.zh(),
                reading.intensity
            ),
        }
    }
}

/// Identifies the turn a tool call belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolContext {
    pub session_id: String,
    pub turn_id: u64,
}

impl ToolContext {
    pub fn new(session_id: impl Into<String>, turn_id: u64) -> Self {
        Self {
            session_id: session_id.into(),
            turn_id,
        }
    }

    pub fn idempotency_key(&self, tool: ToolName) -> String {
        idempotency_key(&self.session_id, self.turn_id, tool.as_str())
    }
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    fingerprint: Value,
    entry_id: String,
}

/// Bounded FIFO map of idempotency key to completed write.
#[derive(Default)]
struct IdempotencyLedger {
    entries: HashMap<String, LedgerEntry>,
    order: VecDeque<String>,
}

impl IdempotencyLedger {
    fn get(&self, key: &str) -> Option<LedgerEntry> {
        self.entries.get(key).cloned()
    }

    fn insert(&mut self, key: String, entry: LedgerEntry) {
        if self.entries.insert(key.clone(), entry).is_none() {
            self.order.push_back(key);
        }
        while self.order.len() > LEDGER_CAPACITY {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }
}

/// Executes tool requests against their backing services.
pub struct ToolRegistry {
    moods: Arc<dyn MoodRepository>,
    horoscope: Arc<dyn HoroscopeProvider>,
    classifier: Arc<dyn EmotionClassifier>,
    seeds: Arc<dyn SeedSource>,
    timeout: Duration,
    retry: RetryPolicy,
    write_locks: parking_lot::Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    ledger: parking_lot::Mutex<IdempotencyLedger>,
}

impl ToolRegistry {
    pub fn new(
        moods: Arc<dyn MoodRepository>,
        horoscope: Arc<dyn HoroscopeProvider>,
        classifier: Arc<dyn EmotionClassifier>,
    ) -> Self {
        Self {
            moods,
            horoscope,
            classifier,
            seeds: Arc::new(EntropySeedSource),
            timeout: DEFAULT_TOOL_TIMEOUT,
            retry: RetryPolicy::persistence(),
            write_locks: parking_lot::Mutex::new(HashMap::new()),
            ledger: parking_lot::Mutex::new(IdempotencyLedger::default()),
        }
    }

    pub fn with_seed_source(mut self, seeds: Arc<dyn SeedSource>) -> Self {
        self.seeds = seeds;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn specs(&self) -> &'static [ToolSpec] {
        tool_specs()
    }

    fn write_lock(&self, session_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.write_locks.lock();
        if locks.len() > 1024 {
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }
        locks.entry(session_id.to_string()).or_default().clone()
    }

    /// Run one tool call. Write-class tools hold the session's write lock
    /// for the whole call; every call is bounded by the tool timeout.
    #[instrument(
        skip(self, ctx, request),
        fields(session_id = %ctx.session_id, turn_id = ctx.turn_id, tool = %request.name())
    )]
    pub async fn execute(&self, ctx: &ToolContext, request: ToolRequest) -> Result<ToolOutput> {
        let name = request.name();
        let _write_guard = if name.idempotency().is_write() {
            Some(self.write_lock(&ctx.session_id).lock_owned().await)
        } else {
            None
        };

        let started = Instant::now();
        let result = match tokio::time::timeout(self.timeout, self.dispatch(ctx, request)).await {
            Ok(result) => result,
            Err(_) => Err(HealmateError::upstream(
                name.as_str(),
                format!("timed out after {} ms", self.timeout.as_millis()),
            )),
        };
        let latency_ms = started.elapsed().as_millis() as u64;

        match &result {
            Ok(_) => info!(latency_ms, "Tool call succeeded"),
            Err(e) => warn!(latency_ms, error = %e, "Tool call failed"),
        }
        result
    }

    async fn dispatch(&self, ctx: &ToolContext, request: ToolRequest) -> Result<ToolOutput> {
        match request {
            ToolRequest::RecordMood(input) => self.record_mood(ctx, input).await,
            ToolRequest::QueryMoodHistory(input) => {
                let query = input.to_query();
                let entries = with_retry(&self.retry, "mood.list", || {
                    self.moods.list(&ctx.session_id, query)
                })
                .await?;
                Ok(ToolOutput::MoodHistory(MoodHistory::from_entries(entries)))
            }
            ToolRequest::DrawTarot(input) => {
                let seed = self.seeds.next_seed();
                Ok(ToolOutput::Tarot(TarotDraw::with_seed(input.spread, seed)))
            }
            ToolRequest::LookupHoroscope(input) => {
                let date = input.date.unwrap_or_else(|| Utc::now().date_naive());
                with_retry(&self.retry, "horoscope.fortune", || {
                    self.horoscope.fortune(input.sign, date)
                })
                .await
                .map(ToolOutput::Horoscope)
            }
            ToolRequest::ClassifyEmotion(input) => {
                with_retry(&self.retry, "emotion.classify", || {
                    self.classifier.classify(&input.text)
                })
                .await
                .map(ToolOutput::Emotion)
            }
        }
    }

    async fn record_mood(&self, ctx: &ToolContext, input: RecordMoodInput) -> Result<ToolOutput> {
        let key = ctx.idempotency_key(ToolName::RecordMood);
        let fingerprint = serde_json::to_value(&input)?;

        let prior = self.ledger.lock().get(&key);
        if let Some(prior) = prior {
            if prior.fingerprint == fingerprint {
                info!(key = %key, entry_id = %prior.entry_id, "Replaying recorded mood");
                return Ok(ToolOutput::MoodRecorded {
                    entry_id: prior.entry_id,
                    replayed: true,
                });
            }
            return Err(HealmateError::ToolIdempotencyConflict { key });
        }

        let entry = MoodEntry {
            id: format!("mood_{}", uuid::Uuid::new_v4().simple()),
            user_id: ctx.session_id.clone(),
            mood: input.mood,
            intensity: input.intensity,
            note: input.note,
            tags: input.tags,
            created_at: Utc::now(),
        };

        // Inserts are keyed by entry id, so retrying one is safe.
        with_retry(&self.retry, "mood.insert", || self.moods.insert(entry.clone())).await?;

        self.ledger.lock().insert(
            key,
            LedgerEntry {
                fingerprint,
                entry_id: entry.id.clone(),
            },
        );

        Ok(ToolOutput::MoodRecorded {
            entry_id: entry.id,
            replayed: false,
        })
    }
}
