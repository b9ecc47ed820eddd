//! Mood diary entries and their persistence boundary.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use healmate_common::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoodLabel {
    Happy,
    Calm,
    Grateful,
    Excited,
    Sad,
    Anxious,
    Angry,
    Frustrated,
    Confused,
    Lonely,
    Tired,
}

impl MoodLabel {
    pub const ALL: [MoodLabel; 11] = [
        MoodLabel::Happy,
        MoodLabel::Calm,
        MoodLabel::Grateful,
        MoodLabel::Excited,
        MoodLabel::Sad,
        MoodLabel::Anxious,
        MoodLabel::Angry,
        MoodLabel::Frustrated,
        MoodLabel::Confused,
        MoodLabel::Lonely,
        MoodLabel::Tired,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Happy => "happy",
            Self::Calm => "calm",
            Self::Grateful => "grateful",
            Self::Excited => "excited",
            Self::Sad => "sad",
            Self::Anxious => "anxious",
            Self::Angry => "angry",
            Self::Frustrated => "frustrated",
            Self::Confused => "confused",
            Self::Lonely => "lonely",
            Self::Tired => "tired",
        }
    }

    pub fn zh(&self) -> &'static str {
        match self {
            Self::Happy => "開心",
            Self::Calm => "平靜",
            Self::Grateful => "感恩",
            Self::Excited => "興奮",
            Self::Sad => "難過",
            Self::Anxious => "焦慮",
            Self::Angry => "生氣",
            Self::Frustrated => "沮喪",
            Self::Confused => "困惑",
            Self::Lonely => "孤單",
            Self::Tired => "疲憊",
        }
    }

    /// Accepts the English label or its Chinese alias.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        Self::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s) || m.zh() == s)
    }

    pub fn is_negative(&self) -> bool {
        matches!(
            self,
            Self::Sad | Self::Anxious | Self::Angry | Self::Frustrated | Self::Lonely | Self::Tired
        )
    }
}

impl fmt::Display for MoodLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MOOD_TAGS: [&str; 11] = [
    "work",
    "study",
    "family",
    "relationship",
    "friends",
    "health",
    "sleep",
    "money",
    "self_care",
    "weather",
    "other",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodEntry {
    pub id: String,
    pub user_id: String,
    pub mood: MoodLabel,
    pub intensity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

/// Optional bounds for a history query, inclusive.
#[derive(Debug, Clone, Copy, Default)]
pub struct MoodQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub limit: usize,
}

/// Plain create/read storage for mood entries.
#[async_trait]
pub trait MoodRepository: Send + Sync {
    /// Inserting an id that already exists is a no-op.
    async fn insert(&self, entry: MoodEntry) -> Result<()>;

    /// Entries for `user_id`, most recent first.
    async fn list(&self, user_id: &str, query: MoodQuery) -> Result<Vec<MoodEntry>>;
}

#[derive(Default)]
pub struct InMemoryMoodRepository {
    entries: parking_lot::RwLock<Vec<MoodEntry>>,
}

impl InMemoryMoodRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, user_id: &str) -> usize {
        self.entries
            .read()
            .iter()
            .filter(|e| e.user_id == user_id)
            .count()
    }
}

#[async_trait]
impl MoodRepository for InMemoryMoodRepository {
    async fn insert(&self, entry: MoodEntry) -> Result<()> {
        let mut entries = self.entries.write();
        if !entries.iter().any(|e| e.id == entry.id) {
            entries.push(entry);
        }
        Ok(())
    }

    async fn list(&self, user_id: &str, query: MoodQuery) -> Result<Vec<MoodEntry>> {
        let mut matching: Vec<MoodEntry> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.user_id == user_id)
            .filter(|e| query.from.is_none_or(|from| e.created_at >= from))
            .filter(|e| query.to.is_none_or(|to| e.created_at <= to))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching.truncate(query.limit);
        Ok(matching)
    }
}

/// Share of each mood label in `entries`, as whole percentages.
pub fn mood_distribution(entries: &[MoodEntry]) -> BTreeMap<MoodLabel, u32> {
    let mut counts: BTreeMap<MoodLabel, u32> = BTreeMap::new();
    for entry in entries {
        *counts.entry(entry.mood).or_default() += 1;
    }
    let total = entries.len() as f64;
    counts
        .into_iter()
        .map(|(mood, count)| (mood, ((count as f64 / total) * 100.0).round() as u32))
        .collect()
}
