//! Mood diary tool inputs and outputs.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use healmate_common::{HealmateError, Result};
use healmate_memory::{MOOD_TAGS, MoodEntry, MoodLabel, MoodQuery, mood_distribution};
use serde::{Deserialize, Serialize};

pub const MAX_NOTE_CHARS: usize = 500;
pub const MAX_TAGS: usize = 8;
pub const DEFAULT_HISTORY_LIMIT: usize = 5;
pub const MAX_HISTORY_LIMIT: usize = 50;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RecordMoodInput {
    pub mood: MoodLabel,
    pub intensity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
}

impl RecordMoodInput {
    pub fn validate(&self) -> Result<()> {
        if !(1..=10).contains(&self.intensity) {
            return Err(HealmateError::validation(format!(
                "intensity must be between 1 and 10, got {}",
                self.intensity
            )));
        }
        if let Some(note) = &self.note {
            if note.chars().count() > MAX_NOTE_CHARS {
                return Err(HealmateError::validation(format!(
                    "note exceeds {MAX_NOTE_CHARS} characters"
                )));
            }
        }
        if self.tags.len() > MAX_TAGS {
            return Err(HealmateError::validation(format!(
                "at most {MAX_TAGS} tags allowed"
            )));
        }
        if let Some(unknown) = self.tags.iter().find(|t| !MOOD_TAGS.contains(&t.as_str())) {
            return Err(HealmateError::validation(format!("unknown tag: {unknown}")));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QueryMoodHistoryInput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl QueryMoodHistoryInput {
    pub fn validate(&self) -> Result<()> {
        if let Some(limit) = self.limit {
            if limit == 0 || limit > MAX_HISTORY_LIMIT {
                return Err(HealmateError::validation(format!(
                    "limit must be between 1 and {MAX_HISTORY_LIMIT}"
                )));
            }
        }
        if let (Some(from), Some(to)) = (self.from, self.to) {
            if from > to {
                return Err(HealmateError::validation("`from` is after `to`"));
            }
        }
        Ok(())
    }

    /// Inclusive calendar-day bounds in UTC.
    pub fn to_query(&self) -> MoodQuery {
        MoodQuery {
            from: self.from.map(|d| d.and_time(NaiveTime::MIN).and_utc()),
            to: self
                .to
                .and_then(|d| d.succ_opt())
                .map(|d| d.and_time(NaiveTime::MIN).and_utc() - chrono::Duration::nanoseconds(1)),
            limit: self.limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodSummary {
    pub id: String,
    pub mood: MoodLabel,
    pub intensity: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
}

impl From<MoodEntry> for MoodSummary {
    fn from(entry: MoodEntry) -> Self {
        Self {
            id: entry.id,
            mood: entry.mood,
            intensity: entry.intensity,
            note: entry.note,
            tags: entry.tags,
            created_at: entry.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoodHistory {
    /// Most recent first.
    pub entries: Vec<MoodSummary>,
    /// Percentage of returned entries per label.
    pub distribution: BTreeMap<MoodLabel, u32>,
}

impl MoodHistory {
    pub fn from_entries(entries: Vec<MoodEntry>) -> Self {
        let distribution = mood_distribution(&entries);
        Self {
            entries: entries.into_iter().map(MoodSummary::from).collect(),
            distribution,
        }
    }

    pub fn latest(&self) -> Option<&MoodSummary> {
        self.entries.first()
    }
}
