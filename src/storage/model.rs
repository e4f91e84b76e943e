use rusqlite::Row;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::remaining::{self, TimeRemaining};

pub const DEFAULT_ICON: &str = "⏱️";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub id: i64,
    pub title: String,
    pub target_at: i64,
    pub is_favorite: bool,
    pub is_archived: bool,
    pub image_uri: Option<String>,
    pub has_reminder: bool,
    pub created_at: i64,
    pub icon: String,
    pub background_color: Option<u32>,
    pub notes: Vec<String>,
    pub category: Option<String>,
    pub goal_target: Option<i64>,
    pub goal_type: Option<String>,
    pub current_progress: i64,
    pub history: Vec<CounterHistoryEntry>,
}

impl Counter {
    pub fn time_remaining(&self, now: i64) -> TimeRemaining {
        remaining::calculate_time_remaining(self.target_at, now)
    }

    /// Share of the created-to-target span already elapsed, in `[0.0, 1.0]`.
    pub fn elapsed_fraction(&self, now: i64) -> f64 {
        remaining::elapsed_fraction(self.created_at, self.target_at, now)
    }
}

/// Fields supplied when creating a counter. `created_at` defaults to the
/// insert instant when left unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewCounter {
    pub title: String,
    pub target_at: i64,
    pub is_favorite: bool,
    pub is_archived: bool,
    pub image_uri: Option<String>,
    pub has_reminder: bool,
    pub created_at: Option<i64>,
    pub icon: String,
    pub background_color: Option<u32>,
    pub notes: Vec<String>,
    pub category: Option<String>,
    pub goal_target: Option<i64>,
    pub goal_type: Option<String>,
    pub current_progress: i64,
}

impl NewCounter {
    pub fn new(title: impl Into<String>, target_at: i64) -> Self {
        Self {
            title: title.into(),
            target_at,
            is_favorite: false,
            is_archived: false,
            image_uri: None,
            has_reminder: false,
            created_at: None,
            icon: DEFAULT_ICON.to_string(),
            background_color: None,
            notes: Vec::new(),
            category: None,
            goal_target: None,
            goal_type: None,
            current_progress: 0,
        }
    }

    pub fn favorite(mut self, favorite: bool) -> Self {
        self.is_favorite = favorite;
        self
    }

    pub fn archived(mut self, archived: bool) -> Self {
        self.is_archived = archived;
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn icon(mut self, icon: impl Into<String>) -> Self {
        self.icon = icon.into();
        self
    }

    pub fn background_color(mut self, argb: u32) -> Self {
        self.background_color = Some(argb);
        self
    }

    pub fn image_uri(mut self, uri: impl Into<String>) -> Self {
        self.image_uri = Some(uri.into());
        self
    }

    pub fn reminder(mut self, enabled: bool) -> Self {
        self.has_reminder = enabled;
        self
    }

    pub fn created_at(mut self, created_at: i64) -> Self {
        self.created_at = Some(created_at);
        self
    }

    pub fn notes<I, S>(mut self, notes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.notes = notes.into_iter().map(Into::into).collect();
        self
    }

    pub fn goal(mut self, target: i64, kind: Option<String>) -> Self {
        self.goal_target = Some(target);
        self.goal_type = kind;
        self
    }

    pub fn progress(mut self, progress: i64) -> Self {
        self.current_progress = progress;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterHistoryEntry {
    pub timestamp: i64,
    pub action: String,
    pub value: i64,
}

impl CounterHistoryEntry {
    pub fn new(timestamp: i64, action: impl Into<String>, value: i64) -> Self {
        Self {
            timestamp,
            action: action.into(),
            value,
        }
    }
}

/// Labels written by the built-in progress actions. History entries may carry
/// any other label as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, AsRefStr)]
#[strum(serialize_all = "lowercase")]
pub enum HistoryAction {
    Increment,
    Decrement,
    Progress,
}

pub(crate) const COUNTER_COLUMNS: &str = "id,
        title,
        target_at,
        is_favorite,
        is_archived,
        image_uri,
        has_reminder,
        created_at,
        icon,
        background_color,
        notes,
        category,
        goal_target,
        goal_type,
        current_progress,
        history";

pub(crate) fn row_to_counter(row: &Row<'_>) -> rusqlite::Result<Counter> {
    let id: i64 = row.get(0)?;
    let notes: Option<String> = row.get(10)?;
    let history: Option<String> = row.get(15)?;
    Ok(Counter {
        id,
        title: row.get(1)?,
        target_at: row.get(2)?,
        is_favorite: row.get::<_, i64>(3)? != 0,
        is_archived: row.get::<_, i64>(4)? != 0,
        image_uri: row.get(5)?,
        has_reminder: row.get::<_, i64>(6)? != 0,
        created_at: row.get(7)?,
        icon: row.get(8)?,
        background_color: decode_color(id, row.get(9)?),
        notes: decode_lenient(id, "notes", notes.as_deref()),
        category: row.get(11)?,
        goal_target: row.get(12)?,
        goal_type: row.get(13)?,
        current_progress: row.get(14)?,
        history: decode_lenient(id, "history", history.as_deref()),
    })
}

fn decode_color(id: i64, raw: Option<i64>) -> Option<u32> {
    let raw = raw?;
    match u32::try_from(raw) {
        Ok(argb) => Some(argb),
        Err(_) => {
            tracing::warn!(counter_id = id, raw, "ignoring out-of-range background color");
            None
        }
    }
}

/// Lenient history decoder: absent, blank or malformed text yields an empty list.
pub fn parse_history(raw: Option<&str>) -> Vec<CounterHistoryEntry> {
    decode_list(raw).unwrap_or_default()
}

/// Decodes a stored JSON list, logging and returning an empty list when the
/// text does not parse.
pub(crate) fn decode_lenient<T: DeserializeOwned>(
    id: i64,
    field: &str,
    raw: Option<&str>,
) -> Vec<T> {
    decode_list(raw).unwrap_or_else(|err| {
        tracing::warn!(counter_id = id, field, %err, "treating malformed list as empty");
        Vec::new()
    })
}

fn decode_list<T: DeserializeOwned>(raw: Option<&str>) -> Result<Vec<T>, serde_json::Error> {
    match raw.map(str::trim) {
        None | Some("") => Ok(Vec::new()),
        Some(text) => serde_json::from_str(text),
    }
}

/// Empty lists are stored as NULL.
pub(crate) fn encode_list<T: Serialize>(items: &[T]) -> serde_json::Result<Option<String>> {
    if items.is_empty() {
        Ok(None)
    } else {
        serde_json::to_string(items).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn history_decoding_is_lenient() {
        assert!(parse_history(None).is_empty());
        assert!(parse_history(Some("   ")).is_empty());
        assert!(parse_history(Some("{not json")).is_empty());
        assert!(parse_history(Some(r#"{"timestamp":1}"#)).is_empty());

        let entries = parse_history(Some(
            r#"[{"timestamp":1,"action":"increment","value":1},
                {"timestamp":2,"action":"progress","value":5}]"#,
        ));
        assert_eq!(
            entries,
            vec![
                CounterHistoryEntry::new(1, "increment", 1),
                CounterHistoryEntry::new(2, "progress", 5),
            ]
        );
    }

    #[test]
    fn notes_may_contain_former_delimiters() {
        let notes = vec!["pack a|||b".to_string(), "call mum".to_string()];
        let encoded = encode_list(&notes).unwrap().unwrap();
        assert_eq!(decode_lenient::<String>(1, "notes", Some(&encoded)), notes);
    }

    #[test]
    fn empty_list_encodes_as_null() {
        assert_eq!(encode_list::<String>(&[]).unwrap(), None);
    }

    #[test]
    fn history_action_labels() {
        assert_eq!(HistoryAction::Increment.as_ref(), "increment");
        assert_eq!("decrement".parse::<HistoryAction>().unwrap(), HistoryAction::Decrement);
        assert_eq!(HistoryAction::Progress.to_string(), "progress");
    }

    #[test]
    fn new_counter_defaults() {
        let counter = NewCounter::new("Launch", 10);
        assert_eq!(counter.icon, DEFAULT_ICON);
        assert_eq!(counter.current_progress, 0);
        assert!(counter.created_at.is_none());
        assert!(!counter.is_favorite && !counter.is_archived);
    }
}
