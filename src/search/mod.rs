use std::cmp::{max, min};

use time::format_description;
use time::{Date, Duration, Time};

use crate::storage::Counter;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeFilter {
    pub from: Option<i64>,
    pub to: Option<i64>, // exclusive
}

impl RangeFilter {
    pub fn has_range(&self) -> bool {
        self.from.is_some() || self.to.is_some()
    }

    pub fn contains(&self, value: i64) -> bool {
        self.from.map_or(true, |from| value >= from) && self.to.map_or(true, |to| value < to)
    }

    pub fn merge(&mut self, other: RangeFilter) {
        if let Some(from) = other.from {
            self.from = Some(match self.from {
                Some(existing) => max(existing, from),
                None => from,
            });
        }
        if let Some(to) = other.to {
            self.to = Some(match self.to {
                Some(existing) => min(existing, to),
                None => to,
            });
        }
    }
}

/// Which base list a query draws from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Scope {
    #[default]
    Active,
    Favorites,
    Archived,
}

/// Parsed form of the free-text filter box, e.g.
/// `party category:family is:fav due:2026-01-01..2026-02-01`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterQuery {
    pub title: Option<String>,
    pub category: Option<String>,
    pub scope: Scope,
    pub due: RangeFilter,
    pub created: RangeFilter,
}

impl CounterQuery {
    pub fn has_filters(&self) -> bool {
        self.category.is_some() || self.due.has_range() || self.created.has_range()
    }

    pub fn is_empty(&self) -> bool {
        self.title.is_none() && self.scope == Scope::Active && !self.has_filters()
    }

    /// Applies every filter except the scope, which the caller resolves by
    /// choosing the base list.
    pub fn matches(&self, counter: &Counter) -> bool {
        if let Some(category) = &self.category {
            if counter.category.as_deref() != Some(category.as_str()) {
                return false;
            }
        }
        if let Some(title) = &self.title {
            if !counter.title.to_lowercase().contains(&title.to_lowercase()) {
                return false;
            }
        }
        self.due.contains(counter.target_at) && self.created.contains(counter.created_at)
    }
}

pub fn parse_query(input: &str) -> CounterQuery {
    let mut query = CounterQuery::default();
    let mut words = Vec::new();
    for raw in input.split_whitespace() {
        if let Some(category) = raw
            .strip_prefix("category:")
            .or_else(|| raw.strip_prefix("cat:"))
        {
            if !category.is_empty() {
                query.category = Some(category.to_string());
            }
            continue;
        }
        if let Some(flag) = raw.strip_prefix("is:") {
            match flag.to_lowercase().as_str() {
                "fav" | "favorite" | "favourite" => query.scope = Scope::Favorites,
                "archived" => query.scope = Scope::Archived,
                other => tracing::debug!(flag = other, "ignoring unknown is: filter"),
            }
            continue;
        }
        if let Some(range) = raw.strip_prefix("due:") {
            query.due.merge(parse_date_range(range));
            continue;
        }
        if let Some(range) = raw.strip_prefix("created:") {
            query.created.merge(parse_date_range(range));
            continue;
        }
        words.push(raw);
    }
    if !words.is_empty() {
        query.title = Some(words.join(" "));
    }
    query
}

fn parse_date_range(input: &str) -> RangeFilter {
    let mut range = RangeFilter::default();
    let parts: Vec<&str> = input.split("..").collect();
    match parts.as_slice() {
        [single] => {
            if let Some((from, to)) = parse_single_date(single) {
                range.from = Some(from);
                range.to = Some(to);
            }
        }
        [from, to] => {
            if !from.is_empty() {
                if let Some((start, _)) = parse_single_date(from) {
                    range.from = Some(start);
                }
            }
            if !to.is_empty() {
                if let Some((_, end)) = parse_single_date(to) {
                    range.to = Some(end);
                }
            }
        }
        _ => {}
    }
    range
}

/// Millisecond bounds of one UTC calendar day.
fn parse_single_date(input: &str) -> Option<(i64, i64)> {
    static FORMAT: once_cell::sync::Lazy<Vec<format_description::FormatItem<'static>>> =
        once_cell::sync::Lazy::new(|| {
            format_description::parse("[year]-[month]-[day]")
                .expect("valid date format description")
        });
    let date = Date::parse(input, &*FORMAT).ok()?;
    let from = date.with_time(Time::MIDNIGHT).assume_utc().unix_timestamp();
    let to = date
        .checked_add(Duration::days(1))?
        .with_time(Time::MIDNIGHT)
        .assume_utc()
        .unix_timestamp();
    Some((from * 1_000, to * 1_000))
}
