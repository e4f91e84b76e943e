use crate::remaining::now_millis;
use crate::search::{CounterQuery, Scope};
use crate::storage::{
    self, Counter, CounterHistoryEntry, NewCounter, Result, StorageHandle, Subscription,
};

/// Counter operations in the vocabulary of the screens: live lists plus the
/// favorite/archive/progress/history conveniences.
#[derive(Clone)]
pub struct CounterRepository {
    storage: StorageHandle,
}

impl CounterRepository {
    pub fn new(storage: StorageHandle) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &StorageHandle {
        &self.storage
    }

    pub fn all_counters(&self) -> Subscription<Vec<Counter>> {
        self.storage.watch(|storage| storage.list_active())
    }

    pub fn favorite_counters(&self) -> Subscription<Vec<Counter>> {
        self.storage.watch(|storage| storage.list_favorites())
    }

    pub fn archived_counters(&self) -> Subscription<Vec<Counter>> {
        self.storage.watch(|storage| storage.list_archived())
    }

    pub fn all_categories(&self) -> Subscription<Vec<String>> {
        self.storage.watch(|storage| storage.list_categories())
    }

    pub fn counters_by_category(&self, category: &str) -> Subscription<Vec<Counter>> {
        let category = category.to_string();
        self.storage
            .watch(move |storage| storage.list_by_category(&category))
    }

    pub fn search_counters(&self, query: &str) -> Subscription<Vec<Counter>> {
        let query = query.to_string();
        self.storage.watch(move |storage| storage.search_by_title(&query))
    }

    pub fn get_counter(&self, id: i64) -> Result<Option<Counter>> {
        self.storage.get(id)
    }

    pub fn insert_counter(&self, counter: &NewCounter) -> Result<i64> {
        self.storage.insert(counter)
    }

    pub fn update_counter(&self, counter: &Counter) -> Result<bool> {
        self.storage.update(counter)
    }

    pub fn delete_counter(&self, counter: &Counter) -> Result<bool> {
        self.storage.delete(counter.id)
    }

    /// Flips the stored favorite flag. Returns the new value, or `None` if the
    /// counter no longer exists.
    pub fn toggle_favorite(&self, counter: &Counter) -> Result<Option<bool>> {
        self.storage.toggle_favorite(counter.id)
    }

    pub fn archive_counter(&self, counter: &Counter) -> Result<bool> {
        self.storage.set_archived(counter.id, true)
    }

    pub fn unarchive_counter(&self, counter: &Counter) -> Result<bool> {
        self.storage.set_archived(counter.id, false)
    }

    pub fn update_progress(&self, counter: &Counter, progress: i64) -> Result<bool> {
        self.storage.set_progress(counter.id, progress)
    }

    /// Appends one entry stamped with the current instant. The append runs
    /// against the stored history, not the snapshot in `counter`.
    pub fn add_history_entry(&self, counter: &Counter, action: &str, value: i64) -> Result<bool> {
        let entry = CounterHistoryEntry::new(now_millis(), action, value);
        let appended = self.storage.append_history(counter.id, &entry)?;
        if appended {
            tracing::debug!(counter_id = counter.id, action, value, "history entry added");
        }
        Ok(appended)
    }

    pub fn parse_history(&self, raw: Option<&str>) -> Vec<CounterHistoryEntry> {
        storage::parse_history(raw)
    }

    pub fn add_note(&self, counter: &Counter, note: &str) -> Result<bool> {
        self.storage.append_note(counter.id, note)
    }

    pub fn remove_note(&self, counter: &Counter, index: usize) -> Result<bool> {
        self.storage.remove_note(counter.id, index)
    }

    pub fn set_icon(&self, counter: &Counter, icon: &str) -> Result<bool> {
        self.storage.set_icon(counter.id, icon)
    }

    pub fn set_background_color(&self, counter: &Counter, argb: Option<u32>) -> Result<bool> {
        self.storage.set_background_color(counter.id, argb)
    }

    /// One-shot snapshot for home-screen widgets: future, non-archived
    /// counters, soonest first.
    pub fn upcoming(&self, now: i64, limit: usize) -> Result<Vec<Counter>> {
        self.storage.list_upcoming(now, limit)
    }

    pub fn query(&self, query: &CounterQuery) -> Result<Vec<Counter>> {
        let mut counters = match (query.scope, query.category.as_deref()) {
            (Scope::Archived, _) => self.storage.list_archived()?,
            (Scope::Favorites, _) => self.storage.list_favorites()?,
            (Scope::Active, Some(category)) => self.storage.list_by_category(category)?,
            (Scope::Active, None) => self.storage.list_active()?,
        };
        counters.retain(|counter| query.matches(counter));
        Ok(counters)
    }

    pub fn watch_query(&self, query: CounterQuery) -> Subscription<Vec<Counter>> {
        let repository = self.clone();
        self.storage.watch(move |_| repository.query(&query))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageOptions;
    use crate::search::parse_query;
    use crate::storage::HistoryAction;
    use tempfile::TempDir;

    fn init_repository() -> anyhow::Result<(TempDir, CounterRepository)> {
        let temp = TempDir::new()?;
        let db_path = temp.path().join("counters.db");
        let storage = StorageHandle::new(db_path, StorageOptions::default());
        Ok((temp, CounterRepository::new(storage)))
    }

    fn fetch(repository: &CounterRepository, id: i64) -> anyhow::Result<Counter> {
        repository
            .get_counter(id)?
            .ok_or_else(|| anyhow::anyhow!("counter {id} missing"))
    }

    #[test]
    fn toggling_twice_restores_flag() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        let id = repository.insert_counter(&NewCounter::new("Concert", 10))?;
        let snapshot = fetch(&repository, id)?;

        assert_eq!(repository.toggle_favorite(&snapshot)?, Some(true));
        assert!(fetch(&repository, id)?.is_favorite);
        // the stale snapshot still says "not favorite"; the flip uses stored state
        assert_eq!(repository.toggle_favorite(&snapshot)?, Some(false));
        assert!(!fetch(&repository, id)?.is_favorite);
        Ok(())
    }

    #[test]
    fn archive_and_unarchive_move_between_views() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        let id = repository.insert_counter(&NewCounter::new("Exam", 10).favorite(true))?;
        let counter = fetch(&repository, id)?;
        let favorites = repository.favorite_counters();

        repository.archive_counter(&counter)?;
        repository.archive_counter(&counter)?;
        assert!(favorites.current()?.is_empty());
        assert_eq!(repository.archived_counters().current()?.len(), 1);
        let archived = fetch(&repository, id)?;
        assert_eq!(archived, Counter { is_archived: true, ..counter.clone() });

        repository.unarchive_counter(&counter)?;
        assert_eq!(fetch(&repository, id)?, counter);
        assert_eq!(favorites.try_next()?.map(|list| list.len()), Some(1));
        Ok(())
    }

    #[test]
    fn progress_is_not_clamped() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        let id = repository.insert_counter(&NewCounter::new("Pushups", 10).goal(10, None))?;
        let counter = fetch(&repository, id)?;
        repository.update_progress(&counter, 25)?;
        let counter = fetch(&repository, id)?;
        assert_eq!(counter.current_progress, 25);
        assert_eq!(counter.goal_target, Some(10));
        Ok(())
    }

    #[test]
    fn history_appends_in_call_order() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        let id = repository.insert_counter(&NewCounter::new("Reading", 10))?;
        let stale = fetch(&repository, id)?;
        for value in 1..=5 {
            repository.add_history_entry(&stale, HistoryAction::Increment.as_ref(), value)?;
        }
        let history = fetch(&repository, id)?.history;
        assert_eq!(history.len(), 5);
        assert_eq!(
            history.iter().map(|entry| entry.value).collect::<Vec<_>>(),
            vec![1, 2, 3, 4, 5]
        );
        assert!(history.windows(2).all(|pair| pair[0].timestamp <= pair[1].timestamp));
        assert!(history.iter().all(|entry| entry.action == "increment"));
        Ok(())
    }

    #[test]
    fn history_on_deleted_counter_is_noop() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        let id = repository.insert_counter(&NewCounter::new("Temp", 10))?;
        let counter = fetch(&repository, id)?;
        assert!(repository.delete_counter(&counter)?);
        assert!(!repository.add_history_entry(&counter, "progress", 1)?);
        assert!(!repository.delete_counter(&counter)?);
        Ok(())
    }

    #[test]
    fn parse_history_swallows_garbage() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        assert!(repository.parse_history(Some("not json")).is_empty());
        Ok(())
    }

    #[test]
    fn search_matches_title_substring() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        repository.insert_counter(&NewCounter::new("Birthday Party", 100))?;
        repository.insert_counter(&NewCounter::new("Work Deadline", 200).archived(true))?;
        let results = repository.search_counters("art").current()?;
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Birthday Party");
        Ok(())
    }

    #[test]
    fn category_stream_updates() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        let work = repository.counters_by_category("work");
        let categories = repository.all_categories();
        repository.insert_counter(&NewCounter::new("Review", 100).category("work"))?;
        assert_eq!(work.try_next()?.map(|list| list.len()), Some(1));
        assert_eq!(categories.try_next()?, Some(vec!["work".to_string()]));
        Ok(())
    }

    #[test]
    fn query_combines_scope_and_filters() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        repository.insert_counter(&NewCounter::new("Team party", 100).category("work"))?;
        repository.insert_counter(
            &NewCounter::new("Garden party", 200)
                .category("home")
                .favorite(true),
        )?;
        repository.insert_counter(&NewCounter::new("Old party", 50).archived(true))?;

        let titles = |query: &str| -> anyhow::Result<Vec<String>> {
            Ok(repository
                .query(&parse_query(query))?
                .into_iter()
                .map(|counter| counter.title)
                .collect())
        };
        assert_eq!(titles("party")?, ["Team party", "Garden party"]);
        assert_eq!(titles("party cat:work")?, ["Team party"]);
        assert_eq!(titles("is:fav")?, ["Garden party"]);
        assert_eq!(titles("is:archived party")?, ["Old party"]);
        assert!(titles("is:fav cat:work")?.is_empty());
        Ok(())
    }

    #[test]
    fn notes_and_appearance_helpers() -> anyhow::Result<()> {
        let (_temp, repository) = init_repository()?;
        let id = repository.insert_counter(&NewCounter::new("Move", 10))?;
        let counter = fetch(&repository, id)?;
        repository.add_note(&counter, "rent van")?;
        repository.add_note(&counter, "boxes")?;
        repository.remove_note(&counter, 0)?;
        repository.set_icon(&counter, "📦")?;
        repository.set_background_color(&counter, Some(0xFFAA_BBCC))?;
        repository.set_background_color(&counter, None)?;
        let counter = fetch(&repository, id)?;
        assert_eq!(counter.notes, vec!["boxes".to_string()]);
        assert_eq!(counter.icon, "📦");
        assert_eq!(counter.background_color, None);
        Ok(())
    }
}
