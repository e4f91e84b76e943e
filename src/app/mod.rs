//! Presentation-side state: cached live lists, in-memory preferences and a
//! background queue for writes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;

use crate::config::AppConfig;
use crate::remaining::now_millis;
use crate::repository::CounterRepository;
use crate::search::parse_query;
use crate::storage::{Counter, CounterHistoryEntry, NewCounter, SharedView, Subscription};

pub mod actions;
pub mod state;

pub use actions::{ActionWorker, CounterAction};
pub use state::{EphemeralState, Observable, Watcher};

struct SearchCache {
    generation: u64,
    query: String,
    results: Arc<Vec<Counter>>,
}

pub struct StateProjection {
    repository: CounterRepository,
    state: Arc<EphemeralState>,
    all: SharedView<Vec<Counter>>,
    favorites: SharedView<Vec<Counter>>,
    archived: SharedView<Vec<Counter>>,
    categories: SharedView<Vec<String>>,
    search: Mutex<Option<SearchCache>>,
    refresh_delay: Duration,
    refresh_token: Arc<AtomicU64>,
    upcoming_limit: usize,
    worker: ActionWorker,
}

impl StateProjection {
    pub fn new(repository: CounterRepository, config: &AppConfig) -> Result<Self> {
        let storage = repository.storage();
        let all = storage.shared(|storage| storage.list_active());
        let favorites = storage.shared(|storage| storage.list_favorites());
        let archived = storage.shared(|storage| storage.list_archived());
        let categories = storage.shared(|storage| storage.list_categories());
        let state = Arc::new(EphemeralState::new(
            config.theme.is_dark(),
            config.haptic_feedback,
            config.sound_effects,
        ));
        let worker = ActionWorker::spawn(repository.clone(), Arc::clone(&state))?;
        Ok(Self {
            repository,
            state,
            all,
            favorites,
            archived,
            categories,
            search: Mutex::new(None),
            refresh_delay: config.refresh_delay(),
            refresh_token: Arc::new(AtomicU64::new(0)),
            upcoming_limit: config.widget.upcoming_limit,
            worker,
        })
    }

    pub fn repository(&self) -> &CounterRepository {
        &self.repository
    }

    pub fn state(&self) -> &EphemeralState {
        &self.state
    }

    pub fn all_counters(&self) -> Arc<Vec<Counter>> {
        self.all.get()
    }

    pub fn favorite_counters(&self) -> Arc<Vec<Counter>> {
        self.favorites.get()
    }

    pub fn archived_counters(&self) -> Arc<Vec<Counter>> {
        self.archived.get()
    }

    pub fn categories(&self) -> Arc<Vec<String>> {
        self.categories.get()
    }

    pub fn watch_all(&self) -> Subscription<Vec<Counter>> {
        self.all.subscribe()
    }

    /// Counters matching the current search text, re-queried only when the
    /// text or the store changes.
    pub fn search_results(&self) -> Arc<Vec<Counter>> {
        let query = self.state.search_query.get();
        let generation = self.repository.storage().generation();
        let mut cache = self.search.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.generation == generation && cached.query == query {
                return Arc::clone(&cached.results);
            }
        }
        match self.repository.query(&parse_query(&query)) {
            Ok(results) => {
                let results = Arc::new(results);
                *cache = Some(SearchCache {
                    generation,
                    query,
                    results: Arc::clone(&results),
                });
                results
            }
            Err(err) => {
                tracing::warn!(%err, query = %query, "search failed, keeping previous results");
                cache
                    .as_ref()
                    .map(|cached| Arc::clone(&cached.results))
                    .unwrap_or_default()
            }
        }
    }

    /// Widget snapshot using the configured limit.
    pub fn upcoming(&self) -> Result<Vec<Counter>> {
        Ok(self.repository.upcoming(now_millis(), self.upcoming_limit)?)
    }

    /// History of the stored counter, or empty if it no longer exists.
    pub fn counter_history(&self, counter: &Counter) -> Result<Vec<CounterHistoryEntry>> {
        Ok(self
            .repository
            .get_counter(counter.id)?
            .map(|fresh| fresh.history)
            .unwrap_or_default())
    }

    pub fn set_search_query(&self, query: impl Into<String>) {
        self.state.search_query.set(query.into());
    }

    pub fn set_dark_mode(&self, enabled: bool) {
        self.state.dark_mode.set(enabled);
    }

    pub fn set_haptic_feedback(&self, enabled: bool) {
        self.state.haptic_feedback.set(enabled);
    }

    pub fn set_sound_effects(&self, enabled: bool) {
        self.state.sound_effects.set(enabled);
    }

    pub fn sign_in(&self, user: impl Into<String>) {
        self.state.current_user.set(Some(user.into()));
    }

    pub fn sign_out(&self) {
        self.state.current_user.set(None);
    }

    pub fn clear_error(&self) {
        self.state.last_error.set(None);
    }

    /// Raises `refreshing` for the configured delay. Nothing is re-fetched;
    /// the views are already live.
    pub fn refresh(&self) {
        let token = self.refresh_token.fetch_add(1, Ordering::AcqRel) + 1;
        self.state.refreshing.set(true);
        let state = Arc::clone(&self.state);
        let latest = Arc::clone(&self.refresh_token);
        let delay = self.refresh_delay;
        let spawned = thread::Builder::new()
            .name("countdown-refresh".into())
            .spawn(move || {
                thread::sleep(delay);
                if latest.load(Ordering::Acquire) == token {
                    state.refreshing.set(false);
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(%err, "could not start refresh timer");
            self.state.refreshing.set(false);
        }
    }

    pub fn dispatch(&self, action: CounterAction) {
        self.worker.dispatch(action);
    }

    /// Waits for every queued write to land.
    pub fn flush(&self) -> Result<()> {
        self.worker.flush()
    }

    pub fn insert_counter(&self, counter: NewCounter) {
        self.dispatch(CounterAction::Insert(counter));
    }

    pub fn update_counter(&self, counter: Counter) {
        self.dispatch(CounterAction::Update(counter));
    }

    pub fn delete_counter(&self, counter: Counter) {
        self.dispatch(CounterAction::Delete(counter));
    }

    pub fn toggle_favorite(&self, counter: Counter) {
        self.dispatch(CounterAction::ToggleFavorite(counter));
    }

    pub fn archive_counter(&self, counter: Counter) {
        self.dispatch(CounterAction::Archive(counter));
    }

    pub fn unarchive_counter(&self, counter: Counter) {
        self.dispatch(CounterAction::Unarchive(counter));
    }

    pub fn update_progress(&self, counter: Counter, progress: i64) {
        self.dispatch(CounterAction::SetProgress { counter, progress });
    }

    pub fn increment_progress(&self, counter: Counter) {
        self.dispatch(CounterAction::Increment(counter));
    }

    pub fn decrement_progress(&self, counter: Counter) {
        self.dispatch(CounterAction::Decrement(counter));
    }

    pub fn add_note(&self, counter: Counter, note: impl Into<String>) {
        self.dispatch(CounterAction::AddNote {
            counter,
            note: note.into(),
        });
    }

    pub fn remove_note(&self, counter: Counter, index: usize) {
        self.dispatch(CounterAction::RemoveNote { counter, index });
    }

    pub fn set_icon(&self, counter: Counter, icon: impl Into<String>) {
        self.dispatch(CounterAction::SetIcon {
            counter,
            icon: icon.into(),
        });
    }

    pub fn set_background_color(&self, counter: Counter, argb: Option<u32>) {
        self.dispatch(CounterAction::SetBackgroundColor { counter, argb });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StorageOptions, ThemeName};
    use crate::storage::StorageHandle;
    use tempfile::TempDir;

    fn projection(config: &AppConfig) -> anyhow::Result<(TempDir, StateProjection)> {
        let temp = TempDir::new()?;
        let db_path = temp.path().join("counters.db");
        let storage = StorageHandle::new(db_path, StorageOptions::default());
        let projection = StateProjection::new(CounterRepository::new(storage), config)?;
        Ok((temp, projection))
    }

    fn first_counter(projection: &StateProjection) -> anyhow::Result<Counter> {
        projection
            .all_counters()
            .first()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("no counters"))
    }

    #[test]
    fn views_start_empty_and_follow_writes() -> anyhow::Result<()> {
        let (_temp, projection) = projection(&AppConfig::default())?;
        assert!(projection.all_counters().is_empty());

        projection.insert_counter(NewCounter::new("Trip", now_millis() + 60_000).category("fun"));
        projection.flush()?;
        assert_eq!(projection.all_counters().len(), 1);
        assert_eq!(*projection.categories(), vec!["fun".to_string()]);

        let counter = first_counter(&projection)?;
        projection.toggle_favorite(counter.clone());
        projection.flush()?;
        assert_eq!(projection.favorite_counters().len(), 1);

        projection.archive_counter(counter);
        projection.flush()?;
        assert!(projection.all_counters().is_empty());
        assert!(projection.favorite_counters().is_empty());
        assert_eq!(projection.archived_counters().len(), 1);
        assert!(projection.categories().is_empty());
        Ok(())
    }

    #[test]
    fn shared_reads_do_not_requery() -> anyhow::Result<()> {
        let (_temp, projection) = projection(&AppConfig::default())?;
        projection.insert_counter(NewCounter::new("One", 10));
        projection.flush()?;
        let first = projection.all_counters();
        let second = projection.all_counters();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(projection.all.load_count(), 1);
        Ok(())
    }

    #[test]
    fn search_results_track_query_and_store() -> anyhow::Result<()> {
        let (_temp, projection) = projection(&AppConfig::default())?;
        projection.insert_counter(NewCounter::new("Birthday Party", 100));
        projection.insert_counter(NewCounter::new("Work Deadline", 200));
        projection.flush()?;

        assert_eq!(projection.search_results().len(), 2);
        projection.set_search_query("art");
        let results = projection.search_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].title, "Birthday Party");
        assert!(Arc::ptr_eq(&results, &projection.search_results()));

        projection.insert_counter(NewCounter::new("Art class", 300));
        projection.flush()?;
        assert_eq!(projection.search_results().len(), 2);
        Ok(())
    }

    #[test]
    fn initial_flags_come_from_config() -> anyhow::Result<()> {
        let config = AppConfig {
            theme: ThemeName::Dark,
            sound_effects: false,
            ..AppConfig::default()
        };
        let (_temp, projection) = projection(&config)?;
        assert!(projection.state().dark_mode.get());
        assert!(projection.state().haptic_feedback.get());
        assert!(!projection.state().sound_effects.get());

        projection.set_dark_mode(false);
        projection.sign_in("ada");
        assert_eq!(projection.state().current_user.get().as_deref(), Some("ada"));
        projection.sign_out();
        assert_eq!(projection.state().current_user.get(), None);
        assert!(!projection.state().dark_mode.get());
        Ok(())
    }

    #[test]
    fn refresh_raises_then_clears() -> anyhow::Result<()> {
        let config = AppConfig {
            refresh_delay_ms: 100,
            ..AppConfig::default()
        };
        let (_temp, projection) = projection(&config)?;
        let watcher = projection.state().refreshing.subscribe();
        projection.refresh();
        assert!(projection.state().refreshing.get());
        assert!(watcher.changed());
        assert_eq!(watcher.wait_timeout(Duration::from_secs(2)), Some(false));
        Ok(())
    }

    #[test]
    fn older_refresh_timer_does_not_clear_newer() -> anyhow::Result<()> {
        let config = AppConfig {
            refresh_delay_ms: 200,
            ..AppConfig::default()
        };
        let (_temp, projection) = projection(&config)?;
        projection.refresh();
        thread::sleep(Duration::from_millis(120));
        projection.refresh();
        thread::sleep(Duration::from_millis(120));
        assert!(projection.state().refreshing.get());
        thread::sleep(Duration::from_millis(250));
        assert!(!projection.state().refreshing.get());
        Ok(())
    }

    #[test]
    fn progress_actions_and_history() -> anyhow::Result<()> {
        let (_temp, projection) = projection(&AppConfig::default())?;
        projection.insert_counter(NewCounter::new("Run", 10).goal(3, Some("km".into())));
        projection.flush()?;
        let counter = first_counter(&projection)?;

        projection.increment_progress(counter.clone());
        projection.update_progress(counter.clone(), 3);
        projection.decrement_progress(counter.clone());
        projection.flush()?;

        let history = projection.counter_history(&counter)?;
        let labels: Vec<_> = history.iter().map(|entry| entry.action.as_str()).collect();
        assert_eq!(labels, ["increment", "progress", "decrement"]);
        assert_eq!(first_counter(&projection)?.current_progress, 2);
        Ok(())
    }

    #[test]
    fn upcoming_respects_configured_limit() -> anyhow::Result<()> {
        let mut config = AppConfig::default();
        config.widget.upcoming_limit = 2;
        let (_temp, projection) = projection(&config)?;
        let now = now_millis();
        for offset in 1..=4 {
            projection.insert_counter(NewCounter::new(format!("C{offset}"), now + offset * 60_000));
        }
        projection.insert_counter(NewCounter::new("Past", now - 60_000));
        projection.flush()?;
        let titles: Vec<_> = projection
            .upcoming()?
            .into_iter()
            .map(|counter| counter.title)
            .collect();
        assert_eq!(titles, ["C1", "C2"]);
        Ok(())
    }

    #[test]
    fn write_errors_reach_last_error() -> anyhow::Result<()> {
        let (_temp, projection) = projection(&AppConfig::default())?;
        projection.insert_counter(NewCounter::new("Notes", 10));
        projection.flush()?;
        let counter = first_counter(&projection)?;
        projection.add_note(counter, "  ");
        projection.flush()?;
        assert!(projection.state().last_error.get().is_some());
        projection.clear_error();
        assert!(projection.state().last_error.get().is_none());
        Ok(())
    }
}
