use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Params, TransactionBehavior};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{ConfigPaths, StorageOptions};
use crate::remaining::now_millis;

mod error;
pub mod live;
pub mod model;
mod schema;

pub use error::{Result, StorageError, UnavailableCause};
pub use live::{ChangeNotifier, SharedView, Subscription, EXTERNAL_POLL_INTERVAL};
pub use model::{
    parse_history, Counter, CounterHistoryEntry, HistoryAction, NewCounter, DEFAULT_ICON,
};
pub use schema::SCHEMA_VERSION;

use model::{decode_lenient, encode_list, row_to_counter, COUNTER_COLUMNS};

const ACTIVE_ORDER: &str = "ORDER BY target_at ASC, id ASC";
const ARCHIVED_ORDER: &str = "ORDER BY target_at DESC, id DESC";

#[derive(Debug, Clone, Copy)]
enum ListColumn {
    Notes,
    History,
}

impl ListColumn {
    fn name(self) -> &'static str {
        match self {
            ListColumn::Notes => "notes",
            ListColumn::History => "history",
        }
    }
}

/// Shared handle to the counter database. Cloning is cheap; every clone uses
/// the same lazily opened connection and the same change notifier.
#[derive(Clone)]
pub struct StorageHandle {
    inner: Arc<StorageInner>,
}

struct StorageInner {
    db_path: PathBuf,
    options: StorageOptions,
    conn: Mutex<Option<Connection>>,
    // last `PRAGMA data_version` seen on `conn`; only touched while `conn` is locked
    seen_data_version: Mutex<Option<i64>>,
    notifier: ChangeNotifier,
}

impl StorageHandle {
    /// Creates a handle without touching the filesystem. The database is
    /// opened on first use.
    pub fn new(db_path: impl Into<PathBuf>, options: StorageOptions) -> Self {
        Self {
            inner: Arc::new(StorageInner {
                db_path: db_path.into(),
                options,
                conn: Mutex::new(None),
                seen_data_version: Mutex::new(None),
                notifier: ChangeNotifier::default(),
            }),
        }
    }

    pub fn database_path(&self) -> &Path {
        &self.inner.db_path
    }

    pub fn generation(&self) -> u64 {
        self.inner.notifier.generation()
    }

    /// Picks up commits made through other connections to the same file,
    /// from another handle or another process. SQLite bumps `data_version`
    /// only for those, so writes through this handle never count twice.
    /// Returns `true` and wakes subscribers when something changed.
    pub fn poll_external_changes(&self) -> Result<bool> {
        let changed = self.with_connection(|conn| {
            let version = data_version(conn)?;
            let previous = self.inner.seen_data_version.lock().replace(version);
            Ok(previous.is_some_and(|previous| previous != version))
        })?;
        if changed {
            tracing::debug!(
                path = %self.inner.db_path.display(),
                "counter store changed by another connection"
            );
            self.inner.notifier.notify();
        }
        Ok(changed)
    }

    /// [`generation`](Self::generation) after checking for external commits.
    pub fn sync_generation(&self) -> u64 {
        if let Err(err) = self.poll_external_changes() {
            tracing::warn!(%err, "could not check for external changes");
        }
        self.generation()
    }

    pub(crate) fn notifier(&self) -> &ChangeNotifier {
        &self.inner.notifier
    }

    pub fn is_open(&self) -> bool {
        self.inner.conn.lock().is_some()
    }

    pub fn with_connection<F, T>(&self, mut f: F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        match self.try_with_connection(&mut f) {
            Err(err) if err.is_transient() => {
                tracing::warn!(
                    %err,
                    path = %self.inner.db_path.display(),
                    "counter store busy, retrying once"
                );
                self.try_with_connection(&mut f)
            }
            other => other,
        }
    }

    fn try_with_connection<F, T>(&self, f: &mut F) -> Result<T>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<T>,
    {
        let mut guard = self.inner.conn.lock();
        let conn = match guard.take() {
            Some(conn) => conn,
            None => self.open()?,
        };
        let conn = guard.insert(conn);
        let result = f(conn).map_err(|err| StorageError::from_sqlite(&self.inner.db_path, err));
        if matches!(&result, Err(err) if err.is_unavailable()) {
            // reopen on the next call instead of reusing a broken connection
            *guard = None;
        }
        result
    }

    fn open(&self) -> Result<Connection> {
        let path = &self.inner.db_path;
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| StorageError::Unavailable {
                path: path.clone(),
                source: err.into(),
            })?;
        }
        let conn = Connection::open(path).map_err(|err| StorageError::Unavailable {
            path: path.clone(),
            source: err.into(),
        })?;
        let version = prepare_connection(&conn, &self.inner.options)
            .and_then(|()| schema::apply(&conn))
            .and_then(|()| data_version(&conn))
            .map_err(|err| StorageError::from_sqlite(path, err))?;
        // counters are per connection, so a fresh one starts a new baseline
        *self.inner.seen_data_version.lock() = Some(version);
        tracing::debug!(path = %path.display(), "opened counter store");
        Ok(conn)
    }

    /// Opens the database now instead of on first use.
    pub fn open_now(&self) -> Result<()> {
        self.with_connection(|_| Ok(()))
    }

    /// Drops the connection. The next operation reopens it.
    pub fn close(&self) {
        if self.inner.conn.lock().take().is_some() {
            tracing::debug!(path = %self.inner.db_path.display(), "closed counter store");
        }
    }

    /// Destroys every counter and recreates the schema.
    pub fn reset(&self) -> Result<()> {
        self.with_connection(|conn| schema::rebuild(conn))?;
        tracing::info!(path = %self.inner.db_path.display(), "counter store reset");
        self.inner.notifier.notify();
        Ok(())
    }

    /// Live query over this store.
    pub fn watch<T, F>(&self, loader: F) -> Subscription<T>
    where
        F: Fn(&StorageHandle) -> Result<T> + Send + Sync + 'static,
    {
        Subscription::new(self.clone(), Arc::new(loader))
    }

    /// Cached query shared between readers.
    pub fn shared<T, F>(&self, loader: F) -> SharedView<T>
    where
        T: Default,
        F: Fn(&StorageHandle) -> Result<T> + Send + Sync + 'static,
    {
        SharedView::new(self.clone(), Arc::new(loader))
    }

    fn select<P>(&self, clause: &str, params: P) -> Result<Vec<Counter>>
    where
        P: Params + Clone,
    {
        let sql = format!("SELECT {COUNTER_COLUMNS} FROM counters {clause}");
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(&sql)?;
            let rows = stmt.query_map(params.clone(), row_to_counter)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    fn write<F>(&self, f: F) -> Result<bool>
    where
        F: FnMut(&mut Connection) -> rusqlite::Result<usize>,
    {
        let changed = self.with_connection(f)?;
        if changed > 0 {
            self.inner.notifier.notify();
        }
        Ok(changed > 0)
    }

    pub fn list_active(&self) -> Result<Vec<Counter>> {
        self.select(&format!("WHERE is_archived = 0 {ACTIVE_ORDER}"), [])
    }

    pub fn list_favorites(&self) -> Result<Vec<Counter>> {
        self.select(
            &format!("WHERE is_favorite = 1 AND is_archived = 0 {ACTIVE_ORDER}"),
            [],
        )
    }

    pub fn list_archived(&self) -> Result<Vec<Counter>> {
        self.select(&format!("WHERE is_archived = 1 {ARCHIVED_ORDER}"), [])
    }

    pub fn list_by_category(&self, category: &str) -> Result<Vec<Counter>> {
        self.select(
            &format!("WHERE is_archived = 0 AND category = ?1 {ACTIVE_ORDER}"),
            [category],
        )
    }

    /// Non-archived counters whose title contains `needle`, ignoring case.
    pub fn search_by_title(&self, needle: &str) -> Result<Vec<Counter>> {
        let mut counters = self.list_active()?;
        let needle = needle.to_lowercase();
        if needle.is_empty() {
            return Ok(counters);
        }
        // SQLite's LIKE and lower() only fold ASCII
        counters.retain(|counter| counter.title.to_lowercase().contains(&needle));
        Ok(counters)
    }

    pub fn list_categories(&self) -> Result<Vec<String>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare_cached(
                "SELECT DISTINCT category FROM counters
                 WHERE is_archived = 0 AND category IS NOT NULL AND TRIM(category) <> ''
                 ORDER BY category COLLATE NOCASE, category",
            )?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Non-archived counters still in the future, soonest first.
    pub fn list_upcoming(&self, now: i64, limit: usize) -> Result<Vec<Counter>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        self.select(
            &format!("WHERE is_archived = 0 AND target_at > ?1 {ACTIVE_ORDER} LIMIT ?2"),
            [now, limit],
        )
    }

    pub fn get(&self, id: i64) -> Result<Option<Counter>> {
        let sql = format!("SELECT {COUNTER_COLUMNS} FROM counters WHERE id = ?1");
        self.with_connection(|conn| {
            conn.prepare_cached(&sql)?
                .query_row([id], row_to_counter)
                .optional()
        })
    }

    pub fn insert(&self, counter: &NewCounter) -> Result<i64> {
        check_title(&counter.title)?;
        let notes = encode_list(&counter.notes)?;
        let created_at = counter.created_at.unwrap_or_else(now_millis);
        let id = self.with_connection(|conn| {
            conn.execute(
                "INSERT INTO counters (
                    title, target_at, is_favorite, is_archived, image_uri, has_reminder,
                    created_at, icon, background_color, notes, category, goal_target,
                    goal_type, current_progress, history
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, NULL)",
                params![
                    counter.title,
                    counter.target_at,
                    counter.is_favorite,
                    counter.is_archived,
                    counter.image_uri,
                    counter.has_reminder,
                    created_at,
                    counter.icon,
                    counter.background_color,
                    notes,
                    counter.category,
                    counter.goal_target,
                    counter.goal_type,
                    counter.current_progress,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        self.inner.notifier.notify();
        tracing::debug!(counter_id = id, "inserted counter");
        Ok(id)
    }

    /// Replaces every field of an existing counter. Returns `false` when no
    /// counter has that id.
    pub fn update(&self, counter: &Counter) -> Result<bool> {
        check_title(&counter.title)?;
        let notes = encode_list(&counter.notes)?;
        let history = encode_list(&counter.history)?;
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET
                    title = ?2, target_at = ?3, is_favorite = ?4, is_archived = ?5,
                    image_uri = ?6, has_reminder = ?7, created_at = ?8, icon = ?9,
                    background_color = ?10, notes = ?11, category = ?12, goal_target = ?13,
                    goal_type = ?14, current_progress = ?15, history = ?16
                 WHERE id = ?1",
                params![
                    counter.id,
                    counter.title,
                    counter.target_at,
                    counter.is_favorite,
                    counter.is_archived,
                    counter.image_uri,
                    counter.has_reminder,
                    counter.created_at,
                    counter.icon,
                    counter.background_color,
                    notes,
                    counter.category,
                    counter.goal_target,
                    counter.goal_type,
                    counter.current_progress,
                    history,
                ],
            )
        })
    }

    pub fn delete(&self, id: i64) -> Result<bool> {
        let deleted = self.write(|conn| conn.execute("DELETE FROM counters WHERE id = ?1", [id]))?;
        if deleted {
            tracing::debug!(counter_id = id, "deleted counter");
        }
        Ok(deleted)
    }

    pub fn set_favorite(&self, id: i64, favorite: bool) -> Result<bool> {
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET is_favorite = ?1 WHERE id = ?2",
                params![favorite, id],
            )
        })
    }

    /// Flips the stored favorite flag and returns the new value, or `None`
    /// when the counter does not exist.
    pub fn toggle_favorite(&self, id: i64) -> Result<Option<bool>> {
        let state = self.with_connection(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let updated = tx.execute(
                "UPDATE counters SET is_favorite = NOT is_favorite WHERE id = ?1",
                [id],
            )?;
            let state = if updated == 0 {
                None
            } else {
                let flag: i64 =
                    tx.query_row("SELECT is_favorite FROM counters WHERE id = ?1", [id], |row| {
                        row.get(0)
                    })?;
                Some(flag != 0)
            };
            tx.commit()?;
            Ok(state)
        })?;
        if state.is_some() {
            self.inner.notifier.notify();
        }
        Ok(state)
    }

    pub fn set_archived(&self, id: i64, archived: bool) -> Result<bool> {
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET is_archived = ?1 WHERE id = ?2",
                params![archived, id],
            )
        })
    }

    pub fn set_progress(&self, id: i64, progress: i64) -> Result<bool> {
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET current_progress = ?1 WHERE id = ?2",
                params![progress, id],
            )
        })
    }

    pub fn set_icon(&self, id: i64, icon: &str) -> Result<bool> {
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET icon = ?1 WHERE id = ?2",
                params![icon, id],
            )
        })
    }

    pub fn set_background_color(&self, id: i64, argb: Option<u32>) -> Result<bool> {
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET background_color = ?1 WHERE id = ?2",
                params![argb, id],
            )
        })
    }

    /// Replaces the whole notes list.
    pub fn update_notes(&self, id: i64, notes: &[String]) -> Result<bool> {
        let encoded = encode_list(notes)?;
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET notes = ?1 WHERE id = ?2",
                params![encoded, id],
            )
        })
    }

    /// Replaces the whole history list.
    pub fn update_history(&self, id: i64, history: &[CounterHistoryEntry]) -> Result<bool> {
        let encoded = encode_list(history)?;
        self.write(|conn| {
            conn.execute(
                "UPDATE counters SET history = ?1 WHERE id = ?2",
                params![encoded, id],
            )
        })
    }

    pub fn append_history(&self, id: i64, entry: &CounterHistoryEntry) -> Result<bool> {
        self.modify_list(id, ListColumn::History, |entries: &mut Vec<CounterHistoryEntry>| {
            entries.push(entry.clone());
            true
        })
    }

    pub fn append_note(&self, id: i64, note: &str) -> Result<bool> {
        let note = note.trim();
        if note.is_empty() {
            return Err(StorageError::InvalidCounter("note cannot be empty".into()));
        }
        self.modify_list(id, ListColumn::Notes, |notes: &mut Vec<String>| {
            notes.push(note.to_string());
            true
        })
    }

    /// Removes the note at `index`. Returns `false` if the counter or the
    /// index does not exist.
    pub fn remove_note(&self, id: i64, index: usize) -> Result<bool> {
        self.modify_list(id, ListColumn::Notes, |notes: &mut Vec<String>| {
            if index < notes.len() {
                notes.remove(index);
                true
            } else {
                false
            }
        })
    }

    /// Read-decode-edit-write of a list column inside one immediate
    /// transaction, so concurrent edits of the same counter serialize.
    fn modify_list<T, F>(&self, id: i64, column: ListColumn, mut edit: F) -> Result<bool>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut(&mut Vec<T>) -> bool,
    {
        let select = format!("SELECT {} FROM counters WHERE id = ?1", column.name());
        let update = format!("UPDATE counters SET {} = ?1 WHERE id = ?2", column.name());
        self.write(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let raw: Option<Option<String>> = tx
                .query_row(&select, [id], |row| row.get(0))
                .optional()?;
            let Some(raw) = raw else {
                return Ok(0);
            };
            let mut items: Vec<T> = decode_lenient(id, column.name(), raw.as_deref());
            if !edit(&mut items) {
                return Ok(0);
            }
            let encoded = encode_list(&items)
                .map_err(|err| rusqlite::Error::ToSqlConversionFailure(Box::new(err)))?;
            let changed = tx.execute(&update, params![encoded, id])?;
            tx.commit()?;
            Ok(changed)
        })
    }
}

/// Titles are stored exactly as given, but must have visible text.
fn check_title(title: &str) -> Result<()> {
    if title.trim().is_empty() {
        return Err(StorageError::InvalidCounter(
            "counter title cannot be empty".into(),
        ));
    }
    Ok(())
}

pub fn init(paths: &ConfigPaths, options: &StorageOptions) -> Result<StorageHandle> {
    let storage = StorageHandle::new(paths.database_path.clone(), options.clone());
    storage.open_now()?;
    Ok(storage)
}

fn data_version(conn: &Connection) -> rusqlite::Result<i64> {
    conn.pragma_query_value(None, "data_version", |row| row.get(0))
}

fn prepare_connection(conn: &Connection, options: &StorageOptions) -> rusqlite::Result<()> {
    conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(
        None,
        "wal_autocheckpoint",
        options.wal_autocheckpoint.to_string(),
    )?;
    Ok(())
}
