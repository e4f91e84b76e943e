use rusqlite::Connection;

/// Bumped whenever the table layout changes. Databases at any other version,
/// including unversioned ones that already hold a `counters` table, are
/// rebuilt from scratch.
pub const SCHEMA_VERSION: i64 = 6;

pub fn apply(conn: &Connection) -> rusqlite::Result<()> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    let stale = match current {
        SCHEMA_VERSION => false,
        0 => has_counters_table(conn)?,
        _ => true,
    };
    if stale {
        tracing::warn!(
            found = current,
            expected = SCHEMA_VERSION,
            "counter schema version mismatch, rebuilding database"
        );
        drop_all(conn)?;
    }
    create(conn)
}

fn has_counters_table(conn: &Connection) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = 'counters')",
        [],
        |row| row.get(0),
    )
}

pub fn rebuild(conn: &Connection) -> rusqlite::Result<()> {
    drop_all(conn)?;
    create(conn)
}

fn create(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        r#"
        CREATE TABLE IF NOT EXISTS counters (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            title TEXT NOT NULL,
            target_at INTEGER NOT NULL,
            is_favorite INTEGER NOT NULL DEFAULT 0,
            is_archived INTEGER NOT NULL DEFAULT 0,
            image_uri TEXT,
            has_reminder INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            icon TEXT NOT NULL,
            background_color INTEGER,
            notes TEXT,
            category TEXT,
            goal_target INTEGER,
            goal_type TEXT,
            current_progress INTEGER NOT NULL DEFAULT 0,
            history TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_counters_archived_target
            ON counters (is_archived, target_at);

        CREATE INDEX IF NOT EXISTS idx_counters_category
            ON counters (category)
            WHERE category IS NOT NULL;

        PRAGMA user_version = {SCHEMA_VERSION};
        "#
    ))
}

fn drop_all(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        DROP INDEX IF EXISTS idx_counters_category;
        DROP INDEX IF EXISTS idx_counters_archived_target;
        DROP TABLE IF EXISTS counters;
        PRAGMA user_version = 0;
        "#,
    )
}
