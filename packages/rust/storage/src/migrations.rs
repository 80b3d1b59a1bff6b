//! SQL migration definitions for the AutoNews database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: cache_entries, index_vectors, sink collections and items",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Fingerprint cache: stage markers and cached stage results
CREATE TABLE IF NOT EXISTS cache_entries (
    key        TEXT PRIMARY KEY,
    value      TEXT,
    expires_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expires ON cache_entries(expires_at);

-- Similarity index: one embedding per accepted item
CREATE TABLE IF NOT EXISTS index_vectors (
    id         TEXT PRIMARY KEY,
    dims       INTEGER NOT NULL,
    vector     BLOB NOT NULL,
    metadata   TEXT NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Sink collections (rotated "ToRead - YYYY-MM" handles)
CREATE TABLE IF NOT EXISTS sink_collections (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT NOT NULL UNIQUE,
    created_at INTEGER NOT NULL
);

-- Pushed items, one row per fingerprint
CREATE TABLE IF NOT EXISTS sink_items (
    fingerprint     TEXT PRIMARY KEY,
    collection      TEXT NOT NULL REFERENCES sink_collections(name),
    source_type     TEXT NOT NULL,
    source_list     TEXT NOT NULL,
    title           TEXT NOT NULL,
    url             TEXT,
    summary         TEXT,
    body            TEXT NOT NULL,
    topics_json     TEXT NOT NULL,
    categories_json TEXT NOT NULL,
    rating          REAL,
    user_rating     REAL,
    notes           TEXT NOT NULL DEFAULT '',
    published_at    INTEGER NOT NULL,
    created_at      INTEGER NOT NULL,
    edited_at       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_sink_items_collection ON sink_items(collection);
CREATE INDEX IF NOT EXISTS idx_sink_items_edited ON sink_items(edited_at);

-- Distinct category values per collection (bounded by max_categories)
CREATE TABLE IF NOT EXISTS sink_categories (
    collection TEXT NOT NULL,
    category   TEXT NOT NULL,
    PRIMARY KEY (collection, category)
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
    ]
}
