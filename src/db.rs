use rusqlite::Connection;
use std::fs;
use std::path::Path;

use crate::error::StoreResult;

const CURRENT_DB_VERSION: u32 = 1;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE TABLE IF NOT EXISTS authors (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    bio TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_authors_name ON authors(name);

CREATE TABLE IF NOT EXISTS books (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    author_id TEXT NOT NULL,
    cover_url TEXT,
    description TEXT,
    isbn TEXT,
    page_count INTEGER,
    published_date TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY(author_id) REFERENCES authors(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_books_title_author ON books(title, author_id);

CREATE TABLE IF NOT EXISTS user_books (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    book_id TEXT NOT NULL,
    status TEXT NOT NULL,
    favorite INTEGER NOT NULL DEFAULT 0,
    date_started TEXT,
    date_finished TEXT,
    notes TEXT,
    personal_rating INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY(book_id) REFERENCES books(id)
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_user_books_pair ON user_books(user_id, book_id);
CREATE INDEX IF NOT EXISTS idx_user_books_user ON user_books(user_id);

CREATE TABLE IF NOT EXISTS book_notes (
    id TEXT PRIMARY KEY,
    user_book_id TEXT NOT NULL,
    user_id TEXT NOT NULL,
    content TEXT NOT NULL,
    highlight_text TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    page_number INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY(user_book_id) REFERENCES user_books(id) ON DELETE CASCADE
);
CREATE INDEX IF NOT EXISTS idx_book_notes_user_book ON book_notes(user_book_id);

CREATE TABLE IF NOT EXISTS follows (
    id TEXT PRIMARY KEY,
    follower_id TEXT NOT NULL,
    followed_id TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_follows_pair ON follows(follower_id, followed_id);
CREATE INDEX IF NOT EXISTS idx_follows_followed ON follows(followed_id);

CREATE TABLE IF NOT EXISTS profile_updates (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    field TEXT NOT NULL,
    created_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_profile_updates_user ON profile_updates(user_id);
"#;

/// Open (or create) the tracker database at `path` and ensure the schema.
pub fn open(path: &Path) -> StoreResult<Connection> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// In-memory database with the full schema, used by tests.
pub fn open_in_memory() -> StoreResult<Connection> {
    let conn = Connection::open_in_memory()?;
    init_schema(&conn)?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> StoreResult<()> {
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute_batch(SCHEMA_SQL)?;

    conn.execute(
        "INSERT OR IGNORE INTO meta (key, value) VALUES ('schema_version', ?1)",
        [CURRENT_DB_VERSION.to_string()],
    )?;

    Ok(())
}
