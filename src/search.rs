use rusqlite::{params, Connection};
use serde::Serialize;

use crate::error::StoreResult;

const SEARCH_LIMIT: i64 = 50;

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct CatalogHit {
    pub book_id: String,
    pub title: String,
    pub author_name: String,
    pub cover_url: Option<String>,
}

/// Case-insensitive substring search over book titles and author names.
/// Blank queries match nothing rather than everything.
pub fn search_catalog(conn: &Connection, query: &str) -> StoreResult<Vec<CatalogHit>> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let pattern = format!("%{}%", escape_like(trimmed));
    let mut stmt = conn.prepare(
        "SELECT b.id, b.title, a.name, b.cover_url
         FROM books b JOIN authors a ON a.id = b.author_id
         WHERE LOWER(b.title) LIKE LOWER(?1) ESCAPE '\\'
            OR LOWER(a.name) LIKE LOWER(?1) ESCAPE '\\'
         ORDER BY b.title ASC
         LIMIT ?2",
    )?;

    let rows = stmt.query_map(params![pattern, SEARCH_LIMIT], |row| {
        Ok(CatalogHit {
            book_id: row.get(0)?,
            title: row.get(1)?,
            author_name: row.get(2)?,
            cover_url: row.get(3)?,
        })
    })?;

    let mut hits = Vec::new();
    for row in rows {
        hits.push(row?);
    }
    Ok(hits)
}

// % and _ in user input would act as wildcards inside LIKE.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if ch == '%' || ch == '_' || ch == '\\' {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}
