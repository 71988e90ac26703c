use chrono::Utc;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::invalidation::{Entity, InvalidationBus};
use crate::models::{Author, Book};

static PUBLISHED_DATE_RE: OnceLock<Regex> = OnceLock::new();

/// Optional metadata supplied when a book is first added.
#[derive(Debug, Clone, Default)]
pub struct BookMetadata {
    pub cover_url: Option<String>,
    pub description: Option<String>,
    pub isbn: Option<String>,
    pub page_count: Option<i64>,
    pub published_date: Option<String>,
}

#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct EnsuredBook {
    pub author_id: String,
    pub book_id: String,
    pub created: bool,
}

/// Look up an author by exact name, inserting if absent.
///
/// Returns the author id and whether a row was created. An insert that
/// loses a race to the unique name index falls back to re-reading the row
/// the winner created.
pub fn ensure_author(
    conn: &Connection,
    bus: &InvalidationBus,
    name: &str,
    bio: Option<&str>,
) -> StoreResult<(String, bool)> {
    let name = normalize_ws(name);
    if name.is_empty() {
        return Err(StoreError::validation("author name must not be empty"));
    }

    if let Some(id) = find_author_id(conn, &name)? {
        return Ok((id, false));
    }

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp_millis();
    let inserted = conn.execute(
        "INSERT INTO authors (id, name, bio, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?4)",
        params![id, name, bio, now],
    );

    match inserted {
        Ok(_) => {
            bus.publish(Entity::Authors);
            Ok((id, true))
        }
        Err(err) if is_unique_violation(&err) => {
            log::info!("author insert raced for {:?}, reusing existing row", name);
            match find_author_id(conn, &name)? {
                Some(existing) => Ok((existing, false)),
                None => Err(StoreError::Conflict("author")),
            }
        }
        Err(err) => Err(err.into()),
    }
}

/// Idempotently ensure an author and a book exist, returning both ids.
///
/// `(title, author_id)` is the book's natural key; metadata is only applied
/// when the book row is first created.
pub fn ensure_book(
    conn: &Connection,
    bus: &InvalidationBus,
    title: &str,
    author_name: &str,
    metadata: BookMetadata,
) -> StoreResult<EnsuredBook> {
    let title = normalize_ws(title);
    if title.is_empty() {
        return Err(StoreError::validation("book title must not be empty"));
    }

    let isbn = match metadata.isbn.as_deref() {
        Some(raw) => Some(normalize_isbn(raw).ok_or_else(|| {
            StoreError::Validation(format!("invalid isbn: {}", raw.trim()))
        })?),
        None => None,
    };
    if let Some(pages) = metadata.page_count {
        if pages <= 0 {
            return Err(StoreError::validation("page count must be positive"));
        }
    }
    if let Some(date) = metadata.published_date.as_deref() {
        if !looks_like_published_date(date) {
            return Err(StoreError::Validation(format!(
                "published date must be YYYY, YYYY-MM or YYYY-MM-DD, got {:?}",
                date
            )));
        }
    }

    let (author_id, _) = ensure_author(conn, bus, author_name, None)?;

    if let Some(book_id) = find_book_id(conn, &title, &author_id)? {
        return Ok(EnsuredBook {
            author_id,
            book_id,
            created: false,
        });
    }

    let book_id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp_millis();
    let inserted = conn.execute(
        "INSERT INTO books (id, title, author_id, cover_url, description, isbn, page_count, published_date, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
        params![
            book_id,
            title,
            author_id,
            metadata.cover_url,
            metadata.description,
            isbn,
            metadata.page_count,
            metadata.published_date,
            now
        ],
    );

    match inserted {
        Ok(_) => {
            log::info!("created book {:?} by {:?}", title, author_name);
            bus.publish(Entity::Books);
            Ok(EnsuredBook {
                author_id,
                book_id,
                created: true,
            })
        }
        Err(err) if is_unique_violation(&err) => {
            log::info!("book insert raced for {:?}, reusing existing row", title);
            match find_book_id(conn, &title, &author_id)? {
                Some(existing) => Ok(EnsuredBook {
                    author_id,
                    book_id: existing,
                    created: false,
                }),
                None => Err(StoreError::Conflict("book")),
            }
        }
        Err(err) => Err(err.into()),
    }
}

pub fn get_author(conn: &Connection, author_id: &str) -> StoreResult<Option<Author>> {
    let author = conn
        .query_row(
            "SELECT id, name, bio, created_at, updated_at FROM authors WHERE id = ?1",
            params![author_id],
            |row| {
                Ok(Author {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    bio: row.get(2)?,
                    created_at: row.get(3)?,
                    updated_at: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(author)
}

pub fn get_book(conn: &Connection, book_id: &str) -> StoreResult<Option<Book>> {
    let book = conn
        .query_row(
            "SELECT id, title, author_id, cover_url, description, isbn, page_count, published_date, created_at, updated_at
             FROM books WHERE id = ?1",
            params![book_id],
            |row| {
                Ok(Book {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    author_id: row.get(2)?,
                    cover_url: row.get(3)?,
                    description: row.get(4)?,
                    isbn: row.get(5)?,
                    page_count: row.get(6)?,
                    published_date: row.get(7)?,
                    created_at: row.get(8)?,
                    updated_at: row.get(9)?,
                })
            },
        )
        .optional()?;
    Ok(book)
}

fn find_author_id(conn: &Connection, name: &str) -> StoreResult<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM authors WHERE name = ?1",
            params![name],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

fn find_book_id(conn: &Connection, title: &str, author_id: &str) -> StoreResult<Option<String>> {
    let id = conn
        .query_row(
            "SELECT id FROM books WHERE title = ?1 AND author_id = ?2",
            params![title, author_id],
            |row| row.get(0),
        )
        .optional()?;
    Ok(id)
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    err.sqlite_error_code() == Some(rusqlite::ErrorCode::ConstraintViolation)
}

pub(crate) fn normalize_ws(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .trim()
        .to_string()
}

fn looks_like_published_date(value: &str) -> bool {
    let regex = PUBLISHED_DATE_RE
        .get_or_init(|| Regex::new(r"^\d{4}(-\d{2}(-\d{2})?)?$").expect("published date regex"));
    regex.is_match(value.trim())
}

fn normalize_isbn(value: &str) -> Option<String> {
    let cleaned = value
        .chars()
        .filter(|ch| ch.is_ascii_digit() || *ch == 'X' || *ch == 'x')
        .map(|ch| ch.to_ascii_uppercase())
        .collect::<String>();
    if cleaned.len() == 10 && is_valid_isbn10(&cleaned) {
        return Some(cleaned);
    }
    if cleaned.len() == 13 && is_valid_isbn13(&cleaned) {
        return Some(cleaned);
    }
    None
}

fn is_valid_isbn10(value: &str) -> bool {
    let mut sum = 0;
    for (index, ch) in value.chars().take(9).enumerate() {
        let digit = match ch.to_digit(10) {
            Some(digit) => digit as i32,
            None => return false,
        };
        sum += digit * (10 - index as i32);
    }
    let check = value.chars().nth(9).unwrap_or('0');
    let check_val = if check == 'X' {
        10
    } else {
        check.to_digit(10).unwrap_or(0) as i32
    };
    sum += check_val;
    sum % 11 == 0
}

fn is_valid_isbn13(value: &str) -> bool {
    let mut sum = 0;
    for (index, ch) in value.chars().take(12).enumerate() {
        let digit = match ch.to_digit(10) {
            Some(digit) => digit as i32,
            None => return false,
        };
        sum += if index % 2 == 0 { digit } else { digit * 3 };
    }
    let check = value.chars().nth(12).unwrap_or('0');
    let check_val = check.to_digit(10).unwrap_or(0) as i32;
    (10 - (sum % 10)) % 10 == check_val
}
