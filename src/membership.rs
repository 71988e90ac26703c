use chrono::{NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::invalidation::{Entity, InvalidationBus};
use crate::models::{Membership, ReadingStatus};

const MEMBERSHIP_COLUMNS: &str =
    "id, user_id, book_id, status, favorite, date_started, date_finished, notes, personal_rating, created_at, updated_at";

/// What a favorite toggle did to the membership row.
#[derive(Debug, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ToggleOutcome {
    Favorited,
    Unfavorited,
    Removed,
}

/// Toggle the favorite flag for (user, book) with exactly one write.
///
/// The decision runs inside a single transaction against the stored row, so
/// concurrent toggles converge on the stored state instead of double
/// applying. `current_favorite` is the caller's belief about the flag; a
/// mismatch with storage is logged as staleness and the stored flag wins.
///
/// Transitions:
/// - no row: insert `{status: planned, favorite: true}` -> `Favorited`
/// - stored favorite false: set it -> `Favorited`
/// - stored favorite true, status planned: delete the row -> `Removed`
///   (an unfavorited planned row would carry no meaningful state)
/// - stored favorite true, any other status: clear the flag -> `Unfavorited`
pub fn toggle_favorite(
    conn: &mut Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
    current_favorite: bool,
) -> StoreResult<ToggleOutcome> {
    require_id(user_id, "user id")?;
    require_id(book_id, "book id")?;

    let now = Utc::now().timestamp_millis();
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let row: Option<(String, ReadingStatus, bool)> = tx
        .query_row(
            "SELECT id, status, favorite FROM user_books WHERE user_id = ?1 AND book_id = ?2",
            params![user_id, book_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get::<_, i64>(2)? != 0)),
        )
        .optional()?;

    let outcome = match row {
        None => {
            let book_exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM books WHERE id = ?1",
                    params![book_id],
                    |row| row.get(0),
                )
                .optional()?;
            if book_exists.is_none() {
                return Err(StoreError::NotFound("book"));
            }

            tx.execute(
                "INSERT INTO user_books (id, user_id, book_id, status, favorite, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'planned', 1, ?4, ?4)
                 ON CONFLICT(user_id, book_id) DO UPDATE SET favorite = 1, updated_at = excluded.updated_at",
                params![Uuid::new_v4().to_string(), user_id, book_id, now],
            )?;
            ToggleOutcome::Favorited
        }
        Some((id, status, stored_favorite)) => {
            if stored_favorite != current_favorite {
                log::warn!(
                    "stale favorite flag from caller for user {} book {}: caller saw {}, stored is {}",
                    user_id,
                    book_id,
                    current_favorite,
                    stored_favorite
                );
            }

            if !stored_favorite {
                tx.execute(
                    "UPDATE user_books SET favorite = 1, updated_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                ToggleOutcome::Favorited
            } else if status == ReadingStatus::Planned {
                tx.execute("DELETE FROM user_books WHERE id = ?1", params![id])?;
                ToggleOutcome::Removed
            } else {
                tx.execute(
                    "UPDATE user_books SET favorite = 0, updated_at = ?2 WHERE id = ?1",
                    params![id, now],
                )?;
                ToggleOutcome::Unfavorited
            }
        }
    };

    tx.commit()?;
    bus.publish(Entity::Memberships);
    Ok(outcome)
}

/// Put a book on the user's list. Converges on the existing row if the
/// pair is already present.
pub fn add_to_list(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
    status: ReadingStatus,
) -> StoreResult<Membership> {
    require_id(user_id, "user id")?;
    require_id(book_id, "book id")?;

    let book_exists: Option<i64> = conn
        .query_row(
            "SELECT 1 FROM books WHERE id = ?1",
            params![book_id],
            |row| row.get(0),
        )
        .optional()?;
    if book_exists.is_none() {
        return Err(StoreError::NotFound("book"));
    }

    let now = Utc::now().timestamp_millis();
    let inserted = conn.execute(
        "INSERT INTO user_books (id, user_id, book_id, status, favorite, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)
         ON CONFLICT(user_id, book_id) DO NOTHING",
        params![Uuid::new_v4().to_string(), user_id, book_id, status, now],
    )?;
    if inserted > 0 {
        bus.publish(Entity::Memberships);
    }

    get_membership(conn, user_id, book_id)?.ok_or(StoreError::NotFound("membership"))
}

pub fn set_status(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
    status: ReadingStatus,
) -> StoreResult<()> {
    update_membership_field(
        conn,
        bus,
        user_id,
        book_id,
        "UPDATE user_books SET status = ?3, updated_at = ?4 WHERE user_id = ?1 AND book_id = ?2",
        params![
            user_id,
            book_id,
            status,
            Utc::now().timestamp_millis()
        ],
    )
}

pub fn set_dates(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
    date_started: Option<&str>,
    date_finished: Option<&str>,
) -> StoreResult<()> {
    for date in [date_started, date_finished].into_iter().flatten() {
        if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
            return Err(StoreError::Validation(format!(
                "dates must be YYYY-MM-DD, got {:?}",
                date
            )));
        }
    }

    update_membership_field(
        conn,
        bus,
        user_id,
        book_id,
        "UPDATE user_books SET date_started = ?3, date_finished = ?4, updated_at = ?5 WHERE user_id = ?1 AND book_id = ?2",
        params![
            user_id,
            book_id,
            date_started,
            date_finished,
            Utc::now().timestamp_millis()
        ],
    )
}

/// The quick note field on the membership itself, not a `BookNote` child.
pub fn set_notes(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
    notes: Option<&str>,
) -> StoreResult<()> {
    update_membership_field(
        conn,
        bus,
        user_id,
        book_id,
        "UPDATE user_books SET notes = ?3, updated_at = ?4 WHERE user_id = ?1 AND book_id = ?2",
        params![
            user_id,
            book_id,
            notes,
            Utc::now().timestamp_millis()
        ],
    )
}

pub fn set_rating(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
    rating: Option<i64>,
) -> StoreResult<()> {
    if let Some(value) = rating {
        if !(1..=5).contains(&value) {
            return Err(StoreError::Validation(format!(
                "rating must be between 1 and 5, got {}",
                value
            )));
        }
    }

    update_membership_field(
        conn,
        bus,
        user_id,
        book_id,
        "UPDATE user_books SET personal_rating = ?3, updated_at = ?4 WHERE user_id = ?1 AND book_id = ?2",
        params![
            user_id,
            book_id,
            rating,
            Utc::now().timestamp_millis()
        ],
    )
}

pub fn remove_from_list(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
) -> StoreResult<()> {
    let removed = conn.execute(
        "DELETE FROM user_books WHERE user_id = ?1 AND book_id = ?2",
        params![user_id, book_id],
    )?;
    if removed == 0 {
        return Err(StoreError::NotFound("membership"));
    }
    bus.publish(Entity::Memberships);
    Ok(())
}

pub fn get_membership(
    conn: &Connection,
    user_id: &str,
    book_id: &str,
) -> StoreResult<Option<Membership>> {
    let membership = conn
        .query_row(
            &format!(
                "SELECT {} FROM user_books WHERE user_id = ?1 AND book_id = ?2",
                MEMBERSHIP_COLUMNS
            ),
            params![user_id, book_id],
            membership_from_row,
        )
        .optional()?;
    Ok(membership)
}

/// One shelf row: the membership joined with its book and author.
#[derive(Debug, Serialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct LibraryEntry {
    pub id: String,
    pub book_id: String,
    pub title: String,
    pub author_name: String,
    pub cover_url: Option<String>,
    pub status: ReadingStatus,
    pub favorite: bool,
    pub date_started: Option<String>,
    pub date_finished: Option<String>,
    pub personal_rating: Option<i64>,
    pub updated_at: i64,
}

pub fn list_library(conn: &Connection, user_id: &str) -> StoreResult<Vec<LibraryEntry>> {
    let mut stmt = conn.prepare(
        "SELECT ub.id, ub.book_id, b.title, a.name, b.cover_url, ub.status, ub.favorite,
                ub.date_started, ub.date_finished, ub.personal_rating, ub.updated_at
         FROM user_books ub
         JOIN books b ON b.id = ub.book_id
         JOIN authors a ON a.id = b.author_id
         WHERE ub.user_id = ?1
         ORDER BY ub.updated_at DESC, b.title ASC",
    )?;

    let rows = stmt.query_map(params![user_id], |row| {
        Ok(LibraryEntry {
            id: row.get(0)?,
            book_id: row.get(1)?,
            title: row.get(2)?,
            author_name: row.get(3)?,
            cover_url: row.get(4)?,
            status: row.get(5)?,
            favorite: row.get::<_, i64>(6)? != 0,
            date_started: row.get(7)?,
            date_finished: row.get(8)?,
            personal_rating: row.get(9)?,
            updated_at: row.get(10)?,
        })
    })?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row?);
    }
    Ok(entries)
}

fn update_membership_field<P: rusqlite::Params>(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    book_id: &str,
    sql: &str,
    params: P,
) -> StoreResult<()> {
    require_id(user_id, "user id")?;
    require_id(book_id, "book id")?;

    let updated = conn.execute(sql, params)?;
    if updated == 0 {
        return Err(StoreError::NotFound("membership"));
    }
    bus.publish(Entity::Memberships);
    Ok(())
}

pub(crate) fn membership_from_row(row: &rusqlite::Row) -> rusqlite::Result<Membership> {
    Ok(Membership {
        id: row.get(0)?,
        user_id: row.get(1)?,
        book_id: row.get(2)?,
        status: row.get(3)?,
        favorite: row.get::<_, i64>(4)? != 0,
        date_started: row.get(5)?,
        date_finished: row.get(6)?,
        notes: row.get(7)?,
        personal_rating: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
    })
}

fn require_id(value: &str, what: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{} must not be empty", what)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, BookMetadata};
    use crate::db;

    fn setup_with_book() -> (Connection, InvalidationBus, String) {
        let conn = db::open_in_memory().unwrap();
        let bus = InvalidationBus::new();
        let book_id = catalog::ensure_book(
            &conn,
            &bus,
            "Piranesi",
            "Susanna Clarke",
            BookMetadata::default(),
        )
        .unwrap()
        .book_id;
        (conn, bus, book_id)
    }

    #[test]
    fn toggle_on_absent_membership_creates_planned_favorite() {
        let (mut conn, bus, book_id) = setup_with_book();

        let outcome = toggle_favorite(&mut conn, &bus, "u1", &book_id, false).unwrap();
        assert_eq!(outcome, ToggleOutcome::Favorited);

        let membership = get_membership(&conn, "u1", &book_id).unwrap().unwrap();
        assert_eq!(membership.status, ReadingStatus::Planned);
        assert!(membership.favorite);
    }

    #[test]
    fn toggle_sets_flag_and_preserves_everything_else() {
        let (mut conn, bus, book_id) = setup_with_book();

        add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Reading).unwrap();
        set_dates(&conn, &bus, "u1", &book_id, Some("2026-01-05"), None).unwrap();
        set_notes(&conn, &bus, "u1", &book_id, Some("slow start")).unwrap();

        let outcome = toggle_favorite(&mut conn, &bus, "u1", &book_id, false).unwrap();
        assert_eq!(outcome, ToggleOutcome::Favorited);

        let membership = get_membership(&conn, "u1", &book_id).unwrap().unwrap();
        assert!(membership.favorite);
        assert_eq!(membership.status, ReadingStatus::Reading);
        assert_eq!(membership.date_started.as_deref(), Some("2026-01-05"));
        assert_eq!(membership.notes.as_deref(), Some("slow start"));
    }

    #[test]
    fn unfavoriting_a_planned_row_deletes_it() {
        let (mut conn, bus, book_id) = setup_with_book();

        toggle_favorite(&mut conn, &bus, "u1", &book_id, false).unwrap();
        let outcome = toggle_favorite(&mut conn, &bus, "u1", &book_id, true).unwrap();
        assert_eq!(outcome, ToggleOutcome::Removed);
        assert!(get_membership(&conn, "u1", &book_id).unwrap().is_none());
    }

    #[test]
    fn unfavoriting_a_finished_row_keeps_it() {
        let (mut conn, bus, book_id) = setup_with_book();

        add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Finished).unwrap();
        toggle_favorite(&mut conn, &bus, "u1", &book_id, false).unwrap();

        let outcome = toggle_favorite(&mut conn, &bus, "u1", &book_id, true).unwrap();
        assert_eq!(outcome, ToggleOutcome::Unfavorited);

        let membership = get_membership(&conn, "u1", &book_id).unwrap().unwrap();
        assert!(!membership.favorite);
        assert_eq!(membership.status, ReadingStatus::Finished);
    }

    #[test]
    fn stale_caller_flag_converges_on_stored_state() {
        let (mut conn, bus, book_id) = setup_with_book();

        add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Reading).unwrap();

        // Caller believes the book is already a favorite; storage says no.
        let outcome = toggle_favorite(&mut conn, &bus, "u1", &book_id, true).unwrap();
        assert_eq!(outcome, ToggleOutcome::Favorited);
        assert!(get_membership(&conn, "u1", &book_id).unwrap().unwrap().favorite);
    }

    #[test]
    fn toggle_for_unknown_book_is_not_found() {
        let mut conn = db::open_in_memory().unwrap();
        let bus = InvalidationBus::new();

        let result = toggle_favorite(&mut conn, &bus, "u1", "no-such-book", false);
        assert!(matches!(result, Err(StoreError::NotFound("book"))));
    }

    #[test]
    fn add_to_list_converges_on_existing_row() {
        let (conn, bus, book_id) = setup_with_book();

        let first = add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Planned).unwrap();
        let second = add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Finished).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.status, ReadingStatus::Planned);
    }

    #[test]
    fn rating_outside_range_is_rejected() {
        let (conn, bus, book_id) = setup_with_book();
        add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Finished).unwrap();

        assert!(matches!(
            set_rating(&conn, &bus, "u1", &book_id, Some(6)),
            Err(StoreError::Validation(_))
        ));
        set_rating(&conn, &bus, "u1", &book_id, Some(5)).unwrap();
        set_rating(&conn, &bus, "u1", &book_id, None).unwrap();
    }

    #[test]
    fn malformed_dates_are_rejected() {
        let (conn, bus, book_id) = setup_with_book();
        add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Reading).unwrap();

        let result = set_dates(&conn, &bus, "u1", &book_id, Some("05/01/2026"), None);
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn updates_on_missing_membership_are_not_found() {
        let (conn, bus, book_id) = setup_with_book();

        assert!(matches!(
            set_status(&conn, &bus, "u1", &book_id, ReadingStatus::Reading),
            Err(StoreError::NotFound("membership"))
        ));
        assert!(matches!(
            remove_from_list(&conn, &bus, "u1", &book_id),
            Err(StoreError::NotFound("membership"))
        ));
    }

    #[test]
    fn library_listing_joins_book_and_author() {
        let (conn, bus, book_id) = setup_with_book();
        add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Reading).unwrap();

        let entries = list_library(&conn, "u1").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].title, "Piranesi");
        assert_eq!(entries[0].author_name, "Susanna Clarke");
        assert_eq!(entries[0].status, ReadingStatus::Reading);

        assert!(list_library(&conn, "someone-else").unwrap().is_empty());
    }

    #[test]
    fn toggles_publish_membership_invalidations() {
        let (mut conn, bus, book_id) = setup_with_book();
        let rx = bus.subscribe();

        toggle_favorite(&mut conn, &bus, "u1", &book_id, false).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Entity::Memberships);
    }
}
