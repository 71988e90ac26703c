use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::invalidation::{Entity, InvalidationBus};
use crate::models::BookNote;

const NOTE_COLUMNS: &str =
    "id, user_book_id, user_id, content, highlight_text, tags, page_number, created_at, updated_at";

/// Fields a caller supplies when creating or editing a note.
#[derive(Debug, Clone, Default)]
pub struct NoteDraft {
    pub content: String,
    pub highlight_text: Option<String>,
    pub tags: Vec<String>,
    pub page_number: Option<i64>,
}

pub fn add_note(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    user_book_id: &str,
    draft: NoteDraft,
) -> StoreResult<BookNote> {
    validate_draft(&draft)?;
    require_owned_membership(conn, user_id, user_book_id)?;

    let id = Uuid::new_v4().to_string();
    let now = Utc::now().timestamp_millis();
    let tags_json = serde_json::to_string(&draft.tags)?;

    conn.execute(
        "INSERT INTO book_notes (id, user_book_id, user_id, content, highlight_text, tags, page_number, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
        params![
            id,
            user_book_id,
            user_id,
            draft.content,
            draft.highlight_text,
            tags_json,
            draft.page_number,
            now
        ],
    )?;
    bus.publish(Entity::Notes);

    Ok(BookNote {
        id,
        user_book_id: user_book_id.to_string(),
        user_id: user_id.to_string(),
        content: draft.content,
        highlight_text: draft.highlight_text,
        tags: draft.tags,
        page_number: draft.page_number,
        created_at: now,
        updated_at: now,
    })
}

pub fn update_note(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    note_id: &str,
    draft: NoteDraft,
) -> StoreResult<BookNote> {
    validate_draft(&draft)?;

    let now = Utc::now().timestamp_millis();
    let tags_json = serde_json::to_string(&draft.tags)?;
    let updated = conn.execute(
        "UPDATE book_notes SET content = ?3, highlight_text = ?4, tags = ?5, page_number = ?6, updated_at = ?7
         WHERE id = ?1 AND user_id = ?2",
        params![
            note_id,
            user_id,
            draft.content,
            draft.highlight_text,
            tags_json,
            draft.page_number,
            now
        ],
    )?;
    if updated == 0 {
        return Err(StoreError::NotFound("note"));
    }
    bus.publish(Entity::Notes);

    get_note(conn, note_id)?.ok_or(StoreError::NotFound("note"))
}

pub fn delete_note(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    note_id: &str,
) -> StoreResult<()> {
    let deleted = conn.execute(
        "DELETE FROM book_notes WHERE id = ?1 AND user_id = ?2",
        params![note_id, user_id],
    )?;
    if deleted == 0 {
        return Err(StoreError::NotFound("note"));
    }
    bus.publish(Entity::Notes);
    Ok(())
}

/// All notes under a membership, oldest first.
pub fn list_notes(conn: &Connection, user_book_id: &str) -> StoreResult<Vec<BookNote>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM book_notes WHERE user_book_id = ?1 ORDER BY created_at ASC, rowid ASC",
        NOTE_COLUMNS
    ))?;
    let rows = stmt.query_map(params![user_book_id], raw_note_from_row)?;

    let mut notes = Vec::new();
    for row in rows {
        notes.push(finish_note(row?)?);
    }
    Ok(notes)
}

pub fn get_note(conn: &Connection, note_id: &str) -> StoreResult<Option<BookNote>> {
    let raw = conn
        .query_row(
            &format!("SELECT {} FROM book_notes WHERE id = ?1", NOTE_COLUMNS),
            params![note_id],
            raw_note_from_row,
        )
        .optional()?;
    match raw {
        Some(raw) => Ok(Some(finish_note(raw)?)),
        None => Ok(None),
    }
}

// Tags travel as a JSON column; parse outside the row closure so a bad
// payload surfaces as a Json error, not a silent empty list.
type RawNote = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<i64>,
    i64,
    i64,
);

fn raw_note_from_row(row: &rusqlite::Row) -> rusqlite::Result<RawNote> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
    ))
}

fn finish_note(raw: RawNote) -> StoreResult<BookNote> {
    let (id, user_book_id, user_id, content, highlight_text, tags_json, page_number, created_at, updated_at) =
        raw;
    Ok(BookNote {
        id,
        user_book_id,
        user_id,
        content,
        highlight_text,
        tags: serde_json::from_str(&tags_json)?,
        page_number,
        created_at,
        updated_at,
    })
}

fn validate_draft(draft: &NoteDraft) -> StoreResult<()> {
    if draft.content.trim().is_empty() {
        return Err(StoreError::validation("note content must not be empty"));
    }
    if let Some(page) = draft.page_number {
        if page <= 0 {
            return Err(StoreError::validation("page number must be positive"));
        }
    }
    Ok(())
}

fn require_owned_membership(
    conn: &Connection,
    user_id: &str,
    user_book_id: &str,
) -> StoreResult<()> {
    let owner: Option<String> = conn
        .query_row(
            "SELECT user_id FROM user_books WHERE id = ?1",
            params![user_book_id],
            |row| row.get(0),
        )
        .optional()?;
    match owner {
        Some(owner) if owner == user_id => Ok(()),
        _ => Err(StoreError::NotFound("membership")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, BookMetadata};
    use crate::db;
    use crate::membership;
    use crate::models::ReadingStatus;

    fn setup_with_membership() -> (Connection, InvalidationBus, String) {
        let conn = db::open_in_memory().unwrap();
        let bus = InvalidationBus::new();
        let book_id = catalog::ensure_book(
            &conn,
            &bus,
            "The Left Hand of Darkness",
            "Ursula K. Le Guin",
            BookMetadata::default(),
        )
        .unwrap()
        .book_id;
        let membership =
            membership::add_to_list(&conn, &bus, "u1", &book_id, ReadingStatus::Reading).unwrap();
        (conn, bus, membership.id)
    }

    #[test]
    fn add_list_update_delete() {
        let (conn, bus, user_book_id) = setup_with_membership();

        let note = add_note(
            &conn,
            &bus,
            "u1",
            &user_book_id,
            NoteDraft {
                content: "Genly misreads shifgrethor again".to_string(),
                highlight_text: Some("the king was pregnant".to_string()),
                tags: vec!["gender".to_string(), "politics".to_string()],
                page_number: Some(99),
            },
        )
        .unwrap();

        let listed = list_notes(&conn, &user_book_id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, note.id);
        assert_eq!(listed[0].tags, vec!["gender", "politics"]);

        let updated = update_note(
            &conn,
            &bus,
            "u1",
            &note.id,
            NoteDraft {
                content: "Misread, then understood".to_string(),
                tags: vec!["politics".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(updated.content, "Misread, then understood");
        assert_eq!(updated.tags, vec!["politics"]);
        assert_eq!(updated.created_at, note.created_at);

        delete_note(&conn, &bus, "u1", &note.id).unwrap();
        assert!(list_notes(&conn, &user_book_id).unwrap().is_empty());
    }

    #[test]
    fn tag_order_is_preserved() {
        let (conn, bus, user_book_id) = setup_with_membership();

        let tags = vec!["z".to_string(), "a".to_string(), "m".to_string()];
        let note = add_note(
            &conn,
            &bus,
            "u1",
            &user_book_id,
            NoteDraft {
                content: "ordering check".to_string(),
                tags: tags.clone(),
                ..Default::default()
            },
        )
        .unwrap();

        let fetched = get_note(&conn, &note.id).unwrap().unwrap();
        assert_eq!(fetched.tags, tags);
    }

    #[test]
    fn notes_are_listed_oldest_first() {
        let (conn, bus, user_book_id) = setup_with_membership();

        for content in ["first", "second", "third"] {
            add_note(
                &conn,
                &bus,
                "u1",
                &user_book_id,
                NoteDraft {
                    content: content.to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        }

        let listed = list_notes(&conn, &user_book_id).unwrap();
        let contents: Vec<&str> = listed.iter().map(|note| note.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }

    #[test]
    fn empty_content_is_rejected() {
        let (conn, bus, user_book_id) = setup_with_membership();

        let result = add_note(
            &conn,
            &bus,
            "u1",
            &user_book_id,
            NoteDraft {
                content: "   ".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(StoreError::Validation(_))));
    }

    #[test]
    fn another_users_membership_is_invisible() {
        let (conn, bus, user_book_id) = setup_with_membership();

        let result = add_note(
            &conn,
            &bus,
            "intruder",
            &user_book_id,
            NoteDraft {
                content: "should not land".to_string(),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(StoreError::NotFound("membership"))));
    }

    #[test]
    fn editing_someone_elses_note_is_not_found() {
        let (conn, bus, user_book_id) = setup_with_membership();

        let note = add_note(
            &conn,
            &bus,
            "u1",
            &user_book_id,
            NoteDraft {
                content: "mine".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

        let result = delete_note(&conn, &bus, "intruder", &note.id);
        assert!(matches!(result, Err(StoreError::NotFound("note"))));
    }
}
