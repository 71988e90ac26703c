use chrono::Utc;
use rusqlite::{params, Connection};
use serde::Serialize;
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::invalidation::{Entity, InvalidationBus};
use crate::models::{Follow, ProfileUpdate, ReadingStatus};

/// One entry in the merged activity feed.
///
/// Two row shapes feed it: membership changes from followed users and their
/// profile updates. Both carry `happened_at` so the merge has one sort key.
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ActivityItem {
    #[serde(rename_all = "camelCase")]
    Book {
        id: String,
        user_id: String,
        book_id: String,
        title: String,
        status: ReadingStatus,
        favorite: bool,
        happened_at: i64,
    },
    #[serde(rename_all = "camelCase")]
    Profile {
        id: String,
        user_id: String,
        field: String,
        happened_at: i64,
    },
}

impl ActivityItem {
    pub fn happened_at(&self) -> i64 {
        match self {
            ActivityItem::Book { happened_at, .. } => *happened_at,
            ActivityItem::Profile { happened_at, .. } => *happened_at,
        }
    }
}

/// Follow another user. Repeats converge on the existing relationship so a
/// stale double-tap is harmless.
pub fn follow(
    conn: &Connection,
    bus: &InvalidationBus,
    follower_id: &str,
    followed_id: &str,
) -> StoreResult<Follow> {
    require_id(follower_id, "follower id")?;
    require_id(followed_id, "followed id")?;
    if follower_id == followed_id {
        return Err(StoreError::validation("cannot follow yourself"));
    }

    let follow = Follow {
        id: Uuid::new_v4().to_string(),
        follower_id: follower_id.to_string(),
        followed_id: followed_id.to_string(),
        created_at: Utc::now().timestamp_millis(),
    };
    let inserted = conn.execute(
        "INSERT OR IGNORE INTO follows (id, follower_id, followed_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![follow.id, follow.follower_id, follow.followed_id, follow.created_at],
    )?;
    if inserted > 0 {
        bus.publish(Entity::Follows);
        return Ok(follow);
    }

    let existing = conn.query_row(
        "SELECT id, follower_id, followed_id, created_at FROM follows WHERE follower_id = ?1 AND followed_id = ?2",
        params![follower_id, followed_id],
        |row| {
            Ok(Follow {
                id: row.get(0)?,
                follower_id: row.get(1)?,
                followed_id: row.get(2)?,
                created_at: row.get(3)?,
            })
        },
    )?;
    Ok(existing)
}

pub fn unfollow(
    conn: &Connection,
    bus: &InvalidationBus,
    follower_id: &str,
    followed_id: &str,
) -> StoreResult<()> {
    let removed = conn.execute(
        "DELETE FROM follows WHERE follower_id = ?1 AND followed_id = ?2",
        params![follower_id, followed_id],
    )?;
    if removed == 0 {
        return Err(StoreError::NotFound("follow"));
    }
    bus.publish(Entity::Follows);
    Ok(())
}

/// Ids this user follows, most recent follow first.
pub fn following(conn: &Connection, user_id: &str) -> StoreResult<Vec<String>> {
    collect_ids(
        conn,
        "SELECT followed_id FROM follows WHERE follower_id = ?1 ORDER BY created_at DESC",
        user_id,
    )
}

/// Ids following this user, most recent follow first.
pub fn followers(conn: &Connection, user_id: &str) -> StoreResult<Vec<String>> {
    collect_ids(
        conn,
        "SELECT follower_id FROM follows WHERE followed_id = ?1 ORDER BY created_at DESC",
        user_id,
    )
}

pub fn is_following(
    conn: &Connection,
    follower_id: &str,
    followed_id: &str,
) -> StoreResult<bool> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM follows WHERE follower_id = ?1 AND followed_id = ?2",
        params![follower_id, followed_id],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Record that a user changed a profile field, for the activity feed.
pub fn record_profile_update(
    conn: &Connection,
    bus: &InvalidationBus,
    user_id: &str,
    field: &str,
) -> StoreResult<ProfileUpdate> {
    require_id(user_id, "user id")?;
    let field = field.trim();
    if field.is_empty() {
        return Err(StoreError::validation("profile field must not be empty"));
    }

    let update = ProfileUpdate {
        id: Uuid::new_v4().to_string(),
        user_id: user_id.to_string(),
        field: field.to_string(),
        created_at: Utc::now().timestamp_millis(),
    };
    conn.execute(
        "INSERT INTO profile_updates (id, user_id, field, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![update.id, update.user_id, update.field, update.created_at],
    )?;
    bus.publish(Entity::Profiles);
    Ok(update)
}

/// Merged activity from everyone the viewer follows, newest first.
///
/// Each source query is bounded by `limit` before the merge so neither
/// shape can starve the other out of its own query window.
pub fn activity_feed(
    conn: &Connection,
    viewer_id: &str,
    limit: i64,
) -> StoreResult<Vec<ActivityItem>> {
    require_id(viewer_id, "viewer id")?;
    if limit <= 0 {
        return Err(StoreError::validation("feed limit must be positive"));
    }

    let mut items = Vec::new();

    let mut stmt = conn.prepare(
        "SELECT ub.id, ub.user_id, ub.book_id, b.title, ub.status, ub.favorite, ub.updated_at
         FROM user_books ub
         JOIN follows f ON f.followed_id = ub.user_id
         JOIN books b ON b.id = ub.book_id
         WHERE f.follower_id = ?1
         ORDER BY ub.updated_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![viewer_id, limit], |row| {
        Ok(ActivityItem::Book {
            id: row.get(0)?,
            user_id: row.get(1)?,
            book_id: row.get(2)?,
            title: row.get(3)?,
            status: row.get(4)?,
            favorite: row.get::<_, i64>(5)? != 0,
            happened_at: row.get(6)?,
        })
    })?;
    for row in rows {
        items.push(row?);
    }

    let mut stmt = conn.prepare(
        "SELECT p.id, p.user_id, p.field, p.created_at
         FROM profile_updates p
         JOIN follows f ON f.followed_id = p.user_id
         WHERE f.follower_id = ?1
         ORDER BY p.created_at DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![viewer_id, limit], |row| {
        Ok(ActivityItem::Profile {
            id: row.get(0)?,
            user_id: row.get(1)?,
            field: row.get(2)?,
            happened_at: row.get(3)?,
        })
    })?;
    for row in rows {
        items.push(row?);
    }

    items.sort_by(|a, b| b.happened_at().cmp(&a.happened_at()));
    items.truncate(limit as usize);
    Ok(items)
}

fn collect_ids(conn: &Connection, sql: &str, user_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params![user_id], |row| row.get(0))?;

    let mut ids = Vec::new();
    for row in rows {
        ids.push(row?);
    }
    Ok(ids)
}

fn require_id(value: &str, what: &str) -> StoreResult<()> {
    if value.trim().is_empty() {
        return Err(StoreError::Validation(format!("{} must not be empty", what)));
    }
    Ok(())
}
