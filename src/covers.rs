use chrono::Utc;
use reqwest::blocking::Client;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};
use crate::invalidation::{Entity, InvalidationBus};

const HTTP_TIMEOUT_SECS: u64 = 6;
const HTTP_MAX_RETRIES: u64 = 1;
const HTTP_USER_AGENT: &str = "dogear/0.1";
const VOLUMES_URL: &str = "https://www.googleapis.com/books/v1/volumes";

/// Image variants by resolution tier, largest first.
const VARIANT_PREFERENCE: [&str; 6] = [
    "extraLarge",
    "large",
    "medium",
    "small",
    "thumbnail",
    "smallThumbnail",
];

static COVER_DEBUG_ENABLED: OnceLock<bool> = OnceLock::new();

/// Best-effort cover enrichment for a book that has none.
///
/// Issues one external lookup by (title, author) and persists the best
/// image variant if one comes back. Lookup failures of any kind are logged
/// and absorbed; the result is `Ok(None)` and the book stays coverless.
/// Only a storage failure (reading the book, writing the URL) is an error.
pub fn resolve_missing_cover(
    conn: &Connection,
    bus: &InvalidationBus,
    book_id: &str,
) -> StoreResult<Option<String>> {
    let book: Option<(String, String, Option<String>)> = conn
        .query_row(
            "SELECT b.title, a.name, b.cover_url
             FROM books b JOIN authors a ON a.id = b.author_id
             WHERE b.id = ?1",
            params![book_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    let (title, author, cover_url) = book.ok_or(StoreError::NotFound("book"))?;

    if let Some(existing) = cover_url {
        if cover_debug_enabled() {
            log::info!("[cover-debug] skip (already set) book={}", book_id);
        }
        return Ok(Some(existing));
    }

    let found = match search_cover_url(&title, &author) {
        Some(url) => url,
        None => {
            log::info!("no cover found for {:?} by {:?}", title, author);
            return Ok(None);
        }
    };

    conn.execute(
        "UPDATE books SET cover_url = ?2, updated_at = ?3 WHERE id = ?1",
        params![book_id, found, Utc::now().timestamp_millis()],
    )?;
    bus.publish(Entity::Books);
    log::info!("cover resolved for {:?}: {}", title, found);
    Ok(Some(found))
}

fn search_cover_url(title: &str, author: &str) -> Option<String> {
    let query = format!("intitle:{} inauthor:{}", title, author);
    let url = format!(
        "{}?q={}&maxResults=1",
        VOLUMES_URL,
        urlencoding::encode(&query)
    );

    let data = fetch_json_with_retry(&url)?;
    let links = data
        .get("items")
        .and_then(|value| value.as_array())
        .and_then(|items| items.first())
        .and_then(|item| item.get("volumeInfo"))
        .and_then(|info| info.get("imageLinks"))?;

    select_image_variant(links)
}

/// Pick the largest named variant present and force the secure scheme.
fn select_image_variant(links: &Value) -> Option<String> {
    for variant in VARIANT_PREFERENCE {
        let url = links
            .get(variant)
            .and_then(|value| value.as_str())
            .map(|value| value.trim())
            .filter(|value| !value.is_empty());
        if let Some(url) = url {
            return Some(force_https(url));
        }
    }
    None
}

fn force_https(url: &str) -> String {
    match url.strip_prefix("http://") {
        Some(rest) => format!("https://{}", rest),
        None => url.to_string(),
    }
}

fn fetch_json_with_retry(url: &str) -> Option<Value> {
    let client = Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .ok()?;

    for attempt in 0..=HTTP_MAX_RETRIES {
        let response = client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/json")
            .header(reqwest::header::USER_AGENT, HTTP_USER_AGENT)
            .send();

        let response = match response {
            Ok(value) => value,
            Err(err) => {
                if cover_debug_enabled() {
                    log::warn!(
                        "[cover-debug] transport error url={} attempt={}: {}",
                        url,
                        attempt + 1,
                        err
                    );
                }
                if attempt < HTTP_MAX_RETRIES {
                    std::thread::sleep(Duration::from_millis(350 * (attempt + 1)));
                    continue;
                }
                return None;
            }
        };

        let status = response.status();
        if status.is_success() {
            return response.json::<Value>().ok();
        }

        log::warn!("cover lookup returned status {} for {}", status, url);
        if (status.as_u16() == 429 || status.is_server_error()) && attempt < HTTP_MAX_RETRIES {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.parse::<u64>().ok())
                .map(|value| value * 1000)
                .unwrap_or(350 * (attempt + 1));
            std::thread::sleep(Duration::from_millis(retry_after_ms.min(4_000)));
            continue;
        }

        return None;
    }

    None
}

fn cover_debug_enabled() -> bool {
    *COVER_DEBUG_ENABLED.get_or_init(|| {
        std::env::var("DOGEAR_COVER_DEBUG")
            .map(|value| {
                let lowered = value.trim().to_ascii_lowercase();
                lowered == "1" || lowered == "true" || lowered == "yes" || lowered == "on"
            })
            .unwrap_or(false)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{self, BookMetadata};
    use crate::db;

    #[test]
    fn variant_preference_is_largest_first() {
        let links = serde_json::json!({
            "smallThumbnail": "http://books.example/small-thumb.jpg",
            "thumbnail": "http://books.example/thumb.jpg",
            "large": "http://books.example/large.jpg",
        });
        assert_eq!(
            select_image_variant(&links).as_deref(),
            Some("https://books.example/large.jpg")
        );
    }

    #[test]
    fn blank_variants_are_skipped() {
        let links = serde_json::json!({
            "extraLarge": "  ",
            "medium": "https://books.example/medium.jpg",
        });
        assert_eq!(
            select_image_variant(&links).as_deref(),
            Some("https://books.example/medium.jpg")
        );
    }

    #[test]
    fn no_usable_variant_yields_none() {
        let links = serde_json::json!({ "colorCount": 3 });
        assert_eq!(select_image_variant(&links), None);
    }

    #[test]
    fn scheme_is_upgraded_but_https_left_alone() {
        assert_eq!(
            force_https("http://books.example/a.jpg"),
            "https://books.example/a.jpg"
        );
        assert_eq!(
            force_https("https://books.example/a.jpg"),
            "https://books.example/a.jpg"
        );
    }

    #[test]
    fn existing_cover_short_circuits_the_lookup() {
        let conn = db::open_in_memory().unwrap();
        let bus = InvalidationBus::new();
        let book_id = catalog::ensure_book(
            &conn,
            &bus,
            "Too Like the Lightning",
            "Ada Palmer",
            BookMetadata {
                cover_url: Some("https://covers.example/tltl.jpg".to_string()),
                ..Default::default()
            },
        )
        .unwrap()
        .book_id;

        let resolved = resolve_missing_cover(&conn, &bus, &book_id).unwrap();
        assert_eq!(resolved.as_deref(), Some("https://covers.example/tltl.jpg"));
    }

    #[test]
    fn unknown_book_is_not_found() {
        let conn = db::open_in_memory().unwrap();
        let bus = InvalidationBus::new();
        let result = resolve_missing_cover(&conn, &bus, "no-such-book");
        assert!(matches!(result, Err(StoreError::NotFound("book"))));
    }

    #[test]
    #[ignore = "network probe for manual debugging"]
    fn live_lookup_probe() {
        let conn = db::open_in_memory().unwrap();
        let bus = InvalidationBus::new();
        let book_id = catalog::ensure_book(
            &conn,
            &bus,
            "The Hitchhiker's Guide to the Galaxy",
            "Douglas Adams",
            BookMetadata::default(),
        )
        .unwrap()
        .book_id;

        // Must come back Ok whether or not the lookup finds anything.
        let resolved = resolve_missing_cover(&conn, &bus, &book_id).unwrap();
        println!("probe cover={:?}", resolved);
    }
}
