use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::StoreError;

/// Where a book sits in a user's reading life.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReadingStatus {
    Planned,
    Reading,
    Finished,
    DidNotFinish,
}

impl ReadingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadingStatus::Planned => "planned",
            ReadingStatus::Reading => "reading",
            ReadingStatus::Finished => "finished",
            ReadingStatus::DidNotFinish => "did_not_finish",
        }
    }
}

impl FromStr for ReadingStatus {
    type Err = StoreError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "planned" => Ok(ReadingStatus::Planned),
            "reading" => Ok(ReadingStatus::Reading),
            "finished" => Ok(ReadingStatus::Finished),
            "did_not_finish" => Ok(ReadingStatus::DidNotFinish),
            other => Err(StoreError::Validation(format!(
                "unknown reading status: {}",
                other
            ))),
        }
    }
}

impl FromSql for ReadingStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse::<ReadingStatus>().map_err(|err| {
            FromSqlError::Other(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                err.to_string(),
            )))
        })
    }
}

impl ToSql for ReadingStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Author {
    pub id: String, // UUID
    pub name: String,
    pub bio: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Book {
    pub id: String, // UUID
    pub title: String,
    pub author_id: String,
    pub cover_url: Option<String>,
    pub description: Option<String>,
    pub isbn: Option<String>,
    pub page_count: Option<i64>,
    pub published_date: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One `user_books` row: a user's relationship to a book.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Membership {
    pub id: String, // UUID
    pub user_id: String,
    pub book_id: String,
    pub status: ReadingStatus,
    pub favorite: bool,
    pub date_started: Option<String>,  // YYYY-MM-DD
    pub date_finished: Option<String>, // YYYY-MM-DD
    pub notes: Option<String>,
    pub personal_rating: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BookNote {
    pub id: String, // UUID
    pub user_book_id: String,
    pub user_id: String,
    pub content: String,
    pub highlight_text: Option<String>,
    pub tags: Vec<String>,
    pub page_number: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Follow {
    pub id: String, // UUID
    pub follower_id: String,
    pub followed_id: String,
    pub created_at: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProfileUpdate {
    pub id: String, // UUID
    pub user_id: String,
    pub field: String,
    pub created_at: i64,
}
