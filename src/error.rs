use thiserror::Error;

/// Errors surfaced by the storage-facing operations.
///
/// External metadata lookups are deliberately absent: the cover helper
/// absorbs lookup failures and reports `None` instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid input: {0}")]
    Validation(String),
    #[error("{0} not found")]
    NotFound(&'static str),
    #[error("{0} already exists")]
    Conflict(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("storage error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

impl StoreError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        StoreError::Validation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::StoreError;

    #[test]
    fn messages_are_short_and_human_readable() {
        let err = StoreError::validation("title must not be empty");
        assert_eq!(err.to_string(), "invalid input: title must not be empty");

        let err = StoreError::NotFound("book");
        assert_eq!(err.to_string(), "book not found");

        let err = StoreError::Conflict("author");
        assert_eq!(err.to_string(), "author already exists");
    }
}
