pub mod catalog;
pub mod covers;
pub mod db;
pub mod error;
pub mod invalidation;
pub mod membership;
pub mod models;
pub mod notes;
pub mod search;
pub mod social;

pub use catalog::{BookMetadata, EnsuredBook};
pub use error::{StoreError, StoreResult};
pub use invalidation::{Entity, InvalidationBus};
pub use membership::{LibraryEntry, ToggleOutcome};
pub use models::{
    Author, Book, BookNote, Follow, Membership, ProfileUpdate, ReadingStatus,
};
pub use notes::NoteDraft;
pub use search::CatalogHit;
pub use social::ActivityItem;
