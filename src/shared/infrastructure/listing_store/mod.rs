// Ports for the listing store, the system of record for listings.
//
// Purpose
// - Describe transactional read-modify-write of listing rows with optimistic versioning.
//
// Responsibilities
// - Every committed write appends exactly one outbox event in the same atomic unit.
// - Drift repairs are appended through the store as well, so the store stays the only appender.
//
// Testing guidance
// - The in memory adapter supports failure injection. The SQLite adapter runs against an
//   in memory database.

pub mod in_memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::modules::listings::core::decide::WriteRejection;
use crate::modules::listings::core::listing::{Listing, ListingMutation};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionConflict { expected: i64, actual: i64 },

    #[error("listing {0} not found")]
    NotFound(String),

    #[error("invalid listing: {0}")]
    Invalid(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<WriteRejection> for StoreError {
    fn from(rejection: WriteRejection) -> Self {
        match rejection {
            WriteRejection::VersionConflict { expected, actual } => {
                StoreError::VersionConflict { expected, actual }
            }
            WriteRejection::NotFound(listing_id) => StoreError::NotFound(listing_id),
            WriteRejection::Invalid(reason) => StoreError::Invalid(reason),
        }
    }
}

/// The part of a listing row the drift sweep compares against the index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingVersion {
    pub listing_id: String,
    pub version: i64,
    pub deleted: bool,
}

impl From<&Listing> for ListingVersion {
    fn from(listing: &Listing) -> Self {
        Self {
            listing_id: listing.listing_id.clone(),
            version: listing.version,
            deleted: listing.is_deleted(),
        }
    }
}

#[async_trait]
pub trait ListingStore: Send + Sync {
    /// Read a listing row. Tombstoned rows are returned with `deleted_at` set.
    async fn get(&self, listing_id: &str) -> Result<Option<Listing>, StoreError>;

    /// Apply a mutation if the stored version equals `expected_version`, appending
    /// one outbox event in the same transaction. Returns the new version.
    async fn write(
        &self,
        listing_id: &str,
        expected_version: i64,
        mutation: ListingMutation,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    /// Page through listing versions ordered by id, starting after `after`.
    async fn listing_versions(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ListingVersion>, StoreError>;

    /// Append a drift repair event built from the current row. Returns the event
    /// sequence, or `None` when the listing does not exist.
    async fn enqueue_resync(
        &self,
        listing_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError>;
}
