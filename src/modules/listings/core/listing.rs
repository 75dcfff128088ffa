use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const MAX_TITLE_LEN: usize = 200;
pub const MAX_CATEGORY_LEN: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    #[default]
    Draft,
    Active,
    Sold,
    Archived,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ListingStatus::Draft => "draft",
            ListingStatus::Active => "active",
            ListingStatus::Sold => "sold",
            ListingStatus::Archived => "archived",
        }
    }
}

impl fmt::Display for ListingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown listing status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for ListingStatus {
    type Err = UnknownStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "draft" => Ok(ListingStatus::Draft),
            "active" => Ok(ListingStatus::Active),
            "sold" => Ok(ListingStatus::Sold),
            "archived" => Ok(ListingStatus::Archived),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// A marketplace listing as held by the listing store, the system of record.
///
/// `version` starts at 1 on create and grows by one with every committed
/// write. A deleted listing keeps its row with `deleted_at` set so the
/// version history never goes backwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub listing_id: String,
    pub owner_id: String,
    pub title: String,
    pub price_cents: i64,
    pub status: ListingStatus,
    pub category: String,
    pub version: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub deleted_at: Option<i64>,
}

impl Listing {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewListing {
    pub owner_id: String,
    pub title: String,
    pub price_cents: i64,
    pub status: ListingStatus,
    pub category: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingPatch {
    pub title: Option<String>,
    pub price_cents: Option<i64>,
    pub status: Option<ListingStatus>,
    pub category: Option<String>,
}

impl ListingPatch {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.price_cents.is_none()
            && self.status.is_none()
            && self.category.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListingMutation {
    Create(NewListing),
    Update(ListingPatch),
    Delete,
}

/// Result of a committed write, returned to mutation callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOutcome {
    pub listing_id: String,
    pub version: i64,
}
