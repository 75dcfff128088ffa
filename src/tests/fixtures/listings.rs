// Shared listing fixtures for unit and end to end tests.

use chrono::{DateTime, Utc};

use crate::modules::listings::core::listing::{Listing, ListingStatus, NewListing};

pub const OWNER_ID: &str = "user-owner-0001";
pub const BASE_MILLIS: i64 = 1_700_000_000_000;

/// A fixed instant `seconds` after the fixture epoch.
pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(BASE_MILLIS + seconds * 1_000).expect("fixture instant out of range")
}

pub fn make_new_listing() -> NewListing {
    NewListing {
        owner_id: OWNER_ID.to_string(),
        title: "Vintage road bike".to_string(),
        price_cents: 25_000,
        status: ListingStatus::Active,
        category: "bikes".to_string(),
    }
}

pub struct ListingBuilder {
    inner: Listing,
}

impl Default for ListingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(dead_code)]
impl ListingBuilder {
    pub fn new() -> Self {
        let new = make_new_listing();
        Self {
            inner: Listing {
                listing_id: "listing-0001".to_string(),
                owner_id: new.owner_id,
                title: new.title,
                price_cents: new.price_cents,
                status: new.status,
                category: new.category,
                version: 1,
                created_at: BASE_MILLIS,
                updated_at: BASE_MILLIS,
                deleted_at: None,
            },
        }
    }

    pub fn listing_id(mut self, v: impl Into<String>) -> Self {
        self.inner.listing_id = v.into();
        self
    }

    pub fn owner_id(mut self, v: impl Into<String>) -> Self {
        self.inner.owner_id = v.into();
        self
    }

    pub fn title(mut self, v: impl Into<String>) -> Self {
        self.inner.title = v.into();
        self
    }

    pub fn price_cents(mut self, v: i64) -> Self {
        self.inner.price_cents = v;
        self
    }

    pub fn version(mut self, v: i64) -> Self {
        self.inner.version = v;
        self
    }

    pub fn updated_at(mut self, v: i64) -> Self {
        self.inner.updated_at = v;
        self
    }

    pub fn deleted_at(mut self, v: Option<i64>) -> Self {
        self.inner.deleted_at = v;
        self
    }

    pub fn build(self) -> Listing {
        self.inner
    }
}
