// Pure decision function for listing writes.
//
// Purpose
// - Validate a mutation against the currently stored row and produce the next row.
//
// Responsibilities
// - Enforce optimistic concurrency: the caller's expected version must match the stored one.
// - Enforce field rules: non-empty bounded title and category, non-negative price.
// - Never perform input or output. Store adapters call this inside their transaction.

use crate::modules::listings::core::listing::{
    Listing, ListingMutation, ListingPatch, MAX_CATEGORY_LEN, MAX_TITLE_LEN, NewListing,
};

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum WriteRejection {
    #[error("version mismatch: expected {expected}, actual {actual}")]
    VersionConflict { expected: i64, actual: i64 },
    #[error("listing {0} not found")]
    NotFound(String),
    #[error("invalid listing: {0}")]
    Invalid(String),
}

pub fn decide_write(
    current: Option<&Listing>,
    listing_id: &str,
    expected_version: i64,
    mutation: ListingMutation,
    occurred_at: i64,
) -> Result<Listing, WriteRejection> {
    match mutation {
        ListingMutation::Create(new) => decide_create(current, listing_id, expected_version, new, occurred_at),
        ListingMutation::Update(patch) => {
            let current = live_row(current, listing_id, expected_version)?;
            decide_update(current, patch, occurred_at)
        }
        ListingMutation::Delete => {
            let current = live_row(current, listing_id, expected_version)?;
            Ok(Listing {
                version: current.version + 1,
                updated_at: occurred_at,
                deleted_at: Some(occurred_at),
                ..current.clone()
            })
        }
    }
}

fn decide_create(
    current: Option<&Listing>,
    listing_id: &str,
    expected_version: i64,
    new: NewListing,
    occurred_at: i64,
) -> Result<Listing, WriteRejection> {
    let actual = current.map(|listing| listing.version).unwrap_or(0);
    if current.is_some() || expected_version != 0 {
        return Err(WriteRejection::VersionConflict {
            expected: expected_version,
            actual,
        });
    }
    let listing = Listing {
        listing_id: listing_id.to_string(),
        owner_id: new.owner_id,
        title: new.title.trim().to_string(),
        price_cents: new.price_cents,
        status: new.status,
        category: new.category.trim().to_string(),
        version: 1,
        created_at: occurred_at,
        updated_at: occurred_at,
        deleted_at: None,
    };
    validate(&listing)?;
    Ok(listing)
}

fn decide_update(
    current: &Listing,
    patch: ListingPatch,
    occurred_at: i64,
) -> Result<Listing, WriteRejection> {
    if patch.is_empty() {
        return Err(WriteRejection::Invalid("no fields to change".to_string()));
    }
    let mut next = current.clone();
    if let Some(title) = patch.title {
        next.title = title.trim().to_string();
    }
    if let Some(price_cents) = patch.price_cents {
        next.price_cents = price_cents;
    }
    if let Some(status) = patch.status {
        next.status = status;
    }
    if let Some(category) = patch.category {
        next.category = category.trim().to_string();
    }
    validate(&next)?;
    next.version = current.version + 1;
    next.updated_at = occurred_at;
    Ok(next)
}

fn live_row<'a>(
    current: Option<&'a Listing>,
    listing_id: &str,
    expected_version: i64,
) -> Result<&'a Listing, WriteRejection> {
    let current = current
        .filter(|listing| !listing.is_deleted())
        .ok_or_else(|| WriteRejection::NotFound(listing_id.to_string()))?;
    if current.version != expected_version {
        return Err(WriteRejection::VersionConflict {
            expected: expected_version,
            actual: current.version,
        });
    }
    Ok(current)
}

fn validate(listing: &Listing) -> Result<(), WriteRejection> {
    if listing.title.is_empty() {
        return Err(WriteRejection::Invalid("title must not be empty".to_string()));
    }
    if listing.title.chars().count() > MAX_TITLE_LEN {
        return Err(WriteRejection::Invalid(format!(
            "title must be at most {MAX_TITLE_LEN} characters"
        )));
    }
    if listing.category.is_empty() {
        return Err(WriteRejection::Invalid("category must not be empty".to_string()));
    }
    if listing.category.chars().count() > MAX_CATEGORY_LEN {
        return Err(WriteRejection::Invalid(format!(
            "category must be at most {MAX_CATEGORY_LEN} characters"
        )));
    }
    if listing.price_cents < 0 {
        return Err(WriteRejection::Invalid("price must not be negative".to_string()));
    }
    Ok(())
}
