use crate::modules::listings::core::listing::{ListingStatus, NewListing};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateListing {
    pub listing_id: String,
    /// Owner to create on behalf of. Defaults to the authenticated subject.
    pub owner_id: Option<String>,
    pub title: String,
    pub price_cents: i64,
    pub status: Option<ListingStatus>,
    pub category: String,
}

impl CreateListing {
    pub fn into_new_listing(self, owner_id: String) -> NewListing {
        NewListing {
            owner_id,
            title: self.title,
            price_cents: self.price_cents,
            status: self.status.unwrap_or_default(),
            category: self.category,
        }
    }
}
