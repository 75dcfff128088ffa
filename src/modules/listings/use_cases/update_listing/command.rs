use crate::modules::listings::core::listing::ListingPatch;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateListing {
    pub listing_id: String,
    pub expected_version: i64,
    pub patch: ListingPatch,
}
