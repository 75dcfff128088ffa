#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteListing {
    pub listing_id: String,
    pub expected_version: i64,
}
