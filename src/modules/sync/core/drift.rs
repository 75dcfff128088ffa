// Drift detection between the listing store and the search index.

use serde::Serialize;

use crate::shared::infrastructure::listing_store::ListingVersion;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// A live listing has no document.
    Missing,
    /// Document and listing versions differ.
    VersionMismatch,
    /// A tombstoned listing still has a document.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftRecord {
    pub listing_id: String,
    pub store_version: i64,
    pub index_version: Option<i64>,
    pub kind: DriftKind,
}

impl DriftRecord {
    /// The index claims a newer version than the store. Fencing rejects any repair.
    pub fn index_ahead(&self) -> bool {
        self.index_version
            .is_some_and(|index_version| index_version > self.store_version)
    }
}

pub fn detect_drift(store: &ListingVersion, index_version: Option<i64>) -> Option<DriftRecord> {
    let kind = match (store.deleted, index_version) {
        (false, None) => DriftKind::Missing,
        (false, Some(version)) if version != store.version => DriftKind::VersionMismatch,
        (true, Some(_)) => DriftKind::Orphaned,
        _ => return None,
    };
    Some(DriftRecord {
        listing_id: store.listing_id.clone(),
        store_version: store.version,
        index_version,
        kind,
    })
}
