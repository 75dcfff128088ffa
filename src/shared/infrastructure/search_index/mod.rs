// Ports for the search index, the eventually consistent read model for listing search.
//
// Purpose
// - Describe fenced document writes and keyword search over listing documents.
//
// Responsibilities
// - Reject an upsert older than the stored document, treat an equal version as a no-op.
// - Expose document versions so the drift sweep can compare them with the listing store.

pub mod in_memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

use crate::modules::listings::core::listing::ListingStatus;

pub const DEFAULT_SEARCH_LIMIT: usize = 20;
pub const MAX_SEARCH_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchDocument {
    pub listing_id: String,
    pub version: i64,
    pub owner_id: String,
    pub title: String,
    pub category: String,
    pub status: ListingStatus,
    pub price_cents: i64,
    pub updated_at: i64,
    /// Lower-cased title and category, matched by free-text terms.
    pub search_text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SearchQuery {
    pub text: Option<String>,
    pub category: Option<String>,
    pub status: Option<ListingStatus>,
    pub min_price_cents: Option<i64>,
    pub max_price_cents: Option<i64>,
    pub offset: usize,
    pub limit: Option<usize>,
}

impl SearchQuery {
    pub fn effective_limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_SEARCH_LIMIT)
            .clamp(1, MAX_SEARCH_LIMIT)
    }

    pub fn terms(&self) -> Vec<String> {
        self.text
            .as_deref()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_lowercase)
            .collect()
    }

    pub fn matches(&self, document: &SearchDocument) -> bool {
        let terms_match = self
            .terms()
            .iter()
            .all(|term| document.search_text.contains(term.as_str()));
        let category_match = self
            .category
            .as_deref()
            .is_none_or(|category| document.category.eq_ignore_ascii_case(category));
        let status_match = self.status.is_none_or(|status| document.status == status);
        let min_match = self
            .min_price_cents
            .is_none_or(|min| document.price_cents >= min);
        let max_match = self
            .max_price_cents
            .is_none_or(|max| document.price_cents <= max);
        terms_match && category_match && status_match && min_match && max_match
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    pub listing_id: String,
    pub version: i64,
    pub owner_id: String,
    pub title: String,
    pub category: String,
    pub status: ListingStatus,
    pub price_cents: i64,
    pub updated_at: i64,
}

impl From<&SearchDocument> for SearchHit {
    fn from(document: &SearchDocument) -> Self {
        Self {
            listing_id: document.listing_id.clone(),
            version: document.version,
            owner_id: document.owner_id.clone(),
            title: document.title.clone(),
            category: document.category.clone(),
            status: document.status,
            price_cents: document.price_cents,
            updated_at: document.updated_at,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SearchIndexError {
    #[error("upsert of {listing_id} at version {attempted} rejected, index holds version {current}")]
    Rejected {
        listing_id: String,
        attempted: i64,
        current: i64,
    },

    #[error("search index unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert(&self, document: SearchDocument) -> Result<(), SearchIndexError>;

    /// Remove a document. Removing an absent document succeeds.
    async fn delete(&self, listing_id: &str) -> Result<(), SearchIndexError>;

    /// Versions of the indexed documents among `listing_ids`. Absent ids are left out.
    async fn versions_of(&self, listing_ids: &[String]) -> Result<HashMap<String, i64>, SearchIndexError>;

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchIndexError>;
}
