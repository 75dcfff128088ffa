// In memory implementation of the SearchIndex port.
//
// Purpose
// - Stand in for the external search engine in tests and local development.
//
// Responsibilities
// - Fence upserts by version.
// - Inject failures: an offline switch, a number of transient failures, and artificial latency.
// - Offer unfenced writes so tests can simulate drift between the store and the index.

use async_trait::async_trait;
use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::shared::infrastructure::search_index::{
    SearchDocument, SearchHit, SearchIndex, SearchIndexError, SearchQuery,
};

#[derive(Debug, Default)]
pub struct InMemorySearchIndex {
    documents: RwLock<HashMap<String, SearchDocument>>,
    is_offline: AtomicBool,
    failures_left: AtomicU32,
    delay_ms: AtomicU64,
}

impl InMemorySearchIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_offline(&self, offline: bool) {
        self.is_offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` calls with `Unavailable`.
    pub fn fail_next(&self, count: u32) {
        self.failures_left.store(count, Ordering::SeqCst);
    }

    pub fn set_delay_ms(&self, delay_ms: u64) {
        self.delay_ms.store(delay_ms, Ordering::SeqCst);
    }

    pub async fn document(&self, listing_id: &str) -> Option<SearchDocument> {
        self.documents.read().await.get(listing_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }

    /// Write a document without fencing.
    pub async fn overwrite(&self, document: SearchDocument) {
        self.documents
            .write()
            .await
            .insert(document.listing_id.clone(), document);
    }

    /// Drop a document without going through the port.
    pub async fn remove(&self, listing_id: &str) {
        self.documents.write().await.remove(listing_id);
    }

    async fn ensure_available(&self) -> Result<(), SearchIndexError> {
        let delay_ms = self.delay_ms.load(Ordering::SeqCst);
        if delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
        if self.is_offline.load(Ordering::SeqCst) {
            return Err(SearchIndexError::Unavailable("Search index offline".to_string()));
        }
        let injected = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1));
        if injected.is_ok() {
            return Err(SearchIndexError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl SearchIndex for InMemorySearchIndex {
    async fn upsert(&self, document: SearchDocument) -> Result<(), SearchIndexError> {
        self.ensure_available().await?;
        let mut documents = self.documents.write().await;
        if let Some(current) = documents.get(&document.listing_id) {
            if document.version < current.version {
                return Err(SearchIndexError::Rejected {
                    listing_id: document.listing_id,
                    attempted: document.version,
                    current: current.version,
                });
            }
            if document.version == current.version {
                return Ok(());
            }
        }
        documents.insert(document.listing_id.clone(), document);
        Ok(())
    }

    async fn delete(&self, listing_id: &str) -> Result<(), SearchIndexError> {
        self.ensure_available().await?;
        self.documents.write().await.remove(listing_id);
        Ok(())
    }

    async fn versions_of(&self, listing_ids: &[String]) -> Result<HashMap<String, i64>, SearchIndexError> {
        self.ensure_available().await?;
        let documents = self.documents.read().await;
        Ok(listing_ids
            .iter()
            .filter_map(|listing_id| {
                documents
                    .get(listing_id)
                    .map(|document| (listing_id.clone(), document.version))
            })
            .collect())
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SearchHit>, SearchIndexError> {
        self.ensure_available().await?;
        let documents = self.documents.read().await;
        let mut matches: Vec<&SearchDocument> = documents
            .values()
            .filter(|document| query.matches(document))
            .collect();
        matches.sort_by_key(|document| (Reverse(document.updated_at), document.listing_id.clone()));
        Ok(matches
            .into_iter()
            .skip(query.offset)
            .take(query.effective_limit())
            .map(SearchHit::from)
            .collect())
    }
}
