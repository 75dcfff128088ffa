// Drift sweep: finds listings whose indexed version disagrees with the store and re-enqueues them.
//
// Purpose
// - Heal divergence the outbox cannot see, such as documents lost or overwritten in the index.
//
// Responsibilities
// - Page through listing versions with a cursor that wraps around at the end.
// - Skip listings that still have undelivered events; the reconciler will settle them.
// - Append repairs through the listing store so it stays the only outbox appender.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::modules::sync::core::drift::{DriftRecord, detect_drift};
use crate::shared::infrastructure::change_outbox::{ChangeOutbox, OutboxError};
use crate::shared::infrastructure::listing_store::{ListingStore, StoreError};
use crate::shared::infrastructure::search_index::{SearchIndex, SearchIndexError};

#[derive(Debug, Error)]
pub enum SweepError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Index(#[from] SearchIndexError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub skipped_undelivered: usize,
    pub drift: Vec<DriftRecord>,
    pub enqueued: usize,
    /// The cursor reached the end of the listings and starts over next time.
    pub wrapped: bool,
}

pub struct DriftSweeper<TStore, TOutbox, TIndex>
where
    TStore: ListingStore + ?Sized,
    TOutbox: ChangeOutbox + ?Sized,
    TIndex: SearchIndex + ?Sized,
{
    store: Arc<TStore>,
    outbox: Arc<TOutbox>,
    index: Arc<TIndex>,
    sample_size: usize,
    cursor: Mutex<Option<String>>,
}

impl<TStore, TOutbox, TIndex> DriftSweeper<TStore, TOutbox, TIndex>
where
    TStore: ListingStore + ?Sized,
    TOutbox: ChangeOutbox + ?Sized,
    TIndex: SearchIndex + ?Sized,
{
    pub fn new(store: Arc<TStore>, outbox: Arc<TOutbox>, index: Arc<TIndex>, sample_size: usize) -> Self {
        Self {
            store,
            outbox,
            index,
            sample_size: sample_size.max(1),
            cursor: Mutex::new(None),
        }
    }

    /// Compare one page of listings with the index and enqueue repairs for drifted ones.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<SweepReport, SweepError> {
        let mut cursor = self.cursor.lock().await;
        let page = self
            .store
            .listing_versions(cursor.as_deref(), self.sample_size)
            .await?;

        let mut report = SweepReport {
            scanned: page.len(),
            wrapped: page.len() < self.sample_size,
            ..Default::default()
        };

        let listing_ids: Vec<String> = page.iter().map(|entry| entry.listing_id.clone()).collect();
        let index_versions = if listing_ids.is_empty() {
            Default::default()
        } else {
            self.index.versions_of(&listing_ids).await?
        };

        for entry in &page {
            let Some(record) = detect_drift(entry, index_versions.get(&entry.listing_id).copied()) else {
                continue;
            };
            if self.outbox.has_undelivered(&entry.listing_id).await? {
                report.skipped_undelivered += 1;
                continue;
            }
            if record.index_ahead() {
                tracing::warn!(
                    listing_id = %record.listing_id,
                    version = record.store_version,
                    index_version = record.index_version,
                    "search index is ahead of the listing store"
                );
            } else {
                tracing::info!(
                    listing_id = %record.listing_id,
                    version = record.store_version,
                    index_version = record.index_version,
                    kind = ?record.kind,
                    "drift detected"
                );
            }
            if let Some(sequence) = self.store.enqueue_resync(&entry.listing_id, now).await? {
                tracing::debug!(listing_id = %entry.listing_id, sequence, "drift repair enqueued");
                report.enqueued += 1;
            }
            report.drift.push(record);
        }

        *cursor = if report.wrapped {
            None
        } else {
            page.last().map(|entry| entry.listing_id.clone())
        };
        Ok(report)
    }
}
