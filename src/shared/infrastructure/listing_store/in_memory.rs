// In memory implementation of the ListingStore and ChangeOutbox ports.
//
// Purpose
// - Support handler, reconciler and end to end tests and local development without a database.
//
// Responsibilities
// - Keep listing rows and the outbox log behind one lock, so a row write and its
//   outbox append are observed together or not at all.
// - Enforce optimistic concurrency through the shared decision function.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Bound;
use tokio::sync::Mutex;

use crate::modules::listings::core::decide::decide_write;
use crate::modules::listings::core::listing::{Listing, ListingMutation};
use crate::shared::infrastructure::change_outbox::in_memory::OutboxLog;
use crate::shared::infrastructure::change_outbox::{
    ChangeOutbox, EventOrigin, NewOutboxEvent, OutboxError, OutboxEvent, RetrySchedule,
};
use crate::shared::infrastructure::listing_store::{ListingStore, ListingVersion, StoreError};

#[derive(Debug, Default)]
struct Tables {
    listings: BTreeMap<String, Listing>,
    outbox: OutboxLog,
}

#[derive(Debug, Default)]
pub struct InMemoryListingStore {
    tables: Mutex<Tables>,
    is_offline: bool,
}

impl InMemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn toggle_offline(&mut self) {
        self.is_offline = !self.is_offline;
    }

    /// Every outbox event recorded for a listing, delivered or not.
    pub async fn outbox_events_for(&self, listing_id: &str) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.events_for(listing_id)
    }

    fn ensure_online(&self) -> Result<(), StoreError> {
        if self.is_offline {
            return Err(StoreError::Backend("Listing store offline".to_string()));
        }
        Ok(())
    }
}

fn snapshot(listing: &Listing, origin: EventOrigin, occurred_at: i64) -> Result<NewOutboxEvent, StoreError> {
    NewOutboxEvent::for_listing(listing, origin, occurred_at)
        .map_err(|err| StoreError::Backend(format!("cannot snapshot listing: {err}")))
}

#[async_trait]
impl ListingStore for InMemoryListingStore {
    async fn get(&self, listing_id: &str) -> Result<Option<Listing>, StoreError> {
        self.ensure_online()?;
        Ok(self.tables.lock().await.listings.get(listing_id).cloned())
    }

    async fn write(
        &self,
        listing_id: &str,
        expected_version: i64,
        mutation: ListingMutation,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.ensure_online()?;
        let occurred_at = now.timestamp_millis();
        let mut tables = self.tables.lock().await;
        let listing = decide_write(
            tables.listings.get(listing_id),
            listing_id,
            expected_version,
            mutation,
            occurred_at,
        )?;
        let event = snapshot(&listing, EventOrigin::Mutation, occurred_at)?;
        let version = listing.version;
        tables.listings.insert(listing_id.to_string(), listing);
        tables.outbox.append(event);
        Ok(version)
    }

    async fn listing_versions(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ListingVersion>, StoreError> {
        self.ensure_online()?;
        let tables = self.tables.lock().await;
        let lower = match after {
            Some(listing_id) => Bound::Excluded(listing_id.to_string()),
            None => Bound::Unbounded,
        };
        Ok(tables
            .listings
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, listing)| ListingVersion::from(listing))
            .collect())
    }

    async fn enqueue_resync(
        &self,
        listing_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        self.ensure_online()?;
        let mut tables = self.tables.lock().await;
        let Some(listing) = tables.listings.get(listing_id) else {
            return Ok(None);
        };
        let event = snapshot(listing, EventOrigin::DriftRepair, now.timestamp_millis())?;
        Ok(Some(tables.outbox.append(event)))
    }
}

#[async_trait]
impl ChangeOutbox for InMemoryListingStore {
    async fn fetch_batch(&self, max_count: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, OutboxError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.outbox.claim_batch(max_count, now.timestamp_millis()))
    }

    async fn mark_delivered(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        tables.outbox.mark_delivered(sequence, now.timestamp_millis())
    }

    async fn mark_retry(&self, sequence: i64, schedule: RetrySchedule, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        tables.outbox.mark_retry(sequence, schedule, now.timestamp_millis())
    }

    async fn release(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        tables.outbox.release(sequence, now.timestamp_millis())
    }

    async fn mark_failed(&self, sequence: i64, reason: &str, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let mut tables = self.tables.lock().await;
        tables.outbox.mark_failed(sequence, reason, now.timestamp_millis())
    }

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        Ok(self.tables.lock().await.outbox.failed(limit))
    }

    async fn requeue_failed(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let now = now.timestamp_millis();
        let mut guard = self.tables.lock().await;
        let tables = &mut *guard;
        let parked = tables
            .outbox
            .get(sequence)
            .ok_or(OutboxError::NotFound(sequence))?;
        let newer = tables
            .listings
            .get(&parked.listing_id)
            .filter(|listing| listing.version > parked.listing_version);

        // A newer listing version makes the parked snapshot stale: settle it and
        // queue the current state instead.
        match newer {
            Some(listing) => {
                let event = NewOutboxEvent::for_listing(listing, EventOrigin::DriftRepair, now)
                    .map_err(|err| OutboxError::Backend(format!("cannot snapshot listing: {err}")))?;
                tables.outbox.supersede_failed(sequence, now)?;
                tables.outbox.append(event);
                Ok(())
            }
            None => tables.outbox.requeue_failed(sequence, now),
        }
    }

    async fn requeue_in_flight(&self, now: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.outbox.requeue_in_flight(now.timestamp_millis()))
    }

    async fn has_undelivered(&self, listing_id: &str) -> Result<bool, OutboxError> {
        Ok(self.tables.lock().await.outbox.has_undelivered(listing_id))
    }

    async fn prune_delivered(&self, before: DateTime<Utc>) -> Result<usize, OutboxError> {
        let mut tables = self.tables.lock().await;
        Ok(tables.outbox.prune_delivered(before.timestamp_millis()))
    }
}
