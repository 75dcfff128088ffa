// Synchronization reconciler: drains the change outbox into the search index.
//
// Purpose
// - Apply every committed listing change to the search index, at least once and in
//   per-listing order.
//
// Responsibilities
// - Mark an event delivered only after the index confirms it.
// - Treat unavailability and timeouts as transient: retry with backoff until the retry
//   window is exhausted, then park the event as failed.
// - Treat a fencing rejection as superseded and a malformed payload as permanent.
// - Release later events of a listing whose earlier event was just retried.
// - Keep draining when one event's outcome cannot be recorded, and never leave a claim behind.

use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::modules::sync::core::projection::{decode_snapshot, project};
use crate::modules::sync::core::retry_policy::{RetryDecision, RetryPolicy};
use crate::shared::infrastructure::change_outbox::{ChangeOutbox, OutboxError, OutboxEvent, OutboxOperation};
use crate::shared::infrastructure::search_index::{SearchDocument, SearchIndex, SearchIndexError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilerSettings {
    pub batch_size: usize,
    pub index_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            index_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// Why a single delivery attempt did not reach the index.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("transient sync failure: {0}")]
    Transient(String),

    #[error("permanent sync failure: {0}")]
    Permanent(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Applied,
    Superseded { current: i64 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub claimed: usize,
    pub delivered: usize,
    pub superseded: usize,
    pub retried: usize,
    pub failed: usize,
    pub released: usize,
    /// Events whose outcome could not be recorded. They return to pending.
    pub unsettled: usize,
}

impl DrainReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Delivered,
    Superseded,
    Retried,
    Failed,
}

enum IndexOperation {
    Upsert(SearchDocument),
    Delete,
}

pub struct Reconciler<TOutbox, TIndex>
where
    TOutbox: ChangeOutbox + ?Sized,
    TIndex: SearchIndex + ?Sized,
{
    outbox: Arc<TOutbox>,
    index: Arc<TIndex>,
    settings: ReconcilerSettings,
    stranded: AtomicBool,
}

impl<TOutbox, TIndex> Reconciler<TOutbox, TIndex>
where
    TOutbox: ChangeOutbox + ?Sized,
    TIndex: SearchIndex + ?Sized,
{
    pub fn new(outbox: Arc<TOutbox>, index: Arc<TIndex>, settings: ReconcilerSettings) -> Self {
        Self {
            outbox,
            index,
            settings,
            stranded: AtomicBool::new(false),
        }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Return events claimed by a previous run that never finished to pending.
    pub async fn recover(&self, now: DateTime<Utc>) -> Result<usize, OutboxError> {
        let requeued = self.outbox.requeue_in_flight(now).await?;
        if requeued > 0 {
            tracing::warn!(requeued, "requeued in-flight outbox events");
        }
        Ok(requeued)
    }

    /// Claim one batch and settle every event in it.
    ///
    /// An event whose outcome cannot be recorded is released and does not stop the
    /// rest of the batch. Claims that could not even be released are requeued at the
    /// start of the next drain.
    pub async fn drain_once(&self, now: DateTime<Utc>) -> Result<DrainReport, OutboxError> {
        if self.stranded.swap(false, Ordering::SeqCst) {
            if let Err(err) = self.recover(now).await {
                self.stranded.store(true, Ordering::SeqCst);
                return Err(err);
            }
        }

        let batch = self.outbox.fetch_batch(self.settings.batch_size, now).await?;
        let mut report = DrainReport {
            claimed: batch.len(),
            ..Default::default()
        };
        let mut held_back: HashSet<String> = HashSet::new();

        for event in batch {
            if held_back.contains(&event.listing_id) {
                match self.outbox.release(event.sequence, now).await {
                    Ok(()) => report.released += 1,
                    Err(err) => {
                        self.strand(&event, &err);
                        report.unsettled += 1;
                    }
                }
                continue;
            }
            match self.settle(&event, now).await {
                Ok(Settlement::Delivered) => report.delivered += 1,
                Ok(Settlement::Superseded) => report.superseded += 1,
                Ok(Settlement::Retried) => {
                    held_back.insert(event.listing_id.clone());
                    report.retried += 1;
                }
                Ok(Settlement::Failed) => report.failed += 1,
                Err(err) => {
                    tracing::error!(
                        sequence = event.sequence,
                        listing_id = %event.listing_id,
                        error = %err,
                        "cannot record the outcome of an outbox event, releasing it"
                    );
                    if let Err(err) = self.outbox.release(event.sequence, now).await {
                        self.strand(&event, &err);
                    }
                    held_back.insert(event.listing_id.clone());
                    report.unsettled += 1;
                }
            }
        }

        if !report.is_idle() {
            tracing::info!(
                claimed = report.claimed,
                delivered = report.delivered,
                superseded = report.superseded,
                retried = report.retried,
                failed = report.failed,
                released = report.released,
                unsettled = report.unsettled,
                "outbox batch drained"
            );
        }
        Ok(report)
    }

    fn strand(&self, event: &OutboxEvent, err: &OutboxError) {
        tracing::error!(
            sequence = event.sequence,
            listing_id = %event.listing_id,
            error = %err,
            "outbox event left in flight, requeueing on the next drain"
        );
        self.stranded.store(true, Ordering::SeqCst);
    }

    async fn settle(&self, event: &OutboxEvent, now: DateTime<Utc>) -> Result<Settlement, OutboxError> {
        match self.deliver(event).await {
            Ok(Delivery::Applied) => {
                self.outbox.mark_delivered(event.sequence, now).await?;
                tracing::debug!(
                    sequence = event.sequence,
                    listing_id = %event.listing_id,
                    version = event.listing_version,
                    operation = %event.operation,
                    "outbox event delivered"
                );
                Ok(Settlement::Delivered)
            }
            Ok(Delivery::Superseded { current }) => {
                self.outbox.mark_delivered(event.sequence, now).await?;
                tracing::info!(
                    sequence = event.sequence,
                    listing_id = %event.listing_id,
                    version = event.listing_version,
                    index_version = current,
                    "outbox event superseded by a newer indexed version"
                );
                Ok(Settlement::Superseded)
            }
            Err(SyncError::Transient(reason)) => self.handle_transient(event, &reason, now).await,
            Err(SyncError::Permanent(reason)) => {
                self.outbox.mark_failed(event.sequence, &reason, now).await?;
                tracing::error!(
                    sequence = event.sequence,
                    listing_id = %event.listing_id,
                    version = event.listing_version,
                    error = %reason,
                    "outbox event cannot be delivered"
                );
                Ok(Settlement::Failed)
            }
        }
    }

    /// Schedule a retry or park the event.
    async fn handle_transient(&self, event: &OutboxEvent, reason: &str, now: DateTime<Utc>) -> Result<Settlement, OutboxError> {
        match self.settings.retry.decide(event, reason, now.timestamp_millis()) {
            RetryDecision::RetryAt(schedule) => {
                tracing::warn!(
                    sequence = event.sequence,
                    listing_id = %event.listing_id,
                    version = event.listing_version,
                    attempt = schedule.attempts,
                    next_attempt_at = schedule.next_attempt_at,
                    error = %reason,
                    "index delivery failed, retry scheduled"
                );
                self.outbox.mark_retry(event.sequence, schedule, now).await?;
                Ok(Settlement::Retried)
            }
            RetryDecision::GiveUp { attempts, reason } => {
                tracing::error!(
                    sequence = event.sequence,
                    listing_id = %event.listing_id,
                    version = event.listing_version,
                    attempt = attempts,
                    error = %reason,
                    "outbox event parked as failed"
                );
                self.outbox.mark_failed(event.sequence, &reason, now).await?;
                Ok(Settlement::Failed)
            }
        }
    }

    async fn deliver(&self, event: &OutboxEvent) -> Result<Delivery, SyncError> {
        let operation = match event.operation {
            OutboxOperation::Upsert => {
                IndexOperation::Upsert(project(&decode_snapshot(event).map_err(SyncError::Permanent)?))
            }
            OutboxOperation::Delete => IndexOperation::Delete,
        };

        let call = async {
            match operation {
                IndexOperation::Upsert(document) => self.index.upsert(document).await,
                IndexOperation::Delete => self.index.delete(&event.listing_id).await,
            }
        };
        let outcome = tokio::time::timeout(self.settings.index_timeout, call)
            .await
            .map_err(|_| {
                SyncError::Transient(format!(
                    "index call timed out after {}ms",
                    self.settings.index_timeout.as_millis()
                ))
            })?;

        match outcome {
            Ok(()) => Ok(Delivery::Applied),
            Err(SearchIndexError::Rejected { current, .. }) => Ok(Delivery::Superseded { current }),
            Err(SearchIndexError::Unavailable(reason)) => Err(SyncError::Transient(reason)),
        }
    }
}
