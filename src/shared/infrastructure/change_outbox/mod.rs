// Ports for the change outbox: the ordered record of pending index synchronization work.
//
// Purpose
// - Describe how the reconciler claims, acknowledges, retries and parks outbox events.
//
// Boundaries
// - Appending is not part of this port. Only listing store adapters append, inside the
//   same transaction as the listing row they represent.

pub mod in_memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::modules::listings::core::listing::Listing;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxOperation {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    Pending,
    InFlight,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Mutation,
    DriftRepair,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown outbox value: {0}")]
pub struct UnknownOutboxValue(pub String);

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = UnknownOutboxValue;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(UnknownOutboxValue(other.to_string())),
                }
            }
        }
    };
}

string_enum!(OutboxOperation { Upsert => "upsert", Delete => "delete" });
string_enum!(DeliveryState {
    Pending => "pending",
    InFlight => "in_flight",
    Delivered => "delivered",
    Failed => "failed",
});
string_enum!(EventOrigin { Mutation => "mutation", DriftRepair => "drift_repair" });

/// An outbox row as written by a store adapter, before it has a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub listing_id: String,
    pub operation: OutboxOperation,
    pub listing_version: i64,
    pub payload: serde_json::Value,
    pub origin: EventOrigin,
    pub created_at: i64,
}

impl NewOutboxEvent {
    /// Snapshot a committed listing. Tombstoned listings produce a delete.
    pub fn for_listing(
        listing: &Listing,
        origin: EventOrigin,
        created_at: i64,
    ) -> Result<Self, serde_json::Error> {
        let operation = if listing.is_deleted() {
            OutboxOperation::Delete
        } else {
            OutboxOperation::Upsert
        };
        Ok(Self {
            listing_id: listing.listing_id.clone(),
            operation,
            listing_version: listing.version,
            payload: serde_json::to_value(listing)?,
            origin,
            created_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxEvent {
    pub sequence: i64,
    pub listing_id: String,
    pub operation: OutboxOperation,
    pub listing_version: i64,
    pub payload: serde_json::Value,
    pub origin: EventOrigin,
    pub state: DeliveryState,
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub first_failed_at: Option<i64>,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl OutboxEvent {
    pub fn from_new(sequence: i64, event: NewOutboxEvent) -> Self {
        Self {
            sequence,
            listing_id: event.listing_id,
            operation: event.operation,
            listing_version: event.listing_version,
            payload: event.payload,
            origin: event.origin,
            state: DeliveryState::Pending,
            attempts: 0,
            next_attempt_at: event.created_at,
            first_failed_at: None,
            last_error: None,
            created_at: event.created_at,
            updated_at: event.created_at,
        }
    }

    pub fn is_undelivered(&self) -> bool {
        matches!(self.state, DeliveryState::Pending | DeliveryState::InFlight)
    }
}

/// Retry bookkeeping recorded when a delivery attempt fails transiently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    pub attempts: u32,
    pub next_attempt_at: i64,
    pub first_failed_at: i64,
    pub last_error: String,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OutboxError {
    #[error("outbox event {0} not found")]
    NotFound(i64),

    #[error("outbox event {sequence} is {actual}, expected {expected}")]
    InvalidState {
        sequence: i64,
        expected: DeliveryState,
        actual: DeliveryState,
    },

    #[error("backend error: {0}")]
    Backend(String),
}

/// Pick the sequences a batch may claim, given undelivered events in sequence order.
///
/// A listing whose earliest undelivered event is in flight or not yet due
/// contributes nothing, so per-listing order survives retries and
/// concurrent claimers.
pub fn select_claimable<'a>(
    undelivered: impl IntoIterator<Item = &'a OutboxEvent>,
    max_count: usize,
    now: i64,
) -> Vec<i64> {
    let mut blocked: HashSet<&str> = HashSet::new();
    let mut claimable = Vec::new();
    for event in undelivered {
        if claimable.len() >= max_count {
            break;
        }
        match event.state {
            DeliveryState::InFlight => {
                blocked.insert(event.listing_id.as_str());
            }
            DeliveryState::Pending => {
                if blocked.contains(event.listing_id.as_str()) {
                    continue;
                }
                if event.next_attempt_at > now {
                    blocked.insert(event.listing_id.as_str());
                    continue;
                }
                claimable.push(event.sequence);
            }
            DeliveryState::Delivered | DeliveryState::Failed => {}
        }
    }
    claimable
}

#[async_trait]
pub trait ChangeOutbox: Send + Sync {
    /// Claim up to `max_count` due events, ordered by sequence, marking them in flight.
    async fn fetch_batch(&self, max_count: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, OutboxError>;

    async fn mark_delivered(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError>;

    async fn mark_retry(&self, sequence: i64, schedule: RetrySchedule, now: DateTime<Utc>) -> Result<(), OutboxError>;

    /// Return a claimed event to pending without touching its retry schedule.
    async fn release(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError>;

    async fn mark_failed(&self, sequence: i64, reason: &str, now: DateTime<Utc>) -> Result<(), OutboxError>;

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError>;

    /// Operator action: give a failed event a fresh schedule. When the listing has moved
    /// past the event's version, the event is settled and the current state is queued instead.
    async fn requeue_failed(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError>;

    /// Crash recovery: return every in-flight event to pending.
    async fn requeue_in_flight(&self, now: DateTime<Utc>) -> Result<usize, OutboxError>;

    async fn has_undelivered(&self, listing_id: &str) -> Result<bool, OutboxError>;

    async fn prune_delivered(&self, before: DateTime<Utc>) -> Result<usize, OutboxError>;
}
