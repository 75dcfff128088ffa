// SQLite implementation of the ListingStore and ChangeOutbox ports.
//
// Purpose
// - Keep listing rows and their outbox events in one database file, so a committed
//   listing change always has its synchronization obligation recorded.
//
// Responsibilities
// - Run every listing write and its outbox insert in one transaction.
// - Open read-then-write transactions with BEGIN IMMEDIATE, so they take the write lock
//   up front and wait on the busy timeout instead of failing a lock upgrade.
// - Serialize those transactions in-process through a write gate. The conditional
//   `UPDATE ... WHERE version = ?` still guards against other processes on the same file.

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
};
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::modules::listings::core::decide::decide_write;
use crate::modules::listings::core::listing::{Listing, ListingMutation, ListingStatus};
use crate::shared::infrastructure::change_outbox::{
    ChangeOutbox, DeliveryState, EventOrigin, NewOutboxEvent, OutboxError, OutboxEvent,
    OutboxOperation, RetrySchedule, select_claimable,
};
use crate::shared::infrastructure::listing_store::{ListingStore, ListingVersion, StoreError};

const LISTING_COLUMNS: &str = "id, owner_id, title, price_cents, status, category, version, created_at, updated_at, deleted_at";
const OUTBOX_COLUMNS: &str = "sequence, listing_id, operation, listing_version, payload, origin, state, attempts, next_attempt_at, first_failed_at, last_error, created_at, updated_at";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SqliteListingStore {
    pool: SqlitePool,
    write_gate: Mutex<()>,
}

impl SqliteListingStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_gate: Mutex::new(()),
        }
    }

    /// Open (or create) a database file in WAL mode and apply the schema.
    pub async fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("cannot create {}", parent.display()))?;
        }
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("cannot open listing store at {}", path.display()))?;
        let store = Self::new(pool);
        store.migrate().await.context("listing store migration failed")?;
        Ok(store)
    }

    /// A private in-memory database. One connection that never expires, since every
    /// SQLite memory connection is its own database.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect_with(options)
            .await?;
        let store = Self::new(pool);
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>, sqlx::Error> {
        self.pool.begin_with("BEGIN IMMEDIATE").await
    }

    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                title TEXT NOT NULL,
                price_cents INTEGER NOT NULL,
                status TEXT NOT NULL,
                category TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                deleted_at INTEGER
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS outbox_events (
                sequence INTEGER PRIMARY KEY AUTOINCREMENT,
                listing_id TEXT NOT NULL,
                operation TEXT NOT NULL,
                listing_version INTEGER NOT NULL,
                payload TEXT NOT NULL,
                origin TEXT NOT NULL,
                state TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                first_failed_at INTEGER,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_state ON outbox_events(state, sequence)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_outbox_events_listing ON outbox_events(listing_id, state)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Every outbox event recorded for a listing, delivered or not.
    pub async fn outbox_events_for(&self, listing_id: &str) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE listing_id = ? ORDER BY sequence"
        ))
        .bind(listing_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(outbox_event_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn transition_error(&self, sequence: i64, expected: DeliveryState) -> OutboxError {
        let state = sqlx::query_scalar::<_, String>("SELECT state FROM outbox_events WHERE sequence = ?")
            .bind(sequence)
            .fetch_optional(&self.pool)
            .await;
        match state {
            Ok(None) => OutboxError::NotFound(sequence),
            Ok(Some(state)) => match state.parse::<DeliveryState>() {
                Ok(actual) => OutboxError::InvalidState {
                    sequence,
                    expected,
                    actual,
                },
                Err(err) => OutboxError::Backend(err.to_string()),
            },
            Err(err) => OutboxError::from(err),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

impl From<sqlx::Error> for OutboxError {
    fn from(err: sqlx::Error) -> Self {
        OutboxError::Backend(err.to_string())
    }
}

fn decode_err<E>(err: E) -> sqlx::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    sqlx::Error::Decode(Box::new(err))
}

fn listing_from_row(row: &SqliteRow) -> Result<Listing, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Listing {
        listing_id: row.try_get("id")?,
        owner_id: row.try_get("owner_id")?,
        title: row.try_get("title")?,
        price_cents: row.try_get("price_cents")?,
        status: status.parse::<ListingStatus>().map_err(decode_err)?,
        category: row.try_get("category")?,
        version: row.try_get("version")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn outbox_event_from_row(row: &SqliteRow) -> Result<OutboxEvent, sqlx::Error> {
    let operation: String = row.try_get("operation")?;
    let origin: String = row.try_get("origin")?;
    let state: String = row.try_get("state")?;
    let payload: String = row.try_get("payload")?;
    let attempts: i64 = row.try_get("attempts")?;
    Ok(OutboxEvent {
        sequence: row.try_get("sequence")?,
        listing_id: row.try_get("listing_id")?,
        operation: operation.parse::<OutboxOperation>().map_err(decode_err)?,
        listing_version: row.try_get("listing_version")?,
        payload: serde_json::from_str(&payload).map_err(decode_err)?,
        origin: origin.parse::<EventOrigin>().map_err(decode_err)?,
        state: state.parse::<DeliveryState>().map_err(decode_err)?,
        attempts: u32::try_from(attempts).map_err(decode_err)?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        first_failed_at: row.try_get("first_failed_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

async fn fetch_listing(conn: &mut SqliteConnection, listing_id: &str) -> Result<Option<Listing>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?"))
        .bind(listing_id)
        .fetch_optional(&mut *conn)
        .await?;
    row.as_ref().map(listing_from_row).transpose()
}

async fn stored_version(conn: &mut SqliteConnection, listing_id: &str) -> Result<i64, sqlx::Error> {
    let version = sqlx::query_scalar::<_, i64>("SELECT version FROM listings WHERE id = ?")
        .bind(listing_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(version.unwrap_or(0))
}

async fn insert_outbox_event(conn: &mut SqliteConnection, event: &NewOutboxEvent) -> Result<i64, sqlx::Error> {
    let payload = serde_json::to_string(&event.payload).map_err(|err| sqlx::Error::Encode(Box::new(err)))?;
    let result = sqlx::query(
        r#"
        INSERT INTO outbox_events (listing_id, operation, listing_version, payload, origin,
                                   state, attempts, next_attempt_at, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        "#,
    )
    .bind(&event.listing_id)
    .bind(event.operation.as_str())
    .bind(event.listing_version)
    .bind(payload)
    .bind(event.origin.as_str())
    .bind(DeliveryState::Pending.as_str())
    .bind(event.created_at)
    .bind(event.created_at)
    .bind(event.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

fn snapshot(listing: &Listing, origin: EventOrigin, occurred_at: i64) -> Result<NewOutboxEvent, StoreError> {
    NewOutboxEvent::for_listing(listing, origin, occurred_at)
        .map_err(|err| StoreError::Backend(format!("cannot snapshot listing: {err}")))
}

#[async_trait]
impl ListingStore for SqliteListingStore {
    async fn get(&self, listing_id: &str) -> Result<Option<Listing>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Ok(fetch_listing(&mut conn, listing_id).await?)
    }

    async fn write(
        &self,
        listing_id: &str,
        expected_version: i64,
        mutation: ListingMutation,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let occurred_at = now.timestamp_millis();
        let _writer = self.write_gate.lock().await;
        let mut tx = self.begin_immediate().await?;

        let current = fetch_listing(&mut tx, listing_id).await?;
        let listing = decide_write(current.as_ref(), listing_id, expected_version, mutation, occurred_at)?;
        let event = snapshot(&listing, EventOrigin::Mutation, occurred_at)?;

        let result = if current.is_some() {
            sqlx::query(
                r#"
                UPDATE listings
                SET title = ?, price_cents = ?, status = ?, category = ?,
                    version = ?, updated_at = ?, deleted_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(&listing.title)
            .bind(listing.price_cents)
            .bind(listing.status.as_str())
            .bind(&listing.category)
            .bind(listing.version)
            .bind(listing.updated_at)
            .bind(listing.deleted_at)
            .bind(listing_id)
            .bind(expected_version)
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                INSERT INTO listings (id, owner_id, title, price_cents, status, category,
                                      version, created_at, updated_at, deleted_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO NOTHING
                "#,
            )
            .bind(&listing.listing_id)
            .bind(&listing.owner_id)
            .bind(&listing.title)
            .bind(listing.price_cents)
            .bind(listing.status.as_str())
            .bind(&listing.category)
            .bind(listing.version)
            .bind(listing.created_at)
            .bind(listing.updated_at)
            .bind(listing.deleted_at)
            .execute(&mut *tx)
            .await?
        };

        if result.rows_affected() == 0 {
            let actual = stored_version(&mut tx, listing_id).await?;
            return Err(StoreError::VersionConflict {
                expected: expected_version,
                actual,
            });
        }

        insert_outbox_event(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(listing.version)
    }

    async fn listing_versions(
        &self,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ListingVersion>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, version, deleted_at FROM listings
            WHERE (? IS NULL OR id > ?)
            ORDER BY id
            LIMIT ?
            "#,
        )
        .bind(after)
        .bind(after)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let deleted_at: Option<i64> = row.try_get("deleted_at")?;
                Ok(ListingVersion {
                    listing_id: row.try_get("id")?,
                    version: row.try_get("version")?,
                    deleted: deleted_at.is_some(),
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()
            .map_err(StoreError::from)
    }

    async fn enqueue_resync(
        &self,
        listing_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let _writer = self.write_gate.lock().await;
        let mut tx = self.begin_immediate().await?;
        let Some(listing) = fetch_listing(&mut tx, listing_id).await? else {
            return Ok(None);
        };
        let event = snapshot(&listing, EventOrigin::DriftRepair, now.timestamp_millis())?;
        let sequence = insert_outbox_event(&mut tx, &event).await?;
        tx.commit().await?;
        Ok(Some(sequence))
    }
}

#[async_trait]
impl ChangeOutbox for SqliteListingStore {
    async fn fetch_batch(&self, max_count: usize, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, OutboxError> {
        let now = now.timestamp_millis();
        let _writer = self.write_gate.lock().await;
        let mut tx = self.begin_immediate().await?;

        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE state IN (?, ?) ORDER BY sequence"
        ))
        .bind(DeliveryState::Pending.as_str())
        .bind(DeliveryState::InFlight.as_str())
        .fetch_all(&mut *tx)
        .await?;
        let undelivered = rows
            .iter()
            .map(outbox_event_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        let claimable: HashSet<i64> = select_claimable(&undelivered, max_count, now)
            .into_iter()
            .collect();
        let mut claimed = Vec::with_capacity(claimable.len());
        for mut event in undelivered
            .into_iter()
            .filter(|event| claimable.contains(&event.sequence))
        {
            sqlx::query("UPDATE outbox_events SET state = ?, updated_at = ? WHERE sequence = ?")
                .bind(DeliveryState::InFlight.as_str())
                .bind(now)
                .bind(event.sequence)
                .execute(&mut *tx)
                .await?;
            event.state = DeliveryState::InFlight;
            event.updated_at = now;
            claimed.push(event);
        }

        tx.commit().await?;
        Ok(claimed)
    }

    async fn mark_delivered(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET state = ?, updated_at = ? WHERE sequence = ? AND state = ?",
        )
        .bind(DeliveryState::Delivered.as_str())
        .bind(now.timestamp_millis())
        .bind(sequence)
        .bind(DeliveryState::InFlight.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.transition_error(sequence, DeliveryState::InFlight).await);
        }
        Ok(())
    }

    async fn mark_retry(&self, sequence: i64, schedule: RetrySchedule, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET state = ?, attempts = ?, next_attempt_at = ?, first_failed_at = ?,
                last_error = ?, updated_at = ?
            WHERE sequence = ? AND state = ?
            "#,
        )
        .bind(DeliveryState::Pending.as_str())
        .bind(i64::from(schedule.attempts))
        .bind(schedule.next_attempt_at)
        .bind(schedule.first_failed_at)
        .bind(&schedule.last_error)
        .bind(now.timestamp_millis())
        .bind(sequence)
        .bind(DeliveryState::InFlight.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.transition_error(sequence, DeliveryState::InFlight).await);
        }
        Ok(())
    }

    async fn release(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET state = ?, updated_at = ? WHERE sequence = ? AND state = ?",
        )
        .bind(DeliveryState::Pending.as_str())
        .bind(now.timestamp_millis())
        .bind(sequence)
        .bind(DeliveryState::InFlight.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.transition_error(sequence, DeliveryState::InFlight).await);
        }
        Ok(())
    }

    async fn mark_failed(&self, sequence: i64, reason: &str, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events SET state = ?, last_error = ?, updated_at = ?
            WHERE sequence = ? AND state = ?
            "#,
        )
        .bind(DeliveryState::Failed.as_str())
        .bind(reason)
        .bind(now.timestamp_millis())
        .bind(sequence)
        .bind(DeliveryState::InFlight.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(self.transition_error(sequence, DeliveryState::InFlight).await);
        }
        Ok(())
    }

    async fn failed(&self, limit: usize) -> Result<Vec<OutboxEvent>, OutboxError> {
        let rows = sqlx::query(&format!(
            "SELECT {OUTBOX_COLUMNS} FROM outbox_events WHERE state = ? ORDER BY sequence LIMIT ?"
        ))
        .bind(DeliveryState::Failed.as_str())
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .iter()
            .map(outbox_event_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn requeue_failed(&self, sequence: i64, now: DateTime<Utc>) -> Result<(), OutboxError> {
        let now = now.timestamp_millis();
        let _writer = self.write_gate.lock().await;
        let mut tx = self.begin_immediate().await?;

        let row = sqlx::query("SELECT listing_id, listing_version, state FROM outbox_events WHERE sequence = ?")
            .bind(sequence)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(OutboxError::NotFound(sequence))?;
        let listing_id: String = row.try_get("listing_id")?;
        let listing_version: i64 = row.try_get("listing_version")?;
        let state: String = row.try_get("state")?;
        let state = state
            .parse::<DeliveryState>()
            .map_err(|err| OutboxError::Backend(err.to_string()))?;
        if state != DeliveryState::Failed {
            return Err(OutboxError::InvalidState {
                sequence,
                expected: DeliveryState::Failed,
                actual: state,
            });
        }

        // A newer listing version makes the parked snapshot stale: settle it and
        // queue the current state instead.
        match fetch_listing(&mut tx, &listing_id).await? {
            Some(listing) if listing.version > listing_version => {
                sqlx::query("UPDATE outbox_events SET state = ?, updated_at = ? WHERE sequence = ?")
                    .bind(DeliveryState::Delivered.as_str())
                    .bind(now)
                    .bind(sequence)
                    .execute(&mut *tx)
                    .await?;
                let event = NewOutboxEvent::for_listing(&listing, EventOrigin::DriftRepair, now)
                    .map_err(|err| OutboxError::Backend(format!("cannot snapshot listing: {err}")))?;
                insert_outbox_event(&mut tx, &event).await?;
            }
            _ => {
                sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET state = ?, attempts = 0, next_attempt_at = ?, first_failed_at = NULL, updated_at = ?
                    WHERE sequence = ?
                    "#,
                )
                .bind(DeliveryState::Pending.as_str())
                .bind(now)
                .bind(now)
                .bind(sequence)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn requeue_in_flight(&self, now: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query("UPDATE outbox_events SET state = ?, updated_at = ? WHERE state = ?")
            .bind(DeliveryState::Pending.as_str())
            .bind(now.timestamp_millis())
            .bind(DeliveryState::InFlight.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }

    async fn has_undelivered(&self, listing_id: &str) -> Result<bool, OutboxError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM outbox_events WHERE listing_id = ? AND state IN (?, ?)",
        )
        .bind(listing_id)
        .bind(DeliveryState::Pending.as_str())
        .bind(DeliveryState::InFlight.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn prune_delivered(&self, before: DateTime<Utc>) -> Result<usize, OutboxError> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE state = ? AND updated_at < ?")
            .bind(DeliveryState::Delivered.as_str())
            .bind(before.timestamp_millis())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() as usize)
    }
}
