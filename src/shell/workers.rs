// Background workers: the outbox drain loop and the drift sweep loop.
//
// Responsibilities
// - Recover in-flight events once at startup, then drain the outbox on a poll interval.
// - Drain back-to-back while batches come back full and fully settled.
// - Sweep for drift and prune old delivered events on the sweep interval.
// - Stop both loops when the shutdown signal flips.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::modules::sync::drift_sweep::DriftSweeper;
use crate::modules::sync::reconciler::Reconciler;
use crate::shared::infrastructure::change_outbox::ChangeOutbox;
use crate::shared::infrastructure::listing_store::ListingStore;
use crate::shared::infrastructure::search_index::SearchIndex;

pub async fn run_drain_loop<TOutbox, TIndex>(
    reconciler: Arc<Reconciler<TOutbox, TIndex>>,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    TOutbox: ChangeOutbox + ?Sized,
    TIndex: SearchIndex + ?Sized,
{
    if let Err(err) = reconciler.recover(Utc::now()).await {
        tracing::error!(error = %err, "outbox recovery failed");
    }
    tracing::info!(poll_interval_ms = poll_interval.as_millis() as u64, "outbox drain loop started");

    let batch_size = reconciler.settings().batch_size;
    loop {
        if *shutdown.borrow() {
            break;
        }
        let full_batch = match reconciler.drain_once(Utc::now()).await {
            Ok(report) => report.claimed >= batch_size && report.unsettled == 0,
            Err(err) => {
                tracing::warn!(error = %err, "outbox drain failed");
                false
            }
        };
        if full_batch {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(poll_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }
    tracing::info!("outbox drain loop stopped");
}

pub async fn run_sweep_loop<TStore, TOutbox, TIndex>(
    sweeper: Arc<DriftSweeper<TStore, TOutbox, TIndex>>,
    outbox: Arc<TOutbox>,
    sweep_interval: Duration,
    delivered_retention: Duration,
    mut shutdown: watch::Receiver<bool>,
) where
    TStore: ListingStore + ?Sized,
    TOutbox: ChangeOutbox + ?Sized,
    TIndex: SearchIndex + ?Sized,
{
    let retention = ChronoDuration::from_std(delivered_retention).unwrap_or(ChronoDuration::MAX);
    tracing::info!(sweep_interval_ms = sweep_interval.as_millis() as u64, "drift sweep loop started");

    loop {
        tokio::select! {
            _ = tokio::time::sleep(sweep_interval) => {}
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
        if *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        match sweeper.sweep_once(now).await {
            Ok(report) if !report.drift.is_empty() => tracing::info!(
                scanned = report.scanned,
                drifted = report.drift.len(),
                enqueued = report.enqueued,
                skipped = report.skipped_undelivered,
                "drift sweep finished"
            ),
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "drift sweep failed"),
        }

        let cutoff = now.checked_sub_signed(retention).unwrap_or(now);
        match outbox.prune_delivered(cutoff).await {
            Ok(0) => {}
            Ok(pruned) => tracing::debug!(pruned, "pruned delivered outbox events"),
            Err(err) => tracing::warn!(error = %err, "pruning delivered outbox events failed"),
        }
    }
    tracing::info!("drift sweep loop stopped");
}

/// Handles of the spawned loops plus the sender that stops them.
pub struct SyncWorkers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct WorkerIntervals {
    pub poll_interval: Duration,
    pub sweep_interval: Duration,
    pub delivered_retention: Duration,
}

impl SyncWorkers {
    pub fn spawn<TStore, TOutbox, TIndex>(
        reconciler: Arc<Reconciler<TOutbox, TIndex>>,
        sweeper: Arc<DriftSweeper<TStore, TOutbox, TIndex>>,
        outbox: Arc<TOutbox>,
        intervals: WorkerIntervals,
    ) -> Self
    where
        TStore: ListingStore + ?Sized + 'static,
        TOutbox: ChangeOutbox + ?Sized + 'static,
        TIndex: SearchIndex + ?Sized + 'static,
    {
        let (shutdown, receiver) = watch::channel(false);
        let drain = tokio::spawn(run_drain_loop(reconciler, intervals.poll_interval, receiver.clone()));
        let sweep = tokio::spawn(run_sweep_loop(
            sweeper,
            outbox,
            intervals.sweep_interval,
            intervals.delivered_retention,
            receiver,
        ));
        Self {
            shutdown,
            handles: vec![drain, sweep],
        }
    }

    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "sync worker panicked");
            }
        }
    }
}
