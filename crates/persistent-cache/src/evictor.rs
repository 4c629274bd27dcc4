//! Eviction of expired records
//!
//! A sweep lists the keys in scope and evicts each expired one under that
//! key's own lock. No lock is held across the pass, so readers and loaders
//! are never stalled by a long sweep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::error::{CacheError, Result, StorageError};
use crate::store::{EntryStore, Eviction};
use crate::types::Counters;

/// Result of one sweep pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: u64,
    pub evicted: u64,
    /// Records left in place because they could not be read or decoded
    pub skipped: u64,
}

pub struct Evictor {
    store: Arc<EntryStore>,
    counters: Arc<Counters>,
    trigger: Notify,
}

impl Evictor {
    pub fn new(store: Arc<EntryStore>, counters: Arc<Counters>) -> Self {
        Self {
            store,
            counters,
            trigger: Notify::new(),
        }
    }

    /// Delete every record in `group` (all groups when `None`) that is
    /// expired at `now`. Records without a TTL are never touched.
    pub async fn sweep(
        &self,
        group: Option<&str>,
        now: DateTime<Utc>,
    ) -> std::result::Result<SweepReport, StorageError> {
        let keys = self.store.list_keys(group).await?;
        let mut report = SweepReport::default();

        for key in keys {
            report.scanned += 1;
            match self.store.evict_if_expired(&key, now).await {
                Ok(Eviction::Evicted) => report.evicted += 1,
                Ok(Eviction::Live) | Ok(Eviction::Gone) => {}
                Ok(Eviction::Undecodable) => report.skipped += 1,
                Err(e) => {
                    warn!(key = %key, error = %e, "Sweep could not evict record");
                    report.skipped += 1;
                }
            }
        }

        Counters::add(&self.counters.evicted, report.evicted);
        debug!(
            group = group.unwrap_or("*"),
            scanned = report.scanned,
            evicted = report.evicted,
            skipped = report.skipped,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Wake the background task for an early sweep
    pub fn request_sweep(&self) {
        self.trigger.notify_one();
    }

    /// Sweep all groups every `interval`, starting immediately, until the
    /// handle is shut down or dropped. A zero `interval` is rejected.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> Result<EvictorHandle> {
        if interval.is_zero() {
            return Err(CacheError::Config("sweep interval must be positive".to_string()));
        }
        let me = Arc::clone(self);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(?interval, "Evictor started");

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = ticker.tick() => {}
                    _ = me.trigger.notified() => debug!("Early sweep requested"),
                }

                match me.sweep(None, Utc::now()).await {
                    Ok(report) if report.evicted > 0 || report.skipped > 0 => info!(
                        evicted = report.evicted,
                        skipped = report.skipped,
                        scanned = report.scanned,
                        "Evicted expired records"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(error = %e, "Sweep failed"),
                }
            }

            info!("Evictor stopped");
        });

        Ok(EvictorHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        })
    }
}

/// Owns the background sweep task; dropping it aborts the task.
pub struct EvictorHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl EvictorHandle {
    /// Stop after the sweep in progress, if any, completes.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "Evictor task ended abnormally");
            }
        }
    }
}

impl Drop for EvictorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
