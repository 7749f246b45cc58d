use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::{DispatchError, StoreError};
use crate::retry::RetryPolicy;
use crate::storage::NotificationStore;
use crate::telemetry::metric_add;
use crate::types::Notification;
use crate::worker::{DeliveryContext, JobQueue};

/// Counts produced by one maintenance pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub expired: usize,
    pub dispatched: usize,
    pub rearmed: usize,
    pub purged: u64,
}

/// Periodic maintenance over the store: expire, promote due records,
/// re-arm retries, purge old records.
///
/// Passive: something outside calls these on a timer.
pub(crate) struct ScheduledSweeper {
    store: Arc<dyn NotificationStore>,
    ctx: Arc<DeliveryContext>,
    queue: Arc<JobQueue>,
    retry: RetryPolicy,
    batch_size: usize,
    batching: bool,
    retention: chrono::Duration,
}

impl ScheduledSweeper {
    pub fn new(
        store: Arc<dyn NotificationStore>,
        ctx: Arc<DeliveryContext>,
        queue: Arc<JobQueue>,
        retry: RetryPolicy,
        batch_size: usize,
        batching: bool,
        retention: chrono::Duration,
    ) -> Self {
        Self {
            store,
            ctx,
            queue,
            retry,
            batch_size: batch_size.max(1),
            batching,
            retention,
        }
    }

    /// Expire stale pending records, then hand due ones to delivery.
    ///
    /// Expiry runs first so a record that is both expired and due is never
    /// sent.
    pub async fn process_scheduled(&self) -> Result<SweepReport, DispatchError> {
        let mut report = SweepReport::default();
        let now = self.ctx.clock.now();

        for n in self.store.get_pending(self.batch_size).await? {
            if n.is_expired_at(now) && !self.ctx.is_claimed(&n.id).await && self.ctx.record_expired(n, now).await {
                report.expired += 1;
            }
        }

        let mut due = Vec::new();
        for n in self.store.get_pending(self.batch_size).await? {
            if n.is_due_at(now) && !n.is_expired_at(now) && !self.ctx.is_claimed(&n.id).await {
                due.push(n);
            }
        }
        sort_for_dispatch(&mut due);
        report.dispatched = self.queue.submit(&due, self.batching).await;

        metric_add("notify.sweep.expired", report.expired as u64);
        metric_add("notify.sweep.dispatched", report.dispatched as u64);
        if report.expired > 0 || report.dispatched > 0 {
            info!(expired = report.expired, dispatched = report.dispatched, "scheduled sweep finished");
        } else {
            debug!("scheduled sweep found nothing to do");
        }
        Ok(report)
    }

    /// Re-arm failed records whose backoff has elapsed and re-dispatch them.
    ///
    /// Admission checks are not repeated; they only gate first acceptance.
    pub async fn process_retries(&self) -> Result<SweepReport, DispatchError> {
        let mut report = SweepReport::default();
        let now = self.ctx.clock.now();
        let mut rearmed = Vec::new();

        for mut n in self.store.get_failed(self.retry.max_retries, self.batch_size).await? {
            if !self.retry.is_eligible(&n, now) || self.ctx.is_claimed(&n.id).await {
                continue;
            }
            n.rearm(now)?;
            match self.store.update(&n).await {
                Ok(stored) => {
                    debug!(notification_id = %stored.id, retry_count = stored.retry_count, "re-armed for retry");
                    rearmed.push(stored);
                }
                Err(StoreError::Conflict { .. }) => {
                    debug!(notification_id = %n.id, "record changed before re-arm; skipping");
                }
                Err(err) => return Err(err.into()),
            }
        }

        report.rearmed = rearmed.len();
        sort_for_dispatch(&mut rearmed);
        report.dispatched = self.queue.submit(&rearmed, self.batching).await;

        metric_add("notify.sweep.rearmed", report.rearmed as u64);
        if report.rearmed > 0 {
            info!(rearmed = report.rearmed, dispatched = report.dispatched, "retry sweep finished");
        }
        Ok(report)
    }

    /// Delete records older than the retention period, whatever their status.
    pub async fn cleanup(&self) -> Result<SweepReport, DispatchError> {
        let cutoff = self.ctx.clock.now() - self.retention;
        let purged = self.store.cleanup_older_than(cutoff).await?;
        metric_add("notify.sweep.purged", purged);
        if purged > 0 {
            info!(purged, %cutoff, "retention sweep finished");
        }
        Ok(SweepReport {
            purged,
            ..Default::default()
        })
    }
}

/// Most urgent first, then oldest.
fn sort_for_dispatch(notifications: &mut [Notification]) {
    notifications.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.created_at.cmp(&b.created_at))
    });
}

/// Intervals for [`spawn_maintenance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceSchedule {
    pub sweep_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for MaintenanceSchedule {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 30,
            cleanup_interval_secs: 3_600,
        }
    }
}

pub struct MaintenanceHandle {
    stop: Arc<Notify>,
    handle: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Stop the loop after the pass in progress, if any, completes.
    pub async fn stop(self) {
        self.stop.notify_one();
        let _ = self.handle.await;
    }
}

/// Drive the maintenance entry points on fixed intervals.
///
/// Hosts with their own scheduler can call `process_scheduled`,
/// `process_retries` and `cleanup` directly instead.
pub fn spawn_maintenance(dispatcher: Arc<Dispatcher>, schedule: MaintenanceSchedule) -> MaintenanceHandle {
    let stop = Arc::new(Notify::new());
    let loop_stop = stop.clone();

    let handle = tokio::spawn(async move {
        let mut sweep = tokio::time::interval(Duration::from_secs(schedule.sweep_interval_secs.max(1)));
        let mut cleanup = tokio::time::interval(Duration::from_secs(schedule.cleanup_interval_secs.max(1)));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = loop_stop.notified() => break,
                _ = sweep.tick() => {
                    if let Err(err) = dispatcher.process_scheduled().await {
                        warn!(error = %err, "scheduled sweep failed");
                    }
                    if let Err(err) = dispatcher.process_retries().await {
                        warn!(error = %err, "retry sweep failed");
                    }
                }
                _ = cleanup.tick() => {
                    if let Err(err) = dispatcher.cleanup().await {
                        warn!(error = %err, "retention sweep failed");
                    }
                }
            }
        }
        debug!("maintenance loop stopped");
    });

    MaintenanceHandle { stop, handle }
}
