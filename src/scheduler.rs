//! Periodic batch sweeps over the active roster.
//!
//! - The daily sweep recalculates every active student and dispatches
//!   escalations. A failing student is counted and logged; the sweep goes on.
//! - The rapid-increase sweep flags sharp score jumps in recent history on
//!   its own, shorter interval.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::Result;
use crate::escalation;
use crate::pipeline::Pipeline;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub successful: usize,
    pub failed: usize,
    pub escalated: usize,
    /// Notifications created for escalations.
    pub notified: usize,
    /// Recipients whose escalation notification could not be created.
    pub notify_failures: usize,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RapidScanReport {
    pub scanned: usize,
    pub flagged: usize,
    pub failed: usize,
}

pub struct Scheduler {
    pipeline: Arc<Pipeline>,
    concurrency: usize,
    daily_interval: Duration,
    rapid_interval: Duration,
}

impl Scheduler {
    pub fn new(
        pipeline: Arc<Pipeline>,
        concurrency: usize,
        daily_interval: Duration,
        rapid_interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            concurrency: concurrency.max(1),
            daily_interval,
            rapid_interval,
        }
    }

    pub async fn daily_sweep(&self) -> Result<SweepReport> {
        let students = self.pipeline.store().active_student_ids().await?;
        tracing::info!(students = students.len(), "starting daily risk sweep");

        let results: Vec<_> = stream::iter(students)
            .map(|student_id| async move {
                (student_id, self.pipeline.recalculate(student_id).await)
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = SweepReport::default();
        for (student_id, result) in results {
            match result {
                Ok(recalculation) => {
                    report.successful += 1;
                    if recalculation.escalated {
                        report.escalated += 1;
                        report.notified += recalculation.notifications.len();
                        report.notify_failures += recalculation.failed_recipients;
                        tracing::debug!(
                            %student_id,
                            from = ?recalculation.previous_level,
                            to = %recalculation.snapshot.level,
                            score = recalculation.snapshot.total_score,
                            "escalation dispatched"
                        );
                    }
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(%student_id, %err, "risk recalculation failed");
                }
            }
        }

        tracing::info!(?report, "daily risk sweep complete");
        Ok(report)
    }

    pub async fn rapid_increase_sweep(&self) -> Result<RapidScanReport> {
        let store = self.pipeline.store();
        let students = store.active_student_ids().await?;
        let now = self.pipeline.clock().now();
        let since = escalation::lookback_start(now);

        let mut report = RapidScanReport::default();
        for student_id in students {
            match self.scan_student(student_id, since, now).await {
                Ok(flagged) => {
                    report.scanned += 1;
                    report.flagged += flagged;
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::error!(%student_id, %err, "rapid increase scan failed");
                }
            }
        }

        tracing::info!(?report, "rapid increase sweep complete");
        Ok(report)
    }

    async fn scan_student(
        &self,
        student_id: Uuid,
        since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize> {
        let store = self.pipeline.store();
        let history = store.snapshots_since(student_id, since).await?;

        let mut flagged = 0;
        for flag in escalation::detect_rapid_increases(&history, now) {
            if store.record_rapid_increase(&flag).await? {
                flagged += 1;
                tracing::warn!(
                    %student_id,
                    from = flag.from_score,
                    to = flag.to_score,
                    delta = flag.delta(),
                    days = flag.days_between,
                    "rapid risk increase detected"
                );
            }
        }
        Ok(flagged)
    }

    /// Runs both sweeps immediately, then on their intervals, until
    /// `shutdown` resolves.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) {
        let mut daily = tokio::time::interval(self.daily_interval);
        daily.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut rapid = tokio::time::interval(self.rapid_interval);
        rapid.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = daily.tick() => {
                    if let Err(err) = self.daily_sweep().await {
                        tracing::error!(%err, "daily risk sweep aborted");
                    }
                }
                _ = rapid.tick() => {
                    if let Err(err) = self.rapid_increase_sweep().await {
                        tracing::error!(%err, "rapid increase sweep aborted");
                    }
                }
                () = &mut shutdown => {
                    tracing::info!("scheduler shutting down");
                    return;
                }
            }
        }
    }
}
