//! Periodic escalation sweep.
//!
//! The reconciler finds open check-ins whose response deadline has passed and
//! escalates them with [`EscalationReason::DeadlinePassed`]. It is the
//! authoritative path for escalation: a device that never fires its local
//! trigger, or loses power mid-session, is still covered here. Every delivery
//! attempt is written to the delivery ledger, and failed channels are retried
//! on later sweeps until their attempt budget runs out. Rejected channels are
//! final.

use std::sync::Arc;
use std::time::Duration;

use lifeline_core::checkin::EscalationReason;
use lifeline_core::db::unix_timestamp;
use lifeline_core::escalation::{DeliveryOutcome, EscalationResult, Escalator};
use lifeline_core::store::{Stored, StoreError};
use lifeline_core::CheckIn;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::storage::{DatabaseError, DeliveryAttemptRow, ServerDatabase};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("record store error: {0}")]
    Store(#[from] StoreError),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Overdue check-ins found on the index.
    pub overdue: usize,
    pub escalated: usize,
    /// Ended as `missed` because nobody could be notified.
    pub missed: usize,
    /// Resolved by another writer between the query and the write.
    pub already_resolved: usize,
    /// Escalations that errored and will be picked up again next sweep.
    pub failed: usize,
    /// Channels that failed during this sweep's first dispatch.
    pub deliveries_failed: usize,
    /// Earlier failed channels that went through on retry.
    pub redelivered: usize,
}

#[derive(Clone)]
pub struct Reconciler {
    escalator: Escalator,
    db: ServerDatabase,
    max_delivery_attempts: u32,
}

impl Reconciler {
    /// The escalator's dispatch rounds are recorded in `db`'s delivery
    /// ledger from here on.
    pub fn new(escalator: Escalator, db: ServerDatabase, max_delivery_attempts: u32) -> Self {
        Self {
            escalator: escalator.with_ledger(Arc::new(db.clone())),
            db,
            max_delivery_attempts,
        }
    }

    /// Open check-ins whose deadline is strictly before `now`.
    pub async fn find_overdue(&self, now: i64) -> Result<Vec<Stored<CheckIn>>, StoreError> {
        self.escalator.repository().find_overdue(now).await
    }

    /// Escalate everything overdue, then retry failed deliveries.
    ///
    /// One failing check-in never aborts the sweep. Only a failed index or
    /// ledger query does.
    #[instrument(skip(self))]
    pub async fn sweep(&self, now: i64) -> Result<SweepReport, ReconcileError> {
        let overdue = self.find_overdue(now).await?;
        let mut report = SweepReport {
            overdue: overdue.len(),
            ..SweepReport::default()
        };

        for stored in overdue {
            let check_in = stored.value;
            let result = self
                .escalator
                .escalate(
                    &check_in.user_id,
                    &check_in.id,
                    EscalationReason::DeadlinePassed,
                    now,
                )
                .await;

            match result {
                Ok(EscalationResult::Escalated {
                    report: delivery, ..
                }) => {
                    report.escalated += 1;
                    report.deliveries_failed += delivery.failed_count();
                }
                Ok(EscalationResult::Missed { .. }) => report.missed += 1,
                Ok(EscalationResult::AlreadyEscalated | EscalationResult::AlreadyResolved { .. }) => {
                    report.already_resolved += 1;
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(check_in_id = %check_in.id, error = %e, "Escalation failed, will retry");
                }
            }
        }

        report.redelivered = self.retry_failed_deliveries(now).await?;

        if report.overdue > 0 || report.redelivered > 0 {
            info!(
                overdue = report.overdue,
                escalated = report.escalated,
                missed = report.missed,
                failed = report.failed,
                redelivered = report.redelivered,
                "Sweep completed"
            );
        } else {
            debug!("Sweep found nothing to do");
        }

        Ok(report)
    }

    /// Re-send channels whose last attempt failed and that still have budget.
    /// Returns how many went through. A row that cannot be retried is logged
    /// and left for the next sweep.
    pub async fn retry_failed_deliveries(&self, now: i64) -> Result<usize, ReconcileError> {
        let rows = self
            .db
            .retryable_deliveries(self.max_delivery_attempts)
            .await?;
        let mut delivered = 0;

        for row in rows {
            match self.retry_delivery(&row, now).await {
                Ok(true) => delivered += 1,
                Ok(false) => {}
                Err(e) => warn!(
                    user_id = %row.user_id,
                    check_in_id = %row.check_in_id,
                    channel = %row.channel,
                    error = %e,
                    "Delivery retry skipped"
                ),
            }
        }

        Ok(delivered)
    }

    async fn retry_delivery(&self, row: &DeliveryAttemptRow, now: i64) -> Result<bool, ReconcileError> {
        let Some(target) = row.target() else {
            warn!(check_in_id = %row.check_in_id, channel = %row.channel, "Unknown channel in delivery ledger");
            return Ok(false);
        };

        let event = match self
            .escalator
            .repository()
            .get(&row.user_id, &row.check_in_id)
            .await
        {
            Ok(stored) => stored.and_then(|s| s.value.escalation_event()),
            Err(e @ StoreError::Corrupt { .. }) => {
                warn!(check_in_id = %row.check_in_id, error = %e, "Check-in unreadable, not retrying");
                None
            }
            Err(e) => return Err(e.into()),
        };

        let outcome = match event {
            // Burn an attempt so the row ages out of the retry set.
            None => DeliveryOutcome::Failed("check-in is no longer escalated".into()),
            Some(event) => match self.escalator.notifier().deliver(&event, &target).await {
                Ok(()) => DeliveryOutcome::Delivered,
                Err(e) => {
                    warn!(
                        check_in_id = %row.check_in_id,
                        target_id = %target.target_id,
                        channel = %target.channel,
                        attempts = row.attempts + 1,
                        error = %e,
                        "Delivery retry failed"
                    );
                    DeliveryOutcome::from_error(&e)
                }
            },
        };

        self.db
            .record_delivery(&row.user_id, &row.check_in_id, &target, &outcome, now)
            .await?;
        Ok(outcome.is_delivered())
    }

    /// Run [`Self::sweep`] every `interval` until `shutdown` flips.
    ///
    /// The first tick fires immediately so check-ins that went overdue while
    /// the server was down are handled at startup.
    pub fn spawn(self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        if let Err(e) = self.sweep(unix_timestamp()).await {
                            warn!(error = %e, "Escalation sweep failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("Reconciler shutting down");
                        return;
                    }
                }
            }
        })
    }
}
