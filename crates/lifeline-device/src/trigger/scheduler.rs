//! Trigger scheduler: keeps exactly one pending platform trigger per
//! scheduled check-in.

use std::path::Path;
use std::sync::Arc;

use lifeline_core::CheckIn;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::index::{IndexEntry, TriggerIndex};
use super::platform::NotificationPlatform;
use super::{PermissionStatus, TriggerContent, TriggerError, TriggerId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArmOutcome {
    Armed { trigger_id: TriggerId, at: i64 },
    /// The scheduled time is not in the future; nothing is pending.
    Skipped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub cancelled: usize,
    pub armed: usize,
    pub skipped: usize,
}

/// Every operation serialises on one lock, so a `reconcile_all` finishes
/// before any later `arm` starts.
pub struct TriggerScheduler {
    platform: Arc<dyn NotificationPlatform>,
    index: Mutex<TriggerIndex>,
}

impl TriggerScheduler {
    /// Scheduler with an index that lives only in memory.
    pub fn new(platform: Arc<dyn NotificationPlatform>) -> Self {
        Self {
            platform,
            index: Mutex::new(TriggerIndex::in_memory()),
        }
    }

    /// Scheduler whose index is persisted at `path`.
    pub async fn with_index_file(
        platform: Arc<dyn NotificationPlatform>,
        path: &Path,
    ) -> Result<Self, TriggerError> {
        Ok(Self {
            platform,
            index: Mutex::new(TriggerIndex::load(path).await?),
        })
    }

    pub fn platform(&self) -> &Arc<dyn NotificationPlatform> {
        &self.platform
    }

    /// Install the trigger for a check-in, replacing any earlier one.
    #[instrument(skip(self, title))]
    pub async fn arm(
        &self,
        check_in_id: &str,
        scheduled_time: i64,
        title: &str,
        now: i64,
    ) -> Result<ArmOutcome, TriggerError> {
        let mut index = self.index.lock().await;

        if scheduled_time <= now {
            if let Some(prev) = index.get(check_in_id).map(|e| e.trigger_id.clone()) {
                self.platform.cancel(&prev).await?;
                index.remove(check_in_id);
                index.save().await?;
            }
            debug!("Scheduled time already passed, not arming");
            return Ok(ArmOutcome::Skipped);
        }

        self.ensure_permission().await?;
        if let Some(prev) = index.get(check_in_id).map(|e| e.trigger_id.clone()) {
            self.platform.cancel(&prev).await?;
            index.remove(check_in_id);
        }
        let trigger_id = self
            .platform
            .schedule_at(scheduled_time, TriggerContent::for_check_in(check_in_id, title))
            .await?;
        index.insert(
            check_in_id,
            IndexEntry {
                trigger_id: trigger_id.clone(),
                at: scheduled_time,
            },
        );
        index.save().await?;
        debug!(trigger_id = %trigger_id, "Trigger armed");
        Ok(ArmOutcome::Armed {
            trigger_id,
            at: scheduled_time,
        })
    }

    /// Remove the trigger for a check-in. Returns `false` if none was pending.
    ///
    /// The index entry is dropped only once the platform has cancelled the
    /// trigger.
    pub async fn disarm(&self, check_in_id: &str) -> Result<bool, TriggerError> {
        let mut index = self.index.lock().await;
        let Some(prev) = index.get(check_in_id).map(|e| e.trigger_id.clone()) else {
            return Ok(false);
        };
        self.platform.cancel(&prev).await?;
        index.remove(check_in_id);
        index.save().await?;
        debug!(check_in_id, trigger_id = %prev, "Trigger disarmed");
        Ok(true)
    }

    /// Clear every platform trigger and re-arm one per scheduled check-in
    /// with a future time. Used on start-up and after a restore.
    #[instrument(skip_all, fields(check_ins = check_ins.len()))]
    pub async fn reconcile_all(
        &self,
        check_ins: &[CheckIn],
        now: i64,
    ) -> Result<ReconcileReport, TriggerError> {
        let mut index = self.index.lock().await;
        let mut report = ReconcileReport {
            cancelled: self.platform.list_pending().await?.len(),
            ..ReconcileReport::default()
        };
        self.platform.cancel_all().await?;
        index.clear();

        let due: Vec<&CheckIn> = check_ins.iter().filter(|c| c.needs_trigger(now)).collect();
        report.skipped = check_ins.len() - due.len();
        if !due.is_empty() {
            if let Err(e) = self.ensure_permission().await {
                index.save().await?;
                return Err(e);
            }
        }

        for check_in in due {
            let trigger_id = self
                .platform
                .schedule_at(
                    check_in.scheduled_time,
                    TriggerContent::for_check_in(&check_in.id, &check_in.title),
                )
                .await?;
            index.insert(
                &check_in.id,
                IndexEntry {
                    trigger_id,
                    at: check_in.scheduled_time,
                },
            );
            report.armed += 1;
        }
        index.save().await?;

        info!(
            cancelled = report.cancelled,
            armed = report.armed,
            skipped = report.skipped,
            "Triggers reconciled"
        );
        Ok(report)
    }

    /// Forget a trigger the platform has delivered. Returns the check-in it
    /// belonged to.
    pub async fn take_fired(&self, trigger_id: &TriggerId) -> Result<Option<String>, TriggerError> {
        let mut index = self.index.lock().await;
        let check_in_id = index.take_by_trigger(trigger_id);
        if check_in_id.is_some() {
            index.save().await?;
        } else {
            warn!(trigger_id = %trigger_id, "Fired trigger not in index");
        }
        Ok(check_in_id)
    }

    pub async fn pending_for(&self, check_in_id: &str) -> Option<TriggerId> {
        self.index
            .lock()
            .await
            .get(check_in_id)
            .map(|e| e.trigger_id.clone())
    }

    pub async fn pending_count(&self) -> usize {
        self.index.lock().await.len()
    }

    async fn ensure_permission(&self) -> Result<(), TriggerError> {
        let status = match self.platform.permission().await {
            PermissionStatus::Granted => return Ok(()),
            PermissionStatus::Denied => PermissionStatus::Denied,
            PermissionStatus::NotDetermined => self.platform.request_permission().await,
        };
        if status == PermissionStatus::Granted {
            Ok(())
        } else {
            warn!("Notification permission refused");
            Err(TriggerError::PermissionDenied)
        }
    }
}
