//! Device-side check-in client.
//!
//! Ties the lifecycle engine, the record store, the challenge protocol and
//! the local trigger scheduler together for one signed-in user.

use std::sync::Arc;
use std::time::Duration;

use lifeline_core::checkin::{CheckInEdit, Contact, NewCheckIn};
use lifeline_core::confirmation::{ChallengeRegistry, ChallengeSession};
use lifeline_core::store::{CheckInRepository, Stored};
use lifeline_core::{CheckIn, Config, Error, Result, SubmitOutcome};
use tracing::{debug, info, instrument, warn};

use crate::trigger::{ArmOutcome, FiredTrigger, ReconcileReport, TriggerError, TriggerId, TriggerScheduler};

/// Upper bound on re-reads after a version conflict.
const MAX_CAS_RETRIES: usize = 3;

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Bound on a single code submission before the caller gets `Timeout`.
    pub submit_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            submit_timeout: Duration::from_secs(12),
        }
    }
}

impl From<&Config> for ClientConfig {
    fn from(config: &Config) -> Self {
        Self {
            submit_timeout: Duration::from_secs(config.checkins.confirmation_timeout_secs),
        }
    }
}

/// Whether a local trigger backs a saved check-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerStatus {
    Armed { trigger_id: TriggerId, at: i64 },
    /// The scheduled time was not in the future.
    Skipped,
    /// The record was saved but the device may not notify; the server
    /// sweep still escalates it.
    PermissionDenied,
    /// The record was saved but the trigger could not be installed. Fixed
    /// by the next [`CheckInClient::resume`].
    Unarmed { reason: String },
}

impl From<ArmOutcome> for TriggerStatus {
    fn from(outcome: ArmOutcome) -> Self {
        match outcome {
            ArmOutcome::Armed { trigger_id, at } => Self::Armed { trigger_id, at },
            ArmOutcome::Skipped => Self::Skipped,
        }
    }
}

/// A persisted check-in and its local trigger.
#[derive(Debug, Clone)]
pub struct Scheduled {
    pub check_in: CheckIn,
    pub trigger: TriggerStatus,
}

pub struct CheckInClient {
    user_id: String,
    repo: CheckInRepository,
    registry: ChallengeRegistry,
    scheduler: Arc<TriggerScheduler>,
    config: ClientConfig,
}

impl CheckInClient {
    pub fn new(
        user_id: impl Into<String>,
        registry: ChallengeRegistry,
        repo: CheckInRepository,
        scheduler: Arc<TriggerScheduler>,
        config: ClientConfig,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            repo,
            registry,
            scheduler,
            config,
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn scheduler(&self) -> &Arc<TriggerScheduler> {
        &self.scheduler
    }

    /// Validate, persist and arm a new check-in.
    #[instrument(skip(self, input), fields(user_id = %self.user_id))]
    pub async fn create(&self, input: NewCheckIn, now: i64) -> Result<Scheduled> {
        let id = uuid::Uuid::new_v4().to_string();
        let check_in = CheckIn::create(id, self.user_id.clone(), input, now)?;
        self.repo.insert(&check_in).await?;
        info!(check_in_id = %check_in.id, scheduled_time = check_in.scheduled_time, "Check-in created");
        let trigger = self.arm(&check_in, now).await;
        Ok(Scheduled { check_in, trigger })
    }

    /// Apply an edit and move the local trigger along with it.
    #[instrument(skip(self, edit), fields(user_id = %self.user_id))]
    pub async fn edit(&self, check_in_id: &str, edit: CheckInEdit, now: i64) -> Result<Scheduled> {
        let caller = self.user_id.clone();
        let check_in = self
            .update(check_in_id, move |c| c.edit(&caller, edit.clone(), now))
            .await?;
        let trigger = self.arm(&check_in, now).await;
        Ok(Scheduled { check_in, trigger })
    }

    /// Cancel a check-in and drop its trigger and any open session.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn cancel(&self, check_in_id: &str, now: i64) -> Result<CheckIn> {
        let caller = self.user_id.clone();
        let check_in = self
            .update(check_in_id, move |c| c.cancel(&caller, now).map(|_| ()))
            .await?;
        self.scheduler.disarm(check_in_id).await?;
        self.registry.close(&self.user_id, check_in_id).await;
        Ok(check_in)
    }

    /// Remove a scheduled or active check-in. Returns `false` if it did not
    /// exist. Resolved check-ins keep their history and are refused with
    /// [`Error::InvalidTransition`].
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn delete(&self, check_in_id: &str) -> Result<bool> {
        for _ in 0..MAX_CAS_RETRIES {
            let stored = match self.load(check_in_id).await {
                Ok(stored) => stored,
                Err(Error::NotFound(_)) => return Ok(false),
                Err(e) => return Err(e),
            };
            stored.value.ensure_deletable(&self.user_id)?;

            match self
                .repo
                .delete(&self.user_id, check_in_id, stored.version)
                .await
            {
                Ok(deleted) => {
                    if let Err(e) = self.scheduler.disarm(check_in_id).await {
                        warn!(check_in_id, error = %e, "Deleted check-in left a local trigger");
                    }
                    self.registry.close(&self.user_id, check_in_id).await;
                    debug!(check_in_id, deleted, "Check-in deleted");
                    return Ok(deleted);
                }
                Err(e) if e.is_conflict() => debug!(check_in_id, "Version conflict, retrying"),
                Err(e) => return Err(e.into()),
            }
        }
        Err(conflicts_exhausted(check_in_id))
    }

    pub async fn list(&self) -> Result<Vec<CheckIn>> {
        Ok(self
            .repo
            .list_for_user(&self.user_id)
            .await?
            .into_iter()
            .map(|s| s.value)
            .collect())
    }

    /// Authoritative state of one check-in, e.g. after a `Timeout`.
    pub async fn refresh(&self, check_in_id: &str) -> Result<CheckIn> {
        Ok(self.load(check_in_id).await?.value)
    }

    pub async fn save_contact(&self, contact: Contact) -> Result<Contact> {
        if contact.user_id != self.user_id {
            return Err(Error::NotOwner {
                caller: self.user_id.clone(),
                check_in_id: contact.id,
            });
        }
        self.repo.put_contact(&contact).await?;
        Ok(contact)
    }

    /// Rebuild local triggers from stored records, e.g. at app start.
    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn resume(&self, now: i64) -> Result<ReconcileReport> {
        let check_ins = self.list().await?;
        Ok(self.scheduler.reconcile_all(&check_ins, now).await?)
    }

    /// A local trigger went off: open the challenge prompt.
    #[instrument(skip(self, fired), fields(user_id = %self.user_id, trigger_id = %fired.id))]
    pub async fn on_trigger_fired(&self, fired: &FiredTrigger, now: i64) -> Result<ChallengeSession> {
        let check_in_id = self
            .scheduler
            .take_fired(&fired.id)
            .await?
            .unwrap_or_else(|| fired.content.check_in_id.clone());
        Ok(self.registry.open(&self.user_id, &check_in_id, now).await?)
    }

    /// Submit a code, bounded by the configured timeout.
    ///
    /// The submission runs on its own task and is not cancelled by the
    /// timeout: an escalation that has been written still finishes
    /// notifying contacts. On `Timeout` the outcome is unknown; call
    /// [`Self::refresh`].
    #[instrument(skip(self, code), fields(user_id = %self.user_id))]
    pub async fn submit_code(&self, check_in_id: &str, code: &str, now: i64) -> Result<SubmitOutcome> {
        let registry = self.registry.clone();
        let user_id = self.user_id.clone();
        let id = check_in_id.to_string();
        let code = code.to_string();
        let mut submission =
            tokio::spawn(async move { registry.submit(&user_id, &id, &code, now).await });

        match tokio::time::timeout(self.config.submit_timeout, &mut submission).await {
            Ok(Ok(result)) => Ok(result?),
            Ok(Err(e)) => Err(Error::Io(std::io::Error::other(e.to_string()))),
            Err(_) => {
                warn!(check_in_id, "Code submission timed out, still running");
                Err(Error::Timeout)
            }
        }
    }

    /// The record is already saved, so a trigger failure only degrades the
    /// returned status.
    async fn arm(&self, check_in: &CheckIn, now: i64) -> TriggerStatus {
        match self
            .scheduler
            .arm(&check_in.id, check_in.scheduled_time, &check_in.title, now)
            .await
        {
            Ok(outcome) => outcome.into(),
            Err(TriggerError::PermissionDenied) => {
                warn!(check_in_id = %check_in.id, "No local trigger, notification permission denied");
                TriggerStatus::PermissionDenied
            }
            Err(e) => {
                warn!(check_in_id = %check_in.id, error = %e, "No local trigger, arming failed");
                TriggerStatus::Unarmed {
                    reason: e.to_string(),
                }
            }
        }
    }

    async fn load(&self, check_in_id: &str) -> Result<Stored<CheckIn>> {
        self.repo
            .get(&self.user_id, check_in_id)
            .await?
            .ok_or_else(|| Error::NotFound(check_in_id.to_string()))
    }

    /// Read-modify-write with compare-and-swap on the record version.
    async fn update<F>(&self, check_in_id: &str, mut apply: F) -> Result<CheckIn>
    where
        F: FnMut(&mut CheckIn) -> std::result::Result<(), lifeline_core::checkin::TransitionError>,
    {
        for _ in 0..MAX_CAS_RETRIES {
            let stored = self.load(check_in_id).await?;
            let mut check_in = stored.value;
            apply(&mut check_in)?;
            match self.repo.replace(&check_in, stored.version).await {
                Ok(_) => return Ok(check_in),
                Err(e) if e.is_conflict() => debug!(check_in_id, "Version conflict, retrying"),
                Err(e) => return Err(e.into()),
            }
        }
        Err(conflicts_exhausted(check_in_id))
    }
}

fn conflicts_exhausted(check_in_id: &str) -> Error {
    Error::StoreUnavailable(format!(
        "gave up on {check_in_id} after {MAX_CAS_RETRIES} write conflicts"
    ))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::trigger::{MemoryPlatform, NotificationPlatform, PermissionStatus};
    use lifeline_core::checkin::{CheckInStatus, CodeChoice, NotificationMethod};
    use lifeline_core::confirmation::ChallengeConfig;
    use lifeline_core::escalation::{Escalator, RecordingNotifier};
    use lifeline_core::MemoryStore;

    fn client_with(platform: MemoryPlatform) -> CheckInClient {
        client_and_notifier(platform, ClientConfig::default()).0
    }

    fn client_and_notifier(
        platform: MemoryPlatform,
        config: ClientConfig,
    ) -> (CheckInClient, RecordingNotifier) {
        let repo = CheckInRepository::new(Arc::new(MemoryStore::new()));
        let notifier = RecordingNotifier::new();
        let escalator = Escalator::new(repo.clone(), Arc::new(notifier.clone()));
        let registry = ChallengeRegistry::new(escalator, ChallengeConfig::default());
        let scheduler = Arc::new(TriggerScheduler::new(Arc::new(platform)));
        let client = CheckInClient::new("u1", registry, repo, scheduler, config);
        (client, notifier)
    }

    async fn save_c1(client: &CheckInClient) {
        client
            .save_contact(Contact {
                id: "c1".into(),
                user_id: "u1".into(),
                name: "Sam".into(),
                email: Some("sam@example.com".into()),
                phone: None,
                method: NotificationMethod::Email,
            })
            .await
            .unwrap();
    }

    async fn exhaust_attempts(client: &CheckInClient, check_in_id: &str) -> Result<SubmitOutcome> {
        for _ in 0..4 {
            assert!(matches!(
                client.submit_code(check_in_id, "0000", 5_010).await,
                Err(Error::CodeMismatch { .. })
            ));
        }
        client.submit_code(check_in_id, "0000", 5_010).await
    }

    fn input(scheduled_time: i64) -> NewCheckIn {
        NewCheckIn {
            title: "Date".into(),
            scheduled_time,
            interval_minutes: 60,
            confirmation_code: Some("7777".into()),
            contact_ids: vec!["c1".into()],
            ..NewCheckIn::default()
        }
    }

    #[tokio::test]
    async fn create_arms_a_trigger() {
        let platform = MemoryPlatform::new();
        let client = client_with(platform.clone());
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();
        assert!(matches!(scheduled.trigger, TriggerStatus::Armed { at: 5_000, .. }));
        assert_eq!(platform.list_pending().await.unwrap().len(), 1);
        assert_eq!(client.refresh(&scheduled.check_in.id).await.unwrap(), scheduled.check_in);
    }

    #[tokio::test]
    async fn create_survives_denied_permission() {
        let platform =
            MemoryPlatform::with_permission(PermissionStatus::Denied, PermissionStatus::Denied);
        let client = client_with(platform);
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();
        assert_eq!(scheduled.trigger, TriggerStatus::PermissionDenied);
        assert_eq!(client.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn edit_leaves_exactly_one_pending_trigger() {
        let platform = MemoryPlatform::new();
        let client = client_with(platform.clone());
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();

        let edited = client
            .edit(
                &scheduled.check_in.id,
                CheckInEdit {
                    scheduled_time: Some(8_000),
                    code: CodeChoice::Regenerate,
                    ..CheckInEdit::default()
                },
                1_100,
            )
            .await
            .unwrap();
        assert_eq!(edited.check_in.response_deadline, 8_000 + 3_600);

        let pending = platform.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].at, 8_000);
    }

    #[tokio::test]
    async fn cancel_disarms() {
        let platform = MemoryPlatform::new();
        let client = client_with(platform.clone());
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();
        let cancelled = client.cancel(&scheduled.check_in.id, 1_200).await.unwrap();
        assert_eq!(cancelled.status, CheckInStatus::Cancelled);
        assert!(platform.list_pending().await.unwrap().is_empty());
        assert!(matches!(
            client.edit(&scheduled.check_in.id, CheckInEdit::default(), 1_300).await,
            Err(Error::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn fired_trigger_opens_challenge_and_code_acknowledges() {
        let platform = MemoryPlatform::new();
        let client = client_with(platform.clone());
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();

        let fired = platform.fire_due(5_000);
        let session = client.on_trigger_fired(&fired[0], 5_000).await.unwrap();
        assert_eq!(session.attempts_remaining, 5);
        assert_eq!(
            client.refresh(&scheduled.check_in.id).await.unwrap().status,
            CheckInStatus::Active
        );

        assert!(matches!(
            client.submit_code(&scheduled.check_in.id, "0000", 5_010).await,
            Err(Error::CodeMismatch {
                attempts_remaining: 4
            })
        ));
        let outcome = client
            .submit_code(&scheduled.check_in.id, "7777", 5_020)
            .await
            .unwrap();
        assert_eq!(outcome, SubmitOutcome::Acknowledged { at: 5_020 });
        assert_eq!(client.scheduler().pending_count().await, 0);
    }

    #[tokio::test]
    async fn resume_rearms_scheduled_records() {
        let platform = MemoryPlatform::new();
        let client = client_with(platform.clone());
        client.create(input(5_000), 1_000).await.unwrap();
        client.create(input(6_000), 1_000).await.unwrap();
        platform.cancel_all().await.unwrap();

        let report = client.resume(2_000).await.unwrap();
        assert_eq!(report.armed, 2);
        assert_eq!(platform.list_pending().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_removes_record_and_trigger() {
        let platform = MemoryPlatform::new();
        let client = client_with(platform.clone());
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();
        assert!(client.delete(&scheduled.check_in.id).await.unwrap());
        assert!(!client.delete(&scheduled.check_in.id).await.unwrap());
        assert!(platform.list_pending().await.unwrap().is_empty());
        assert!(matches!(
            client.refresh(&scheduled.check_in.id).await,
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn delete_refuses_resolved_check_ins() {
        let (client, _) = client_and_notifier(MemoryPlatform::new(), ClientConfig::default());
        save_c1(&client).await;
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();
        let id = scheduled.check_in.id;

        let outcome = exhaust_attempts(&client, &id).await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Escalated { .. }));

        assert!(matches!(
            client.delete(&id).await,
            Err(Error::InvalidTransition(_))
        ));
        assert_eq!(
            client.refresh(&id).await.unwrap().status,
            CheckInStatus::Escalated
        );
    }

    #[tokio::test]
    async fn timed_out_submission_still_notifies_contacts() {
        let config = ClientConfig {
            submit_timeout: Duration::from_millis(50),
        };
        let (client, notifier) = client_and_notifier(MemoryPlatform::new(), config);
        save_c1(&client).await;
        let scheduled = client.create(input(5_000), 1_000).await.unwrap();
        let id = scheduled.check_in.id;

        notifier.set_delay(Some(Duration::from_millis(300)));
        assert!(matches!(
            exhaust_attempts(&client, &id).await,
            Err(Error::Timeout)
        ));
        assert!(notifier.deliveries().is_empty());

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(notifier.deliveries().len(), 1);
        assert_eq!(
            client.refresh(&id).await.unwrap().status,
            CheckInStatus::Escalated
        );
    }

    #[tokio::test]
    async fn create_survives_unavailable_platform() {
        let platform = MemoryPlatform::new();
        platform.set_unavailable(true);
        let client = client_with(platform);

        let scheduled = client.create(input(5_000), 1_000).await.unwrap();
        assert!(matches!(scheduled.trigger, TriggerStatus::Unarmed { .. }));
        assert_eq!(client.list().await.unwrap().len(), 1);
    }
}
