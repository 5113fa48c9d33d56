//! Escalation: turning an overdue or failed check-in into contact
//! notifications.
//!
//! [`Escalator`] is shared by the confirmation protocol (attempts exhausted)
//! and the server reconciler (deadline passed). The status write is a
//! compare-and-swap on the record version, so two racing callers converge
//! on one terminal state and only the winner dispatches.

mod ledger;
mod notifier;

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::checkin::{
    CheckIn, CheckInStatus, Companion, CustomContact, EscalationReason, Location,
    TransitionError,
};
use crate::store::{CheckInRepository, StoreError};

#[cfg(any(test, feature = "test-utils"))]
pub use notifier::RecordingNotifier;
pub use ledger::DeliveryLedger;
pub use notifier::{DeliveryTarget, EscalationNotifier, NotifyError};

/// Upper bound on re-reads after a version conflict.
const MAX_CAS_RETRIES: usize = 8;

/// What contacts are told about.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationEvent {
    pub check_in_id: String,
    pub user_id: String,
    pub title: String,
    pub kind: String,
    pub reason: EscalationReason,
    pub escalated_at: i64,
    pub scheduled_time: i64,
    pub response_deadline: i64,
    pub contact_ids: Vec<String>,
    pub custom_contacts: Vec<CustomContact>,
    pub location: Option<Location>,
    pub companions: Vec<Companion>,
}

impl EscalationEvent {
    pub fn new(check_in: &CheckIn, reason: EscalationReason, escalated_at: i64) -> Self {
        Self {
            check_in_id: check_in.id.clone(),
            user_id: check_in.user_id.clone(),
            title: check_in.title.clone(),
            kind: check_in.kind.clone(),
            reason,
            escalated_at,
            scheduled_time: check_in.scheduled_time,
            response_deadline: check_in.response_deadline,
            contact_ids: check_in.contact_ids.clone(),
            custom_contacts: check_in.custom_contacts.clone(),
            location: check_in.location.clone(),
            companions: check_in.companions.clone(),
        }
    }
}

impl CheckIn {
    /// The event for an escalated check-in, `None` for any other status.
    pub fn escalation_event(&self) -> Option<EscalationEvent> {
        if self.status != CheckInStatus::Escalated {
            return None;
        }
        let reason = self.escalation_reason?;
        let at = self.escalated_at?;
        Some(EscalationEvent::new(self, reason, at))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered,
    /// Worth another attempt.
    Failed(String),
    /// Refused by the gateway. Final.
    Rejected(String),
}

impl DeliveryOutcome {
    pub fn from_error(error: &NotifyError) -> Self {
        match error {
            NotifyError::Rejected(_) => Self::Rejected(error.to_string()),
            NotifyError::Transport(_) | NotifyError::NotConfigured(_) => {
                Self::Failed(error.to_string())
            }
        }
    }

    pub const fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryAttempt {
    pub target: DeliveryTarget,
    pub outcome: DeliveryOutcome,
}

/// Per-target results of one dispatch round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeliveryReport {
    pub attempts: Vec<DeliveryAttempt>,
}

impl DeliveryReport {
    pub fn delivered_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.outcome.is_delivered())
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.attempts.len() - self.delivered_count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeliveryAttempt> {
        self.attempts.iter().filter(|a| !a.outcome.is_delivered())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscalationResult {
    /// This call performed the transition and dispatched the event.
    Escalated {
        event: EscalationEvent,
        report: DeliveryReport,
    },
    /// Someone else escalated first. Nothing was dispatched.
    AlreadyEscalated,
    /// The record reached another terminal status first.
    AlreadyResolved { status: CheckInStatus },
    /// No deliverable target, or notifications are suppressed.
    Missed { reason: EscalationReason },
}

#[derive(Debug, thiserror::Error)]
pub enum EscalationError {
    #[error("check-in {check_in_id} not found for user {user_id}")]
    NotFound {
        user_id: String,
        check_in_id: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transition(#[from] TransitionError),
}

/// Performs escalations and dispatches the resulting notifications.
#[derive(Clone)]
pub struct Escalator {
    repo: CheckInRepository,
    notifier: Arc<dyn EscalationNotifier>,
    ledger: Option<Arc<dyn DeliveryLedger>>,
    suppress: bool,
    #[cfg(feature = "metrics")]
    metrics: Arc<crate::metrics::CheckInMetrics>,
}

impl Escalator {
    pub fn new(repo: CheckInRepository, notifier: Arc<dyn EscalationNotifier>) -> Self {
        Self {
            repo,
            notifier,
            ledger: None,
            suppress: false,
            #[cfg(feature = "metrics")]
            metrics: Arc::new(crate::metrics::CheckInMetrics::new()),
        }
    }

    /// When set, escalations end as `missed` and nothing is sent.
    #[must_use]
    pub const fn with_suppressed(mut self, suppress: bool) -> Self {
        self.suppress = suppress;
        self
    }

    /// Record every dispatch round in `ledger`.
    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn DeliveryLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn repository(&self) -> &CheckInRepository {
        &self.repo
    }

    pub fn notifier(&self) -> &Arc<dyn EscalationNotifier> {
        &self.notifier
    }

    /// Escalate one check-in. Safe to call repeatedly and concurrently.
    #[instrument(skip(self))]
    pub async fn escalate(
        &self,
        user_id: &str,
        check_in_id: &str,
        reason: EscalationReason,
        now: i64,
    ) -> Result<EscalationResult, EscalationError> {
        for _ in 0..MAX_CAS_RETRIES {
            let Some(stored) = self.repo.get(user_id, check_in_id).await? else {
                return Err(EscalationError::NotFound {
                    user_id: user_id.to_string(),
                    check_in_id: check_in_id.to_string(),
                });
            };
            let mut check_in = stored.value;
            match check_in.status {
                CheckInStatus::Escalated => {
                    debug!("Already escalated, nothing to dispatch");
                    return Ok(EscalationResult::AlreadyEscalated);
                }
                status if status.is_terminal() => {
                    debug!(%status, "Already resolved");
                    return Ok(EscalationResult::AlreadyResolved { status });
                }
                _ => {}
            }

            let targets = self.resolve_targets(&check_in).await?;
            if self.suppress || targets.is_empty() {
                check_in.mark_missed(reason, now)?;
                match self.repo.replace(&check_in, stored.version).await {
                    Ok(_) => {
                        warn!(
                            suppressed = self.suppress,
                            %reason,
                            "Check-in missed without notifying contacts"
                        );
                        #[cfg(feature = "metrics")]
                        self.metrics.record_escalation("missed");
                        return Ok(EscalationResult::Missed { reason });
                    }
                    Err(e) if e.is_conflict() => continue,
                    Err(e) => return Err(e.into()),
                }
            }

            check_in.escalate(reason, now)?;
            match self.repo.replace(&check_in, stored.version).await {
                Ok(_) => {}
                Err(e) if e.is_conflict() => {
                    debug!("Version conflict, re-evaluating");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let event = EscalationEvent::new(&check_in, reason, now);
            info!(
                %reason,
                targets = targets.len(),
                "Check-in escalated"
            );
            #[cfg(feature = "metrics")]
            self.metrics.record_escalation(reason.as_str());
            let report = self.deliver(&event, &targets).await;
            if let Some(ledger) = &self.ledger
                && let Err(e) = ledger.record_report(user_id, check_in_id, &report, now).await
            {
                warn!(error = %e, "Failed to record deliveries");
            }
            return Ok(EscalationResult::Escalated { event, report });
        }

        Err(EscalationError::Store(StoreError::Unavailable(format!(
            "gave up on {check_in_id} after {MAX_CAS_RETRIES} write conflicts"
        ))))
    }

    /// Expand the check-in's contacts into concrete channel targets.
    ///
    /// Permanent contacts are looked up under the owner's partition; missing
    /// ones are skipped. Targets sharing a channel and address are sent once.
    pub async fn resolve_targets(
        &self,
        check_in: &CheckIn,
    ) -> Result<Vec<DeliveryTarget>, StoreError> {
        let mut targets = Vec::new();
        let mut seen = HashSet::new();

        for contact_id in &check_in.contact_ids {
            let Some(contact) = self.repo.get_contact(&check_in.user_id, contact_id).await? else {
                warn!(contact_id = %contact_id, "Escalation contact not found, skipping");
                continue;
            };
            for &channel in contact.method.channels() {
                if let Some(address) = contact.address(channel)
                    && seen.insert((channel, address.to_string()))
                {
                    targets.push(DeliveryTarget {
                        target_id: format!("contact:{contact_id}"),
                        contact_id: Some(contact_id.clone()),
                        name: contact.name.clone(),
                        channel,
                        address: address.to_string(),
                    });
                }
            }
        }

        for (index, custom) in check_in.custom_contacts.iter().enumerate() {
            for &channel in custom.method.channels() {
                if let Some(address) = custom.address(channel)
                    && seen.insert((channel, address.to_string()))
                {
                    targets.push(DeliveryTarget {
                        target_id: format!("custom:{index}"),
                        contact_id: None,
                        name: custom.name.clone(),
                        channel,
                        address: address.to_string(),
                    });
                }
            }
        }

        Ok(targets)
    }

    /// Send `event` to each target. Failures are reported, never raised.
    pub async fn deliver(
        &self,
        event: &EscalationEvent,
        targets: &[DeliveryTarget],
    ) -> DeliveryReport {
        let mut report = DeliveryReport::default();
        for target in targets {
            let outcome = match self.notifier.deliver(event, target).await {
                Ok(()) => {
                    debug!(target_id = %target.target_id, channel = %target.channel, "Delivered");
                    DeliveryOutcome::Delivered
                }
                Err(e) => {
                    warn!(
                        target_id = %target.target_id,
                        channel = %target.channel,
                        error = %e,
                        "Escalation delivery failed"
                    );
                    #[cfg(feature = "metrics")]
                    self.metrics
                        .record_delivery_failures(1, target.channel.as_str());
                    DeliveryOutcome::from_error(&e)
                }
            };
            report.attempts.push(DeliveryAttempt {
                target: target.clone(),
                outcome,
            });
        }
        report
    }
}
