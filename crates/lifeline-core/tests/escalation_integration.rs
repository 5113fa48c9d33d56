#![allow(clippy::unwrap_used, clippy::panic)] // Integration tests use unwrap for brevity

//! End-to-end checks of the challenge protocol and escalation over the
//! in-memory record store.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use lifeline_core::checkin::{
    CheckIn, CheckInStatus, Contact, CustomContact, EscalationReason, NewCheckIn,
    NotificationMethod,
};
use lifeline_core::confirmation::{ChallengeConfig, ChallengeRegistry, ConfirmationError};
use lifeline_core::escalation::{
    DeliveryTarget, EscalationEvent, EscalationNotifier, EscalationResult, Escalator, NotifyError,
};
use lifeline_core::store::{CheckInRepository, MemoryStore};
use lifeline_core::SubmitOutcome;

#[derive(Clone, Default)]
struct Outbox(Arc<Mutex<Vec<(EscalationEvent, DeliveryTarget)>>>);

#[async_trait]
impl EscalationNotifier for Outbox {
    async fn deliver(
        &self,
        event: &EscalationEvent,
        target: &DeliveryTarget,
    ) -> Result<(), NotifyError> {
        self.0.lock().unwrap().push((event.clone(), target.clone()));
        Ok(())
    }
}

impl Outbox {
    fn sent(&self) -> Vec<(EscalationEvent, DeliveryTarget)> {
        self.0.lock().unwrap().clone()
    }
}

struct Harness {
    repo: CheckInRepository,
    outbox: Outbox,
    escalator: Escalator,
    registry: ChallengeRegistry,
}

async fn harness() -> Harness {
    let store = MemoryStore::new();
    let repo = CheckInRepository::new(Arc::new(store));
    let outbox = Outbox::default();
    let escalator = Escalator::new(repo.clone(), Arc::new(outbox.clone()));
    let registry = ChallengeRegistry::new(escalator.clone(), ChallengeConfig::default());

    for (id, method) in [("c1", NotificationMethod::Email), ("c2", NotificationMethod::Sms)] {
        repo.put_contact(&Contact {
            id: id.into(),
            user_id: "user-1".into(),
            name: format!("Contact {id}"),
            email: Some(format!("{id}@example.com")),
            phone: Some("+15550123".into()),
            method,
        })
        .await
        .unwrap();
    }

    // scheduled at 10_000, deadline 10_000 + 45 * 60 = 12_700
    let check_in = CheckIn::create(
        "hike-1",
        "user-1",
        NewCheckIn {
            title: "Ridge hike".into(),
            kind: Some("hiking".into()),
            scheduled_time: 10_000,
            interval_minutes: 45,
            confirmation_code: Some("0042".into()),
            contact_ids: vec!["c1".into(), "c2".into()],
            custom_contacts: vec![CustomContact {
                name: "Jordan".into(),
                email: Some("jordan@example.com".into()),
                phone: None,
                method: NotificationMethod::Email,
            }],
            ..NewCheckIn::default()
        },
        9_000,
    )
    .unwrap();
    repo.insert(&check_in).await.unwrap();

    Harness {
        repo,
        outbox,
        escalator,
        registry,
    }
}

#[tokio::test]
async fn five_wrong_codes_notify_the_full_contact_set_once() {
    let h = harness().await;
    h.registry.open("user-1", "hike-1", 10_000).await.unwrap();

    let mut last = None;
    for _ in 0..5 {
        last = Some(h.registry.submit("user-1", "hike-1", "9999", 10_030).await);
    }
    let outcome = last.unwrap().unwrap();
    assert!(matches!(outcome, SubmitOutcome::Escalated { at: 10_030, .. }));

    let sent = h.outbox.sent();
    assert_eq!(sent.len(), 3);
    let event = &sent[0].0;
    assert!(sent.iter().all(|(e, _)| e == event));
    assert_eq!(event.reason, EscalationReason::AttemptsExhausted);
    assert_eq!(event.contact_ids, vec!["c1".to_string(), "c2".to_string()]);
    assert_eq!(event.custom_contacts.len(), 1);

    let mut addresses: Vec<_> = sent.iter().map(|(_, t)| t.address.clone()).collect();
    addresses.sort();
    assert_eq!(
        addresses,
        vec!["+15550123", "c1@example.com", "jordan@example.com"]
    );

    let stored = h.repo.get("user-1", "hike-1").await.unwrap().unwrap().value;
    assert_eq!(stored.status, CheckInStatus::Escalated);
    assert_eq!(stored.escalated_at, Some(10_030));
    assert!(stored.acknowledged_at.is_none());
    stored.check_invariants().unwrap();
}

#[tokio::test]
async fn sweep_escalation_beats_late_submission() {
    let h = harness().await;
    h.registry.open("user-1", "hike-1", 10_000).await.unwrap();

    let result = h
        .escalator
        .escalate("user-1", "hike-1", EscalationReason::DeadlinePassed, 12_760)
        .await
        .unwrap();
    assert!(matches!(result, EscalationResult::Escalated { .. }));

    let submit = h.registry.submit("user-1", "hike-1", "0042", 12_770).await;
    assert!(matches!(
        submit,
        Err(ConfirmationError::AlreadyResolved {
            status: CheckInStatus::Escalated
        })
    ));
    assert_eq!(h.outbox.sent().len(), 3);
}

#[tokio::test]
async fn acknowledgment_beats_sweep() {
    let h = harness().await;
    h.registry.open("user-1", "hike-1", 10_000).await.unwrap();
    let outcome = h
        .registry
        .submit("user-1", "hike-1", "0042", 12_600)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Acknowledged { at: 12_600 });

    let result = h
        .escalator
        .escalate("user-1", "hike-1", EscalationReason::DeadlinePassed, 12_760)
        .await
        .unwrap();
    assert_eq!(
        result,
        EscalationResult::AlreadyResolved {
            status: CheckInStatus::Acknowledged
        }
    );
    assert!(h.outbox.sent().is_empty());
    assert!(h.repo.find_overdue(20_000).await.unwrap().is_empty());
}

#[tokio::test]
async fn racing_acknowledge_and_escalate_converge() {
    let h = harness().await;
    h.registry.open("user-1", "hike-1", 10_000).await.unwrap();

    let (submit, escalate) = tokio::join!(
        h.registry.submit("user-1", "hike-1", "0042", 12_700),
        h.escalator
            .escalate("user-1", "hike-1", EscalationReason::DeadlinePassed, 12_701),
    );

    let stored = h.repo.get("user-1", "hike-1").await.unwrap().unwrap().value;
    match stored.status {
        CheckInStatus::Acknowledged => {
            assert!(submit.is_ok());
            assert!(matches!(
                escalate.unwrap(),
                EscalationResult::AlreadyResolved { .. }
            ));
            assert!(h.outbox.sent().is_empty());
        }
        CheckInStatus::Escalated => {
            assert!(matches!(
                submit,
                Err(ConfirmationError::AlreadyResolved { .. })
            ));
            assert!(matches!(
                escalate.unwrap(),
                EscalationResult::Escalated { .. }
            ));
        }
        other => panic!("unexpected terminal status {other}"),
    }
    stored.check_invariants().unwrap();
}
