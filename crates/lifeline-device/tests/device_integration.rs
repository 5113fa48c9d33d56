#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Device flow: create, restart, fire, confirm.

use std::sync::Arc;
use std::time::Duration;

use lifeline_core::checkin::{CheckInStatus, NewCheckIn};
use lifeline_core::confirmation::{ChallengeConfig, ChallengeRegistry};
use lifeline_core::db::unix_timestamp;
use lifeline_core::escalation::{Escalator, RecordingNotifier};
use lifeline_core::store::CheckInRepository;
use lifeline_core::{MemoryStore, SubmitOutcome};
use lifeline_device::trigger::{MemoryPlatform, NotificationPlatform, TokioPlatform};
use lifeline_device::{CheckInClient, ClientConfig, TriggerScheduler, TriggerStatus};

fn new_check_in(scheduled_time: i64) -> NewCheckIn {
    NewCheckIn {
        title: "Late shift".into(),
        scheduled_time,
        interval_minutes: 20,
        confirmation_code: Some("1357".into()),
        contact_ids: vec!["c1".into()],
        ..NewCheckIn::default()
    }
}

fn registry(repo: &CheckInRepository) -> ChallengeRegistry {
    let escalator = Escalator::new(repo.clone(), Arc::new(RecordingNotifier::new()));
    ChallengeRegistry::new(escalator, ChallengeConfig::default())
}

#[tokio::test]
async fn triggers_survive_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let index_path = dir.path().join("triggers.json");
    let store = MemoryStore::new();
    let repo = CheckInRepository::new(Arc::new(store));
    let platform = MemoryPlatform::new();

    let later = {
        let scheduler = TriggerScheduler::with_index_file(Arc::new(platform.clone()), &index_path)
            .await
            .unwrap();
        let client = CheckInClient::new(
            "u1",
            registry(&repo),
            repo.clone(),
            Arc::new(scheduler),
            ClientConfig::default(),
        );
        client.create(new_check_in(10_000), 1_000).await.unwrap();
        client.create(new_check_in(20_000), 1_000).await.unwrap()
    };

    // The OS dropped every pending notification while the app was gone.
    platform.cancel_all().await.unwrap();

    let scheduler = TriggerScheduler::with_index_file(Arc::new(platform.clone()), &index_path)
        .await
        .unwrap();
    assert_eq!(scheduler.pending_count().await, 2);
    let client = CheckInClient::new(
        "u1",
        registry(&repo),
        repo.clone(),
        Arc::new(scheduler),
        ClientConfig::default(),
    );

    let report = client.resume(15_000).await.unwrap();
    assert_eq!(report.armed, 1);
    assert_eq!(report.skipped, 1);
    let pending = platform.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].content.check_in_id, later.check_in.id);
}

#[tokio::test]
async fn tokio_trigger_fires_and_opens_the_prompt() {
    let repo = CheckInRepository::new(Arc::new(MemoryStore::new()));
    let (platform, mut fired_rx) = TokioPlatform::new();
    let scheduler = Arc::new(TriggerScheduler::new(Arc::new(platform)));
    let client = CheckInClient::new(
        "u1",
        registry(&repo),
        repo.clone(),
        scheduler,
        ClientConfig::default(),
    );

    let now = unix_timestamp();
    let scheduled = client.create(new_check_in(now + 1), now).await.unwrap();
    assert!(matches!(scheduled.trigger, TriggerStatus::Armed { .. }));

    let fired = tokio::time::timeout(Duration::from_secs(10), fired_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fired.content.check_in_id, scheduled.check_in.id);

    let at = fired.fired_at;
    let session = client.on_trigger_fired(&fired, at).await.unwrap();
    assert_eq!(session.check_in_id, scheduled.check_in.id);

    let outcome = client
        .submit_code(&scheduled.check_in.id, "1357", at)
        .await
        .unwrap();
    assert_eq!(outcome, SubmitOutcome::Acknowledged { at });
    assert_eq!(
        client.refresh(&scheduled.check_in.id).await.unwrap().status,
        CheckInStatus::Acknowledged
    );
}
