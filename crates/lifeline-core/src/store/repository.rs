//! Typed access to check-in and contact records.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use super::keys::{
    checkin_sort_key, contact_sort_key, user_partition_key, CHECKIN_PREFIX, CONTACT_PREFIX,
    ESCALATION_INDEX,
};
use super::{PutCondition, Record, RecordStore, StoreError};
use crate::checkin::{CheckIn, CheckInStatus, Contact};

/// A decoded value together with the record version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct Stored<T> {
    pub value: T,
    pub version: u64,
}

/// Maps [`CheckIn`] and [`Contact`] onto the generic record layout.
///
/// Open check-ins project their status and response deadline into
/// [`ESCALATION_INDEX`]; terminal ones drop out of the index.
#[derive(Clone)]
pub struct CheckInRepository {
    store: Arc<dyn RecordStore>,
}

impl CheckInRepository {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub async fn get(
        &self,
        user_id: &str,
        check_in_id: &str,
    ) -> Result<Option<Stored<CheckIn>>, StoreError> {
        let record = self
            .store
            .get(&user_partition_key(user_id), &checkin_sort_key(check_in_id))
            .await?;
        record.map(|r| decode(&r)).transpose()
    }

    /// Store a freshly created check-in. Fails with a conflict if the id is
    /// already taken.
    pub async fn insert(&self, check_in: &CheckIn) -> Result<Stored<CheckIn>, StoreError> {
        let record = checkin_record(check_in)?;
        let stored = self.store.put(record, PutCondition::MustNotExist).await?;
        Ok(Stored {
            value: check_in.clone(),
            version: stored.version,
        })
    }

    /// Compare-and-swap write against the version the caller read.
    pub async fn replace(
        &self,
        check_in: &CheckIn,
        expected_version: u64,
    ) -> Result<Stored<CheckIn>, StoreError> {
        let record = checkin_record(check_in)?;
        let stored = self
            .store
            .put(record, PutCondition::Version(expected_version))
            .await?;
        Ok(Stored {
            value: check_in.clone(),
            version: stored.version,
        })
    }

    /// Delete a check-in at the version the caller read.
    pub async fn delete(
        &self,
        user_id: &str,
        check_in_id: &str,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        self.store
            .delete(
                &user_partition_key(user_id),
                &checkin_sort_key(check_in_id),
                Some(expected_version),
            )
            .await
    }

    /// All check-ins of a user. Undecodable records are logged and skipped.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<Stored<CheckIn>>, StoreError> {
        let records = self
            .store
            .query_by_prefix(&user_partition_key(user_id), CHECKIN_PREFIX)
            .await?;
        Ok(decode_all(&records))
    }

    /// Open check-ins whose response deadline is strictly before `now`.
    ///
    /// Served entirely from [`ESCALATION_INDEX`], one query per open status.
    pub async fn find_overdue(&self, now: i64) -> Result<Vec<Stored<CheckIn>>, StoreError> {
        let mut overdue = Vec::new();
        for status in CheckInStatus::OPEN {
            let records = self
                .store
                .query_by_index(ESCALATION_INDEX, status.as_str(), now)
                .await?;
            overdue.extend(
                decode_all::<CheckIn>(&records)
                    .into_iter()
                    .filter(|c| c.value.is_overdue(now)),
            );
        }
        overdue.sort_by_key(|c| c.value.response_deadline);
        Ok(overdue)
    }

    pub async fn get_contact(
        &self,
        user_id: &str,
        contact_id: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let record = self
            .store
            .get(&user_partition_key(user_id), &contact_sort_key(contact_id))
            .await?;
        record
            .map(|r| decode::<Contact>(&r).map(|s| s.value))
            .transpose()
    }

    pub async fn put_contact(&self, contact: &Contact) -> Result<(), StoreError> {
        let record = Record {
            partition_key: user_partition_key(&contact.user_id),
            sort_key: contact_sort_key(&contact.id),
            index_status: None,
            index_deadline: None,
            version: 0,
            payload: encode(contact, &contact.id)?,
            updated_at: crate::db::unix_timestamp(),
        };
        self.store.put(record, PutCondition::Any).await?;
        Ok(())
    }

    pub async fn list_contacts(&self, user_id: &str) -> Result<Vec<Contact>, StoreError> {
        let records = self
            .store
            .query_by_prefix(&user_partition_key(user_id), CONTACT_PREFIX)
            .await?;
        Ok(decode_all::<Contact>(&records)
            .into_iter()
            .map(|s| s.value)
            .collect())
    }
}

fn checkin_record(check_in: &CheckIn) -> Result<Record, StoreError> {
    let open = check_in.status.is_open();
    Ok(Record {
        partition_key: user_partition_key(&check_in.user_id),
        sort_key: checkin_sort_key(&check_in.id),
        index_status: open.then(|| check_in.status.as_str().to_string()),
        index_deadline: open.then_some(check_in.response_deadline),
        version: 0,
        payload: encode(check_in, &check_in.id)?,
        updated_at: check_in.updated_at,
    })
}

fn encode<T: Serialize>(value: &T, key: &str) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

fn decode<T: DeserializeOwned>(record: &Record) -> Result<Stored<T>, StoreError> {
    let value = T::deserialize(&record.payload).map_err(|e| StoreError::Corrupt {
        key: format!("{}/{}", record.partition_key, record.sort_key),
        message: e.to_string(),
    })?;
    Ok(Stored {
        value,
        version: record.version,
    })
}

fn decode_all<T: DeserializeOwned>(records: &[Record]) -> Vec<Stored<T>> {
    records
        .iter()
        .filter_map(|record| match decode(record) {
            Ok(stored) => Some(stored),
            Err(e) => {
                warn!(error = %e, "Skipping undecodable record");
                None
            }
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::checkin::{EscalationReason, NewCheckIn, NotificationMethod};
    use crate::store::MemoryStore;

    fn sample(id: &str, scheduled_time: i64) -> CheckIn {
        CheckIn::create(
            id,
            "u1",
            NewCheckIn {
                title: "Evening hike".into(),
                scheduled_time,
                interval_minutes: 60,
                confirmation_code: Some("1234".into()),
                contact_ids: vec!["c1".into()],
                ..NewCheckIn::default()
            },
            0,
        )
        .unwrap()
    }

    fn repo() -> (MemoryStore, CheckInRepository) {
        let store = MemoryStore::new();
        let repo = CheckInRepository::new(Arc::new(store.clone()));
        (store, repo)
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let (_, repo) = repo();
        let check_in = sample("a", 1_000);
        let stored = repo.insert(&check_in).await.unwrap();
        assert_eq!(stored.version, 1);

        let loaded = repo.get("u1", "a").await.unwrap().unwrap();
        assert_eq!(loaded.value, check_in);
        assert_eq!(loaded.version, 1);
        assert!(repo.get("u2", "a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_insert_conflicts() {
        let (_, repo) = repo();
        let check_in = sample("a", 1_000);
        repo.insert(&check_in).await.unwrap();
        assert!(repo.insert(&check_in).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn replace_requires_current_version() {
        let (_, repo) = repo();
        let mut check_in = sample("a", 1_000);
        repo.insert(&check_in).await.unwrap();

        check_in.activate(1_000).unwrap();
        let stored = repo.replace(&check_in, 1).await.unwrap();
        assert_eq!(stored.version, 2);
        assert!(repo.replace(&check_in, 1).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn find_overdue_returns_exactly_the_overdue_record() {
        let (_, repo) = repo();
        // deadline 1_000 + 3_600 = 4_600
        repo.insert(&sample("late", 1_000)).await.unwrap();
        // deadline 9_000 + 3_600 = 12_600
        repo.insert(&sample("future", 9_000)).await.unwrap();
        let mut done = sample("done", 0);
        done.acknowledge(100).unwrap();
        repo.insert(&done).await.unwrap();

        let overdue = repo.find_overdue(5_000).await.unwrap();
        let ids: Vec<_> = overdue.iter().map(|c| c.value.id.as_str()).collect();
        assert_eq!(ids, vec!["late"]);
    }

    #[tokio::test]
    async fn find_overdue_includes_active_records() {
        let (_, repo) = repo();
        let mut check_in = sample("a", 1_000);
        check_in.activate(1_000).unwrap();
        repo.insert(&check_in).await.unwrap();
        assert_eq!(repo.find_overdue(4_601).await.unwrap().len(), 1);
        assert!(repo.find_overdue(4_600).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_records_leave_the_index() {
        let (store, repo) = repo();
        let mut check_in = sample("a", 1_000);
        repo.insert(&check_in).await.unwrap();
        check_in
            .escalate(EscalationReason::DeadlinePassed, 5_000)
            .unwrap();
        repo.replace(&check_in, 1).await.unwrap();

        let hits = store
            .query_by_index(ESCALATION_INDEX, "scheduled", i64::MAX)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn corrupt_records_are_skipped_in_listings() {
        let (store, repo) = repo();
        repo.insert(&sample("good", 1_000)).await.unwrap();
        store
            .put(
                Record {
                    partition_key: user_partition_key("u1"),
                    sort_key: checkin_sort_key("bad"),
                    index_status: Some("scheduled".into()),
                    index_deadline: Some(10),
                    version: 0,
                    payload: serde_json::json!({"title": 7}),
                    updated_at: 0,
                },
                PutCondition::Any,
            )
            .await
            .unwrap();

        assert_eq!(repo.list_for_user("u1").await.unwrap().len(), 1);
        assert_eq!(repo.find_overdue(5_000).await.unwrap().len(), 1);
        assert!(matches!(
            repo.get("u1", "bad").await,
            Err(StoreError::Corrupt { .. })
        ));
    }

    #[tokio::test]
    async fn contacts_live_beside_check_ins() {
        let (_, repo) = repo();
        let contact = Contact {
            id: "c1".into(),
            user_id: "u1".into(),
            name: "Alex".into(),
            email: Some("alex@example.com".into()),
            phone: None,
            method: NotificationMethod::Email,
        };
        repo.put_contact(&contact).await.unwrap();
        repo.insert(&sample("a", 1_000)).await.unwrap();

        assert_eq!(repo.get_contact("u1", "c1").await.unwrap(), Some(contact));
        assert_eq!(repo.list_contacts("u1").await.unwrap().len(), 1);
        assert_eq!(repo.list_for_user("u1").await.unwrap().len(), 1);
    }
}
