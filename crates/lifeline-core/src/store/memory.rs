//! In-memory record store.
//!
//! Used by tests and by embedders that keep a local cache. Cloning shares
//! the underlying map.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use super::keys::ESCALATION_INDEX;
use super::{PutCondition, Record, RecordStore, StoreError};

type Key = (String, String);

#[derive(Clone, Default)]
pub struct MemoryStore {
    records: Arc<RwLock<BTreeMap<Key, Record>>>,
    offline: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: while offline every call fails with
    /// [`StoreError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Number of stored records.
    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn get(
        &self,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<Record>, StoreError> {
        self.check_online()?;
        let key = (partition_key.to_string(), sort_key.to_string());
        Ok(self.records.read().await.get(&key).cloned())
    }

    async fn put(&self, mut record: Record, condition: PutCondition) -> Result<Record, StoreError> {
        self.check_online()?;
        let key = (record.partition_key.clone(), record.sort_key.clone());
        let mut records = self.records.write().await;
        let current = records.get(&key).map(|r| r.version);

        let allowed = match condition {
            PutCondition::Any => true,
            PutCondition::MustNotExist => current.is_none(),
            PutCondition::Version(expected) => current == Some(expected),
        };
        if !allowed {
            return Err(StoreError::Conflict {
                partition_key: key.0,
                sort_key: key.1,
                expected: match condition {
                    PutCondition::Version(v) => Some(v),
                    _ => None,
                },
                actual: current,
            });
        }

        record.version = current.unwrap_or(0) + 1;
        debug!(
            partition_key = %record.partition_key,
            sort_key = %record.sort_key,
            version = record.version,
            "Record stored"
        );
        records.insert(key, record.clone());
        Ok(record)
    }

    async fn delete(
        &self,
        partition_key: &str,
        sort_key: &str,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        self.check_online()?;
        let key = (partition_key.to_string(), sort_key.to_string());
        let mut records = self.records.write().await;
        let current = records.get(&key).map(|r| r.version);
        if let (Some(expected), Some(actual)) = (expected_version, current)
            && expected != actual
        {
            return Err(StoreError::Conflict {
                partition_key: key.0,
                sort_key: key.1,
                expected: Some(expected),
                actual: Some(actual),
            });
        }
        Ok(records.remove(&key).is_some())
    }

    async fn query_by_prefix(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> Result<Vec<Record>, StoreError> {
        self.check_online()?;
        let start = (partition_key.to_string(), sort_key_prefix.to_string());
        Ok(self
            .records
            .read()
            .await
            .range(start..)
            .take_while(|((pk, sk), _)| pk == partition_key && sk.starts_with(sort_key_prefix))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn query_by_index(
        &self,
        index_name: &str,
        status: &str,
        deadline_before: i64,
    ) -> Result<Vec<Record>, StoreError> {
        self.check_online()?;
        if index_name != ESCALATION_INDEX {
            return Err(StoreError::UnknownIndex(index_name.to_string()));
        }
        let mut hits: Vec<Record> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| {
                r.index_status.as_deref() == Some(status)
                    && r.index_deadline.is_some_and(|d| d < deadline_before)
            })
            .cloned()
            .collect();
        hits.sort_by_key(|r| r.index_deadline);
        Ok(hits)
    }
}
