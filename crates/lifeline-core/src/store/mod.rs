//! Record-store seam.
//!
//! The store is a key/value collaborator addressed by a partition key (the
//! owning user) and a sort key (record type + id). It supports point reads and
//! writes, prefix queries within a partition, and one secondary index keyed by
//! status and deadline that the escalation sweep uses to find overdue
//! check-ins without scanning.

mod keys;
mod memory;
mod repository;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use keys::{
    checkin_sort_key, contact_sort_key, user_partition_key, CHECKIN_PREFIX, CONTACT_PREFIX,
    ESCALATION_INDEX,
};
pub use memory::MemoryStore;
pub use repository::{CheckInRepository, Stored};

/// One stored item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub partition_key: String,
    pub sort_key: String,
    /// Status attribute projected into [`ESCALATION_INDEX`].
    #[serde(default)]
    pub index_status: Option<String>,
    /// Deadline attribute projected into [`ESCALATION_INDEX`].
    #[serde(default)]
    pub index_deadline: Option<i64>,
    /// Assigned by the store; incremented on every successful put.
    #[serde(default)]
    pub version: u64,
    pub payload: serde_json::Value,
    pub updated_at: i64,
}

/// Write precondition for [`RecordStore::put`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutCondition {
    /// Unconditional overwrite.
    Any,
    /// Fails with [`StoreError::Conflict`] if the key already exists.
    MustNotExist,
    /// Fails with [`StoreError::Conflict`] unless the stored version matches.
    Version(u64),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// Transient failure reaching the store. Safe to retry.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    #[error("write conflict on {partition_key}/{sort_key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        partition_key: String,
        sort_key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },

    #[error("unknown index: {0}")]
    UnknownIndex(String),

    #[error("corrupt record {key}: {message}")]
    Corrupt { key: String, message: String },
}

impl StoreError {
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Storage collaborator for check-ins and contacts.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Point lookup.
    async fn get(&self, partition_key: &str, sort_key: &str)
        -> Result<Option<Record>, StoreError>;

    /// Point write. Returns the record as stored, with its new version.
    async fn put(&self, record: Record, condition: PutCondition) -> Result<Record, StoreError>;

    /// Remove a record. Returns `true` if something was deleted.
    ///
    /// With `expected_version` set the delete only happens at that version;
    /// a newer stored version fails with [`StoreError::Conflict`].
    async fn delete(
        &self,
        partition_key: &str,
        sort_key: &str,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError>;

    /// All records in a partition whose sort key starts with `sort_key_prefix`,
    /// ordered by sort key.
    async fn query_by_prefix(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> Result<Vec<Record>, StoreError>;

    /// Records in `index_name` with the given status and a deadline strictly
    /// before `deadline_before`, ordered by deadline.
    async fn query_by_index(
        &self,
        index_name: &str,
        status: &str,
        deadline_before: i64,
    ) -> Result<Vec<Record>, StoreError>;
}
