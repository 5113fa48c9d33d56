//! Row types for the server tables.

use std::fmt;

use lifeline_core::checkin::Channel;
use lifeline_core::escalation::DeliveryTarget;
use lifeline_core::store::{Record, StoreError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RecordRow {
    pub pk: String,
    pub sk: String,
    pub index_status: Option<String>,
    pub index_deadline: Option<i64>,
    pub version: i64,
    pub payload: String,
    pub updated_at: i64,
}

impl TryFrom<RecordRow> for Record {
    type Error = StoreError;

    fn try_from(row: RecordRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_str(&row.payload).map_err(|e| StoreError::Corrupt {
            key: format!("{}/{}", row.pk, row.sk),
            message: e.to_string(),
        })?;
        Ok(Self {
            partition_key: row.pk,
            sort_key: row.sk,
            index_status: row.index_status,
            index_deadline: row.index_deadline,
            version: u64::try_from(row.version).unwrap_or_default(),
            payload,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    /// Retried on later sweeps while attempts remain.
    Failed,
    /// Refused by the gateway, never retried.
    Rejected,
}

impl DeliveryStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttemptRow {
    pub check_in_id: String,
    pub user_id: String,
    pub target_id: String,
    pub channel: String,
    pub contact_id: Option<String>,
    pub contact_name: String,
    pub address: String,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl DeliveryAttemptRow {
    /// Rebuild the target this row tracks. `None` if the channel column
    /// holds something unknown.
    pub fn target(&self) -> Option<DeliveryTarget> {
        let channel: Channel = self.channel.parse().ok()?;
        Some(DeliveryTarget {
            target_id: self.target_id.clone(),
            contact_id: self.contact_id.clone(),
            name: self.contact_name.clone(),
            channel,
            address: self.address.clone(),
        })
    }

    pub fn is_delivered(&self) -> bool {
        self.status == DeliveryStatus::Delivered.as_str()
    }
}
