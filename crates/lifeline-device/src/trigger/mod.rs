//! Local check-in triggers.
//!
//! A trigger is a device notification scheduled for a check-in's
//! `scheduled_time`. When it fires the device opens a challenge session.

mod index;
mod platform;
mod scheduler;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use index::{IndexEntry, TriggerIndex};
pub use platform::{MemoryPlatform, NotificationPlatform, TokioPlatform};
pub use scheduler::{ArmOutcome, ReconcileReport, TriggerScheduler};

/// Platform-assigned handle of a scheduled notification.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TriggerId(pub String);

impl TriggerId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl fmt::Display for TriggerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the notification shows and which check-in it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContent {
    pub check_in_id: String,
    pub title: String,
    pub body: String,
}

impl TriggerContent {
    pub fn for_check_in(check_in_id: &str, title: &str) -> Self {
        Self {
            check_in_id: check_in_id.to_string(),
            title: format!("Check-in: {title}"),
            body: "Time to check in. Enter your code to confirm you are safe.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingTrigger {
    pub id: TriggerId,
    pub at: i64,
    pub content: TriggerContent,
}

/// Delivered to the application when a trigger goes off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FiredTrigger {
    pub id: TriggerId,
    pub content: TriggerContent,
    pub fired_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionStatus {
    Granted,
    Denied,
    NotDetermined,
}

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("notification permission denied")]
    PermissionDenied,

    #[error("notification platform error: {0}")]
    Platform(String),

    #[error("trigger index error: {0}")]
    Index(String),
}

impl From<TriggerError> for lifeline_core::Error {
    fn from(e: TriggerError) -> Self {
        match e {
            TriggerError::PermissionDenied => Self::PermissionDenied,
            other => Self::Io(std::io::Error::other(other.to_string())),
        }
    }
}
