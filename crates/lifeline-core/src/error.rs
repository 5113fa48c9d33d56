//! Error types for the Lifeline core library.
//!
//! Module-level errors stay precise; [`Error`] is what service boundaries
//! hand back to callers.

use thiserror::Error;

use crate::checkin::{CheckInStatus, TransitionError, ValidationError};
use crate::confirmation::ConfirmationError;
use crate::db::DatabaseError;
use crate::escalation::{EscalationError, NotifyError};
use crate::store::StoreError;

/// Result type alias using Lifeline Error.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Malformed input. Never retried.
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Submitted code was not four ASCII digits. No attempt consumed.
    #[error("Confirmation code must be exactly 4 digits")]
    InvalidFormat,

    #[error("Incorrect code, {attempts_remaining} attempts remaining")]
    CodeMismatch { attempts_remaining: u32 },

    #[error("Check-in already {status}")]
    AlreadyResolved { status: CheckInStatus },

    #[error("Confirmation window closed at {closed_at}")]
    WindowClosed { closed_at: i64 },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("User {caller} does not own check-in {check_in_id}")]
    NotOwner { caller: String, check_in_id: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// The platform refused notification permission.
    #[error("Notification permission denied")]
    PermissionDenied,

    #[error("Record store unavailable: {0}")]
    StoreUnavailable(String),

    /// A stored record could not be decoded, or a query named an index the
    /// store does not have. Repeating the call gives the same answer.
    #[error("Record store error: {0}")]
    Storage(String),

    #[error("Escalation delivery failed: {0}")]
    Delivery(String),

    /// The operation did not finish in time; its outcome is unknown.
    #[error("Operation timed out")]
    Timeout,

    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// `true` if the same call may succeed when repeated.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::StoreUnavailable(_) | Self::Timeout | Self::CodeMismatch { .. }
        )
    }
}

impl From<TransitionError> for Error {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::Validation(v) => Self::Validation(v),
            TransitionError::NotOwner {
                caller,
                check_in_id,
            } => Self::NotOwner {
                caller,
                check_in_id,
            },
            TransitionError::Invalid { .. } => Self::InvalidTransition(e.to_string()),
        }
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Corrupt { .. } | StoreError::UnknownIndex(_) => Self::Storage(e.to_string()),
            StoreError::Unavailable(_) | StoreError::Conflict { .. } => {
                Self::StoreUnavailable(e.to_string())
            }
        }
    }
}

impl From<DatabaseError> for Error {
    fn from(e: DatabaseError) -> Self {
        Self::StoreUnavailable(e.to_string())
    }
}

impl From<NotifyError> for Error {
    fn from(e: NotifyError) -> Self {
        Self::Delivery(e.to_string())
    }
}

impl From<EscalationError> for Error {
    fn from(e: EscalationError) -> Self {
        match e {
            EscalationError::NotFound { check_in_id, .. } => Self::NotFound(check_in_id),
            EscalationError::Store(e) => e.into(),
            EscalationError::Transition(e) => e.into(),
        }
    }
}

impl From<ConfirmationError> for Error {
    fn from(e: ConfirmationError) -> Self {
        match e {
            ConfirmationError::InvalidFormat => Self::InvalidFormat,
            ConfirmationError::CodeMismatch { attempts_remaining } => {
                Self::CodeMismatch { attempts_remaining }
            }
            ConfirmationError::NotFound(id) => Self::NotFound(id),
            ConfirmationError::NotOwner {
                caller,
                check_in_id,
            } => Self::NotOwner {
                caller,
                check_in_id,
            },
            ConfirmationError::AlreadyResolved { status } => Self::AlreadyResolved { status },
            ConfirmationError::WindowClosed { closed_at } => Self::WindowClosed { closed_at },
            ConfirmationError::Store(e) => e.into(),
            ConfirmationError::Transition(e) => e.into(),
            ConfirmationError::Escalation(e) => e.into(),
        }
    }
}
