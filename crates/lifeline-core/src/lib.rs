//! Lifeline Core Library
//!
//! Shared functionality for Lifeline components:
//! - Check-in data model and lifecycle state machine
//! - Confirmation-code challenge protocol with per-session attempt budgets
//! - Escalation to emergency contacts
//! - Record-store seam with an in-memory implementation
//! - Configuration resolution, database helpers and tracing setup

pub mod checkin;
pub mod config;
pub mod confirmation;
pub mod db;
pub mod error;
pub mod escalation;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod store;
pub mod tracing_init;

pub use checkin::{CheckIn, CheckInStatus, ConfirmationCode};
pub use config::Config;
pub use confirmation::{ChallengeConfig, ChallengeRegistry, SubmitOutcome};
pub use error::{Error, Result};
pub use escalation::{EscalationEvent, EscalationNotifier, EscalationResult, Escalator};
pub use store::{CheckInRepository, MemoryStore, Record, RecordStore};
