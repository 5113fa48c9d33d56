//! Lifeline Device Library
//!
//! Device-side pieces of a check-in:
//! - Local wake-up triggers behind a notification-platform seam
//! - Trigger bookkeeping that survives restarts
//! - The check-in client that ties the lifecycle, the challenge protocol
//!   and the triggers together

pub mod client;
pub mod trigger;

pub use client::{CheckInClient, ClientConfig, Scheduled, TriggerStatus};
pub use trigger::{NotificationPlatform, TriggerScheduler};
