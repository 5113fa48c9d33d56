//! SQLite storage for the Lifeline server.
//!
//! Backs the generic record store (check-ins and contacts) and the
//! per-channel delivery ledger used to retry failed notifications.

mod deliveries;
mod models;
mod records;


pub use lifeline_core::db::DatabaseError;
pub use models::{DeliveryAttemptRow, DeliveryStatus, RecordRow};

lifeline_core::define_database!(ServerDatabase, "Server database migrations complete");
