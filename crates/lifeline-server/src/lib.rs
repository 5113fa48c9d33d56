//! Lifeline server library.
//!
//! `SQLite`-backed record store, delivery ledger, contact notifiers and the
//! reconciler that escalates overdue check-ins.

pub mod notify;
pub mod reconciler;
pub mod storage;

pub use reconciler::{Reconciler, SweepReport};
pub use storage::ServerDatabase;
