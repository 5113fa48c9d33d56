//! Where dispatch outcomes are kept for later retries.

use async_trait::async_trait;

use super::DeliveryReport;
use crate::db::DatabaseError;

/// Persists the per-channel outcome of a dispatch round so failed channels
/// can be retried by whoever owns the ledger.
#[async_trait]
pub trait DeliveryLedger: Send + Sync {
    async fn record_report(
        &self,
        user_id: &str,
        check_in_id: &str,
        report: &DeliveryReport,
        now: i64,
    ) -> Result<(), DatabaseError>;
}
