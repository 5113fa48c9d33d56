//! Delivery ledger queries.

use async_trait::async_trait;
use lifeline_core::escalation::{DeliveryLedger, DeliveryOutcome, DeliveryReport, DeliveryTarget};

use super::models::{DeliveryAttemptRow, DeliveryStatus};
use super::{DatabaseError, ServerDatabase};

impl ServerDatabase {
    // =========================================================================
    // Delivery attempt queries
    // =========================================================================

    /// Record one attempt for a target. The first attempt inserts the row,
    /// later ones bump `attempts` and overwrite the status.
    pub async fn record_delivery(
        &self,
        user_id: &str,
        check_in_id: &str,
        target: &DeliveryTarget,
        outcome: &DeliveryOutcome,
        now: i64,
    ) -> Result<(), DatabaseError> {
        let (status, error) = match outcome {
            DeliveryOutcome::Delivered => (DeliveryStatus::Delivered, None),
            DeliveryOutcome::Failed(message) => (DeliveryStatus::Failed, Some(message.as_str())),
            DeliveryOutcome::Rejected(message) => {
                (DeliveryStatus::Rejected, Some(message.as_str()))
            }
        };

        sqlx::query(
            "INSERT INTO delivery_attempts \
                 (check_in_id, user_id, target_id, channel, contact_id, contact_name, address, \
                  status, attempts, last_error, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?) \
             ON CONFLICT(user_id, check_in_id, target_id, channel) DO UPDATE SET \
                 status = excluded.status, \
                 attempts = delivery_attempts.attempts + 1, \
                 last_error = excluded.last_error, \
                 updated_at = excluded.updated_at",
        )
        .bind(check_in_id)
        .bind(user_id)
        .bind(&target.target_id)
        .bind(target.channel.as_str())
        .bind(&target.contact_id)
        .bind(&target.name)
        .bind(&target.address)
        .bind(status.as_str())
        .bind(error)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Record every attempt of a dispatch round.
    pub async fn record_delivery_report(
        &self,
        user_id: &str,
        check_in_id: &str,
        report: &DeliveryReport,
        now: i64,
    ) -> Result<(), DatabaseError> {
        for attempt in &report.attempts {
            self.record_delivery(user_id, check_in_id, &attempt.target, &attempt.outcome, now)
                .await?;
        }
        Ok(())
    }

    /// Failed deliveries that still have attempts left, oldest first.
    pub async fn retryable_deliveries(
        &self,
        max_attempts: u32,
    ) -> Result<Vec<DeliveryAttemptRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, DeliveryAttemptRow>(
            "SELECT * FROM delivery_attempts \
             WHERE status = ? AND attempts < ? \
             ORDER BY updated_at ASC",
        )
        .bind(DeliveryStatus::Failed.as_str())
        .bind(i64::from(max_attempts))
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }

    pub async fn deliveries_for(
        &self,
        user_id: &str,
        check_in_id: &str,
    ) -> Result<Vec<DeliveryAttemptRow>, DatabaseError> {
        let rows = sqlx::query_as::<_, DeliveryAttemptRow>(
            "SELECT * FROM delivery_attempts \
             WHERE user_id = ? AND check_in_id = ? \
             ORDER BY target_id, channel",
        )
        .bind(user_id)
        .bind(check_in_id)
        .fetch_all(self.pool())
        .await?;

        Ok(rows)
    }
}

#[async_trait]
impl DeliveryLedger for ServerDatabase {
    async fn record_report(
        &self,
        user_id: &str,
        check_in_id: &str,
        report: &DeliveryReport,
        now: i64,
    ) -> Result<(), DatabaseError> {
        self.record_delivery_report(user_id, check_in_id, report, now)
            .await
    }
}
