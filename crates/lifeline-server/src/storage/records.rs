//! [`RecordStore`] over the `records` table.

use async_trait::async_trait;
use lifeline_core::store::{
    PutCondition, Record, RecordStore, StoreError, ESCALATION_INDEX,
};
use tracing::{debug, warn};

use super::models::RecordRow;
use super::ServerDatabase;

fn unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Rows whose payload is not valid JSON are logged and skipped.
fn decode_rows(rows: Vec<RecordRow>) -> Vec<Record> {
    rows.into_iter()
        .filter_map(|row| match Record::try_from(row) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!(error = %e, "Skipping corrupt record row");
                None
            }
        })
        .collect()
}

fn to_i64(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

impl ServerDatabase {
    async fn current_version(&self, pk: &str, sk: &str) -> Result<Option<u64>, StoreError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT version FROM records WHERE pk = ? AND sk = ?")
                .bind(pk)
                .bind(sk)
                .fetch_optional(self.pool())
                .await
                .map_err(unavailable)?;
        Ok(version.and_then(|v| u64::try_from(v).ok()))
    }

    async fn conflict(
        &self,
        record: &Record,
        expected: Option<u64>,
    ) -> Result<Record, StoreError> {
        let actual = self
            .current_version(&record.partition_key, &record.sort_key)
            .await?;
        Err(StoreError::Conflict {
            partition_key: record.partition_key.clone(),
            sort_key: record.sort_key.clone(),
            expected,
            actual,
        })
    }
}

#[async_trait]
impl RecordStore for ServerDatabase {
    async fn get(
        &self,
        partition_key: &str,
        sort_key: &str,
    ) -> Result<Option<Record>, StoreError> {
        let row = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM records WHERE pk = ? AND sk = ?",
        )
        .bind(partition_key)
        .bind(sort_key)
        .fetch_optional(self.pool())
        .await
        .map_err(unavailable)?;
        row.map(Record::try_from).transpose()
    }

    async fn put(&self, mut record: Record, condition: PutCondition) -> Result<Record, StoreError> {
        let payload = record.payload.to_string();

        let version: Option<i64> = match condition {
            PutCondition::Any => sqlx::query_scalar(
                "INSERT INTO records (pk, sk, index_status, index_deadline, version, payload, updated_at) \
                 VALUES (?, ?, ?, ?, 1, ?, ?) \
                 ON CONFLICT(pk, sk) DO UPDATE SET \
                     index_status = excluded.index_status, \
                     index_deadline = excluded.index_deadline, \
                     version = records.version + 1, \
                     payload = excluded.payload, \
                     updated_at = excluded.updated_at \
                 RETURNING version",
            )
            .bind(&record.partition_key)
            .bind(&record.sort_key)
            .bind(&record.index_status)
            .bind(record.index_deadline)
            .bind(&payload)
            .bind(record.updated_at)
            .fetch_optional(self.pool())
            .await
            .map_err(unavailable)?,

            PutCondition::MustNotExist => sqlx::query_scalar(
                "INSERT INTO records (pk, sk, index_status, index_deadline, version, payload, updated_at) \
                 VALUES (?, ?, ?, ?, 1, ?, ?) \
                 ON CONFLICT(pk, sk) DO NOTHING \
                 RETURNING version",
            )
            .bind(&record.partition_key)
            .bind(&record.sort_key)
            .bind(&record.index_status)
            .bind(record.index_deadline)
            .bind(&payload)
            .bind(record.updated_at)
            .fetch_optional(self.pool())
            .await
            .map_err(unavailable)?,

            PutCondition::Version(expected) => sqlx::query_scalar(
                "UPDATE records SET \
                     index_status = ?, index_deadline = ?, version = version + 1, \
                     payload = ?, updated_at = ? \
                 WHERE pk = ? AND sk = ? AND version = ? \
                 RETURNING version",
            )
            .bind(&record.index_status)
            .bind(record.index_deadline)
            .bind(&payload)
            .bind(record.updated_at)
            .bind(&record.partition_key)
            .bind(&record.sort_key)
            .bind(to_i64(expected))
            .fetch_optional(self.pool())
            .await
            .map_err(unavailable)?,
        };

        let Some(version) = version else {
            let expected = match condition {
                PutCondition::Version(v) => Some(v),
                _ => None,
            };
            return self.conflict(&record, expected).await;
        };

        record.version = u64::try_from(version).unwrap_or_default();
        debug!(
            pk = %record.partition_key,
            sk = %record.sort_key,
            version = record.version,
            "Record stored"
        );
        Ok(record)
    }

    async fn delete(
        &self,
        partition_key: &str,
        sort_key: &str,
        expected_version: Option<u64>,
    ) -> Result<bool, StoreError> {
        let expected = expected_version.map(to_i64);
        let result = sqlx::query(
            "DELETE FROM records WHERE pk = ? AND sk = ? AND (? IS NULL OR version = ?)",
        )
        .bind(partition_key)
        .bind(sort_key)
        .bind(expected)
        .bind(expected)
        .execute(self.pool())
        .await
        .map_err(unavailable)?;
        if result.rows_affected() > 0 {
            return Ok(true);
        }

        if expected_version.is_some()
            && let Some(actual) = self.current_version(partition_key, sort_key).await?
        {
            return Err(StoreError::Conflict {
                partition_key: partition_key.to_string(),
                sort_key: sort_key.to_string(),
                expected: expected_version,
                actual: Some(actual),
            });
        }
        Ok(false)
    }

    async fn query_by_prefix(
        &self,
        partition_key: &str,
        sort_key_prefix: &str,
    ) -> Result<Vec<Record>, StoreError> {
        let prefix_len = i64::try_from(sort_key_prefix.chars().count()).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM records WHERE pk = ? AND substr(sk, 1, ?) = ? ORDER BY sk",
        )
        .bind(partition_key)
        .bind(prefix_len)
        .bind(sort_key_prefix)
        .fetch_all(self.pool())
        .await
        .map_err(unavailable)?;
        Ok(decode_rows(rows))
    }

    async fn query_by_index(
        &self,
        index_name: &str,
        status: &str,
        deadline_before: i64,
    ) -> Result<Vec<Record>, StoreError> {
        if index_name != ESCALATION_INDEX {
            return Err(StoreError::UnknownIndex(index_name.to_string()));
        }
        let rows = sqlx::query_as::<_, RecordRow>(
            "SELECT * FROM records \
             WHERE index_status = ? AND index_deadline < ? \
             ORDER BY index_deadline",
        )
        .bind(status)
        .bind(deadline_before)
        .fetch_all(self.pool())
        .await
        .map_err(unavailable)?;
        Ok(decode_rows(rows))
    }
}
