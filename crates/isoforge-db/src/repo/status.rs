//! Status channel backed by Postgres.

use async_trait::async_trait;
use isoforge_core::channel::{StatusChannel, StatusRecord};
use isoforge_core::{BuildId, Error, Result};
use sqlx::PgPool;

/// One overwritable row per build in `status_records`.
pub struct PgStatusChannel {
    pool: PgPool,
}

impl PgStatusChannel {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage(err: sqlx::Error) -> Error {
    Error::Storage(err.to_string())
}

#[async_trait]
impl StatusChannel for PgStatusChannel {
    async fn publish(&self, build_id: BuildId, record: &StatusRecord) -> Result<()> {
        let value = serde_json::to_value(record).map_err(|e| Error::Internal(e.to_string()))?;
        sqlx::query(
            r#"
            INSERT INTO status_records (build_id, record, written_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (build_id) DO UPDATE
            SET record = EXCLUDED.record, written_at = EXCLUDED.written_at
            "#,
        )
        .bind(build_id.as_uuid())
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    async fn latest(&self, build_id: BuildId) -> Result<Option<StatusRecord>> {
        let value: Option<serde_json::Value> =
            sqlx::query_scalar("SELECT record FROM status_records WHERE build_id = $1")
                .bind(build_id.as_uuid())
                .fetch_optional(&self.pool)
                .await
                .map_err(storage)?;
        value
            .map(|v| {
                serde_json::from_value(v).map_err(|e| {
                    Error::Storage(format!("status record for build {build_id}: {e}"))
                })
            })
            .transpose()
    }

    async fn clear(&self, build_id: BuildId) -> Result<()> {
        sqlx::query("DELETE FROM status_records WHERE build_id = $1")
            .bind(build_id.as_uuid())
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }
}
