//! Pipeline config repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{Config, ConfigStore, ConfigVersion};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::{DbError, DbResult};

/// A pipeline record in the database.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct PipelineRecord {
    pub id: uuid::Uuid,
    pub name: String,
    pub config: serde_json::Value,
    pub config_version: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// PostgreSQL implementation of ConfigStore.
pub struct PgConfigRepo {
    pool: PgPool,
}

impl PgConfigRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get_by_name(&self, name: &str) -> DbResult<Option<PipelineRecord>> {
        let record = sqlx::query_as::<_, PipelineRecord>("SELECT * FROM pipelines WHERE name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    async fn save(
        &self,
        name: &str,
        config: &Config,
        expected: ConfigVersion,
    ) -> DbResult<ConfigVersion> {
        let value = serde_json::to_value(config)?;
        let next = expected.next();

        let mut tx = self.pool.begin().await?;

        let current: Option<i64> = sqlx::query_scalar(
            "SELECT config_version FROM pipelines WHERE name = $1 FOR UPDATE",
        )
        .bind(name)
        .fetch_optional(&mut *tx)
        .await?;

        let found = current.unwrap_or(0);
        if found != expected.as_i64() {
            tx.rollback().await?;
            return Err(DbError::VersionMismatch {
                expected: expected.as_i64(),
                found,
            });
        }

        let written = if current.is_none() {
            // A concurrent first save hits the unique name and writes nothing.
            sqlx::query(
                r#"
                INSERT INTO pipelines (id, name, config, config_version, created_at, updated_at)
                VALUES ($1, $2, $3, $4, NOW(), NOW())
                ON CONFLICT (name) DO NOTHING
                "#,
            )
            .bind(uuid::Uuid::now_v7())
            .bind(name)
            .bind(&value)
            .bind(next.as_i64())
            .execute(&mut *tx)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE pipelines SET config = $2, config_version = $3, updated_at = NOW()
                WHERE name = $1 AND config_version = $4
                "#,
            )
            .bind(name)
            .bind(&value)
            .bind(next.as_i64())
            .bind(expected.as_i64())
            .execute(&mut *tx)
            .await?
        };

        if written.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(DbError::Conflict(format!(
                "pipeline '{}' was saved concurrently",
                name
            )));
        }

        tx.commit().await?;
        Ok(next)
    }
}

#[async_trait]
impl ConfigStore for PgConfigRepo {
    async fn list_pipelines(&self) -> conveyor_core::Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>("SELECT name FROM pipelines ORDER BY name")
            .fetch_all(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(names)
    }

    async fn get_config(&self, pipeline: &str) -> conveyor_core::Result<(Config, ConfigVersion)> {
        match self.get_by_name(pipeline).await? {
            Some(record) => {
                let config: Config =
                    serde_json::from_value(record.config).map_err(DbError::from)?;
                Ok((config, ConfigVersion::new(record.config_version)))
            }
            None => Ok((Config::default(), ConfigVersion::default())),
        }
    }

    async fn save_config(
        &self,
        pipeline: &str,
        config: &Config,
        expected: ConfigVersion,
    ) -> conveyor_core::Result<ConfigVersion> {
        Ok(self.save(pipeline, config, expected).await?)
    }
}
