//! Version and build history repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{
    Build, BuildId, BuildStatus, BuildVersions, Config, Lease, PipelineStores, ResolvedInput,
    ResourceVersion, VersionStore,
};
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use super::lease::PgLease;
use crate::{DbError, DbResult};

const BUILD_COLUMNS: &str =
    "id, job_name, number, status, is_scheduled, created_at, started_at";

#[derive(Debug, sqlx::FromRow)]
struct BuildRow {
    id: i64,
    job_name: String,
    number: i64,
    status: String,
    is_scheduled: bool,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for Build {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        let status: BuildStatus = row
            .status
            .parse()
            .map_err(|_| DbError::InvalidRow(format!("build {} has status '{}'", row.id, row.status)))?;

        Ok(Build {
            id: BuildId::new(row.id),
            job_name: row.job_name,
            number: row.number,
            status,
            is_scheduled: row.is_scheduled,
            created_at: row.created_at,
            started_at: row.started_at,
            inputs: Vec::new(),
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct VersionRow {
    id: i64,
    resource_name: String,
    version: serde_json::Value,
    enabled: bool,
}

impl TryFrom<VersionRow> for ResourceVersion {
    type Error = DbError;

    fn try_from(row: VersionRow) -> DbResult<Self> {
        Ok(ResourceVersion {
            resource: row.resource_name,
            sequence: row.id,
            version: serde_json::from_value(row.version)?,
            enabled: row.enabled,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BuildVersionRow {
    build_id: i64,
    #[sqlx(flatten)]
    version: VersionRow,
}

#[derive(Debug, sqlx::FromRow)]
struct BuildInputRow {
    build_id: i64,
    name: String,
    params: serde_json::Value,
    #[sqlx(flatten)]
    version: VersionRow,
}

/// PostgreSQL implementation of VersionStore, scoped to one pipeline.
pub struct PgVersionStore {
    pool: PgPool,
    pipeline_id: uuid::Uuid,
    lease: Duration,
}

impl PgVersionStore {
    pub fn new(pool: PgPool, pipeline_id: uuid::Uuid, lease: Duration) -> Self {
        Self {
            pool,
            pipeline_id,
            lease,
        }
    }

    async fn builds_with_status(&self, jobs: &[String], status: BuildStatus) -> DbResult<Vec<Build>> {
        let rows = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE pipeline_id = $1 AND job_name = ANY($2) AND status = $3 ORDER BY id",
            BUILD_COLUMNS
        ))
        .bind(self.pipeline_id)
        .bind(jobs)
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        let builds = rows
            .into_iter()
            .map(Build::try_from)
            .collect::<DbResult<Vec<_>>>()?;
        self.attach_inputs(builds).await
    }

    async fn attach_inputs(&self, mut builds: Vec<Build>) -> DbResult<Vec<Build>> {
        if builds.is_empty() {
            return Ok(builds);
        }

        let ids: Vec<i64> = builds.iter().map(|b| b.id.as_i64()).collect();
        let rows = sqlx::query_as::<_, BuildInputRow>(
            r#"
            SELECT i.build_id, i.name, i.params, v.id, v.resource_name, v.version, v.enabled
            FROM build_inputs i
            JOIN resource_versions v ON v.id = i.resource_version_id
            WHERE i.build_id = ANY($1)
            ORDER BY i.build_id, i.name
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_build: HashMap<i64, Vec<ResolvedInput>> = HashMap::new();
        for row in rows {
            let params = match row.params {
                serde_json::Value::Object(map) => map,
                _ => Default::default(),
            };
            let version = ResourceVersion::try_from(row.version)?;
            by_build.entry(row.build_id).or_default().push(ResolvedInput {
                name: row.name,
                resource: version.resource.clone(),
                version,
                params,
            });
        }

        for build in &mut builds {
            build.inputs = by_build.remove(&build.id.as_i64()).unwrap_or_default();
        }
        Ok(builds)
    }

    async fn saved_config(&self) -> DbResult<Config> {
        let value: serde_json::Value =
            sqlx::query_scalar("SELECT config FROM pipelines WHERE id = $1")
                .bind(self.pipeline_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| DbError::NotFound(format!("pipeline {}", self.pipeline_id)))?;
        Ok(serde_json::from_value(value)?)
    }

    async fn try_lock(&self, keys: &[String]) -> DbResult<Option<PgLease>> {
        let mut keys = keys.to_vec();
        keys.sort();
        keys.dedup();

        let holder = uuid::Uuid::now_v7();
        let mut tx = self.pool.begin().await?;

        for key in &keys {
            // An existing row is only taken over once its lease has run out.
            let taken: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO serial_locks (key, holder, expires_at)
                VALUES ($1, $2, NOW() + make_interval(secs => $3))
                ON CONFLICT (key) DO UPDATE
                    SET holder = EXCLUDED.holder, expires_at = EXCLUDED.expires_at
                    WHERE serial_locks.expires_at < NOW()
                RETURNING key
                "#,
            )
            .bind(key)
            .bind(holder)
            .bind(self.lease.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await?;

            if taken.is_none() {
                tx.rollback().await?;
                return Ok(None);
            }
        }

        tx.commit().await?;
        Ok(Some(PgLease::new(self.pool.clone(), keys, holder)))
    }

    async fn start(&self, build: BuildId, inputs: &[ResolvedInput]) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE builds SET status = 'started', is_scheduled = TRUE, started_at = NOW()
            WHERE id = $1 AND pipeline_id = $2 AND status = 'pending'
            "#,
        )
        .bind(build.as_i64())
        .bind(self.pipeline_id)
        .execute(&mut *tx)
        .await?;

        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        for input in inputs {
            sqlx::query(
                r#"
                INSERT INTO build_inputs (build_id, name, resource_version_id, params)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(build.as_i64())
            .bind(&input.name)
            .bind(input.version.sequence)
            .bind(serde_json::Value::Object(input.params.clone()))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(true)
    }
}

#[async_trait]
impl VersionStore for PgVersionStore {
    async fn latest_version(&self, resource: &str) -> conveyor_core::Result<Option<ResourceVersion>> {
        let row = sqlx::query_as::<_, VersionRow>(
            r#"
            SELECT id, resource_name, version, enabled FROM resource_versions
            WHERE pipeline_id = $1 AND resource_name = $2 AND enabled
            ORDER BY id DESC
            LIMIT 1
            "#,
        )
        .bind(self.pipeline_id)
        .bind(resource)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(row.map(ResourceVersion::try_from).transpose()?)
    }

    async fn versions_used_by_successful_builds(
        &self,
        job: &str,
    ) -> conveyor_core::Result<Vec<BuildVersions>> {
        let rows = sqlx::query_as::<_, BuildVersionRow>(
            r#"
            SELECT b.id AS build_id, v.id, v.resource_name, v.version, v.enabled
            FROM builds b
            JOIN (
                SELECT build_id, resource_version_id FROM build_inputs
                UNION
                SELECT build_id, resource_version_id FROM build_outputs
            ) used ON used.build_id = b.id
            JOIN resource_versions v ON v.id = used.resource_version_id
            WHERE b.pipeline_id = $1 AND b.job_name = $2 AND b.status = 'succeeded'
            ORDER BY b.id, v.id
            "#,
        )
        .bind(self.pipeline_id)
        .bind(job)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let mut result: Vec<BuildVersions> = Vec::new();
        for row in rows {
            let build_id = BuildId::new(row.build_id);
            let version = ResourceVersion::try_from(row.version)?;
            match result.last_mut() {
                Some(last) if last.build_id == build_id => last.versions.push(version),
                _ => result.push(BuildVersions {
                    build_id,
                    versions: vec![version],
                }),
            }
        }
        Ok(result)
    }

    async fn pending_builds(&self, job: &str) -> conveyor_core::Result<Vec<Build>> {
        Ok(self
            .builds_with_status(&[job.to_string()], BuildStatus::Pending)
            .await?)
    }

    async fn running_builds(&self, job: &str) -> conveyor_core::Result<Vec<Build>> {
        Ok(self
            .builds_with_status(&[job.to_string()], BuildStatus::Started)
            .await?)
    }

    async fn running_builds_by_serial_group(
        &self,
        job: &str,
        groups: &[String],
    ) -> conveyor_core::Result<Vec<Build>> {
        let config = self.saved_config().await?;
        let mut jobs = config.jobs_in_serial_groups(groups);
        if !jobs.iter().any(|j| j == job) {
            jobs.push(job.to_string());
        }
        Ok(self.builds_with_status(&jobs, BuildStatus::Started).await?)
    }

    async fn latest_build(&self, job: &str) -> conveyor_core::Result<Option<Build>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {} FROM builds WHERE pipeline_id = $1 AND job_name = $2 AND status <> 'pending' ORDER BY id DESC LIMIT 1",
            BUILD_COLUMNS
        ))
        .bind(self.pipeline_id)
        .bind(job)
        .fetch_optional(&self.pool)
        .await
        .map_err(DbError::from)?;

        match row {
            Some(row) => {
                let build = Build::try_from(row)?;
                Ok(self.attach_inputs(vec![build]).await?.pop())
            }
            None => Ok(None),
        }
    }

    async fn create_pending_build(&self, job: &str) -> conveyor_core::Result<Build> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            INSERT INTO builds (pipeline_id, job_name, number, status)
            SELECT $1, $2, COALESCE(MAX(number), 0) + 1, 'pending'
            FROM builds WHERE pipeline_id = $1 AND job_name = $2
            RETURNING {}
            "#,
            BUILD_COLUMNS
        ))
        .bind(self.pipeline_id)
        .bind(job)
        .fetch_one(&self.pool)
        .await
        .map_err(DbError::from)?;

        Ok(Build::try_from(row)?)
    }

    async fn start_build(
        &self,
        build: BuildId,
        inputs: &[ResolvedInput],
    ) -> conveyor_core::Result<bool> {
        Ok(self.start(build, inputs).await?)
    }

    async fn acquire_serial_lock(
        &self,
        keys: &[String],
    ) -> conveyor_core::Result<Option<Box<dyn Lease>>> {
        let lease = self.try_lock(keys).await?;
        Ok(lease.map(|l| Box::new(l) as Box<dyn Lease>))
    }
}

/// Hands out [`PgVersionStore`]s for saved pipelines.
#[derive(Clone)]
pub struct PgPipelineStores {
    pool: PgPool,
    lease: Duration,
}

impl PgPipelineStores {
    pub fn new(pool: PgPool, lease: Duration) -> Self {
        Self { pool, lease }
    }
}

#[async_trait]
impl PipelineStores for PgPipelineStores {
    async fn for_pipeline(&self, pipeline: &str) -> conveyor_core::Result<Arc<dyn VersionStore>> {
        let id: uuid::Uuid = sqlx::query_scalar("SELECT id FROM pipelines WHERE name = $1")
            .bind(pipeline)
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", pipeline)))?;

        Ok(Arc::new(PgVersionStore::new(self.pool.clone(), id, self.lease)))
    }
}
