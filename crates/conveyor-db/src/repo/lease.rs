//! Serial lock leases.

use async_trait::async_trait;
use conveyor_core::Lease;
use sqlx::PgPool;

use crate::DbError;

/// A set of `serial_locks` rows held under one holder id.
pub struct PgLease {
    pool: PgPool,
    keys: Vec<String>,
    holder: uuid::Uuid,
}

impl PgLease {
    pub(crate) fn new(pool: PgPool, keys: Vec<String>, holder: uuid::Uuid) -> Self {
        Self { pool, keys, holder }
    }
}

#[async_trait]
impl Lease for PgLease {
    fn keys(&self) -> &[String] {
        &self.keys
    }

    async fn release(self: Box<Self>) -> conveyor_core::Result<()> {
        // Rows already stolen after expiry belong to someone else.
        sqlx::query("DELETE FROM serial_locks WHERE key = ANY($1) AND holder = $2")
            .bind(&self.keys)
            .bind(self.holder)
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(())
    }
}
