//! Postgres-backed checkpoint store and store connection.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use memsync_core::{format_timestamp, parse_timestamp};
use memsync_storage::{StoreError, TimestampStore};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::sink::{MemberSink, PgMemberSink};

/// Key of the single `sync_params` row holding the sync checkpoint.
pub const CHECKPOINT_PARAM: &str = "last_update";

/// One keyed row of `sync_params`. Writes only update; the row is seeded by migration.
#[derive(Debug, Clone)]
pub struct PgParamStore {
    pool: PgPool,
    param: String,
}

impl PgParamStore {
    pub fn new(pool: PgPool, param: impl Into<String>) -> Self {
        Self {
            pool,
            param: param.into(),
        }
    }

    pub fn checkpoint(pool: PgPool) -> Self {
        Self::new(pool, CHECKPOINT_PARAM)
    }

    pub fn param(&self) -> &str {
        &self.param
    }
}

#[async_trait]
impl TimestampStore for PgParamStore {
    async fn load(&self) -> Result<Option<NaiveDateTime>, StoreError> {
        let value: Option<String> =
            sqlx::query_scalar("SELECT value FROM sync_params WHERE param = $1")
                .bind(&self.param)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("reading sync_params row {:?}", self.param))?;
        match value {
            Some(value) => Ok(Some(parse_timestamp(&value)?)),
            None => Ok(None),
        }
    }

    async fn store(&self, value: NaiveDateTime) -> Result<(), StoreError> {
        let result = sqlx::query("UPDATE sync_params SET value = $1 WHERE param = $2")
            .bind(format_timestamp(value))
            .bind(&self.param)
            .execute(&self.pool)
            .await
            .with_context(|| format!("updating sync_params row {:?}", self.param))?;
        if result.rows_affected() != 1 {
            return Err(anyhow!(
                "sync_params row {:?} missing; run migrations to seed it",
                self.param
            )
            .into());
        }
        Ok(())
    }
}

/// Store handles held for the duration of one run.
#[derive(Clone)]
pub struct SyncStores {
    pub checkpoint: Arc<dyn TimestampStore>,
    pub sink: Arc<dyn MemberSink>,
}

#[async_trait]
pub trait StoreConnector: Send + Sync {
    async fn connect(&self) -> anyhow::Result<SyncStores>;
}

#[derive(Debug, Clone)]
pub struct PgConnector {
    database_url: String,
    max_connections: u32,
}

impl PgConnector {
    pub fn new(database_url: impl Into<String>, max_connections: u32) -> Self {
        Self {
            database_url: database_url.into(),
            max_connections,
        }
    }
}

#[async_trait]
impl StoreConnector for PgConnector {
    async fn connect(&self) -> anyhow::Result<SyncStores> {
        let pool = connect_pool(&self.database_url, self.max_connections).await?;
        Ok(SyncStores {
            checkpoint: Arc::new(PgParamStore::checkpoint(pool.clone())),
            sink: Arc::new(PgMemberSink::new(pool)),
        })
    }
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("running migrations")
}
