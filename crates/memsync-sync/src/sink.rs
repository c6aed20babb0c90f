//! Upsert sink: whole-row, last-write-wins persistence of member records.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;
use memsync_core::{MemberRecord, MEMBER_COLUMNS};
use sqlx::{PgPool, Postgres, QueryBuilder};
use thiserror::Error;

/// Rows per INSERT statement; 15 binds each keeps well under the Postgres bind limit.
pub const UPSERT_CHUNK_ROWS: usize = 1000;

pub const MEMBERS_TABLE: &str = "members";

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("upsert failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[async_trait]
pub trait MemberSink: Send + Sync {
    /// Writes the whole batch or nothing. Returns the number of rows written.
    async fn commit(&self, records: &[MemberRecord]) -> Result<u64, SinkError>;
}

/// Keeps only the last occurrence of each member id, in batch order.
/// A single upsert statement cannot touch the same key twice.
pub fn dedupe_last_wins(records: &[MemberRecord]) -> Vec<&MemberRecord> {
    let mut last_index = HashMap::with_capacity(records.len());
    for (idx, record) in records.iter().enumerate() {
        last_index.insert(record.member_id.as_str(), idx);
    }
    records
        .iter()
        .enumerate()
        .filter(|(idx, record)| last_index.get(record.member_id.as_str()) == Some(idx))
        .map(|(_, record)| record)
        .collect()
}

pub fn upsert_conflict_clause() -> String {
    let assignments = MEMBER_COLUMNS[1..]
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ON CONFLICT (member_id) DO UPDATE SET {assignments}")
}

fn upsert_statement<'a>(rows: &[&'a MemberRecord]) -> QueryBuilder<'a, Postgres> {
    let mut builder = QueryBuilder::new(format!(
        "INSERT INTO {MEMBERS_TABLE} ({}) ",
        MEMBER_COLUMNS.join(", ")
    ));
    builder.push_values(rows.iter().copied(), |mut row, record: &'a MemberRecord| {
        row.push_bind(record.member_id.as_str());
        for (_, value) in record.optional_columns() {
            row.push_bind(value);
        }
    });
    builder.push(upsert_conflict_clause());
    builder
}

#[derive(Debug, Clone)]
pub struct PgMemberSink {
    pool: PgPool,
}

impl PgMemberSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MemberSink for PgMemberSink {
    async fn commit(&self, records: &[MemberRecord]) -> Result<u64, SinkError> {
        if records.is_empty() {
            return Ok(0);
        }
        let rows = dedupe_last_wins(records);

        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;
        for chunk in rows.chunks(UPSERT_CHUNK_ROWS) {
            let result = upsert_statement(chunk).build().execute(&mut *tx).await?;
            affected += result.rows_affected();
        }
        tx.commit().await?;
        Ok(affected)
    }
}

/// In-process member table with the same overwrite-by-key semantics.
#[derive(Debug, Default)]
pub struct MemoryMemberSink {
    rows: Mutex<BTreeMap<String, MemberRecord>>,
}

impl MemoryMemberSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<MemberRecord> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn get(&self, member_id: &str) -> Option<MemberRecord> {
        self.rows
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(member_id)
            .cloned()
    }
}

#[async_trait]
impl MemberSink for MemoryMemberSink {
    async fn commit(&self, records: &[MemberRecord]) -> Result<u64, SinkError> {
        let mut rows = self.rows.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        for record in records {
            rows.insert(record.member_id.clone(), record.clone());
        }
        Ok(records.len() as u64)
    }
}
