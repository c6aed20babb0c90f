//! Billing provider adapter: window request form + quoted-row member feed parser.

use std::collections::HashSet;

use async_trait::async_trait;
use memsync_core::{format_timestamp, MemberRecord, Window};
use memsync_storage::{FetchError, HttpClientConfig, HttpFetcher, RawResponse};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "memsync-adapters";

/// Separator between two quoted fields of a feed row.
pub const FIELD_DELIMITER: &str = "\",\"";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredentials {
    pub account_id: String,
    pub authorization: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchContext {
    pub run_id: Uuid,
}

/// Anything that can answer "which members changed inside this window".
#[async_trait]
pub trait MemberSource: Send + Sync {
    async fn fetch_window(
        &self,
        ctx: &FetchContext,
        window: &Window,
    ) -> Result<RawResponse, FetchError>;
}

/// Form fields for one window request, in the order the provider documents them.
pub fn window_form(credentials: &ProviderCredentials, window: &Window) -> Vec<(&'static str, String)> {
    vec![
        ("account_id", credentials.account_id.clone()),
        ("authorization", credentials.authorization.clone()),
        ("changed_after", format_timestamp(window.start)),
        ("changed_before", format_timestamp(window.end)),
    ]
}

/// Member report endpoint reached over [`HttpFetcher`].
#[derive(Debug)]
pub struct ProviderAdapter {
    http: HttpFetcher,
    endpoint: String,
    credentials: ProviderCredentials,
}

impl ProviderAdapter {
    pub fn new(
        http_config: HttpClientConfig,
        endpoint: impl Into<String>,
        credentials: ProviderCredentials,
    ) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(http_config)?,
            endpoint: endpoint.into(),
            credentials,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl MemberSource for ProviderAdapter {
    async fn fetch_window(
        &self,
        ctx: &FetchContext,
        window: &Window,
    ) -> Result<RawResponse, FetchError> {
        let form = window_form(&self.credentials, window);
        self.http.post_form(ctx.run_id, &self.endpoint, &form).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("line {line}: row is not wrapped in double quotes")]
    UnquotedRow { line: usize },
    #[error("line {line}: expected {expected} fields, found {found}")]
    FieldCount {
        line: usize,
        expected: usize,
        found: usize,
    },
    #[error("header repeats column {column:?}")]
    DuplicateColumn { column: String },
    #[error("header has no {column:?} column")]
    MissingColumn { column: String },
    #[error("line {line}: empty member_id")]
    EmptyMemberId { line: usize },
}

/// Records parsed from one response body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParsedFeed {
    pub records: Vec<MemberRecord>,
    /// Header columns that are not member table columns.
    pub ignored_columns: Vec<String>,
}

impl ParsedFeed {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Splits one feed row: the outer quotes are stripped and the remainder is cut on `","`.
///
/// Quotes inside a field are kept verbatim. A field that itself contains `","`
/// cannot be told apart from a delimiter; the resulting field-count mismatch is
/// reported by [`parse_member_feed`].
pub fn split_quoted_row(line: usize, row: &str) -> Result<Vec<String>, ParseError> {
    if row.len() < 2 || !row.starts_with('"') || !row.ends_with('"') {
        return Err(ParseError::UnquotedRow { line });
    }
    let inner = &row[1..row.len() - 1];
    Ok(inner.split(FIELD_DELIMITER).map(str::to_string).collect())
}

/// Parses a response body: first non-blank row is the header (lowercased),
/// every later row maps positionally onto it.
pub fn parse_member_feed(body: &str) -> Result<ParsedFeed, ParseError> {
    let mut rows = body
        .split('\n')
        .enumerate()
        .map(|(idx, row)| (idx + 1, row.strip_suffix('\r').unwrap_or(row)))
        .filter(|(_, row)| !row.trim().is_empty());

    let Some((header_line, header_row)) = rows.next() else {
        return Ok(ParsedFeed::default());
    };

    let header = split_quoted_row(header_line, header_row)?
        .into_iter()
        .map(|name| name.to_lowercase())
        .collect::<Vec<_>>();

    let mut seen = HashSet::new();
    for column in &header {
        if !seen.insert(column.as_str()) {
            return Err(ParseError::DuplicateColumn {
                column: column.clone(),
            });
        }
    }
    if !seen.contains("member_id") {
        return Err(ParseError::MissingColumn {
            column: "member_id".to_string(),
        });
    }

    let ignored_columns = header
        .iter()
        .filter(|column| !MemberRecord::is_member_column(column))
        .cloned()
        .collect();

    let mut records = Vec::new();
    for (line, row) in rows {
        let values = split_quoted_row(line, row)?;
        if values.len() != header.len() {
            return Err(ParseError::FieldCount {
                line,
                expected: header.len(),
                found: values.len(),
            });
        }

        let mut record = MemberRecord::default();
        for (column, value) in header.iter().zip(values) {
            record.set_column(column, value);
        }
        if record.member_id.is_empty() {
            return Err(ParseError::EmptyMemberId { line });
        }
        records.push(record);
    }

    Ok(ParsedFeed {
        records,
        ignored_columns,
    })
}
