//! Core domain model for the member synchronizer: member rows, sync windows,
//! provider timestamps and the per-run log stack.

use std::fmt;
use std::sync::Arc;

use chrono::{Duration, Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "memsync-core";

/// Wire and storage format for every provider timestamp.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Column names of the member table, in provider order. `member_id` is the identity key.
pub const MEMBER_COLUMNS: [&str; 15] = [
    "member_id",
    "site_tag",
    "member_status",
    "email_address",
    "previous_member_status",
    "status_change_date",
    "member_user_name",
    "signup_date",
    "expire_date",
    "recurring_status",
    "recurring_next_date",
    "recurring_period",
    "recurring_periods_left",
    "recurring_amount",
    "next_recurring_amount",
];

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid timestamp {value:?}, expected YYYY-MM-DD HH:MM:SS")]
pub struct TimestampError {
    pub value: String,
}

pub fn parse_timestamp(value: &str) -> Result<NaiveDateTime, TimestampError> {
    NaiveDateTime::parse_from_str(value.trim(), TIMESTAMP_FORMAT).map_err(|_| TimestampError {
        value: value.to_string(),
    })
}

pub fn format_timestamp(value: NaiveDateTime) -> String {
    value.format(TIMESTAMP_FORMAT).to_string()
}

/// One synced member row. Every column stays text; the provider owns the semantics.
///
/// Columns absent from a response header are `None` and persist as NULL, so an
/// upsert always overwrites the whole row.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MemberRecord {
    pub member_id: String,
    pub site_tag: Option<String>,
    pub member_status: Option<String>,
    pub email_address: Option<String>,
    pub previous_member_status: Option<String>,
    pub status_change_date: Option<String>,
    pub member_user_name: Option<String>,
    pub signup_date: Option<String>,
    pub expire_date: Option<String>,
    pub recurring_status: Option<String>,
    pub recurring_next_date: Option<String>,
    pub recurring_period: Option<String>,
    pub recurring_periods_left: Option<String>,
    pub recurring_amount: Option<String>,
    pub next_recurring_amount: Option<String>,
}

impl MemberRecord {
    pub fn new(member_id: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            ..Default::default()
        }
    }

    pub fn is_member_column(name: &str) -> bool {
        MEMBER_COLUMNS.contains(&name)
    }

    /// Assigns a column by its lowercase name. Returns `false` for unknown columns.
    pub fn set_column(&mut self, name: &str, value: impl Into<String>) -> bool {
        let value = value.into();
        let slot = match name {
            "member_id" => {
                self.member_id = value;
                return true;
            }
            "site_tag" => &mut self.site_tag,
            "member_status" => &mut self.member_status,
            "email_address" => &mut self.email_address,
            "previous_member_status" => &mut self.previous_member_status,
            "status_change_date" => &mut self.status_change_date,
            "member_user_name" => &mut self.member_user_name,
            "signup_date" => &mut self.signup_date,
            "expire_date" => &mut self.expire_date,
            "recurring_status" => &mut self.recurring_status,
            "recurring_next_date" => &mut self.recurring_next_date,
            "recurring_period" => &mut self.recurring_period,
            "recurring_periods_left" => &mut self.recurring_periods_left,
            "recurring_amount" => &mut self.recurring_amount,
            "next_recurring_amount" => &mut self.next_recurring_amount,
            _ => return false,
        };
        *slot = Some(value);
        true
    }

    pub fn column(&self, name: &str) -> Option<&str> {
        match name {
            "member_id" => Some(self.member_id.as_str()),
            _ => self
                .optional_columns()
                .into_iter()
                .find(|(column, _)| *column == name)
                .and_then(|(_, value)| value),
        }
    }

    /// Every non-key column with its value, in `MEMBER_COLUMNS` order.
    pub fn optional_columns(&self) -> [(&'static str, Option<&str>); 14] {
        [
            ("site_tag", self.site_tag.as_deref()),
            ("member_status", self.member_status.as_deref()),
            ("email_address", self.email_address.as_deref()),
            ("previous_member_status", self.previous_member_status.as_deref()),
            ("status_change_date", self.status_change_date.as_deref()),
            ("member_user_name", self.member_user_name.as_deref()),
            ("signup_date", self.signup_date.as_deref()),
            ("expire_date", self.expire_date.as_deref()),
            ("recurring_status", self.recurring_status.as_deref()),
            ("recurring_next_date", self.recurring_next_date.as_deref()),
            ("recurring_period", self.recurring_period.as_deref()),
            ("recurring_periods_left", self.recurring_periods_left.as_deref()),
            ("recurring_amount", self.recurring_amount.as_deref()),
            ("next_recurring_amount", self.next_recurring_amount.as_deref()),
        ]
    }
}

/// Time range covered by one remote request: `changed_after = start`, `changed_before = end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", format_timestamp(self.start), format_timestamp(self.end))
    }
}

/// Window beginning at `start`, `increment` long and clamped to `ceiling`.
/// `None` once `start` has caught up with the ceiling.
pub fn next_window(start: NaiveDateTime, ceiling: NaiveDateTime, increment: Duration) -> Option<Window> {
    if start >= ceiling {
        return None;
    }
    let end = start
        .checked_add_signed(increment)
        .filter(|end| *end < ceiling)
        .unwrap_or(ceiling);
    Some(Window { start, end })
}

/// Contiguous windows covering `[start, ceiling]`, assuming every window commits.
pub fn plan_windows(start: NaiveDateTime, ceiling: NaiveDateTime, increment: Duration) -> Vec<Window> {
    let mut windows = Vec::new();
    if increment <= Duration::zero() {
        return windows;
    }
    let mut cursor = start;
    while let Some(window) = next_window(cursor, ceiling, increment) {
        cursor = window.end;
        windows.push(window);
    }
    windows
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Source of "now" in provider-local time, whole seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClock;

impl Clock for LocalClock {
    fn now(&self) -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }
}

/// Ordered, timestamped messages of a single run. Each entry is also emitted as a
/// tracing event so the durable log sink sees it regardless of the run outcome.
#[derive(Clone)]
pub struct RunLog {
    clock: Arc<dyn Clock>,
    lines: Vec<String>,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::with_clock(Arc::new(LocalClock))
    }
}

impl fmt::Debug for RunLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLog").field("lines", &self.lines).finish()
    }
}

impl RunLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamps every line with `clock` instead of the wall clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            lines: Vec::new(),
        }
    }

    pub fn info(&mut self, msg: impl AsRef<str>) {
        self.push(LogLevel::Info, msg.as_ref());
    }

    pub fn warn(&mut self, msg: impl AsRef<str>) {
        self.push(LogLevel::Warn, msg.as_ref());
    }

    pub fn error(&mut self, msg: impl AsRef<str>) {
        self.push(LogLevel::Error, msg.as_ref());
    }

    pub fn push(&mut self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Info => tracing::info!("{msg}"),
            LogLevel::Warn => tracing::warn!("{msg}"),
            LogLevel::Error => tracing::error!("{msg}"),
        }
        let stamp = format_timestamp(self.clock.now());
        self.lines.push(format!("{stamp} {msg}"));
    }

    pub fn lines(&self) -> &[String] {
        &self.lines
    }

    pub fn joined(&self) -> String {
        self.lines.join("\n")
    }

    pub fn into_lines(self) -> Vec<String> {
        self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(value: &str) -> NaiveDateTime {
        parse_timestamp(value).expect("timestamp")
    }

    #[test]
    fn windows_step_by_increment_and_clamp_to_ceiling() {
        let windows = plan_windows(
            ts("2024-01-01 00:00:00"),
            ts("2024-01-03 12:00:00"),
            Duration::days(1),
        );
        assert_eq!(
            windows,
            vec![
                Window { start: ts("2024-01-01 00:00:00"), end: ts("2024-01-02 00:00:00") },
                Window { start: ts("2024-01-02 00:00:00"), end: ts("2024-01-03 00:00:00") },
                Window { start: ts("2024-01-03 00:00:00"), end: ts("2024-01-03 12:00:00") },
            ]
        );
    }

    #[test]
    fn windows_are_contiguous_and_never_pass_ceiling() {
        let ceiling = ts("2024-03-09 07:13:55");
        let windows = plan_windows(ts("2024-02-27 18:30:00"), ceiling, Duration::days(3));
        for pair in windows.windows(2) {
            assert_eq!(pair[1].start, pair[0].end);
        }
        assert!(windows.iter().all(|w| w.end <= ceiling && w.start < w.end));
        assert_eq!(windows.last().map(|w| w.end), Some(ceiling));
    }

    #[test]
    fn window_ending_exactly_on_ceiling_is_final() {
        let window = next_window(
            ts("2024-01-01 00:00:00"),
            ts("2024-01-02 00:00:00"),
            Duration::days(1),
        )
        .expect("window");
        assert_eq!(window.end, ts("2024-01-02 00:00:00"));
        assert!(next_window(window.end, window.end, Duration::days(1)).is_none());
    }

    #[test]
    fn caught_up_checkpoint_plans_nothing() {
        let now = ts("2024-01-01 00:00:00");
        assert!(plan_windows(now, now, Duration::days(1)).is_empty());
        assert!(plan_windows(ts("2024-01-02 00:00:00"), now, Duration::days(1)).is_empty());
    }

    #[test]
    fn timestamps_use_provider_format() {
        let value = ts("2024-05-06 07:08:09");
        assert_eq!(format_timestamp(value), "2024-05-06 07:08:09");
        assert!(parse_timestamp("2024-05-06T07:08:09").is_err());
    }

    #[test]
    fn member_columns_round_trip_by_name() {
        let mut record = MemberRecord::new("42");
        assert!(record.set_column("email_address", "a@example.com"));
        assert!(!record.set_column("favourite_colour", "blue"));
        assert_eq!(record.column("member_id"), Some("42"));
        assert_eq!(record.column("email_address"), Some("a@example.com"));
        assert_eq!(record.column("site_tag"), None);
        assert!(MEMBER_COLUMNS[1..]
            .iter()
            .zip(record.optional_columns())
            .all(|(name, (column, _))| *name == column));
    }

    #[test]
    fn run_log_keeps_order_with_timestamps() {
        let mut log = RunLog::new();
        log.info("first");
        log.error("second");
        assert_eq!(log.lines().len(), 2);
        assert!(log.lines()[0].ends_with(" first"));
        assert!(log.joined().ends_with(" second"));
        assert!(parse_timestamp(&log.lines()[1][..19]).is_ok());
    }

    struct StoppedClock(NaiveDateTime);

    impl Clock for StoppedClock {
        fn now(&self) -> NaiveDateTime {
            self.0
        }
    }

    #[test]
    fn run_log_stamps_with_injected_clock() {
        let mut log = RunLog::with_clock(Arc::new(StoppedClock(ts("2030-02-03 04:05:06"))));
        log.warn("late");
        assert_eq!(log.lines(), ["2030-02-03 04:05:06 late".to_string()]);
    }

    #[test]
    fn local_clock_has_whole_seconds() {
        assert_eq!(LocalClock.now().nanosecond(), 0);
    }
}
