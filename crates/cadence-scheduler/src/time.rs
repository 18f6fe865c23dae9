//! Timestamp helpers shared by the ledger and the engine.
//!
//! Timestamps are persisted as fixed-width RFC 3339 text at millisecond
//! precision (`2026-10-15T09:00:00.000Z`), so a lexical comparison in SQL is
//! also a chronological one.

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};

/// Current UTC time truncated to what the ledger can store.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

pub fn to_sql(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn opt_to_sql(ts: Option<DateTime<Utc>>) -> Option<String> {
    ts.map(to_sql)
}

pub fn from_sql(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
}
