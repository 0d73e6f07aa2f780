//! The single freshness rule for open sessions.
//!
//! Every site that decides whether an open session may be carried forward
//! (resolution, open-for-view, the daemon sweep, the active-sessions listing)
//! must go through [`is_stale`]. A session is fresh when its calendar date is
//! on or after the UTC date of `now - 24h`; the hour it was opened does not
//! matter.

use chrono::{DateTime, Duration, NaiveDate, Utc};

use crate::types::Session;

pub const FRESHNESS_WINDOW_HOURS: i64 = 24;

/// Earliest calendar date that still counts as fresh at `now`.
pub fn freshness_floor(now: DateTime<Utc>) -> NaiveDate {
    (now - Duration::hours(FRESHNESS_WINDOW_HOURS)).date_naive()
}

pub fn is_fresh_date(calendar_date: NaiveDate, now: DateTime<Utc>) -> bool {
    calendar_date >= freshness_floor(now)
}

/// True for an open session that must be auto-expired. Closed sessions are never stale.
pub fn is_stale(session: &Session, now: DateTime<Utc>) -> bool {
    session.is_open() && !is_fresh_date(session.calendar_date, now)
}
