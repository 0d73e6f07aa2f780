//! Renders a session's note log into the message a client receives.
//!
//! Pure: no store access, no clock. Composing never changes session or note
//! state, so a draft can be edited and thrown away freely.

use chrono::NaiveDate;

use crate::types::{Session, SessionNote};

pub const BULLET: &str = "•";

/// "Month Day, Year", e.g. "March 1, 2024".
pub fn format_visit_date(date: NaiveDate) -> String {
    date.format("%B %-d, %Y").to_string()
}

pub fn compose(session: &Session, client_name: &str, notes: &[SessionNote]) -> String {
    let mut text = format!(
        "Hi {}, here are your visit notes from {}:\n\n",
        client_name.trim(),
        format_visit_date(session.calendar_date)
    );
    let lines: Vec<String> = notes
        .iter()
        .map(|note| format!("{} {}", BULLET, note.content))
        .collect();
    text.push_str(&lines.join("\n"));
    text
}
