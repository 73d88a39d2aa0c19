//! Human-readable output for records and view entries.

use chrono::{DateTime, Duration, Utc};
use shelf_core::{Entry, Record};

pub const ID_WIDTH: usize = 26;
pub const TITLE_WIDTH: usize = 28;

pub fn header() -> String { format!("{:<iw$} {:<tw$} AGE", "ID", "TITLE", iw = ID_WIDTH, tw = TITLE_WIDTH) }

pub fn record_row(r: &Record, now: DateTime<Utc>) -> String {
    let title = truncate(&r.title, TITLE_WIDTH);
    format!("{:<iw$} {:<tw$} {}", r.id.as_str(), title, age(r.created_at, now), iw = ID_WIDTH, tw = TITLE_WIDTH)
}

/// Key and label used by `watch` diffs. Provisional entries have no id yet.
pub fn entry_label(e: &Entry) -> (String, String) {
    match e {
        Entry::Confirmed(r) => (r.id.to_string(), r.title.clone()),
        Entry::Provisional(p) => (format!("~{}", p.token), format!("{} (pending)", p.title)),
    }
}

pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('…');
    out
}

/// Two most significant units, e.g. `3d4h`, `2h15m`, `42s`. Clock skew reads as `0s`.
pub fn age(created: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(created).max(Duration::zero());
    let (days, hours, mins) = (elapsed.num_days(), elapsed.num_hours() % 24, elapsed.num_minutes() % 60);
    if days > 0 {
        format!("{}d{}h", days, hours)
    } else if hours > 0 {
        format!("{}h{}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", elapsed.num_seconds())
    }
}
