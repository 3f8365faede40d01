use std::fmt;

use chrono::{NaiveDate, Utc};

/// Routing key for one tunnel session: public hostname label plus UTC day
///
/// The day bucket changes at midnight UTC, so the same label maps to a new
/// session every day.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TunnelIdentity {
    label: String,
    day: NaiveDate,
}

impl TunnelIdentity {
    pub fn new(label: impl Into<String>, day: NaiveDate) -> Self {
        Self {
            label: label.into(),
            day,
        }
    }

    /// Identity for a label in today's UTC bucket
    pub fn for_today(label: impl Into<String>) -> Self {
        Self::new(label, Utc::now().date_naive())
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn day(&self) -> NaiveDate {
        self.day
    }

    /// Stable string key, e.g. `myapp/2024-05-03`
    pub fn key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for TunnelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.label, self.day.format("%Y-%m-%d"))
    }
}
