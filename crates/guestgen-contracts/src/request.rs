use chrono::{DateTime, Local, TimeZone};
use uuid::Uuid;

/// Per-call request identity: built fresh for every outbound request and never reused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestMetadata {
    pub timestamp: i64,
    pub request_id: String,
    pub timezone: String,
}

impl RequestMetadata {
    pub fn generate() -> Self {
        Self::at(&Local::now())
    }

    pub fn at<Tz>(now: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: std::fmt::Display,
    {
        Self {
            timestamp: now.timestamp_millis(),
            request_id: Uuid::new_v4().to_string(),
            timezone: browser_date_string(now),
        }
    }

    pub fn timestamp_secs(&self) -> i64 {
        self.timestamp.div_euclid(1000)
    }
}

/// Formats like a browser's `Date#toString` head: `Sat Oct 18 2026 23:47:00 GMT+0800`.
pub fn browser_date_string<Tz>(now: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    format!(
        "{} GMT{}",
        now.format("%a %b %d %Y %H:%M:%S"),
        now.format("%z")
    )
}
