use chrono::{DateTime, FixedOffset, Offset, Utc};

use crate::constants::TIMESTAMP_FORMAT;

/// Wall clock pinned to the configured UTC offset used for `created_at`.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    offset: FixedOffset,
}

impl RunClock {
    /// Out-of-range offsets fall back to UTC; config validation rejects them first.
    pub fn new(utc_offset_hours: i32) -> Self {
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600).unwrap_or_else(|| Utc.fix());
        Self { offset }
    }

    pub fn timestamp(&self) -> String {
        self.format(Utc::now())
    }

    pub fn format(&self, at: DateTime<Utc>) -> String {
        at.with_timezone(&self.offset).format(TIMESTAMP_FORMAT).to_string()
    }
}
