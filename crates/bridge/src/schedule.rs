//! Daily report timing in a fixed UTC offset.

use std::time::Duration;

use time::{Date, OffsetDateTime, Time, UtcOffset};

use crate::config::ReportWindow;

impl ReportWindow {
    /// The calendar day a report produced on `today` covers.
    pub fn resolve(self, today: Date) -> Date {
        match self {
            ReportWindow::Today => today,
            ReportWindow::Yesterday => today.previous_day().unwrap_or(today),
        }
    }
}

/// Current wall-clock time in `offset`.
pub fn now_in(offset: UtcOffset) -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(offset)
}

/// Next occurrence of `at` strictly after `now`, in `now`'s offset.
pub fn next_run(now: OffsetDateTime, at: Time) -> OffsetDateTime {
    let candidate = now.replace_time(at);
    if candidate > now {
        candidate
    } else {
        candidate + time::Duration::days(1)
    }
}

/// Time to wait from `now` until `next`; zero if `next` has passed.
pub fn delay_until(now: OffsetDateTime, next: OffsetDateTime) -> Duration {
    let d = next - now;
    if d.is_negative() {
        Duration::ZERO
    } else {
        d.unsigned_abs()
    }
}

// ===========================================================================
// Tests
// ===========================================================================
