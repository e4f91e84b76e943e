use std::fmt;

use time::OffsetDateTime;

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;
const MS_PER_DAY: i64 = 24 * MS_PER_HOUR;

/// Decomposed time left until a counter's target instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimeRemaining {
    pub days: i64,
    pub hours: i64,
    pub minutes: i64,
    pub seconds: i64,
    pub is_expired: bool,
}

impl TimeRemaining {
    pub const EXPIRED: TimeRemaining = TimeRemaining {
        days: 0,
        hours: 0,
        minutes: 0,
        seconds: 0,
        is_expired: true,
    };

    pub fn total_seconds(&self) -> i64 {
        self.days * 86_400 + self.hours * 3_600 + self.minutes * 60 + self.seconds
    }
}

impl fmt::Display for TimeRemaining {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_expired {
            return f.write_str("expired");
        }
        write!(
            f,
            "{}d {:02}h {:02}m {:02}s",
            self.days, self.hours, self.minutes, self.seconds
        )
    }
}

/// Current wall-clock instant in milliseconds since the Unix epoch.
pub fn now_millis() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Splits `max(target - now, 0)` into days, hours-of-day, minutes-of-hour and
/// seconds-of-minute. A target at or before `now` is expired and reports zeros.
pub fn calculate_time_remaining(target_ms: i64, now_ms: i64) -> TimeRemaining {
    let diff = target_ms.saturating_sub(now_ms);
    if diff <= 0 {
        return TimeRemaining::EXPIRED;
    }
    TimeRemaining {
        days: diff / MS_PER_DAY,
        hours: (diff / MS_PER_HOUR) % 24,
        minutes: (diff / MS_PER_MINUTE) % 60,
        seconds: (diff / MS_PER_SECOND) % 60,
        is_expired: false,
    }
}

pub fn time_remaining_now(target_ms: i64) -> TimeRemaining {
    calculate_time_remaining(target_ms, now_millis())
}

/// Fraction of the span between creation and target that has already passed,
/// clamped to `[0.0, 1.0]`.
pub fn elapsed_fraction(created_at: i64, target_at: i64, now: i64) -> f64 {
    let total = target_at.saturating_sub(created_at).max(1);
    let elapsed = now.saturating_sub(created_at).clamp(0, total);
    elapsed as f64 / total as f64
}
