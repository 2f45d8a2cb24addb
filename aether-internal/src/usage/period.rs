use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};

use crate::tier::ResourceKind;

/// A usage accounting window.
///
/// `key` is the canonical bucket identifier persisted alongside the counter:
/// the ISO date of the window start for rolling windows, `YYYY-MM` for
/// calendar months. All arithmetic is done on UTC calendar days so that the
/// boundary never drifts with local time or DST.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Period {
    pub key: String,
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    /// Unix timestamp (seconds) of the first instant after this period.
    pub fn reset_timestamp(&self) -> i64 {
        (self.end + Duration::days(1))
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp()
    }
}

/// Fixed-length rolling window anchored to a shared epoch.
///
/// Anchoring to the epoch (rather than "N days after the last reset") means
/// every process computes the identical boundary without shared clock state.
pub fn rolling_period(now: DateTime<Utc>, period_length_days: u32, epoch: NaiveDate) -> Period {
    let len = i64::from(period_length_days.max(1));
    let days_since_epoch = (now.date_naive() - epoch).num_days();
    // div_euclid keeps pre-epoch timestamps in well-formed (negative-index) buckets
    let period_index = days_since_epoch.div_euclid(len);
    let start = epoch + Duration::days(period_index * len);
    let end = start + Duration::days(len - 1);
    Period {
        key: start.format("%Y-%m-%d").to_string(),
        start,
        end,
    }
}

/// Calendar-month window (`YYYY-MM` key), used for premium model calls.
pub fn calendar_month_period(now: DateTime<Utc>) -> Period {
    let today = now.date_naive();
    let start = NaiveDate::from_ymd_opt(today.year(), today.month(), 1).unwrap_or(today);
    let next_month = if today.month() == 12 {
        NaiveDate::from_ymd_opt(today.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(today.year(), today.month() + 1, 1)
    };
    let end = next_month.map_or(start, |d| d - Duration::days(1));
    Period {
        key: start.format("%Y-%m").to_string(),
        start,
        end,
    }
}

/// The bucketing strategy is part of the resource-kind contract: responses
/// use the rolling window, premium calls the calendar month. The two must
/// not be unified.
pub fn period_for(
    kind: ResourceKind,
    now: DateTime<Utc>,
    period_length_days: u32,
    epoch: NaiveDate,
) -> Period {
    match kind {
        ResourceKind::Response => rolling_period(now, period_length_days, epoch),
        ResourceKind::PremiumCall => calendar_month_period(now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn epoch() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 30, 0).unwrap()
    }

    #[test]
    fn test_rolling_period_idempotent() {
        let now = utc(2024, 3, 7, 12);
        let a = rolling_period(now, 14, epoch());
        let b = rolling_period(now, 14, epoch());
        assert_eq!(a, b);
    }

    #[test]
    fn test_rolling_period_constant_within_window() {
        // 2024-01-01 + 4 * 14 days = 2024-02-26
        let first = rolling_period(utc(2024, 2, 26, 0), 14, epoch());
        let last = rolling_period(utc(2024, 3, 10, 23), 14, epoch());
        assert_eq!(first.key, "2024-02-26");
        assert_eq!(first, last);
        assert_eq!(first.end, NaiveDate::from_ymd_opt(2024, 3, 10).unwrap());

        // The next day starts a new window
        let next = rolling_period(utc(2024, 3, 11, 0), 14, epoch());
        assert_eq!(next.key, "2024-03-11");
    }

    #[test]
    fn test_rolling_period_day_ten_vs_day_fifteen() {
        // First window is 2024-01-01..=2024-01-14
        let day_ten = rolling_period(utc(2024, 1, 10, 9), 14, epoch());
        assert_eq!(day_ten.key, "2024-01-01");
        let day_fifteen = rolling_period(utc(2024, 1, 15, 9), 14, epoch());
        assert_eq!(day_fifteen.key, "2024-01-15");
        assert_ne!(day_ten.key, day_fifteen.key);
    }

    #[test]
    fn test_rolling_period_crosses_year_boundary() {
        // 2024-01-01 + 26 * 14 days = 2024-12-30; window spans into 2025
        let period = rolling_period(utc(2025, 1, 2, 3), 14, epoch());
        assert_eq!(period.key, "2024-12-30");
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2025, 1, 12).unwrap());
    }

    #[test]
    fn test_rolling_period_before_epoch() {
        let period = rolling_period(utc(2023, 12, 31, 12), 14, epoch());
        assert_eq!(period.key, "2023-12-18");
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2023, 12, 31).unwrap());
    }

    #[test]
    fn test_calendar_month_period() {
        let period = calendar_month_period(utc(2024, 2, 15, 6));
        assert_eq!(period.key, "2024-02");
        assert_eq!(period.start, NaiveDate::from_ymd_opt(2024, 2, 1).unwrap());
        // 2024 is a leap year
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
    }

    #[test]
    fn test_calendar_month_period_december() {
        let period = calendar_month_period(utc(2024, 12, 31, 23));
        assert_eq!(period.key, "2024-12");
        assert_eq!(period.end, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap());
        assert_eq!(
            period.reset_timestamp(),
            Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap().timestamp()
        );
    }

    #[test]
    fn test_bucketing_strategies_differ_by_kind() {
        let now = utc(2024, 1, 20, 12);
        let response = period_for(ResourceKind::Response, now, 14, epoch());
        let premium = period_for(ResourceKind::PremiumCall, now, 14, epoch());
        assert_eq!(response.key, "2024-01-15");
        assert_eq!(premium.key, "2024-01");
    }
}
