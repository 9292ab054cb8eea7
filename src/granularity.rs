use chrono::{DateTime, Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::model::{DAY_MS, DateRange, Ms};

/// Days from 0001-01-01 (CE day 1) to 1970-01-01.
const UNIX_EPOCH_CE_DAYS: i64 = 719_163;

/// Calendar bucket a source's jobs are split into. All buckets are UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    #[default]
    OneDay,
    /// Weeks start on Sunday.
    OneWeek,
    OneMonth,
    OneYear,
}

impl Granularity {
    /// Start of the bucket containing `t`.
    pub fn bucket_start(&self, t: Ms) -> Ms {
        let Some(date) = to_date(t) else {
            return day_start(t);
        };
        let first = match self {
            Granularity::OneDay => Some(date),
            Granularity::OneWeek => {
                let back = date.weekday().num_days_from_sunday() as i64;
                return date_ms(date) - back * DAY_MS;
            }
            Granularity::OneMonth => date.with_day(1),
            Granularity::OneYear => NaiveDate::from_ymd_opt(date.year(), 1, 1),
        };
        first.map(date_ms).unwrap_or_else(|| day_start(t))
    }

    /// Start of the bucket after the one beginning at `bucket_start`.
    pub fn next_start(&self, bucket_start: Ms) -> Ms {
        let fallback = bucket_start + DAY_MS;
        let Some(date) = to_date(bucket_start) else {
            return fallback;
        };
        match self {
            Granularity::OneDay => fallback,
            Granularity::OneWeek => bucket_start + 7 * DAY_MS,
            Granularity::OneMonth => date
                .checked_add_months(Months::new(1))
                .map(date_ms)
                .unwrap_or(fallback),
            Granularity::OneYear => NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
                .map(date_ms)
                .unwrap_or(fallback),
        }
    }

    /// Buckets covering `[start, end]`, each `[bucket_start, next_start - 1]`.
    pub fn intervals(&self, start: Ms, end: Ms) -> Vec<DateRange> {
        let mut out = Vec::new();
        if start > end {
            return out;
        }
        let mut bucket = self.bucket_start(start);
        while bucket <= end {
            let next = self.next_start(bucket);
            if next <= bucket {
                break;
            }
            out.push(DateRange::new(bucket, next - 1));
            bucket = next;
        }
        out
    }
}

pub fn day_start(t: Ms) -> Ms {
    t.div_euclid(DAY_MS) * DAY_MS
}

pub fn to_date(t: Ms) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.date_naive())
}

pub fn date_ms(date: NaiveDate) -> Ms {
    (date.num_days_from_ce() as i64 - UNIX_EPOCH_CE_DAYS) * DAY_MS
}

/// `YYYY-MM-DD` of the UTC day containing `t`.
pub fn format_day(t: Ms) -> String {
    to_date(t)
        .map(|d| d.format("%Y-%m-%d").to_string())
        .unwrap_or_else(|| t.to_string())
}

/// `YYYYMMDD` of the UTC day containing `t`.
pub fn format_compact_day(t: Ms) -> String {
    to_date(t)
        .map(|d| d.format("%Y%m%d").to_string())
        .unwrap_or_else(|| t.to_string())
}

pub fn parse_day(s: &str) -> Option<Ms> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d").ok().map(date_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(s: &str) -> Ms {
        parse_day(s).unwrap()
    }

    #[test]
    fn epoch_is_zero() {
        assert_eq!(day("1970-01-01"), 0);
        assert_eq!(format_day(0), "1970-01-01");
        assert_eq!(format_compact_day(day("2024-03-09")), "20240309");
    }

    #[test]
    fn daily_intervals_are_inclusive() {
        let ivs = Granularity::OneDay.intervals(day("2024-01-01") + 5_000, day("2024-01-03"));
        assert_eq!(ivs.len(), 3);
        assert_eq!(ivs[0], DateRange::new(day("2024-01-01"), day("2024-01-02") - 1));
        assert_eq!(ivs[2].start, day("2024-01-03"));
    }

    #[test]
    fn weeks_start_on_sunday() {
        // 2024-01-03 is a Wednesday
        assert_eq!(Granularity::OneWeek.bucket_start(day("2024-01-03")), day("2023-12-31"));
        let ivs = Granularity::OneWeek.intervals(day("2024-01-03"), day("2024-01-08"));
        assert_eq!(ivs.len(), 2);
        assert_eq!(ivs[1].start, day("2024-01-07"));
    }

    #[test]
    fn months_follow_calendar() {
        let ivs = Granularity::OneMonth.intervals(day("2024-01-15"), day("2024-03-01"));
        assert_eq!(ivs.len(), 3);
        assert_eq!(ivs[1], DateRange::new(day("2024-02-01"), day("2024-03-01") - 1));
    }

    #[test]
    fn years_follow_calendar() {
        let ivs = Granularity::OneYear.intervals(day("2023-06-01"), day("2024-06-01"));
        assert_eq!(ivs.len(), 2);
        assert_eq!(ivs[0].start, day("2023-01-01"));
        assert_eq!(ivs[1].end, day("2025-01-01") - 1);
    }

    #[test]
    fn reversed_range_is_empty() {
        assert!(Granularity::OneDay.intervals(10 * DAY_MS, DAY_MS).is_empty());
    }
}
