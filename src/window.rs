//! Daily reporting windows.
//!
//! A snapshot date is a calendar day in the scope's local timezone. The
//! vendor API filters on UTC instants, so the day is converted to
//! `[local midnight, next local midnight)` expressed in UTC.

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

use crate::error::PipelineError;

/// Format an instant as `YYYY-MM-DDTHH:MM:SSZ` (second precision).
pub fn iso_z(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn local_midnight(tz: Tz, day: NaiveDate) -> Result<DateTime<Utc>, PipelineError> {
    let naive = day
        .and_hms_opt(0, 0, 0)
        .ok_or_else(|| PipelineError::Config(format!("invalid snapshot date {}", day)))?;
    tz.from_local_datetime(&naive)
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .ok_or_else(|| {
            PipelineError::Config(format!("midnight of {} does not exist in {}", day, tz))
        })
}

/// UTC bounds of `snapshot_day` in `tz`, as ISO strings.
pub fn day_window_utc(tz: Tz, snapshot_day: NaiveDate) -> Result<(String, String), PipelineError> {
    let start = local_midnight(tz, snapshot_day)?;
    let next = snapshot_day
        .succ_opt()
        .ok_or_else(|| PipelineError::Config(format!("no day after {}", snapshot_day)))?;
    let end = local_midnight(tz, next)?;
    Ok((iso_z(start), iso_z(end)))
}

/// The calendar day before `now` in `tz`.
pub fn yesterday_local(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive() - Duration::days(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_berlin_winter_day() {
        let day = NaiveDate::from_ymd_opt(2024, 1, 15).unwrap();
        let (start, end) = day_window_utc(chrono_tz::Europe::Berlin, day).unwrap();
        assert_eq!(start, "2024-01-14T23:00:00Z");
        assert_eq!(end, "2024-01-15T23:00:00Z");
    }

    #[test]
    fn test_window_across_spring_forward() {
        let day = NaiveDate::from_ymd_opt(2024, 3, 31).unwrap();
        let (start, end) = day_window_utc(chrono_tz::Europe::Berlin, day).unwrap();
        assert_eq!(start, "2024-03-30T23:00:00Z");
        assert_eq!(end, "2024-03-31T22:00:00Z");
    }

    #[test]
    fn test_los_angeles_summer_day() {
        let day = NaiveDate::from_ymd_opt(2024, 7, 4).unwrap();
        let (start, end) = day_window_utc(chrono_tz::America::Los_Angeles, day).unwrap();
        assert_eq!(start, "2024-07-04T07:00:00Z");
        assert_eq!(end, "2024-07-05T07:00:00Z");
    }

    #[test]
    fn test_yesterday_uses_local_date() {
        // 2024-05-02 03:00 UTC is still 2024-05-01 in Los Angeles.
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 3, 0, 0).unwrap();
        assert_eq!(
            yesterday_local(chrono_tz::America::Los_Angeles, now),
            NaiveDate::from_ymd_opt(2024, 4, 30).unwrap()
        );
        assert_eq!(
            yesterday_local(chrono_tz::Europe::Berlin, now),
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap()
        );
    }
}
