//! Working-time arithmetic under a fixed weekly business calendar.
//!
//! All inputs and outputs are UTC instants; the calendar converts them to its
//! own timezone to decide which calendar day and which part of the working
//! window an instant falls into.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::Tz;

use crate::error::EscalationError;

const MILLIS_PER_HOUR: f64 = 3_600_000.0;

/// Furthest ahead `deadline` looks, in days.
const MAX_HORIZON_DAYS: usize = 36_525;

/// Weekly business-hours template: a set of working weekdays sharing one
/// daily `[day_start, day_end)` window in a single timezone.
#[derive(Debug, Clone, PartialEq)]
pub struct BusinessCalendar {
    tz: Tz,
    working_days: [bool; 7],
    day_start: NaiveTime,
    day_end: NaiveTime,
}

impl BusinessCalendar {
    pub fn new(
        tz: Tz,
        working_days: &[Weekday],
        day_start: NaiveTime,
        day_end: NaiveTime,
    ) -> Result<Self, EscalationError> {
        if day_end <= day_start {
            return Err(EscalationError::Config(format!(
                "calendar day_end {day_end} must be after day_start {day_start}"
            )));
        }
        if working_days.is_empty() {
            return Err(EscalationError::Config(
                "calendar needs at least one working day".into(),
            ));
        }
        let mut days = [false; 7];
        for day in working_days {
            days[day.num_days_from_monday() as usize] = true;
        }
        Ok(Self {
            tz,
            working_days: days,
            day_start,
            day_end,
        })
    }

    /// Monday to Saturday, 09:00-17:00 in `tz`.
    pub fn standard(tz: Tz) -> Self {
        Self {
            tz,
            working_days: [true, true, true, true, true, true, false],
            day_start: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            day_end: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
        }
    }

    pub fn is_working_day(&self, day: Weekday) -> bool {
        self.working_days[day.num_days_from_monday() as usize]
    }

    /// Length of one working day in hours.
    fn hours_per_day(&self) -> f64 {
        (self.day_end - self.day_start).num_milliseconds() as f64 / MILLIS_PER_HOUR
    }

    /// Working hours elapsed in `[start, end)`.
    ///
    /// Never negative: `end <= start` yields `0.0`. The result is fractional
    /// and unrounded so threshold comparisons stay exact.
    pub fn working_hours(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> f64 {
        if end <= start {
            return 0.0;
        }

        let first = start.with_timezone(&self.tz).date_naive();
        let last = end.with_timezone(&self.tz).date_naive();

        let mut total = Duration::zero();
        for day in first.iter_days().take_while(|d| *d <= last) {
            let Some((open, close)) = self.window(day) else {
                continue;
            };
            let from = open.max(start);
            let to = close.min(end);
            if to > from {
                total += to - from;
            }
        }

        total.num_milliseconds() as f64 / MILLIS_PER_HOUR
    }

    /// The instant at which `hours` working hours will have elapsed since
    /// `start`. Inverse of [`working_hours`](Self::working_hours).
    ///
    /// Returns `DateTime::<Utc>::MAX_UTC` when the deadline lies more than a
    /// century ahead.
    pub fn deadline(&self, start: DateTime<Utc>, hours: f64) -> DateTime<Utc> {
        if hours <= 0.0 || !hours.is_finite() {
            return start;
        }

        // Whole weeks needed, plus slack for a partial first week.
        let working_days = self.working_days.iter().filter(|d| **d).count() as f64;
        let weeks = (hours / (self.hours_per_day() * working_days)).ceil();
        let horizon = (weeks + 2.0) * 7.0;
        if horizon > MAX_HORIZON_DAYS as f64 {
            return DateTime::<Utc>::MAX_UTC;
        }
        let mut remaining = Duration::milliseconds((hours * MILLIS_PER_HOUR).round() as i64);

        let first = start.with_timezone(&self.tz).date_naive();
        for day in first.iter_days().take(horizon as usize) {
            let Some((open, close)) = self.window(day) else {
                continue;
            };
            let from = open.max(start);
            if close <= from {
                continue;
            }
            let available = close - from;
            if remaining <= available {
                return from + remaining;
            }
            remaining -= available;
        }

        DateTime::<Utc>::MAX_UTC
    }

    /// UTC bounds of the working window on a local calendar day, or `None`
    /// for non-working days.
    fn window(&self, day: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        if !self.is_working_day(day.weekday()) {
            return None;
        }
        let open = self.local_instant(day, self.day_start)?;
        let close = self.local_instant(day, self.day_end)?;
        (close > open).then_some((open, close))
    }

    fn local_instant(&self, day: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        // DST gaps have no earliest mapping; fall back to the first valid
        // instant after the gap.
        let local = self.tz.from_local_datetime(&day.and_time(time));
        local
            .earliest()
            .or_else(|| {
                self.tz
                    .from_local_datetime(&(day.and_time(time) + Duration::hours(1)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
    }
}

impl Default for BusinessCalendar {
    fn default() -> Self {
        Self::standard(chrono_tz::Asia::Kolkata)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cal() -> BusinessCalendar {
        BusinessCalendar::default()
    }

    // 2024-03-04 is a Monday.
    fn local(day: u32, h: u32, m: u32) -> DateTime<Utc> {
        chrono_tz::Asia::Kolkata
            .with_ymd_and_hms(2024, 3, day, h, m, 0)
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn zero_for_equal_or_reversed_bounds() {
        let t = local(4, 10, 0);
        assert_eq!(cal().working_hours(t, t), 0.0);
        assert_eq!(cal().working_hours(t, t - Duration::hours(3)), 0.0);
    }

    #[test]
    fn one_hour_on_monday_morning() {
        let start = local(4, 10, 0);
        assert_eq!(cal().working_hours(start, start + Duration::hours(1)), 1.0);
    }

    #[test]
    fn saturday_evening_into_sunday_counts_only_before_close() {
        let start = local(9, 16, 30);
        let end = local(10, 10, 30);
        assert_eq!(cal().working_hours(start, end), 0.5);
    }

    #[test]
    fn partial_days_are_clipped_to_the_window() {
        assert_eq!(cal().working_hours(local(4, 8, 0), local(4, 18, 0)), 8.0);
        assert_eq!(cal().working_hours(local(4, 16, 0), local(5, 10, 0)), 2.0);
        assert_eq!(cal().working_hours(local(4, 17, 0), local(5, 9, 0)), 0.0);
    }

    #[test]
    fn full_week_is_six_working_days() {
        assert_eq!(cal().working_hours(local(4, 0, 0), local(11, 0, 0)), 48.0);
    }

    #[test]
    fn sunday_is_skipped_entirely() {
        assert_eq!(cal().working_hours(local(10, 0, 0), local(10, 23, 59)), 0.0);
        assert_eq!(cal().working_hours(local(8, 9, 0), local(11, 9, 0)), 16.0);
    }

    #[test]
    fn fractional_minutes_are_kept() {
        let hours = cal().working_hours(local(4, 9, 0), local(4, 9, 20));
        assert!((hours - 1.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn monotonic_in_end() {
        let start = local(4, 11, 7);
        let mut prev = 0.0;
        for step in 0..1_000 {
            let end = start + Duration::minutes(17 * step);
            let hours = cal().working_hours(start, end);
            assert!(hours >= prev, "decreased at step {step}: {hours} < {prev}");
            prev = hours;
        }
    }

    #[test]
    fn respects_calendar_timezone() {
        // 09:00 IST is 03:30 UTC.
        let start = Utc.with_ymd_and_hms(2024, 3, 4, 3, 30, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 4, 4, 30, 0).unwrap();
        assert_eq!(cal().working_hours(start, end), 1.0);

        let utc_cal = BusinessCalendar::standard(chrono_tz::UTC);
        assert_eq!(utc_cal.working_hours(start, end), 0.0);
    }

    #[test]
    fn custom_template() {
        let cal = BusinessCalendar::new(
            chrono_tz::UTC,
            &[Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            NaiveTime::from_hms_opt(8, 30, 0).unwrap(),
            NaiveTime::from_hms_opt(12, 30, 0).unwrap(),
        )
        .unwrap();
        assert_eq!(cal.hours_per_day(), 4.0);
        assert!(!cal.is_working_day(Weekday::Sat));

        let fri = Utc.with_ymd_and_hms(2024, 3, 8, 0, 0, 0).unwrap();
        let mon = Utc.with_ymd_and_hms(2024, 3, 11, 23, 0, 0).unwrap();
        assert_eq!(cal.working_hours(fri, mon), 8.0);
    }

    #[test]
    fn rejects_inverted_window_and_empty_week() {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        let five = NaiveTime::from_hms_opt(17, 0, 0).unwrap();
        assert!(BusinessCalendar::new(chrono_tz::UTC, &[Weekday::Mon], five, nine).is_err());
        assert!(BusinessCalendar::new(chrono_tz::UTC, &[], nine, five).is_err());
    }

    #[test]
    fn deadline_crosses_the_weekend() {
        let friday = local(8, 9, 0);
        assert_eq!(cal().deadline(friday, 16.0), local(9, 17, 0));
        assert_eq!(cal().deadline(friday, 24.0), local(11, 17, 0));
        assert_eq!(cal().deadline(friday, 0.0), friday);
    }

    #[test]
    fn deadline_beyond_a_century_is_unbounded() {
        let friday = local(8, 9, 0);
        assert_eq!(cal().deadline(friday, 1e9), DateTime::<Utc>::MAX_UTC);
        // A year of thresholds still resolves to a real instant.
        assert!(cal().deadline(friday, 8_760.0) < local(8, 9, 0) + Duration::days(366 * 5));
    }

    #[test]
    fn deadline_from_outside_hours_starts_at_next_opening() {
        let saturday_evening = local(9, 20, 0);
        assert_eq!(cal().deadline(saturday_evening, 1.5), local(11, 10, 30));
    }

    #[test]
    fn deadline_inverts_working_hours() {
        let start = local(5, 13, 45);
        for hours in [0.25, 3.0, 8.0, 19.5, 40.0] {
            let due = cal().deadline(start, hours);
            let elapsed = cal().working_hours(start, due);
            assert!((elapsed - hours).abs() < 1e-9, "{hours}h -> {elapsed}h");
        }
    }
}
