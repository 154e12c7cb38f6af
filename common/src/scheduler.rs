use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, Offset, Timelike, Utc};

use crate::config::ScheduleConfig;

/// Anything earlier means the clock has not been set since power-up.
pub const MIN_VALID_YEAR: i32 = 2024;

pub fn is_clock_valid(utc: DateTime<Utc>) -> bool {
    utc.year() >= MIN_VALID_YEAR
}

/// Date of the last successful scheduled refresh. Kept in RAM only, so a
/// reboot forgets it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LastFetchMarker {
    date: Option<NaiveDate>,
}

impl LastFetchMarker {
    pub fn date(&self) -> Option<NaiveDate> {
        self.date
    }

    pub fn mark(&mut self, date: NaiveDate) {
        self.date = Some(date);
    }

    pub fn is_today(&self, today: NaiveDate) -> bool {
        self.date == Some(today)
    }
}

/// Local civil time for a whole-hour UTC offset.
pub fn civil_time(utc: DateTime<Utc>, utc_offset_hours: i8) -> NaiveDateTime {
    let offset = FixedOffset::east_opt(i32::from(utc_offset_hours) * 3600)
        .unwrap_or_else(|| Utc.fix());
    utc.with_timezone(&offset).naive_local()
}

pub fn is_refresh_due(
    now: NaiveDateTime,
    schedule: &ScheduleConfig,
    last_fetch: &LastFetchMarker,
) -> bool {
    if last_fetch.is_today(now.date()) {
        return false;
    }
    (now.hour(), now.minute()) >= (u32::from(schedule.hour), u32::from(schedule.minute))
}

/// Polls `is_refresh_due` at a fixed uptime cadence.
#[derive(Debug, Clone)]
pub struct RefreshScheduler {
    poll_interval_ms: u64,
    last_poll_ms: Option<u64>,
    last_fetch: LastFetchMarker,
}

impl RefreshScheduler {
    pub fn new(poll_interval_ms: u64) -> Self {
        Self {
            poll_interval_ms,
            last_poll_ms: None,
            last_fetch: LastFetchMarker::default(),
        }
    }

    pub fn last_fetch(&self) -> &LastFetchMarker {
        &self.last_fetch
    }

    /// Returns the local date to refresh for when a poll is due and the
    /// schedule has been reached. `civil_now` is `None` while the clock is
    /// not synced.
    pub fn poll(
        &mut self,
        now_ms: u64,
        civil_now: Option<NaiveDateTime>,
        schedule: &ScheduleConfig,
    ) -> Option<NaiveDate> {
        if let Some(last) = self.last_poll_ms {
            if now_ms.saturating_sub(last) < self.poll_interval_ms {
                return None;
            }
        }
        self.last_poll_ms = Some(now_ms);

        let now = civil_now?;
        is_refresh_due(now, schedule, &self.last_fetch).then(|| now.date())
    }

    pub fn record_success(&mut self, today: NaiveDate) {
        self.last_fetch.mark(today);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, 0)
            .unwrap()
    }

    fn seven_am() -> ScheduleConfig {
        ScheduleConfig {
            hour: 7,
            minute: 0,
            utc_offset_hours: 0,
        }
    }

    #[test]
    fn due_once_per_day_after_schedule() {
        let schedule = seven_am();
        let mut marker = LastFetchMarker::default();

        assert!(!is_refresh_due(at(10, 6, 59), &schedule, &marker));
        assert!(is_refresh_due(at(10, 7, 0), &schedule, &marker));

        marker.mark(at(10, 7, 0).date());
        assert!(!is_refresh_due(at(10, 7, 30), &schedule, &marker));
        assert!(!is_refresh_due(at(10, 23, 59), &schedule, &marker));

        assert!(!is_refresh_due(at(11, 0, 0), &schedule, &marker));
        assert!(!is_refresh_due(at(11, 6, 59), &schedule, &marker));
        assert!(is_refresh_due(at(11, 7, 0), &schedule, &marker));
    }

    #[test]
    fn midnight_schedule_is_due_on_first_tick_of_new_day() {
        let schedule = ScheduleConfig {
            hour: 0,
            minute: 0,
            utc_offset_hours: 0,
        };
        let mut marker = LastFetchMarker::default();
        marker.mark(at(10, 0, 0).date());

        assert!(!is_refresh_due(at(10, 12, 0), &schedule, &marker));
        assert!(is_refresh_due(at(11, 0, 0), &schedule, &marker));
    }

    #[test]
    fn minute_compares_lexicographically_with_hour() {
        let schedule = ScheduleConfig {
            hour: 7,
            minute: 30,
            utc_offset_hours: 0,
        };
        let marker = LastFetchMarker::default();

        assert!(!is_refresh_due(at(10, 7, 29), &schedule, &marker));
        assert!(is_refresh_due(at(10, 8, 0), &schedule, &marker));
    }

    #[test]
    fn scheduler_polls_on_cadence_and_retries_until_success() {
        let schedule = seven_am();
        let mut scheduler = RefreshScheduler::new(30_000);

        assert_eq!(scheduler.poll(0, Some(at(10, 7, 0)), &schedule), Some(at(10, 0, 0).date()));
        // Within the cadence: not polled.
        assert_eq!(scheduler.poll(10_000, Some(at(10, 7, 0)), &schedule), None);
        // Failure left the marker untouched, so the next poll retries.
        assert_eq!(scheduler.poll(30_000, Some(at(10, 7, 1)), &schedule), Some(at(10, 0, 0).date()));

        scheduler.record_success(at(10, 0, 0).date());
        assert_eq!(scheduler.poll(60_000, Some(at(10, 7, 2)), &schedule), None);
        assert_eq!(scheduler.last_fetch().date(), Some(at(10, 0, 0).date()));
    }

    #[test]
    fn unsynced_clock_never_triggers() {
        let mut scheduler = RefreshScheduler::new(30_000);
        assert_eq!(scheduler.poll(0, None, &seven_am()), None);
    }

    #[test]
    fn epoch_clock_is_not_valid() {
        assert!(!is_clock_valid(Utc.with_ymd_and_hms(1970, 1, 1, 0, 0, 0).unwrap()));
        assert!(is_clock_valid(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
    }

    #[test]
    fn civil_time_applies_offset_across_date_line() {
        let utc = Utc.with_ymd_and_hms(2025, 3, 10, 22, 30, 0).unwrap();

        assert_eq!(civil_time(utc, 2), at(11, 0, 30));
        assert_eq!(civil_time(utc, -12), at(10, 10, 30));
        assert_eq!(civil_time(utc, 14), at(11, 12, 30));
    }
}
