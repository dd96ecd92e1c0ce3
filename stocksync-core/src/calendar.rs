//! Exchange session calendar.
//!
//! The sync engine only needs one answer from the calendar: the close of the
//! most recently completed session as of "now". That close is the inclusive
//! upper bound for every fetch in a run, so a session that is still trading
//! is never downloaded half-finished.

use chrono::{DateTime, Datelike, NaiveDate, NaiveTime, TimeZone, Utc, Weekday};
use chrono_tz::America::New_York;
use serde::{Deserialize, Serialize};

/// How far back `last_completed_session` searches before giving up.
const MAX_LOOKBACK_DAYS: u32 = 31;

/// Close of a completed trading session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionBoundary {
    /// Exchange-local date of the session.
    pub session_date: NaiveDate,
    /// Close timestamp in UTC.
    pub close: DateTime<Utc>,
}

/// A trading calendar for one exchange.
pub trait MarketCalendar: Send + Sync {
    /// Human-readable calendar name.
    fn name(&self) -> &str;

    /// True if the exchange holds a session on `date`.
    fn is_session(&self, date: NaiveDate) -> bool;

    /// Close timestamp of the session on `date`, or `None` on closed days.
    fn session_close(&self, date: NaiveDate) -> Option<DateTime<Utc>>;

    /// Exchange-local calendar date at `now`.
    fn today(&self, now: DateTime<Utc>) -> NaiveDate;

    /// Latest session whose close is at or before `now`.
    ///
    /// Returns `None` only if no session closed within the lookback window,
    /// which means the calendar itself is misconfigured.
    fn last_completed_session(&self, now: DateTime<Utc>) -> Option<SessionBoundary> {
        let mut date = self.today(now);
        for _ in 0..=MAX_LOOKBACK_DAYS {
            if let Some(close) = self.session_close(date) {
                if close <= now {
                    return Some(SessionBoundary {
                        session_date: date,
                        close,
                    });
                }
            }
            date = date.pred_opt()?;
        }
        None
    }
}

/// NYSE / Nasdaq regular-session calendar.
///
/// Holidays are derived from the exchange rules rather than a fixed table, so
/// the calendar stays valid for any year in a full-history backfill. The
/// handful of unscheduled closures are listed explicitly.
#[derive(Debug, Clone, Copy, Default)]
pub struct NyseCalendar;

/// Unscheduled full-day closures since 2000.
const SPECIAL_CLOSURES: &[(i32, u32, u32)] = &[
    (2001, 9, 11),
    (2001, 9, 12),
    (2001, 9, 13),
    (2001, 9, 14),
    (2004, 6, 11),  // Reagan
    (2007, 1, 2),   // Ford
    (2012, 10, 29), // Hurricane Sandy
    (2012, 10, 30),
    (2018, 12, 5), // G.H.W. Bush
    (2025, 1, 9),  // Carter
];

impl NyseCalendar {
    pub fn new() -> Self {
        Self
    }

    fn regular_close() -> NaiveTime {
        NaiveTime::from_hms_opt(16, 0, 0).unwrap_or(NaiveTime::MIN)
    }

    fn early_close() -> NaiveTime {
        NaiveTime::from_hms_opt(13, 0, 0).unwrap_or(NaiveTime::MIN)
    }

    /// True if `date` is a full-day exchange holiday.
    pub fn is_holiday(date: NaiveDate) -> bool {
        let year = date.year();

        if SPECIAL_CLOSURES.contains(&(year, date.month(), date.day())) {
            return true;
        }

        // New Year's Day: Sunday moves to Monday, Saturday is not observed.
        if let Some(jan1) = NaiveDate::from_ymd_opt(year, 1, 1) {
            let observed = match jan1.weekday() {
                Weekday::Sun => jan1.succ_opt(),
                _ => Some(jan1),
            };
            if observed == Some(date) {
                return true;
            }
        }

        let mut fixed = vec![(7, 4), (12, 25)];
        if year >= 2022 {
            fixed.push((6, 19));
        }
        for (month, day) in fixed {
            if let Some(holiday) = NaiveDate::from_ymd_opt(year, month, day) {
                if observed(holiday) == date {
                    return true;
                }
            }
        }

        let mut floating = vec![
            nth_weekday(year, 2, Weekday::Mon, 3), // Washington's Birthday
            last_weekday(year, 5, Weekday::Mon),   // Memorial Day
            nth_weekday(year, 9, Weekday::Mon, 1), // Labor Day
            nth_weekday(year, 11, Weekday::Thu, 4), // Thanksgiving
            easter_sunday(year).and_then(|e| e.checked_sub_days(chrono::Days::new(2))),
        ];
        if year >= 1998 {
            floating.push(nth_weekday(year, 1, Weekday::Mon, 3)); // MLK Day
        }
        floating.into_iter().flatten().any(|h| h == date)
    }

    /// True if the session on `date` closes at 13:00 instead of 16:00.
    pub fn is_early_close(date: NaiveDate) -> bool {
        let year = date.year();
        let day_after_thanksgiving =
            nth_weekday(year, 11, Weekday::Thu, 4).and_then(|d| d.succ_opt());
        let july_3 = NaiveDate::from_ymd_opt(year, 7, 3);
        let christmas_eve = NaiveDate::from_ymd_opt(year, 12, 24);

        Some(date) == day_after_thanksgiving || Some(date) == july_3 || Some(date) == christmas_eve
    }
}

impl MarketCalendar for NyseCalendar {
    fn name(&self) -> &str {
        "NYSE"
    }

    fn is_session(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !Self::is_holiday(date)
    }

    fn session_close(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        if !self.is_session(date) {
            return None;
        }
        let time = if Self::is_early_close(date) {
            Self::early_close()
        } else {
            Self::regular_close()
        };
        New_York
            .from_local_datetime(&date.and_time(time))
            .single()
            .map(|dt| dt.with_timezone(&Utc))
    }

    fn today(&self, now: DateTime<Utc>) -> NaiveDate {
        now.with_timezone(&New_York).date_naive()
    }
}

/// Saturday holidays are observed on Friday, Sunday holidays on Monday.
fn observed(date: NaiveDate) -> NaiveDate {
    match date.weekday() {
        Weekday::Sat => date.pred_opt().unwrap_or(date),
        Weekday::Sun => date.succ_opt().unwrap_or(date),
        _ => date,
    }
}

fn nth_weekday(year: i32, month: u32, weekday: Weekday, n: u8) -> Option<NaiveDate> {
    NaiveDate::from_weekday_of_month_opt(year, month, weekday, n)
}

fn last_weekday(year: i32, month: u32, weekday: Weekday) -> Option<NaiveDate> {
    nth_weekday(year, month, weekday, 5).or_else(|| nth_weekday(year, month, weekday, 4))
}

/// Gregorian Easter Sunday (anonymous Gregorian algorithm).
fn easter_sunday(year: i32) -> Option<NaiveDate> {
    let a = year % 19;
    let b = year / 100;
    let c = year % 100;
    let d = b / 4;
    let e = b % 4;
    let f = (b + 8) / 25;
    let g = (b - f + 1) / 3;
    let h = (19 * a + b - d - g + 15) % 30;
    let i = c / 4;
    let k = c % 4;
    let l = (32 + 2 * e + 2 * i - h - k) % 7;
    let m = (a + 11 * h + 22 * l) / 451;
    let month = (h + l - 7 * m + 114) / 31;
    let day = (h + l - 7 * m + 114) % 31 + 1;
    NaiveDate::from_ymd_opt(year, month as u32, day as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn easter_dates() {
        assert_eq!(easter_sunday(2024), Some(date(2024, 3, 31)));
        assert_eq!(easter_sunday(2025), Some(date(2025, 4, 20)));
        assert_eq!(easter_sunday(2026), Some(date(2026, 4, 5)));
    }

    #[test]
    fn weekends_and_holidays_are_closed() {
        let cal = NyseCalendar::new();
        assert!(!cal.is_session(date(2024, 1, 6))); // Saturday
        assert!(!cal.is_session(date(2024, 3, 29))); // Good Friday
        assert!(!cal.is_session(date(2024, 11, 28))); // Thanksgiving
        assert!(!cal.is_session(date(2023, 1, 2))); // New Year observed
        assert!(!cal.is_session(date(2026, 7, 3))); // July 4 on Saturday
        assert!(!cal.is_session(date(2025, 1, 9))); // special closure
        assert!(cal.is_session(date(2024, 1, 8)));
    }

    #[test]
    fn juneteenth_only_from_2022() {
        let cal = NyseCalendar::new();
        assert!(!cal.is_session(date(2023, 6, 19)));
        assert!(cal.is_session(date(2021, 6, 18)));
    }

    #[test]
    fn saturday_new_year_is_not_observed_on_friday() {
        let cal = NyseCalendar::new();
        assert!(cal.is_session(date(2021, 12, 31)));
    }

    #[test]
    fn early_close_after_thanksgiving() {
        let cal = NyseCalendar::new();
        let close = cal.session_close(date(2024, 11, 29)).unwrap();
        assert_eq!(close, utc(2024, 11, 29, 18, 0)); // 13:00 EST
    }

    #[test]
    fn regular_close_tracks_daylight_saving() {
        let cal = NyseCalendar::new();
        assert_eq!(cal.session_close(date(2024, 1, 8)), Some(utc(2024, 1, 8, 21, 0)));
        assert_eq!(cal.session_close(date(2024, 7, 8)), Some(utc(2024, 7, 8, 20, 0)));
    }

    #[test]
    fn before_close_uses_previous_session() {
        let cal = NyseCalendar::new();
        // Monday 10:00 ET
        let boundary = cal.last_completed_session(utc(2024, 1, 8, 15, 0)).unwrap();
        assert_eq!(boundary.session_date, date(2024, 1, 5));
        assert_eq!(boundary.close, utc(2024, 1, 5, 21, 0));
    }

    #[test]
    fn after_close_uses_same_day() {
        let cal = NyseCalendar::new();
        let boundary = cal.last_completed_session(utc(2024, 1, 8, 21, 0)).unwrap();
        assert_eq!(boundary.session_date, date(2024, 1, 8));
    }

    #[test]
    fn skips_holiday_back_to_early_close() {
        let cal = NyseCalendar::new();
        // Friday 2024-07-05, 10:00 ET: July 4 closed, July 3 closed early.
        let boundary = cal.last_completed_session(utc(2024, 7, 5, 14, 0)).unwrap();
        assert_eq!(boundary.session_date, date(2024, 7, 3));
        assert_eq!(boundary.close, utc(2024, 7, 3, 17, 0));
    }

    #[test]
    fn today_is_exchange_local() {
        let cal = NyseCalendar::new();
        // 02:00 UTC on the 9th is still the 8th in New York.
        assert_eq!(cal.today(utc(2024, 1, 9, 2, 0)), date(2024, 1, 8));
    }
}
