use chrono::{DateTime, NaiveTime, TimeZone};
use serde::{Deserialize, Deserializer};

/// Time-of-day window outside of which restarts are suppressed.
///
/// `after == before` means no window is configured and every instant is allowed.
/// When `before` is earlier than `after` the window wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ScheduleWindow {
    #[serde(deserialize_with = "deserialize_time_of_day")]
    pub after: NaiveTime,
    #[serde(deserialize_with = "deserialize_time_of_day")]
    pub before: NaiveTime,
}

impl Default for ScheduleWindow {
    fn default() -> Self {
        Self::unrestricted()
    }
}

impl ScheduleWindow {
    pub fn new(after: NaiveTime, before: NaiveTime) -> Self {
        ScheduleWindow { after, before }
    }

    pub fn unrestricted() -> Self {
        ScheduleWindow {
            after: NaiveTime::MIN,
            before: NaiveTime::MIN,
        }
    }

    pub fn is_unrestricted(&self) -> bool {
        self.after == self.before
    }

    /// Projects both bounds onto the calendar date and offset of `target` and
    /// checks that `target` lies strictly between them.
    pub fn should_run<Tz: TimeZone>(&self, target: &DateTime<Tz>) -> bool {
        if self.is_unrestricted() {
            return true;
        }

        let date = target.date_naive();
        let local = target.naive_local();
        let after_today = date.and_time(self.after);
        let before_today = date.and_time(self.before);

        if self.after < self.before {
            local > after_today && local < before_today
        } else {
            // The window spans midnight: [after, 24:00) on one day plus
            // [00:00, before) on the next.
            local > after_today || local < before_today
        }
    }
}

fn deserialize_time_of_day<'de, D>(deserializer: D) -> Result<NaiveTime, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_time_of_day(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_time_of_day(raw: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(raw, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M"))
        .map_err(|e| format!("invalid time of day {:?}, expected HH:MM[:SS]: {}", raw, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn time(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_unrestricted_window_always_runs() {
        let window = ScheduleWindow::new(time(12, 0), time(12, 0));
        for (h, m, s) in [(0, 0, 0), (12, 0, 0), (23, 59, 59), (6, 30, 0)] {
            assert!(window.should_run(&at(h, m, s)), "{:02}:{:02}:{:02}", h, m, s);
        }
        assert!(ScheduleWindow::default().should_run(&at(0, 0, 0)));
    }

    #[test]
    fn test_daytime_window() {
        let window = ScheduleWindow::new(time(9, 0), time(17, 0));
        assert!(window.should_run(&at(10, 0, 0)));
        assert!(!window.should_run(&at(20, 0, 0)));
        assert!(!window.should_run(&at(8, 59, 59)));
    }

    #[test]
    fn test_bounds_are_exclusive() {
        let window = ScheduleWindow::new(time(9, 0), time(17, 0));
        assert!(!window.should_run(&at(9, 0, 0)));
        assert!(!window.should_run(&at(17, 0, 0)));
        assert!(window.should_run(&at(9, 0, 1)));
    }

    #[test]
    fn test_window_wrapping_past_midnight() {
        let window = ScheduleWindow::new(time(23, 0), time(3, 0));
        assert!(window.should_run(&at(23, 30, 0)));
        assert!(window.should_run(&at(0, 0, 0)));
        assert!(window.should_run(&at(2, 59, 59)));
        assert!(!window.should_run(&at(3, 0, 0)));
        assert!(!window.should_run(&at(12, 0, 0)));
        assert!(!window.should_run(&at(23, 0, 0)));
    }

    #[test]
    fn test_window_uses_target_offset() {
        let window = ScheduleWindow::new(time(9, 0), time(17, 0));
        let offset = FixedOffset::east_opt(2 * 3600).unwrap();
        // 08:00 UTC is 10:00 at +02:00
        let target = at(8, 0, 0).with_timezone(&offset);
        assert!(window.should_run(&target));
        assert!(!window.should_run(&at(8, 0, 0)));
    }

    #[test]
    fn test_parse_time_of_day() {
        assert_eq!(parse_time_of_day("09:30").unwrap(), time(9, 30));
        assert_eq!(
            parse_time_of_day("23:15:10").unwrap(),
            NaiveTime::from_hms_opt(23, 15, 10).unwrap()
        );
        assert!(parse_time_of_day("9am").is_err());
    }
}
