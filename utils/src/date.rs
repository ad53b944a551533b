use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;

/// Today's date in the given timezone. Daily usage counters key off this so
/// the rollover tracks the operator's local midnight, not UTC.
pub fn today_in_tz(tz: Tz, now: DateTime<Utc>) -> NaiveDate {
    now.with_timezone(&tz).date_naive()
}

/// The next local midnight in `tz`, as a UTC instant. Around DST gaps the
/// earliest valid instant after midnight is used.
pub fn next_local_midnight(tz: Tz, now: DateTime<Utc>) -> DateTime<Utc> {
    let local_now = now.with_timezone(&tz);
    let next_day = local_now.date_naive() + ChronoDuration::days(1);
    let midnight = next_day.and_hms_opt(0, 0, 0).expect("valid wall time");

    match tz.from_local_datetime(&midnight) {
        chrono::LocalResult::Single(dt) => dt.with_timezone(&Utc),
        chrono::LocalResult::Ambiguous(early, _late) => early.with_timezone(&Utc),
        chrono::LocalResult::None => {
            // Skipped by a DST jump; roll forward an hour at a time.
            let mut probe = midnight + ChronoDuration::hours(1);
            loop {
                if let chrono::LocalResult::Single(dt) | chrono::LocalResult::Ambiguous(dt, _) =
                    tz.from_local_datetime(&probe)
                {
                    return dt.with_timezone(&Utc);
                }
                probe += ChronoDuration::hours(1);
            }
        }
    }
}

pub fn until_next_local_midnight(tz: Tz, now: DateTime<Utc>) -> std::time::Duration {
    let target = next_local_midnight(tz, now);
    (target - now)
        .to_std()
        .unwrap_or(std::time::Duration::from_secs(1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_midnight_is_strictly_in_the_future() {
        let tz: Tz = "America/New_York".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 3, 59, 0).unwrap();
        let midnight = next_local_midnight(tz, now);
        assert!(midnight > now);
        assert_eq!(today_in_tz(tz, midnight), today_in_tz(tz, now) + ChronoDuration::days(1));
    }

    #[test]
    fn today_respects_timezone_offset() {
        let tz: Tz = "Asia/Tokyo".parse().unwrap();
        // 23:00 UTC June 14 is already June 15 in Tokyo.
        let now = Utc.with_ymd_and_hms(2025, 6, 14, 23, 0, 0).unwrap();
        assert_eq!(
            today_in_tz(tz, now),
            NaiveDate::from_ymd_opt(2025, 6, 15).unwrap()
        );
    }
}
