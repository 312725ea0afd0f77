//! Parsing of human-written instants for the command line

use chrono::{DateTime, Duration, NaiveDateTime, Utc};

use crate::error::{CadenceError, Result};

/// Parse an instant relative to `now`.
///
/// Accepted forms, tried in order:
/// - `now`
/// - RFC 3339: `2030-01-07T09:00:00Z`, `2030-01-07T09:00:00-05:00`
/// - `YYYY-MM-DD HH:MM`, read as UTC
/// - durations from now: `30m`, `2h`, `1d 6h`
/// - natural language: `tomorrow`, `next monday 9am`
pub fn parse_instant(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    let input = input.trim();
    if input.is_empty() {
        return Err(CadenceError::InvalidInput(
            "time cannot be empty".to_string(),
        ));
    }

    if input.eq_ignore_ascii_case("now") {
        return Ok(now);
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(input) {
        return Ok(dt.with_timezone(&Utc));
    }

    if let Ok(naive) = NaiveDateTime::parse_from_str(input, "%Y-%m-%d %H:%M") {
        return Ok(naive.and_utc());
    }

    if let Ok(duration) = parse_duration(input) {
        return Ok(now + duration);
    }

    chrono_english::parse_date_string(input, now, chrono_english::Dialect::Us)
        .map_err(|_| CadenceError::InvalidInput(format!("could not parse time: {}", input)))
}

fn parse_duration(input: &str) -> Result<Duration> {
    let std_duration = humantime::parse_duration(input)
        .map_err(|e| CadenceError::InvalidInput(format!("could not parse duration: {}", e)))?;

    i64::try_from(std_duration.as_secs())
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| CadenceError::InvalidInput("duration out of range".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2030, 1, 7, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_now_keyword() {
        assert_eq!(parse_instant("now", now()).unwrap(), now());
        assert_eq!(parse_instant("  NOW ", now()).unwrap(), now());
    }

    #[test]
    fn test_rfc3339_with_offset() {
        let parsed = parse_instant("2030-01-07T09:00:00-05:00", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2030, 1, 7, 14, 0, 0).unwrap());
    }

    #[test]
    fn test_plain_date_time_is_utc() {
        let parsed = parse_instant("2030-01-09 12:00", now()).unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2030, 1, 9, 12, 0, 0).unwrap());
    }

    #[test]
    fn test_durations() {
        assert_eq!(
            parse_instant("30m", now()).unwrap(),
            now() + Duration::minutes(30)
        );
        assert_eq!(
            parse_instant("1d 6h", now()).unwrap(),
            now() + Duration::hours(30)
        );
    }

    #[test]
    fn test_natural_language() {
        let parsed = parse_instant("tomorrow", now()).unwrap();
        assert!(parsed > now());
        assert!(parsed - now() <= Duration::days(2));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(matches!(
            parse_instant("", now()),
            Err(CadenceError::InvalidInput(_))
        ));
        assert!(matches!(
            parse_instant("not a time at all", now()),
            Err(CadenceError::InvalidInput(_))
        ));
    }
}
