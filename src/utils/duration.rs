use chrono::Duration;

use crate::errors::{Result, SqlFlowError};

/// Parse a human lookback duration such as `"1 day"`, `"36 hours"`, `"90m"`.
///
/// Accepted units: seconds, minutes, hours, days, weeks, with the usual
/// abbreviations (`s`, `m`/`min`, `h`, `d`, `w`). The unit may be attached to
/// the number or separated by whitespace; a trailing `s` on the long form is
/// optional.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| invalid(trimmed, "missing unit"))?;
    let (num, unit) = trimmed.split_at(split);
    let amount: i64 = num
        .parse()
        .map_err(|_| invalid(trimmed, "missing or invalid number"))?;
    if amount < 0 {
        return Err(invalid(trimmed, "must be non-negative"));
    }

    let duration = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::seconds(amount),
        "m" | "min" | "mins" | "minute" | "minutes" => Duration::minutes(amount),
        "h" | "hr" | "hrs" | "hour" | "hours" => Duration::hours(amount),
        "d" | "day" | "days" => Duration::days(amount),
        "w" | "week" | "weeks" => Duration::weeks(amount),
        other => return Err(invalid(trimmed, &format!("unknown unit {other:?}"))),
    };
    Ok(duration)
}

fn invalid(input: &str, reason: &str) -> SqlFlowError {
    SqlFlowError::Validation(format!("invalid duration {input:?}: {reason}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_spaced_and_attached_units() {
        assert_eq!(parse_duration("1 day").unwrap(), Duration::days(1));
        assert_eq!(parse_duration("36 hours").unwrap(), Duration::hours(36));
        assert_eq!(parse_duration("90m").unwrap(), Duration::minutes(90));
        assert_eq!(parse_duration("2w").unwrap(), Duration::weeks(2));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("day").is_err());
        assert!(parse_duration("12").is_err());
        assert!(parse_duration("3 fortnights").is_err());
        assert!(parse_duration("-1 day").is_err());
    }
}
