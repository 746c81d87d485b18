//! Configuration value parsing helpers.

use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

/// One duration segment: a number immediately followed by a unit.
static DURATION_SEGMENT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d+)([smhd])").expect("segment pattern is valid"));

/// Parse a duration string made of unit-suffixed segments, e.g. "30s",
/// "5m", "1h30m". Every number needs a unit and the total must be
/// positive.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let mut rest = s;
    let mut total_seconds: u64 = 0;

    if rest.is_empty() {
        return Err("empty duration".to_string());
    }

    while !rest.is_empty() {
        let caps = DURATION_SEGMENT.captures(rest).ok_or_else(|| {
            format!("invalid duration segment {rest:?} in {s:?}, expected forms like \"90s\" or \"1h30m\"")
        })?;
        let value: u64 = caps[1]
            .parse()
            .map_err(|_| format!("number out of range in duration {s:?}"))?;
        let per_unit = match &caps[2] {
            "s" => 1,
            "m" => 60,
            "h" => 3600,
            "d" => 86400,
            other => return Err(format!("unknown duration unit {other:?}")),
        };
        total_seconds = value
            .checked_mul(per_unit)
            .and_then(|secs| total_seconds.checked_add(secs))
            .ok_or_else(|| format!("duration {s:?} out of range"))?;
        rest = &rest[caps[0].len()..];
    }

    if total_seconds == 0 {
        return Err(format!("duration {s:?} must be positive"));
    }

    Ok(Duration::from_secs(total_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_per_unit() {
        assert_eq!(parse_duration("45s").unwrap(), Duration::from_secs(45));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1d").unwrap(), Duration::from_secs(86400));
    }

    #[test]
    fn compound_segments_accumulate() {
        assert_eq!(parse_duration("1h30m").unwrap(), Duration::from_secs(5400));
        assert_eq!(
            parse_duration("1d2h5m30s").unwrap(),
            Duration::from_secs(86400 + 7200 + 300 + 30)
        );
    }

    #[test]
    fn bare_number_is_a_segment_error_not_a_zero_error() {
        // A number with no unit fails as a malformed segment, which is a
        // different failure from a well-formed zero duration.
        let err = parse_duration("10").unwrap_err();
        assert!(err.contains("segment"), "got {err:?}");

        let err = parse_duration("1h30").unwrap_err();
        assert!(err.contains("segment"), "got {err:?}");
    }

    #[test]
    fn zero_duration_is_rejected_as_non_positive() {
        let err = parse_duration("0s").unwrap_err();
        assert!(err.contains("positive"), "got {err:?}");

        let err = parse_duration("0h0m").unwrap_err();
        assert!(err.contains("positive"), "got {err:?}");
    }

    #[test]
    fn empty_and_garbage_are_rejected() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("s30").is_err());
        assert!(parse_duration("30 s").is_err());
    }

    #[test]
    fn oversized_values_do_not_wrap() {
        let err = parse_duration("99999999999999999999s").unwrap_err();
        assert!(err.contains("out of range"), "got {err:?}");
    }
}
