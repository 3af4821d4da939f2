use std::time::Duration;

/// Parses an interval string like `"5m"`, `"90s"`, `"2h"`, or a bare number.
///
/// Bare numbers use the default unit (minutes). `"0"`, empty, and
/// unparseable input all return `None`, which callers treat as "disabled".
pub fn parse_every_duration(raw: &str) -> Option<Duration> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (digits, unit) = match trimmed.find(|ch: char| !ch.is_ascii_digit() && ch != '.') {
        Some(index) => trimmed.split_at(index),
        None => (trimmed, "m"),
    };
    let value = digits.parse::<f64>().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    let seconds = match unit.trim().to_ascii_lowercase().as_str() {
        "s" | "sec" | "secs" | "second" | "seconds" => value,
        "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
        "h" | "hr" | "hrs" | "hour" | "hours" => value * 3_600.0,
        "d" | "day" | "days" => value * 86_400.0,
        _ => return None,
    };
    if seconds < 1.0 {
        return None;
    }
    Some(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::parse_every_duration;

    #[test]
    fn unit_parse_every_duration_defaults_to_minutes() {
        assert_eq!(parse_every_duration("5"), Some(Duration::from_secs(300)));
        assert_eq!(parse_every_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_every_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_every_duration("2h"), Some(Duration::from_secs(7_200)));
    }

    #[test]
    fn unit_parse_every_duration_disables_on_zero_or_garbage() {
        assert_eq!(parse_every_duration("0"), None);
        assert_eq!(parse_every_duration(""), None);
        assert_eq!(parse_every_duration("soon"), None);
        assert_eq!(parse_every_duration("-5m"), None);
    }
}
