//! Helpers for reading rclone's progress output and reporting run times.

use std::time::Duration;

/// Extracts the first `NN%` figure from an rclone output line.
pub fn parse_percent(line: &str) -> Option<f32> {
    let bytes = line.as_bytes();
    for (i, _) in line.match_indices('%') {
        let start = bytes[..i]
            .iter()
            .rev()
            .take(3)
            .take_while(|b| b.is_ascii_digit())
            .count();
        if start > 0 {
            let value: f32 = line[i - start..i].parse().ok()?;
            return Some(value.min(100.0));
        }
    }
    None
}

/// Format duration as human-readable string
pub fn format_duration(duration: Duration) -> String {
    let seconds = duration.as_secs();
    if seconds < 60 {
        format!("{:.1}s", duration.as_secs_f64())
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_percent() {
        assert_eq!(
            parse_percent("Transferred:   1.2 MiB / 2.4 MiB, 50%, 1.1 MiB/s, ETA 1s"),
            Some(50.0)
        );
        assert_eq!(parse_percent("100% done"), Some(100.0));
        assert_eq!(parse_percent("first 7% then 80%"), Some(7.0));
        assert_eq!(parse_percent("no figures here"), None);
        assert_eq!(parse_percent("% only"), None);
    }

    #[test]
    fn test_parse_percent_caps_digits() {
        // Only the last three digits before the sign count
        assert_eq!(parse_percent("1234%"), Some(100.0));
        assert_eq!(parse_percent("x999%"), Some(100.0));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(1500)), "1.5s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m 30s");
        assert_eq!(format_duration(Duration::from_secs(3665)), "1h 1m");
    }
}
