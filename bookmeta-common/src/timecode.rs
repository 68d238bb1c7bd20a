//! Timecode parsing and formatting
//!
//! Chapter lists and tool output use `HH:MM:SS.mmm` style timecodes.
//! Parsing is lenient (`MM:SS`, `SS.fff`, `H:MM:SS,fff`), formatting is fixed.

use std::time::Duration;

/// Format a duration as `HH:MM:SS.mmm`
///
/// # Examples
///
/// ```
/// use bookmeta_common::timecode::format_timecode;
/// use std::time::Duration;
///
/// assert_eq!(format_timecode(Duration::from_millis(0)), "00:00:00.000");
/// assert_eq!(format_timecode(Duration::from_millis(3_723_004)), "01:02:03.004");
/// ```
pub fn format_timecode(duration: Duration) -> String {
    let total_ms = duration.as_millis();
    let hours = total_ms / 3_600_000;
    let minutes = (total_ms % 3_600_000) / 60_000;
    let seconds = (total_ms % 60_000) / 1000;
    let millis = total_ms % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, seconds, millis)
}

/// Parse a timecode into a duration
///
/// Accepts one to three colon-separated components; the last one may carry a
/// fraction separated by `.` or `,`. Fractions beyond millisecond precision are
/// truncated. Returns `None` for anything else.
///
/// # Examples
///
/// ```
/// use bookmeta_common::timecode::parse_timecode;
/// use std::time::Duration;
///
/// assert_eq!(parse_timecode("00:05:00.000"), Some(Duration::from_secs(300)));
/// assert_eq!(parse_timecode("5:00"), Some(Duration::from_secs(300)));
/// assert_eq!(parse_timecode("12.5"), Some(Duration::from_millis(12_500)));
/// assert_eq!(parse_timecode("Intro"), None);
/// ```
pub fn parse_timecode(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }

    let parts: Vec<&str> = input.split(':').collect();
    if parts.len() > 3 {
        return None;
    }

    let (last, leading) = parts.split_last()?;
    // leading components are hours/minutes, folded into whole minutes
    let mut minutes: u64 = 0;
    for part in leading {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let value: u64 = part.parse().ok()?;
        minutes = minutes.checked_mul(60)?.checked_add(value)?;
    }
    let mut total_ms = minutes.checked_mul(60_000)?;

    let (whole, fraction) = match last.find(['.', ',']) {
        Some(pos) => (&last[..pos], Some(&last[pos + 1..])),
        None => (*last, None),
    };
    if whole.is_empty() || !whole.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let seconds: u64 = whole.parse().ok()?;
    total_ms = total_ms.checked_add(seconds.checked_mul(1000)?)?;

    if let Some(fraction) = fraction {
        if fraction.is_empty() || !fraction.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits: String = fraction.chars().chain("000".chars()).take(3).collect();
        total_ms = total_ms.checked_add(digits.parse::<u64>().ok()?)?;
    }

    Some(Duration::from_millis(total_ms))
}

/// Compact human display (`1:02:03` / `2:03`) for log and console output
pub fn format_compact(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / 3600;
    let mins = (secs % 3600) / 60;
    let rest = secs % 60;
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, mins, rest)
    } else {
        format!("{}:{:02}", mins, rest)
    }
}
