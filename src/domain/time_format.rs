use crate::domain::errors::ValidationErrors;
use serde::{Deserialize, Serialize};

pub const MINUTES_PER_DAY: u16 = 24 * 60;
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum TimeFormat {
    #[default]
    #[serde(rename = "12h")]
    TwelveHour,
    #[serde(rename = "24h")]
    TwentyFourHour,
}

/// Lenient parse used on render paths: anything unparseable maps to midnight.
pub fn parse_to_minutes(text: &str) -> u16 {
    parse_clock(text).unwrap_or(0)
}

pub fn parse_time_input(text: &str, field_name: &str) -> Result<u16, ValidationErrors> {
    parse_clock(text).ok_or_else(|| {
        ValidationErrors::single(field_name, "must be H:MM AM/PM or HH:MM")
    })
}

pub fn parse_duration_input(value: u32, field_name: &str) -> Result<u32, ValidationErrors> {
    if value == 0 || value > MAX_DURATION_MINUTES {
        return Err(ValidationErrors::single(
            field_name,
            format!("must be between 1 and {MAX_DURATION_MINUTES} minutes"),
        ));
    }
    Ok(value)
}

pub fn format_minutes(minutes: u16, mode: TimeFormat) -> String {
    let minutes = minutes % MINUTES_PER_DAY;
    let hour = minutes / 60;
    let minute = minutes % 60;
    match mode {
        TimeFormat::TwentyFourHour => format!("{hour:02}:{minute:02}"),
        TimeFormat::TwelveHour => {
            let meridiem = if hour < 12 { "AM" } else { "PM" };
            let display_hour = match hour % 12 {
                0 => 12,
                other => other,
            };
            format!("{display_hour}:{minute:02} {meridiem}")
        }
    }
}

fn parse_clock(text: &str) -> Option<u16> {
    let normalized = text.trim().to_ascii_uppercase();
    if normalized.is_empty() {
        return None;
    }

    let (clock, meridiem) = if let Some(rest) = normalized.strip_suffix("AM") {
        (rest.trim_end(), Some(false))
    } else if let Some(rest) = normalized.strip_suffix("PM") {
        (rest.trim_end(), Some(true))
    } else {
        (normalized.as_str(), None)
    };

    let (hour_str, minute_str) = clock.split_once(':')?;
    if !is_digits(hour_str, 1, 2) || !is_digits(minute_str, 1, 2) {
        return None;
    }
    let hour = hour_str.parse::<u16>().ok()?;
    let minute = minute_str.parse::<u16>().ok()?;
    if minute > 59 {
        return None;
    }

    let hour = match meridiem {
        None if hour <= 23 => hour,
        None => return None,
        Some(_) if hour == 0 || hour > 12 => return None,
        Some(false) => hour % 12,
        Some(true) => hour % 12 + 12,
    };
    Some(hour * 60 + minute)
}

fn is_digits(value: &str, min_len: usize, max_len: usize) -> bool {
    (min_len..=max_len).contains(&value.len()) && value.bytes().all(|byte| byte.is_ascii_digit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_twelve_hour_forms() {
        assert_eq!(parse_to_minutes("7:30 AM"), 7 * 60 + 30);
        assert_eq!(parse_to_minutes("07:30 pm"), 19 * 60 + 30);
        assert_eq!(parse_to_minutes("12:00 AM"), 0);
        assert_eq!(parse_to_minutes("12:15 PM"), 12 * 60 + 15);
        assert_eq!(parse_to_minutes("9:05pm"), 21 * 60 + 5);
    }

    #[test]
    fn parses_twenty_four_hour_forms() {
        assert_eq!(parse_to_minutes("00:00"), 0);
        assert_eq!(parse_to_minutes("7:45"), 7 * 60 + 45);
        assert_eq!(parse_to_minutes("23:59"), 1439);
    }

    #[test]
    fn unparseable_input_maps_to_zero() {
        for raw in ["", "noon", "24:00", "13:00 PM", "0:30 AM", "7:60", "7", "7:5:1", "::"] {
            assert_eq!(parse_to_minutes(raw), 0, "input {raw:?}");
        }
    }

    #[test]
    fn strict_parse_reports_field() {
        let error = parse_time_input("later", "task.scheduled_time").expect_err("rejects");
        assert_eq!(error.fields().collect::<Vec<_>>(), vec!["task.scheduled_time"]);
    }

    #[test]
    fn duration_bounds_are_enforced() {
        assert!(parse_duration_input(0, "task.duration_minutes").is_err());
        assert!(parse_duration_input(1441, "task.duration_minutes").is_err());
        assert_eq!(parse_duration_input(30, "task.duration_minutes"), Ok(30));
    }

    #[test]
    fn formats_both_modes() {
        assert_eq!(format_minutes(0, TimeFormat::TwelveHour), "12:00 AM");
        assert_eq!(format_minutes(720, TimeFormat::TwelveHour), "12:00 PM");
        assert_eq!(format_minutes(425, TimeFormat::TwelveHour), "7:05 AM");
        assert_eq!(format_minutes(425, TimeFormat::TwentyFourHour), "07:05");
    }

    #[test]
    fn every_minute_roundtrips_in_both_modes() {
        for minute in 0..MINUTES_PER_DAY {
            for mode in [TimeFormat::TwelveHour, TimeFormat::TwentyFourHour] {
                assert_eq!(parse_to_minutes(&format_minutes(minute, mode)), minute);
            }
        }
    }

    proptest! {
        #[test]
        fn lenient_parse_stays_in_range(raw in "\\PC{0,12}") {
            prop_assert!(parse_to_minutes(&raw) < MINUTES_PER_DAY);
        }
    }
}
