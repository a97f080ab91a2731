use chrono::{NaiveDateTime, TimeDelta};
use std::f64::consts::PI;

/// Spool geometry used to turn extruded length into weight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilamentProfile {
    pub thickness_mm: f64,
    pub density_g_cm3: f64,
}

impl Default for FilamentProfile {
    fn default() -> Self {
        Self {
            thickness_mm: 1.75,
            density_g_cm3: 1.25,
        }
    }
}

/// `H:MM` with hours floored and minutes rounded.
pub fn seconds_to_hours(seconds: f64) -> String {
    let hours = seconds.max(0.0) / 3600.0;
    let mut whole_hours = hours.floor() as u64;
    let mut minutes = ((hours - hours.floor()) * 60.0).round() as u64;
    if minutes == 60 {
        minutes = 0;
        whole_hours += 1;
    }
    format!("{whole_hours}:{minutes:02}")
}

/// Grams, one decimal.
pub fn filament_length_to_weight(length_mm: f64, profile: FilamentProfile) -> f64 {
    let radius = profile.thickness_mm / 2.0;
    let volume_cm3 = length_mm * PI * radius * radius / 1000.0;
    (volume_cm3 * profile.density_g_cm3 * 10.0).round() / 10.0
}

/// Wall-clock `HH:MM` after `seconds` from `now`.
pub fn end_time_after(now: NaiveDateTime, seconds: f64) -> String {
    let end = TimeDelta::try_seconds(seconds.max(0.0) as i64)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(now);
    end.format("%H:%M").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn hours_format_carries_full_minutes() {
        assert_eq!(seconds_to_hours(0.0), "0:00");
        assert_eq!(seconds_to_hours(90.0), "0:02");
        assert_eq!(seconds_to_hours(3600.0), "1:00");
        assert_eq!(seconds_to_hours(3599.0), "1:00");
        assert_eq!(seconds_to_hours(5400.0), "1:30");
        assert_eq!(seconds_to_hours(-20.0), "0:00");
    }

    #[test]
    fn filament_weight_uses_profile() {
        // 1 m of 1.75 mm PLA is roughly 3 g.
        assert_eq!(filament_length_to_weight(1000.0, FilamentProfile::default()), 3.0);
        assert_eq!(filament_length_to_weight(0.0, FilamentProfile::default()), 0.0);
    }

    #[test]
    fn end_time_wraps_past_midnight() {
        let now = NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(23, 30, 0)
            .unwrap();
        assert_eq!(end_time_after(now, 45.0 * 60.0), "00:15");
        assert_eq!(end_time_after(now, 59.0), "23:30");
    }
}
