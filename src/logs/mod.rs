//! Values scraped from free-text terminal lines and plugin strings.

use regex::Regex;
use std::sync::OnceLock;

const FAN_PWM_MAX: f64 = 255.0;

fn fan_command() -> Option<&'static Regex> {
    static FAN_COMMAND: OnceLock<Option<Regex>> = OnceLock::new();
    FAN_COMMAND
        .get_or_init(|| Regex::new(r"(?i)M106 S(\d+)").ok())
        .as_ref()
}

/// Fan speed in percent from the first `M106 S<n>` found in `logs`.
///
/// `None` means the stored value must stay as it is: no logs, an empty
/// batch or no matching line.
pub fn fan_speed_from_logs(logs: Option<&[String]>) -> Option<u8> {
    let pattern = fan_command()?;
    let captured = logs?
        .iter()
        .find_map(|line| pattern.captures(line))?
        .get(1)?
        .as_str();
    // Digit runs too long for u64 are still "very large".
    let pwm = captured.parse::<u64>().unwrap_or(u64::MAX);
    Some(pwm_to_percent(pwm))
}

fn pwm_to_percent(pwm: u64) -> u8 {
    let percent = (pwm as f64 / FAN_PWM_MAX * 100.0).round();
    percent.clamp(0.0, 100.0) as u8
}

/// DisplayLayerProgress reports `"Off"`, `"-"` or `"<n>%"`.
pub fn fan_speed_from_plugin(text: &str) -> Option<u8> {
    let text = text.trim();
    if text.eq_ignore_ascii_case("off") || text == "-" {
        return Some(0);
    }
    let value: f64 = text.trim_end_matches('%').trim().parse().ok()?;
    if !value.is_finite() {
        return None;
    }
    Some(value.round().clamp(0.0, 100.0) as u8)
}

/// Layer counter from DisplayLayerProgress; `"-"` and garbage read as 0.
pub fn layer_from_plugin(text: Option<&str>) -> u32 {
    match text.map(str::trim) {
        None | Some("-") => 0,
        Some(value) => value.parse().unwrap_or(0),
    }
}
