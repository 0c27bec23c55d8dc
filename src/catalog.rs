//! Name to numeric-ID mapping for standard V4L2 controls, and the
//! TEMPEST-name heuristic classifier used by the TEMPEST engine's
//! auto-discovery (component B).

use crate::error::{Error, Result};

/// Substring patterns (case-insensitive) that mark a control as
/// TEMPEST-related for auto-discovery purposes.
const TEMPEST_PATTERNS: &[&str] = &[
    "tempest", "privacy", "secure", "shutter", "led", "indicator", "emission", "lockdown",
];

const CONTROL_TABLE: &[(&str, u32)] = &[
    ("brightness", v4l2_sys::V4L2_CID_BRIGHTNESS),
    ("contrast", v4l2_sys::V4L2_CID_CONTRAST),
    ("saturation", v4l2_sys::V4L2_CID_SATURATION),
    ("hue", v4l2_sys::V4L2_CID_HUE),
    ("gain", v4l2_sys::V4L2_CID_GAIN),
    ("exposure_auto", v4l2_sys::V4L2_CID_EXPOSURE_AUTO),
    ("exposure_absolute", v4l2_sys::V4L2_CID_EXPOSURE_ABSOLUTE),
    ("focus_auto", v4l2_sys::V4L2_CID_FOCUS_AUTO),
    ("focus_absolute", v4l2_sys::V4L2_CID_FOCUS_ABSOLUTE),
    ("sharpness", v4l2_sys::V4L2_CID_SHARPNESS),
    ("backlight_compensation", v4l2_sys::V4L2_CID_BACKLIGHT_COMPENSATION),
    ("power_line_frequency", v4l2_sys::V4L2_CID_POWER_LINE_FREQUENCY),
    ("white_balance_temperature_auto", v4l2_sys::V4L2_CID_AUTO_WHITE_BALANCE),
    ("white_balance_temperature", v4l2_sys::V4L2_CID_WHITE_BALANCE_TEMPERATURE),
];

/// Resolves a human control name (e.g. `"brightness"`) to its numeric V4L2
/// control id. Matching is exact against the static table above; unlike the
/// TEMPEST heuristic below, this lookup is not substring-based.
///
/// # Errors
///
/// Returns [`Error::NotFound`] if `name` is not a recognized control name.
pub fn name_to_id(name: &str) -> Result<u32> {
    CONTROL_TABLE
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, id)| *id)
        .ok_or_else(|| Error::NotFound(format!("control name `{name}`")))
}

/// Returns `true` if `name`, compared case-insensitively, contains any of
/// the TEMPEST-related substrings used by the auto-discovery heuristic. The
/// first pattern found wins, though callers only care about the boolean
/// result; matching is substring, not whole-word.
#[must_use]
pub fn is_tempest_control_name(name: &str) -> bool {
    let lower = name.to_lowercase();
    TEMPEST_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_controls() {
        assert_eq!(name_to_id("brightness").unwrap(), v4l2_sys::V4L2_CID_BRIGHTNESS);
        assert_eq!(name_to_id("gain").unwrap(), v4l2_sys::V4L2_CID_GAIN);
    }

    #[test]
    fn unknown_control_is_not_found() {
        let err = name_to_id("unknown").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[test]
    fn tempest_pattern_matching_is_case_insensitive_substring() {
        assert!(is_tempest_control_name("TEMPEST Shutter"));
        assert!(is_tempest_control_name("privacy_led"));
        assert!(is_tempest_control_name("Emission Lockdown Override"));
        assert!(!is_tempest_control_name("brightness"));
    }
}
