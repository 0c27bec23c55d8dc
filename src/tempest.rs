//! TEMPEST emission-state engine (component D): caches per-device state,
//! auto-discovers the control that drives it, and translates abstract
//! state transitions into control writes.

use crate::{catalog, device::Device, error::Result, events};
use std::fmt;

/// Totally ordered TEMPEST emission state. Numeric encoding is part of the
/// external contract and must not be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TempestState {
    /// No emission countermeasures active.
    Disabled = 0,
    /// Baseline emission countermeasures.
    Low = 1,
    /// Elevated emission countermeasures.
    High = 2,
    /// Sensor output is fully denied.
    Lockdown = 3,
}

impl TempestState {
    #[must_use]
    pub(crate) fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for TempestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TempestState::Disabled => "DISABLED",
            TempestState::Low => "LOW",
            TempestState::High => "HIGH",
            TempestState::Lockdown => "LOCKDOWN",
        };
        f.write_str(s)
    }
}

/// Target control id plus the four numeric values on that control
/// corresponding to the four emission states.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TempestMapping {
    /// Numeric V4L2 control id driving the emission state. Zero means "not
    /// yet resolved" when `auto_detect` is set.
    pub control_id: u32,
    /// Value to write when transitioning to [`TempestState::Disabled`].
    pub disabled_value: i32,
    /// Value to write when transitioning to [`TempestState::Low`].
    pub low_value: i32,
    /// Value to write when transitioning to [`TempestState::High`].
    pub high_value: i32,
    /// Value to write when transitioning to [`TempestState::Lockdown`].
    pub lockdown_value: i32,
    /// Whether to resolve `control_id` by heuristic name match when it is
    /// zero (see [`discover`]).
    pub auto_detect: bool,
}

impl TempestMapping {
    fn value_for(&self, state: TempestState) -> i32 {
        match state {
            TempestState::Disabled => self.disabled_value,
            TempestState::Low => self.low_value,
            TempestState::High => self.high_value,
            TempestState::Lockdown => self.lockdown_value,
        }
    }
}

/// Reads the cached TEMPEST state for `dev`. Side-effect free: never touches
/// hardware.
#[must_use]
pub fn get_state(dev: &Device) -> TempestState {
    dev.tempest_state()
}

/// Transitions `dev` to `target`.
///
/// If a mapping is installed on the device, writes the target's numeric
/// value to the mapped control. If no mapping is installed, only the cache
/// is updated (and the transition logged) — this is what makes dry-run and
/// simulator use of this engine possible without real hardware.
///
/// The engine does not itself prevent non-monotone transitions (e.g. `Low`
/// directly to `Lockdown`, or back); that policy lives in [`crate::policy`].
///
/// # Errors
///
/// Propagates any ioctl failure from writing the mapped control.
pub fn set_state(dev: &mut Device, target: TempestState) -> Result<()> {
    let old = dev.tempest_state();
    if let Some(mapping) = dev.tempest_mapping() {
        let value = mapping.value_for(target);
        dev.set_raw_control(mapping.control_id, i64::from(value))?;
    }
    dev.set_tempest_state_cache(target);
    events::emit_simple(
        dev.token(),
        events::Category::TempestTransition,
        events::Severity::Info,
        events::Payload::TempestTransition { old, new: target },
    );
    Ok(())
}

/// Enumerates controls and returns the id of the first whose lowercased
/// name contains a TEMPEST-related substring (see
/// [`catalog::is_tempest_control_name`]). Deterministic for a given device:
/// depends on kernel enumeration order, which is stable for a given driver.
///
/// # Errors
///
/// Returns [`crate::Error::NotFound`] if no control name matches.
pub fn discover(dev: &Device) -> Result<u32> {
    let mut found = None;
    dev.enum_controls(|name, id| {
        if found.is_none() && catalog::is_tempest_control_name(name) {
            found = Some(id);
        }
    })?;
    found.ok_or_else(|| crate::Error::NotFound("TEMPEST-like control".into()))
}

/// Applies `dev`'s profile-provided TEMPEST mapping, running [`discover`] if
/// `auto_detect` is set and no explicit control id was given.
///
/// # Errors
///
/// Propagates [`discover`]'s error if auto-discovery fails to find a
/// candidate control.
pub fn install_mapping(dev: &mut Device) -> Result<()> {
    let Some(mut mapping) = dev.tempest_mapping() else { return Ok(()) };
    if mapping.auto_detect && mapping.control_id == 0 {
        mapping.control_id = discover(dev)?;
        dev.set_tempest_mapping(mapping);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_ordering_is_total() {
        assert!(TempestState::Disabled < TempestState::Low);
        assert!(TempestState::Low < TempestState::High);
        assert!(TempestState::High < TempestState::Lockdown);
    }

    #[test]
    fn numeric_encoding_is_stable() {
        assert_eq!(TempestState::Disabled.as_u8(), 0);
        assert_eq!(TempestState::Low.as_u8(), 1);
        assert_eq!(TempestState::High.as_u8(), 2);
        assert_eq!(TempestState::Lockdown.as_u8(), 3);
    }

    #[test]
    fn mapping_selects_value_per_state() {
        let mapping = TempestMapping {
            control_id: 1,
            disabled_value: 0,
            low_value: 1,
            high_value: 2,
            lockdown_value: 3,
            auto_detect: false,
        };
        assert_eq!(mapping.value_for(TempestState::Disabled), 0);
        assert_eq!(mapping.value_for(TempestState::Lockdown), 3);
    }
}
