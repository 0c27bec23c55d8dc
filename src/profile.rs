//! Profile loader: parses the external profile document into a
//! [`Profile`] value, resolves defaults, and [`apply`]s it to a [`Device`].

use crate::{
    catalog,
    device::Device,
    error::{Error, Result},
    tempest::{self, TempestMapping},
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    sync::RwLock,
};

/// Maximum number of `(id, value)` control presets a profile may carry.
pub const MAX_CONTROLS: usize = 32;

/// A single resolved control preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlPreset {
    /// Numeric V4L2 control id.
    pub id: u32,
    /// Value to write to the control.
    pub value: i32,
}

/// A control name in the document that could not be resolved via the
/// control catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedControl {
    /// The name as written in the document.
    pub name: String,
    /// The value it was paired with.
    pub value: i32,
}

/// Fully resolved device profile: how a given role of device should be
/// driven.
#[derive(Debug, Clone, PartialEq)]
pub struct Profile {
    /// USB VID:PID or PCI ID, as a string (e.g. `"046d:0825"`).
    pub id: String,
    /// Device role, e.g. `"camera"`, `"iris_scanner"`.
    pub role: String,
    /// Preferred device path, if any.
    pub device_hint: Option<String>,
    /// Classification label, e.g. `"UNCLASSIFIED"`, `"SECRET_BIOMETRIC"`.
    pub classification: String,
    /// Desired pixel format, little-endian fourcc.
    pub pixel_format: u32,
    /// Desired width, in pixels.
    pub width: u32,
    /// Desired height, in pixels.
    pub height: u32,
    /// Desired frame-interval numerator.
    pub fps_num: u32,
    /// Desired frame-interval denominator.
    pub fps_den: u32,
    /// Resolved control presets, at most [`MAX_CONTROLS`].
    pub controls: Vec<ControlPreset>,
    /// Control names present in the document that the catalog could not
    /// resolve; reported rather than silently dropped.
    pub unresolved_controls: Vec<UnresolvedControl>,
    /// TEMPEST control mapping.
    pub tempest_mapping: TempestMapping,
    /// Companion metadata device path, if any.
    pub meta_device: Option<String>,
    /// Companion metadata device pixel format.
    pub meta_format: u32,
    /// Number of buffers to request when streaming starts.
    pub buffer_count: u32,
    /// Advisory flag: operations on this device should run in constant
    /// time regardless of input (not enforced by this crate).
    pub constant_time_required: bool,
    /// Advisory flag: this device is a candidate for post-quantum signal
    /// processing pipelines (not enforced by this crate).
    pub quantum_candidate: bool,
}

/// Wire format of the profile document. Every field is
/// optional so that unknown or absent top-level keys resolve to typed
/// defaults rather than failing the whole load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ProfileDocument {
    id: String,
    role: String,
    device_hint: String,
    classification: String,
    pixel_format: String,
    resolution: Vec<u32>,
    fps: u32,
    meta_device: String,
    meta_format: String,
    #[serde(default = "default_buffer_count")]
    buffer_count: u32,
    constant_time_required: bool,
    quantum_candidate: bool,
    controls: std::collections::BTreeMap<String, i32>,
    tempest_control: TempestControlDocument,
}

fn default_buffer_count() -> u32 {
    4
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct TempestControlDocument {
    id: u32,
    auto_detect: bool,
    mode_map: std::collections::BTreeMap<String, i32>,
}

fn fourcc_to_u32(fourcc: &str) -> u32 {
    let bytes = fourcc.as_bytes();
    if bytes.len() != 4 {
        return 0;
    }
    u32::from(bytes[0])
        | (u32::from(bytes[1]) << 8)
        | (u32::from(bytes[2]) << 16)
        | (u32::from(bytes[3]) << 24)
}

fn u32_to_fourcc(value: u32) -> String {
    if value == 0 {
        return String::new();
    }
    let bytes = value.to_le_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

impl Profile {
    /// Converts a parsed [`ProfileDocument`] into a resolved [`Profile`],
    /// resolving control names via the catalog (component B).
    ///
    /// Unlike a hard failure, unresolved control names are *collected* into
    /// the profile's `unresolved_controls` field rather than aborting the
    /// load or being silently skipped — callers decide whether that
    /// is fatal for their use case.
    fn from_document(doc: ProfileDocument) -> Self {
        let mut controls = Vec::new();
        let mut unresolved = Vec::new();
        for (name, value) in doc.controls {
            if controls.len() >= MAX_CONTROLS {
                break;
            }
            match catalog::name_to_id(&name) {
                Ok(id) => controls.push(ControlPreset { id, value }),
                Err(_) => unresolved.push(UnresolvedControl { name, value }),
            }
        }

        let (width, height) = match doc.resolution.as_slice() {
            [w, h, ..] => (*w, *h),
            _ => (0, 0),
        };

        let mode_map = &doc.tempest_control.mode_map;
        let tempest_mapping = TempestMapping {
            control_id: doc.tempest_control.id,
            disabled_value: mode_map.get("DISABLED").copied().unwrap_or(0),
            low_value: mode_map.get("LOW").copied().unwrap_or(0),
            high_value: mode_map.get("HIGH").copied().unwrap_or(0),
            lockdown_value: mode_map.get("LOCKDOWN").copied().unwrap_or(0),
            auto_detect: doc.tempest_control.auto_detect,
        };

        Profile {
            id: doc.id,
            role: doc.role,
            device_hint: non_empty(doc.device_hint),
            classification: doc.classification,
            pixel_format: fourcc_to_u32(&doc.pixel_format),
            width,
            height,
            fps_num: doc.fps,
            fps_den: 1,
            controls,
            unresolved_controls: unresolved,
            tempest_mapping,
            meta_device: non_empty(doc.meta_device),
            meta_format: fourcc_to_u32(&doc.meta_format),
            buffer_count: if doc.buffer_count == 0 { default_buffer_count() } else { doc.buffer_count },
            constant_time_required: doc.constant_time_required,
            quantum_candidate: doc.quantum_candidate,
        }
    }

    /// Canonical serialization used by round-trip tests: converts back to
    /// the document wire format.
    fn to_document(&self) -> ProfileDocument {
        let mut controls = std::collections::BTreeMap::new();
        for preset in &self.controls {
            if let Some(name) = catalog_name_for(preset.id) {
                controls.insert(name, preset.value);
            }
        }
        let mut mode_map = std::collections::BTreeMap::new();
        mode_map.insert("DISABLED".to_owned(), self.tempest_mapping.disabled_value);
        mode_map.insert("LOW".to_owned(), self.tempest_mapping.low_value);
        mode_map.insert("HIGH".to_owned(), self.tempest_mapping.high_value);
        mode_map.insert("LOCKDOWN".to_owned(), self.tempest_mapping.lockdown_value);

        ProfileDocument {
            id: self.id.clone(),
            role: self.role.clone(),
            device_hint: self.device_hint.clone().unwrap_or_default(),
            classification: self.classification.clone(),
            pixel_format: u32_to_fourcc(self.pixel_format),
            resolution: vec![self.width, self.height],
            fps: self.fps_num,
            meta_device: self.meta_device.clone().unwrap_or_default(),
            meta_format: u32_to_fourcc(self.meta_format),
            buffer_count: self.buffer_count,
            constant_time_required: self.constant_time_required,
            quantum_candidate: self.quantum_candidate,
            controls,
            tempest_control: TempestControlDocument {
                id: self.tempest_mapping.control_id,
                auto_detect: self.tempest_mapping.auto_detect,
                mode_map,
            },
        }
    }
}

fn catalog_name_for(id: u32) -> Option<String> {
    const NAMES: &[&str] = &[
        "brightness",
        "contrast",
        "saturation",
        "hue",
        "gain",
        "exposure_auto",
        "exposure_absolute",
        "focus_auto",
        "focus_absolute",
        "sharpness",
        "backlight_compensation",
        "power_line_frequency",
        "white_balance_temperature_auto",
        "white_balance_temperature",
    ];
    NAMES.iter().find(|name| catalog::name_to_id(name).ok() == Some(id)).map(|s| (*s).to_owned())
}

fn non_empty(s: String) -> Option<String> {
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

static PROFILE_DIR: OnceCell<RwLock<PathBuf>> = OnceCell::new();

fn profile_dir_lock() -> &'static RwLock<PathBuf> {
    PROFILE_DIR.get_or_init(|| RwLock::new(PathBuf::from("dsv4l2/profiles")))
}

/// Returns the process-wide profile directory (default `"dsv4l2/profiles"`).
#[must_use]
pub fn dir() -> PathBuf {
    profile_dir_lock().read().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
}

/// Sets the process-wide profile directory.
pub fn set_dir<P: Into<PathBuf>>(path: P) {
    *profile_dir_lock().write().unwrap_or_else(std::sync::PoisonError::into_inner) = path.into();
}

/// Loads and resolves a profile document from an explicit filesystem path.
///
/// # Errors
///
/// Returns [`Error::Io`] if the file cannot be read, or
/// [`Error::ParseError`] if it is not valid YAML for this schema.
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Profile> {
    let text = fs::read_to_string(path.as_ref())?;
    let doc: ProfileDocument =
        serde_yaml::from_str(&text).map_err(|e| Error::ParseError(e.to_string()))?;
    Ok(Profile::from_document(doc))
}

/// Loads `{profile_dir}/{role}.yaml`.
///
/// # Errors
///
/// See [`load_from_file`].
pub fn load_by_role(role: &str) -> Result<Profile> {
    let path = dir().join(format!("{role}.yaml"));
    load_from_file(path)
}

/// Loads a profile by matching `vendor_id:product_id` against the `id`
/// field of every `*.yaml` file in the profile directory. Falls back to
/// [`load_by_role`] if nothing matches, logging the fallback at `debug!`
/// rather than doing it silently.
///
/// # Errors
///
/// Returns whatever [`load_by_role`] returns if no profile in the directory
/// matches `vendor_id:product_id`, or an I/O error listing the directory.
pub fn load_by_vidpid(vendor_id: u16, product_id: u16, role: &str) -> Result<Profile> {
    let wanted = format!("{vendor_id:04x}:{product_id:04x}");
    let dir_path = dir();
    if let Ok(entries) = fs::read_dir(&dir_path) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            if let Ok(profile) = load_from_file(&path) {
                if profile.id.eq_ignore_ascii_case(&wanted) {
                    return Ok(profile);
                }
            }
        }
    }
    log::debug!("no profile matched VID:PID {wanted}; falling back to role `{role}`");
    load_by_role(role)
}

/// Serializes `profile` back to YAML using the canonical wire format, for
/// round-trip testing.
///
/// # Errors
///
/// Returns [`Error::ParseError`] if serialization fails (this should not
/// happen for a well-formed [`Profile`]).
pub fn to_yaml(profile: &Profile) -> Result<String> {
    serde_yaml::to_string(&profile.to_document()).map_err(|e| Error::ParseError(e.to_string()))
}

/// Applies `profile` to `dev`: negotiates the format, then drives framerate,
/// control presets and the TEMPEST mapping on a best-effort basis.
///
/// Format is the only step that aborts the whole apply on failure; it is
/// only attempted if `profile` declares a non-zero `pixel_format`, `width`
/// and `height`. Framerate and each control preset are logged and skipped
/// on failure rather than aborting — not every device supports framerate
/// negotiation, and not every control preset is available on every device.
/// Finally, [`tempest::install_mapping`] resolves (and auto-discovers, if
/// requested) the device's TEMPEST control; a failure there is logged, not
/// propagated, since a profile with no TEMPEST mapping at all is valid.
///
/// # Errors
///
/// Returns whatever [`Device::set_format`] returns if the profile declares a
/// format and negotiating it fails.
pub fn apply(dev: &mut Device, profile: &Profile) -> Result<()> {
    if profile.pixel_format != 0 && profile.width != 0 && profile.height != 0 {
        dev.set_format(profile.pixel_format, profile.width, profile.height)?;
    }

    if profile.fps_num > 0 {
        let fps_den = if profile.fps_den > 0 { profile.fps_den } else { 1 };
        if let Err(err) = dev.set_framerate(profile.fps_num, fps_den) {
            log::warn!("profile apply: set_framerate({}, {fps_den}) failed: {err}", profile.fps_num);
        }
    }

    for preset in &profile.controls {
        if let Err(err) = dev.set_raw_control(preset.id, i64::from(preset.value)) {
            log::warn!("profile apply: control {} = {} failed: {err}", preset.id, preset.value);
        }
    }

    if let Err(err) = tempest::install_mapping(dev) {
        log::warn!("profile apply: TEMPEST mapping install failed: {err}");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_roundtrip() {
        assert_eq!(fourcc_to_u32("YUYV"), u32::from_le_bytes(*b"YUYV"));
        assert_eq!(u32_to_fourcc(fourcc_to_u32("MJPG")), "MJPG");
    }

    #[test]
    fn unknown_top_level_keys_are_ignored_and_defaults_apply() {
        let yaml = "role: camera\nunknown_key: 123\n";
        let doc: ProfileDocument = serde_yaml::from_str(yaml).unwrap();
        let profile = Profile::from_document(doc);
        assert_eq!(profile.role, "camera");
        assert_eq!(profile.buffer_count, 4);
        assert!(!profile.constant_time_required);
        assert_eq!(profile.tempest_mapping.control_id, 0);
    }

    #[test]
    fn resolution_pair_populates_width_height() {
        let yaml = "resolution: [1280, 720]\n";
        let doc: ProfileDocument = serde_yaml::from_str(yaml).unwrap();
        let profile = Profile::from_document(doc);
        assert_eq!(profile.width, 1280);
        assert_eq!(profile.height, 720);
    }

    #[test]
    fn unresolved_control_names_are_reported_not_dropped() {
        let yaml = "controls:\n  brightness: 10\n  totally_unknown_control: 5\n";
        let doc: ProfileDocument = serde_yaml::from_str(yaml).unwrap();
        let profile = Profile::from_document(doc);
        assert_eq!(profile.controls.len(), 1);
        assert_eq!(profile.unresolved_controls.len(), 1);
        assert_eq!(profile.unresolved_controls[0].name, "totally_unknown_control");
    }

    #[test]
    fn mode_map_populates_four_states() {
        let yaml = "tempest_control:\n  id: 99\n  auto_detect: true\n  mode_map:\n    DISABLED: 0\n    LOW: 1\n    HIGH: 2\n    LOCKDOWN: 3\n";
        let doc: ProfileDocument = serde_yaml::from_str(yaml).unwrap();
        let profile = Profile::from_document(doc);
        assert_eq!(profile.tempest_mapping.control_id, 99);
        assert!(profile.tempest_mapping.auto_detect);
        assert_eq!(profile.tempest_mapping.lockdown_value, 3);
    }

    #[test]
    fn round_trip_preserves_declared_fields() {
        let yaml = "id: \"046d:0825\"\nrole: iris_scanner\nclassification: SECRET_BIOMETRIC\npixel_format: YUYV\nresolution: [640, 480]\nfps: 30\nbuffer_count: 6\ncontrols:\n  gain: 3\ntempest_control:\n  id: 7\n  auto_detect: false\n  mode_map:\n    DISABLED: 0\n    LOW: 1\n    HIGH: 2\n    LOCKDOWN: 3\n";
        let doc: ProfileDocument = serde_yaml::from_str(yaml).unwrap();
        let profile = Profile::from_document(doc);
        let reserialized = to_yaml(&profile).unwrap();
        let doc2: ProfileDocument = serde_yaml::from_str(&reserialized).unwrap();
        let profile2 = Profile::from_document(doc2);
        assert_eq!(profile, profile2);
    }
}
