//! Hardened capture-device abstraction over Linux V4L2.
//!
//! Wraps the raw ioctl/mmap surface ([`sys`]) with a device lifecycle
//! ([`device`]), a TEMPEST emission-state engine ([`tempest`]), a policy
//! gate tying TEMPEST state to role clearance, classification and
//! THREATCON ([`policy`]), a declarative profile loader ([`profile`]), an
//! append-only event/audit ring ([`events`]), and a zero-copy KLV metadata
//! parser ([`klv`]) for a companion metadata stream.
//!
//! Free functions are grouped by concern rather than flattened into one
//! namespace: device lifecycle lives on [`Device`] itself, TEMPEST
//! transitions are `tempest::*` functions taking `&mut Device`, THREATCON
//! and clearance/layer setup is `policy::*`, profile loading is
//! `profile::*`, runtime introspection of the audit trail is `events::*`.

pub mod buffer;
pub mod catalog;
pub mod device;
pub mod error;
pub mod events;
pub mod frame;
pub mod klv;
pub mod policy;
pub mod profile;
pub mod sys;
pub mod tempest;

pub use device::{Device, DeviceToken, Format, Info};
pub use error::{Error, Result};
pub use frame::{Biometric, Frame, Generic, Label};
pub use profile::Profile;
pub use tempest::TempestState;
