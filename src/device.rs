//! Device core (component F): owns the file descriptor, negotiated format,
//! buffer ring and streaming flag, and composes the ioctl facade, TEMPEST
//! engine and policy gate into the capture operations.

use crate::{
    buffer::BufferRing,
    error::{Error, Result},
    events::{self, Category, Payload, Severity},
    frame::{Biometric, Frame, Generic},
    policy,
    profile::Profile,
    sys,
    tempest::{TempestMapping, TempestState},
};
use libc::{c_int, c_void, O_CLOEXEC, O_NONBLOCK, O_RDWR};
use std::{
    ffi::{CStr, CString},
    mem,
    path::{Path, PathBuf},
    ptr,
    sync::atomic::{AtomicU64, Ordering},
};
use v4l2_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_capability, v4l2_control,
    v4l2_field_V4L2_FIELD_NONE, v4l2_format, v4l2_pix_format, v4l2_queryctrl, v4l2_streamparm,
    V4L2_CTRL_FLAG_DISABLED, V4L2_CTRL_FLAG_NEXT_CTRL, VIDIOC_G_CTRL, VIDIOC_G_FMT, VIDIOC_G_PARM,
    VIDIOC_QUERYCAP, VIDIOC_QUERYCTRL, VIDIOC_S_CTRL, VIDIOC_S_FMT, VIDIOC_S_PARM,
    VIDIOC_STREAMOFF, VIDIOC_STREAMON,
};

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Opaque identity for a [`Device`], used by the TEMPEST engine, policy
/// gate and event ring to key off device identity without holding a
/// back-reference to the device itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceToken(u64);

impl DeviceToken {
    fn next() -> Self {
        Self(NEXT_TOKEN.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value, for embedding in event payloads.
    #[must_use]
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Negotiated pixel format (fourcc, resolution and field layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Format {
    /// Little-endian-packed four-character pixel format code.
    pub fourcc: u32,
    /// Negotiated width in pixels (the driver may alter the requested
    /// value).
    pub width: u32,
    /// Negotiated height in pixels.
    pub height: u32,
}

/// Basic device identification, as returned by `QUERYCAP`.
#[derive(Debug, Clone)]
pub struct Info {
    /// Driver name.
    pub driver: String,
    /// Card (device) name.
    pub card: String,
    /// Bus info string.
    pub bus_info: String,
}

/// The owner of everything tied to one open capture device.
///
/// Opaque by design — every field is private; callers interact through
/// methods only, never through a raw pointer cast to some larger internal
/// type.
pub struct Device {
    fd: c_int,
    path: PathBuf,
    token: DeviceToken,
    role: String,
    classification: String,
    layer: u8,
    profile: Option<Profile>,
    tempest_state: TempestState,
    tempest_mapping: Option<TempestMapping>,
    format: Option<Format>,
    frame_interval: Option<(u32, u32)>,
    buffers: Option<BufferRing>,
    streaming: bool,
}

impl Device {
    /// Opens `path` non-blocking read-write and binds an optional profile.
    ///
    /// TEMPEST state starts at [`TempestState::Disabled`]; the profile's
    /// role, classification and layer (layer defaults to 0) are copied in.
    /// Subsequent calls may be any other `Device` method.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the device cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, profile: Option<Profile>) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let c_path = CString::new(path.to_string_lossy().as_bytes())
            .map_err(|_| Error::InvalidArgument("device path contains NUL byte".into()))?;
        let fd = unsafe { sys::open(c_path.as_ptr(), O_RDWR | O_NONBLOCK | O_CLOEXEC)? };

        let token = DeviceToken::next();
        let (role, classification, tempest_mapping) = match &profile {
            Some(p) => (
                p.role.clone(),
                p.classification.clone(),
                (p.tempest_mapping.control_id != 0 || p.tempest_mapping.auto_detect)
                    .then_some(p.tempest_mapping),
            ),
            None => ("unknown".to_owned(), "UNCLASSIFIED".to_owned(), None),
        };

        let dev = Self {
            fd,
            path,
            token,
            role,
            classification,
            layer: 0,
            profile,
            tempest_state: TempestState::Disabled,
            tempest_mapping,
            format: None,
            frame_interval: None,
            buffers: None,
            streaming: false,
        };

        events::emit_simple(dev.token.value(), Category::DeviceOpen, Severity::Info, Payload::None);
        Ok(dev)
    }

    /// Opaque identity token for this device.
    #[must_use]
    pub fn token(&self) -> u64 {
        self.token.value()
    }

    /// The path this device was opened from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn fd(&self) -> c_int {
        self.fd
    }

    /// The role bound to this device (from its profile, or `"unknown"`).
    #[must_use]
    pub fn role(&self) -> &str {
        &self.role
    }

    /// The classification label bound to this device (from its profile, or
    /// `"UNCLASSIFIED"`).
    #[must_use]
    pub fn classification(&self) -> &str {
        &self.classification
    }

    /// The layer (0..=7) this device is categorized under for the policy
    /// gate's layer-cap rule.
    #[must_use]
    pub fn layer(&self) -> u8 {
        self.layer
    }

    /// Sets the layer this device is categorized under.
    pub fn set_layer(&mut self, layer: u8) {
        self.layer = layer.min(7);
    }

    /// The profile bound at open time, if any.
    #[must_use]
    pub fn profile(&self) -> Option<&Profile> {
        self.profile.as_ref()
    }

    pub(crate) fn negotiated_resolution(&self) -> Option<(u32, u32)> {
        self.format.map(|f| (f.width, f.height))
    }

    pub(crate) fn tempest_state(&self) -> TempestState {
        self.tempest_state
    }

    pub(crate) fn set_tempest_state_cache(&mut self, state: TempestState) {
        self.tempest_state = state;
    }

    pub(crate) fn tempest_mapping(&self) -> Option<TempestMapping> {
        self.tempest_mapping
    }

    pub(crate) fn set_tempest_mapping(&mut self, mapping: TempestMapping) {
        self.tempest_mapping = Some(mapping);
    }

    /// Performs `S_FMT` with field `NONE`, caching the negotiated format
    /// (the driver may alter width/height from what was requested).
    ///
    /// # Errors
    ///
    /// Propagates any ioctl failure.
    pub fn set_format(&mut self, fourcc: u32, width: u32, height: u32) -> Result<Format> {
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe {
            fmt.fmt.pix.width = width;
            fmt.fmt.pix.height = height;
            fmt.fmt.pix.pixelformat = fourcc;
            fmt.fmt.pix.field = v4l2_field_V4L2_FIELD_NONE;
        }
        unsafe { sys::ioctl(self.fd, VIDIOC_S_FMT, ptr::addr_of_mut!(fmt).cast::<c_void>())? };
        let pix: v4l2_pix_format = unsafe { fmt.fmt.pix };
        let negotiated = Format { fourcc: pix.pixelformat, width: pix.width, height: pix.height };
        self.format = Some(negotiated);
        events::emit_simple(
            self.token.value(),
            Category::FormatChange,
            Severity::Info,
            Payload::Format { fourcc: negotiated.fourcc, width: negotiated.width, height: negotiated.height },
        );
        Ok(negotiated)
    }

    /// Reads the current negotiated format from the driver.
    ///
    /// # Errors
    ///
    /// Propagates any ioctl failure.
    pub fn format(&self) -> Result<Format> {
        let mut fmt: v4l2_format = unsafe { mem::zeroed() };
        fmt.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe { sys::ioctl(self.fd, VIDIOC_G_FMT, ptr::addr_of_mut!(fmt).cast::<c_void>())? };
        let pix: v4l2_pix_format = unsafe { fmt.fmt.pix };
        Ok(Format { fourcc: pix.pixelformat, width: pix.width, height: pix.height })
    }

    /// Sets the frame interval via `G_PARM` then `S_PARM`.
    ///
    /// This reverses V4L2's documented numerator/denominator convention,
    /// deliberately: `den` is written into the kernel's `numerator` field
    /// and `num` into `denominator` (time-per-frame is therefore `den/num`
    /// seconds, not `num/den`). This matches the external calling
    /// convention this crate's callers already depend on; it is not a bug
    /// to "fix" without changing every caller.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unsupported`] if the driver does not support
    /// `G_PARM`/`S_PARM`; callers may treat this as non-fatal when applying
    /// a profile (format is required, framerate and control writes are
    /// logged but do not abort the whole apply).
    pub fn set_framerate(&mut self, num: u32, den: u32) -> Result<()> {
        let mut parm: v4l2_streamparm = unsafe { mem::zeroed() };
        parm.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let get = unsafe { sys::ioctl(self.fd, VIDIOC_G_PARM, ptr::addr_of_mut!(parm).cast::<c_void>()) };
        if get.is_err() {
            return Err(Error::Unsupported("driver does not support G_PARM".into()));
        }
        unsafe {
            parm.parm.capture.timeperframe.numerator = den;
            parm.parm.capture.timeperframe.denominator = num;
        }
        unsafe { sys::ioctl(self.fd, VIDIOC_S_PARM, ptr::addr_of_mut!(parm).cast::<c_void>())? };
        self.frame_interval = Some((num, den));
        Ok(())
    }

    /// Returns device identification via `QUERYCAP`.
    ///
    /// # Errors
    ///
    /// Propagates any ioctl failure.
    pub fn info(&self) -> Result<Info> {
        let mut cap: v4l2_capability = unsafe { mem::zeroed() };
        unsafe { sys::ioctl(self.fd, VIDIOC_QUERYCAP, ptr::addr_of_mut!(cap).cast::<c_void>())? };
        Ok(Info {
            driver: cstr_field(&cap.driver),
            card: cstr_field(&cap.card),
            bus_info: cstr_field(&cap.bus_info),
        })
    }

    /// Writes `value` to raw control `id` (`VIDIOC_S_CTRL`).
    ///
    /// # Errors
    ///
    /// Propagates any ioctl failure.
    pub fn set_raw_control(&mut self, id: u32, value: i64) -> Result<()> {
        let mut ctrl: v4l2_control = unsafe { mem::zeroed() };
        ctrl.id = id;
        #[allow(clippy::cast_possible_truncation)]
        {
            ctrl.value = value as i32;
        }
        unsafe { sys::ioctl(self.fd, VIDIOC_S_CTRL, ptr::addr_of_mut!(ctrl).cast::<c_void>())? };
        Ok(())
    }

    /// Reads raw control `id` (`VIDIOC_G_CTRL`).
    ///
    /// # Errors
    ///
    /// Propagates any ioctl failure.
    pub fn get_raw_control(&self, id: u32) -> Result<i32> {
        let mut ctrl: v4l2_control = unsafe { mem::zeroed() };
        ctrl.id = id;
        unsafe { sys::ioctl(self.fd, VIDIOC_G_CTRL, ptr::addr_of_mut!(ctrl).cast::<c_void>())? };
        Ok(ctrl.value)
    }

    /// Sets a control by catalog name (component B lookup, then `S_CTRL`).
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `name` is unrecognized, otherwise
    /// propagates any ioctl failure.
    pub fn set_control(&mut self, name: &str, value: i64) -> Result<()> {
        let id = crate::catalog::name_to_id(name)?;
        self.set_raw_control(id, value)
    }

    /// Gets a control by catalog name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if `name` is unrecognized, otherwise
    /// propagates any ioctl failure.
    pub fn get_control(&self, name: &str) -> Result<i32> {
        let id = crate::catalog::name_to_id(name)?;
        self.get_raw_control(id)
    }

    /// Enumerates every non-disabled control via `QUERYCTRL`/`NEXT_CTRL`,
    /// invoking `visit(name, id)` for each.
    ///
    /// # Errors
    ///
    /// Propagates any ioctl failure other than the expected end-of-
    /// enumeration condition.
    pub fn enum_controls(&self, mut visit: impl FnMut(&str, u32)) -> Result<()> {
        let mut query: v4l2_queryctrl = unsafe { mem::zeroed() };
        loop {
            query.id |= V4L2_CTRL_FLAG_NEXT_CTRL;
            let result =
                unsafe { sys::ioctl(self.fd, VIDIOC_QUERYCTRL, ptr::addr_of_mut!(query).cast::<c_void>()) };
            match result {
                Ok(None) | Err(_) => break,
                Ok(Some(_)) => {}
            }
            if query.flags & V4L2_CTRL_FLAG_DISABLED == 0 {
                if let Some(end) = query.name.iter().position(|&b| b == 0) {
                    if let Ok(name) = CStr::from_bytes_with_nul(&query.name[..=end]) {
                        if let Ok(name) = name.to_str() {
                            visit(name, query.id);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Requests buffers (the profile's `buffer_count`, or 4), maps them,
    /// queues them all, then `STREAMON`s. Idempotent: a no-op success if
    /// already streaming.
    ///
    /// # Errors
    ///
    /// Propagates any ioctl or mmap failure.
    pub fn start_stream(&mut self) -> Result<()> {
        if self.streaming {
            return Ok(());
        }
        if self.buffers.is_none() {
            let count = self.profile.as_ref().map_or(4, |p| if p.buffer_count > 0 { p.buffer_count } else { 4 });
            self.buffers = Some(BufferRing::new(self.fd, count)?);
        }
        let mut type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe { sys::ioctl(self.fd, VIDIOC_STREAMON, ptr::addr_of_mut!(type_).cast::<c_void>())? };
        self.streaming = true;
        Ok(())
    }

    /// `STREAMOFF`s the device. Idempotent.
    ///
    /// # Errors
    ///
    /// Propagates any ioctl failure.
    pub fn stop_stream(&mut self) -> Result<()> {
        if !self.streaming {
            return Ok(());
        }
        let mut type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe { sys::ioctl(self.fd, VIDIOC_STREAMOFF, ptr::addr_of_mut!(type_).cast::<c_void>())? };
        self.streaming = false;
        Ok(())
    }

    /// Captures one generic frame: runs the policy gate, then
    /// `DQBUF`/`QBUF`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AccessDenied`] if the policy gate denies the
    /// request without touching the device at all. Returns
    /// [`Error::InvalidArgument`] if not currently streaming. Otherwise
    /// propagates any ioctl failure (including [`Error::WouldBlock`] if no
    /// frame is ready yet).
    pub fn capture(&mut self, context: &str) -> Result<Frame<'_, Generic>> {
        self.capture_labeled(context)
    }

    /// Captures one biometric frame. Identical mechanics to [`capture`](
    /// Device::capture), but the returned [`Frame`] is labeled
    /// [`Biometric`] and cannot be implicitly treated as a generic frame.
    ///
    /// # Errors
    ///
    /// See [`capture`](Device::capture).
    pub fn capture_biometric(&mut self, context: &str) -> Result<Frame<'_, Biometric>> {
        self.capture_labeled(context)
    }

    fn capture_labeled<L: crate::frame::Label>(&mut self, context: &str) -> Result<Frame<'_, L>> {
        let state = self.tempest_state;
        policy::check_capture(self, state, context)?;

        if !self.streaming {
            return Err(Error::InvalidArgument("capture while not streaming".into()));
        }

        events::emit_simple(self.token.value(), Category::CaptureStart, Severity::Debug, Payload::None);

        let Some(buffers) = &self.buffers else {
            return Err(Error::InvalidArgument("no buffer ring allocated".into()));
        };

        let dequeued = match buffers.dequeue() {
            Ok(Some(d)) => d,
            Ok(None) => {
                events::emit_simple(
                    self.token.value(),
                    Category::CaptureEnd,
                    Severity::Debug,
                    Payload::ReturnCode(Error::WouldBlock.errno()),
                );
                return Err(Error::WouldBlock);
            }
            Err(err) => {
                events::emit_simple(
                    self.token.value(),
                    Category::CaptureEnd,
                    Severity::Warn,
                    Payload::ReturnCode(err.errno()),
                );
                return Err(err);
            }
        };

        // SAFETY: `dequeued.index` was just returned by `dequeue`, so the
        // slot is owned by userland until we `enqueue` it back below.
        let data = unsafe { buffers.slice(dequeued.index, dequeued.bytes_used) };
        let frame = Frame::new(data, dequeued.timestamp_ns, dequeued.sequence);

        buffers.enqueue(dequeued.index)?;

        events::emit_simple(self.token.value(), Category::FrameAcquired, Severity::Debug, Payload::None);
        events::emit_simple(self.token.value(), Category::CaptureEnd, Severity::Debug, Payload::ReturnCode(0));

        Ok(frame)
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if self.streaming {
            if let Err(err) = self.stop_stream() {
                log::error!("couldn't stop streaming on drop: {err}");
            }
        }
        self.buffers = None;
        if self.fd >= 0 {
            if let Err(err) = unsafe { sys::close(self.fd) } {
                log::error!("couldn't close video4linux device descriptor: {err}");
            }
            self.fd = -1;
        }
    }
}

fn cstr_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{self, Threatcon};

    // fd = -1 on purpose: these scenarios are denied by the policy gate
    // before any ioctl would be issued, so no real descriptor is needed.
    fn test_device(role: &str, classification: &str, layer: u8) -> Device {
        Device {
            fd: -1,
            path: PathBuf::from("/test/device"),
            token: DeviceToken::next(),
            role: role.to_owned(),
            classification: classification.to_owned(),
            layer,
            profile: None,
            tempest_state: TempestState::Disabled,
            tempest_mapping: None,
            format: None,
            frame_interval: None,
            buffers: None,
            streaming: false,
        }
    }

    #[test]
    fn lockdown_trumps_every_other_rule() {
        policy::set_threatcon(Threatcon::Normal);
        let mut dev = test_device("generic_webcam", "UNCLASSIFIED", 0);
        dev.set_tempest_state_cache(TempestState::Lockdown);
        let err = policy::check_capture(&dev, dev.tempest_state(), "capture").unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));
    }

    #[test]
    fn layer_cap_denies_oversized_negotiated_format() {
        policy::set_layer_policy(3, policy::LayerPolicy { max_width: 1280, max_height: 720, min_tempest: None });
        let mut dev = test_device("generic_webcam", "UNCLASSIFIED", 3);
        dev.format = Some(Format { fourcc: 0, width: 1920, height: 1080 });
        let err = policy::check_capture(&dev, dev.tempest_state(), "capture").unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));
    }

    #[test]
    fn layer_cap_allows_format_within_bounds() {
        policy::set_layer_policy(4, policy::LayerPolicy { max_width: 1280, max_height: 720, min_tempest: None });
        let mut dev = test_device("generic_webcam", "UNCLASSIFIED", 4);
        dev.format = Some(Format { fourcc: 0, width: 640, height: 480 });
        assert!(policy::check_capture(&dev, dev.tempest_state(), "capture").is_ok());
    }

    #[test]
    fn charlie_biometric_floor_still_applies_at_delta_and_emergency() {
        // A biometric role carrying UNCLASSIFIED clears the clearance check
        // trivially and is exempt from the DELTA/EMERGENCY clauses (which
        // only tighten non-UNCLASSIFIED roles), but the CHARLIE clause
        // ("biometric roles additionally require state >= HIGH") must still
        // deny it — the three THREATCON clauses are cumulative, not
        // mutually exclusive.
        let mut dev = test_device("iris_scanner", "UNCLASSIFIED", 0);
        dev.set_tempest_state_cache(TempestState::Low);

        policy::set_threatcon(Threatcon::Delta);
        let err = policy::check_capture(&dev, dev.tempest_state(), "capture").unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        policy::set_threatcon(Threatcon::Emergency);
        let err = policy::check_capture(&dev, dev.tempest_state(), "capture").unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        policy::set_threatcon(Threatcon::Normal);
    }

    #[test]
    fn device_token_is_monotonic_and_distinct() {
        let a = test_device("a", "UNCLASSIFIED", 0);
        let b = test_device("b", "UNCLASSIFIED", 0);
        assert_ne!(a.token(), b.token());
    }

    fn blank_profile() -> crate::profile::Profile {
        crate::profile::Profile {
            id: String::new(),
            role: "camera".to_owned(),
            device_hint: None,
            classification: "UNCLASSIFIED".to_owned(),
            pixel_format: 0,
            width: 0,
            height: 0,
            fps_num: 0,
            fps_den: 1,
            controls: Vec::new(),
            unresolved_controls: Vec::new(),
            tempest_mapping: TempestMapping::default(),
            meta_device: None,
            meta_format: 0,
            buffer_count: 4,
            constant_time_required: false,
            quantum_candidate: false,
        }
    }

    #[test]
    fn apply_aborts_when_required_format_negotiation_fails() {
        let mut dev = test_device("camera", "UNCLASSIFIED", 0);
        let mut profile = blank_profile();
        profile.pixel_format = u32::from_le_bytes(*b"YUYV");
        profile.width = 640;
        profile.height = 480;

        let err = crate::profile::apply(&mut dev, &profile).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn apply_tolerates_framerate_and_control_failures_when_format_is_unset() {
        let mut dev = test_device("camera", "UNCLASSIFIED", 0);
        let mut profile = blank_profile();
        profile.fps_num = 30;
        profile.controls.push(crate::profile::ControlPreset { id: v4l2_sys::V4L2_CID_BRIGHTNESS, value: 10 });

        assert!(crate::profile::apply(&mut dev, &profile).is_ok());
    }
}
