//! End-to-end scenarios spanning more than one module's public API.
//!
//! Device-level scenarios that need to poke at private fields (LOCKDOWN
//! denial, layer-cap denial) live next to `Device` itself in
//! `src/device.rs`; everything here only touches the public surface.

use dsv4l2::{error::Error, events, policy, profile};
use std::io::Write;
use std::sync::Once;

static INIT: Once = Once::new();

fn ensure_events_initialized() {
    INIT.call_once(|| {
        events::init(events::Config { capacity: 4096, sink: events::Sink::Stderr });
    });
}

#[test]
fn clearance_deny_for_ungranted_biometric_role() {
    policy::set_threatcon(policy::Threatcon::Normal);
    let err = policy::check_clearance("iris_scanner_integration_1", "SECRET_BIOMETRIC").unwrap_err();
    assert!(matches!(err, Error::AccessDenied(_)));
}

#[test]
fn clearance_allow_for_unclassified_role() {
    assert!(policy::check_clearance("generic_webcam_integration", "UNCLASSIFIED").is_ok());
}

#[test]
fn klv_roundtrip_matches_literal_uas_example() {
    let key: [u8; 16] =
        [0x06, 0x0E, 0x2B, 0x34, 0x02, 0x0B, 0x01, 0x01, 0x0E, 0x01, 0x03, 0x01, 0x01, 0x00, 0x00, 0x00];
    let mut buf = Vec::new();
    buf.extend_from_slice(&key);
    buf.push(0x08);
    buf.extend_from_slice(&[0, 1, 2, 3, 4, 5, 6, 7]);

    let items = dsv4l2::klv::parse(&buf).expect("well-formed KLV buffer parses");
    assert_eq!(items.len(), 1);
    let found = dsv4l2::klv::find(&items, &key).expect("UAS key is present");
    assert_eq!(found.value, &[0, 1, 2, 3, 4, 5, 6, 7]);
}

#[test]
fn timestamp_sync_picks_nearest_with_lower_index_tiebreak() {
    let buffers = [
        dsv4l2::klv::TimestampedBuffer { timestamp_ns: 1_000_000_000 },
        dsv4l2::klv::TimestampedBuffer { timestamp_ns: 1_100_000_000 },
        dsv4l2::klv::TimestampedBuffer { timestamp_ns: 1_200_000_000 },
    ];
    assert_eq!(dsv4l2::klv::sync_metadata(1_150_000_000, &buffers), 1);
}

#[test]
fn event_ring_counts_match_literal_scenario() {
    ensure_events_initialized();
    events::shutdown();
    let before = events::get_stats();
    for _ in 0..1000 {
        events::emit_simple(42, events::Category::FrameAcquired, events::Severity::Debug, events::Payload::None);
    }
    let stats = events::get_stats();
    assert_eq!(stats.events_emitted - before.events_emitted, 1000);
    assert_eq!(stats.events_dropped, before.events_dropped);
    assert_eq!(stats.buffer_capacity, 4096);
}

#[test]
fn profile_round_trip_is_byte_identical_in_declared_fields() {
    let dir = tempfile::tempdir().expect("create temp profile directory");
    let path = dir.path().join("iris_scanner.yaml");
    let yaml = "\
id: \"046d:0825\"\n\
role: iris_scanner\n\
classification: SECRET_BIOMETRIC\n\
pixel_format: YUYV\n\
resolution: [640, 480]\n\
fps: 30\n\
buffer_count: 6\n\
controls:\n\
  gain: 3\n\
tempest_control:\n\
  id: 7\n\
  auto_detect: false\n\
  mode_map:\n\
    DISABLED: 0\n\
    LOW: 1\n\
    HIGH: 2\n\
    LOCKDOWN: 3\n";
    {
        let mut file = std::fs::File::create(&path).expect("create profile file");
        file.write_all(yaml.as_bytes()).expect("write profile file");
    }

    let loaded = profile::load_from_file(&path).expect("profile file parses");
    let reserialized = profile::to_yaml(&loaded).expect("profile reserializes");

    let reparsed_path = dir.path().join("iris_scanner_roundtrip.yaml");
    std::fs::write(&reparsed_path, reserialized).expect("write reserialized profile");
    let reloaded = profile::load_from_file(&reparsed_path).expect("reserialized profile parses");

    assert_eq!(loaded, reloaded);
}

#[test]
fn profile_by_role_falls_back_when_no_vidpid_matches() {
    let dir = tempfile::tempdir().expect("create temp profile directory");
    std::fs::write(
        dir.path().join("camera.yaml"),
        "id: \"0000:0000\"\nrole: camera\nclassification: UNCLASSIFIED\n",
    )
    .expect("write fallback profile");

    let previous = profile::dir();
    profile::set_dir(dir.path());
    let result = profile::load_by_vidpid(0xdead, 0xbeef, "camera");
    profile::set_dir(previous);

    let loaded = result.expect("falls back to role-based profile");
    assert_eq!(loaded.role, "camera");
}

#[test]
fn errno_mapping_matches_error_taxonomy() {
    assert_eq!(Error::NotFound("x".into()).errno(), -libc::ENOENT);
    assert_eq!(Error::AccessDenied("x".into()).errno(), -libc::EACCES);
    assert_eq!(Error::WouldBlock.errno(), -libc::EWOULDBLOCK);
    assert_eq!(Error::Unsupported("x".into()).errno(), -libc::ENOSYS);
}
