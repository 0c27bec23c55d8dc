//! Append-only, bounded event/audit ring (component G).
//!
//! Process-wide state, modeled as an explicitly initialized subsystem
//! behind a reader/writer lock, never lazily initialized on first use. Before
//! [`init`] is called, emissions are silently dropped (matching how the
//! `log` crate behaves with no logger installed) rather than panicking,
//! since a library cannot assume its host has configured the ring yet.

use crate::tempest::TempestState;
use once_cell::sync::OnceCell;
use std::{
    collections::VecDeque,
    fs::{File, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
};

/// Default bounded capacity of the ring.
pub const DEFAULT_CAPACITY: usize = 4096;

/// Severity of an emitted event. Numeric ordering is part of the external
/// contract (`DEBUG < INFO < WARN < ERROR`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Severity {
    /// Diagnostic detail, not interesting outside development.
    Debug = 0,
    /// Routine state transition or lifecycle event.
    Info = 1,
    /// An operation was denied or degraded but the system stayed consistent.
    Warn = 2,
    /// An operation failed unexpectedly.
    Error = 3,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Error => "ERROR",
        }
    }
}

/// Category of an emitted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    /// A device was successfully opened.
    DeviceOpen,
    /// The cached TEMPEST state was read.
    TempestQuery,
    /// A TEMPEST state transition was applied.
    TempestTransition,
    /// The policy gate evaluated a request.
    PolicyCheck,
    /// The negotiated pixel format changed.
    FormatChange,
    /// A frame was successfully dequeued.
    FrameAcquired,
    /// A capture operation began.
    CaptureStart,
    /// A capture operation ended.
    CaptureEnd,
}

impl Category {
    fn as_str(self) -> &'static str {
        match self {
            Category::DeviceOpen => "device_open",
            Category::TempestQuery => "tempest_query",
            Category::TempestTransition => "tempest_transition",
            Category::PolicyCheck => "policy_check",
            Category::FormatChange => "format_change",
            Category::FrameAcquired => "frame_acquired",
            Category::CaptureStart => "capture_start",
            Category::CaptureEnd => "capture_end",
        }
    }
}

/// Category-specific payload carried by an [`Event`].
#[derive(Debug, Clone)]
pub enum Payload {
    /// No additional detail.
    None,
    /// A return code (0 success, negative errno-style on failure).
    ReturnCode(i32),
    /// `policy_check(context, rc)`.
    PolicyCheck { context: String, rc: i32 },
    /// `tempest_transition(old, new)`.
    TempestTransition { old: TempestState, new: TempestState },
    /// Negotiated pixel format triple.
    Format { fourcc: u32, width: u32, height: u32 },
}

impl std::fmt::Display for Payload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Payload::None => write!(f, "-"),
            Payload::ReturnCode(rc) => write!(f, "rc={rc}"),
            Payload::PolicyCheck { context, rc } => write!(f, "context={context} rc={rc}"),
            Payload::TempestTransition { old, new } => write!(f, "old={old} new={new}"),
            Payload::Format { fourcc, width, height } => {
                write!(f, "fourcc={fourcc:#010x} width={width} height={height}")
            }
        }
    }
}

/// A single recorded event.
#[derive(Debug, Clone)]
pub struct Event {
    /// Monotonic timestamp in nanoseconds.
    pub timestamp_ns: u64,
    /// Opaque device-derived token; see [`crate::device::DeviceToken`].
    pub device_token: u64,
    /// Event category.
    pub category: Category,
    /// Event severity.
    pub severity: Severity,
    /// Category-specific payload.
    pub payload: Payload,
}

/// Output sink for [`flush`].
#[derive(Debug, Clone)]
pub enum Sink {
    /// Write flushed events to standard error (the default).
    Stderr,
    /// Append flushed events to a file.
    File(PathBuf),
}

impl Default for Sink {
    fn default() -> Self {
        Sink::Stderr
    }
}

/// Configuration passed to [`init`].
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Bounded capacity of the ring; defaults to [`DEFAULT_CAPACITY`] when
    /// zero.
    pub capacity: usize,
    /// Where [`flush`] writes drained events.
    pub sink: Sink,
}

/// Snapshot of ring statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Total events accepted into the ring since [`init`].
    pub events_emitted: u64,
    /// Total events dropped due to the ring being full (oldest-drop policy).
    pub events_dropped: u64,
    /// Bounded capacity of the ring.
    pub buffer_capacity: usize,
}

struct Ring {
    capacity: usize,
    sink: Sink,
    buf: Mutex<VecDeque<Event>>,
    emitted: AtomicU64,
    dropped: AtomicU64,
}

static RING: OnceCell<Ring> = OnceCell::new();

/// Initializes the event ring. Calling this more than once is a no-op for
/// every call after the first (the ring is not reconfigurable at runtime).
pub fn init(config: Config) {
    let capacity = if config.capacity == 0 { DEFAULT_CAPACITY } else { config.capacity };
    let _ = RING.set(Ring {
        capacity,
        sink: config.sink,
        buf: Mutex::new(VecDeque::with_capacity(capacity)),
        emitted: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
    });
}

/// Emits an event with a simple, category-appropriate payload. Safe to call
/// from any thread concurrently: the ring is a mutex-guarded bounded deque
/// with atomic counters.
pub fn emit_simple(device_token: u64, category: Category, severity: Severity, payload: Payload) {
    emit(Event {
        timestamp_ns: crate::sys::now_ns().unwrap_or(0),
        device_token,
        category,
        severity,
        payload,
    });
}

/// Emits a fully constructed event.
pub fn emit(event: Event) {
    let Some(ring) = RING.get() else { return };
    ring.emitted.fetch_add(1, Ordering::Relaxed);
    let mut buf = ring.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
    if buf.len() >= ring.capacity {
        buf.pop_front();
        ring.dropped.fetch_add(1, Ordering::Relaxed);
    }
    buf.push_back(event);
}

/// Synchronously drains every buffered event, in FIFO order, to the
/// configured sink.
///
/// # Errors
///
/// Returns an I/O error if the sink could not be written to. Events already
/// removed from the ring are not re-inserted on failure.
pub fn flush() -> std::io::Result<()> {
    let Some(ring) = RING.get() else { return Ok(()) };
    let drained: Vec<Event> = {
        let mut buf = ring.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buf.drain(..).collect()
    };
    let mut writer: Box<dyn Write> = match &ring.sink {
        Sink::Stderr => Box::new(std::io::stderr()),
        Sink::File(path) => Box::new(open_append(path)?),
    };
    for event in &drained {
        writeln!(
            writer,
            "{} {} {} device={} {}",
            event.timestamp_ns,
            event.category.as_str(),
            event.severity.as_str(),
            event.device_token,
            event.payload
        )?;
    }
    Ok(())
}

fn open_append(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

/// Returns a snapshot of ring statistics. Before [`init`] has been called,
/// returns zeroed stats with `buffer_capacity = 0`.
#[must_use]
pub fn get_stats() -> Stats {
    let Some(ring) = RING.get() else { return Stats::default() };
    Stats {
        events_emitted: ring.emitted.load(Ordering::Relaxed),
        events_dropped: ring.dropped.load(Ordering::Relaxed),
        buffer_capacity: ring.capacity,
    }
}

/// Drains and discards any buffered events. The ring remains initialized
/// (statistics are not reset) so that a process-wide shutdown sequence can
/// still call [`get_stats`] afterwards for a final report.
pub fn shutdown() {
    if let Some(ring) = RING.get() {
        let mut buf = ring.buf.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Once;

    static INIT: Once = Once::new();

    fn ensure_init() {
        INIT.call_once(|| init(Config { capacity: 4096, sink: Sink::Stderr }));
    }

    #[test]
    fn emits_and_counts() {
        ensure_init();
        shutdown();
        let before = get_stats();
        for _ in 0..1000 {
            emit_simple(1, Category::DeviceOpen, Severity::Info, Payload::None);
        }
        let stats = get_stats();
        assert_eq!(stats.events_emitted - before.events_emitted, 1000);
        assert_eq!(stats.buffer_capacity, 4096);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        ensure_init();
        shutdown();
        let before_dropped = get_stats().events_dropped;
        for i in 0..(DEFAULT_CAPACITY + 10) {
            emit_simple(u64::try_from(i).unwrap(), Category::FrameAcquired, Severity::Debug, Payload::None);
        }
        let stats = get_stats();
        assert!(stats.events_dropped - before_dropped >= 10);
        assert_eq!(stats.buffer_capacity, DEFAULT_CAPACITY);
    }
}
