//! Thin, typed bindings around the V4L2 ioctl and mmap surface used by the
//! rest of this crate (component A: Kernel ioctl facade).

use libc::{c_char, c_int, c_ulong, c_void, off_t, size_t, MAP_FAILED};
use std::io;

/// Returns a monotonic timestamp, in nanoseconds, of the same clock used for
/// frame capture timestamps.
pub fn now_ns() -> io::Result<u64> {
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;
    #[allow(clippy::cast_sign_loss)]
    Ok(ts.tv_sec() as u64 * 1_000_000_000 + ts.tv_nsec() as u64)
}

pub(crate) unsafe fn open(path: *const c_char, oflag: c_int) -> io::Result<c_int> {
    let fd = unsafe { libc::open(path, oflag) };
    if fd == -1 { Err(io::Error::last_os_error()) } else { Ok(fd) }
}

pub(crate) unsafe fn close(fd: c_int) -> io::Result<()> {
    let result = unsafe { libc::close(fd) };
    if result == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
}

/// Runs an ioctl, mapping `EWOULDBLOCK`/`EAGAIN` to `Ok(None)` so that
/// non-blocking `DQBUF` callers can distinguish "no frame yet" from a real
/// failure.
pub(crate) unsafe fn ioctl(fd: c_int, request: c_ulong, argp: *mut c_void) -> io::Result<Option<c_int>> {
    let result = unsafe { libc::ioctl(fd, request, argp) };
    if result == -1 {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => Ok(None),
            _ => Err(err),
        }
    } else {
        Ok(Some(result))
    }
}

pub(crate) unsafe fn mmap(
    addr: *mut c_void,
    len: size_t,
    prot: c_int,
    flags: c_int,
    fd: c_int,
    offset: off_t,
) -> io::Result<*mut c_void> {
    let ptr = unsafe { libc::mmap(addr, len, prot, flags, fd, offset) };
    if ptr == MAP_FAILED { Err(io::Error::last_os_error()) } else { Ok(ptr) }
}

pub(crate) unsafe fn munmap(addr: *mut c_void, len: size_t) -> io::Result<()> {
    let result = unsafe { libc::munmap(addr, len) };
    if result == -1 { Err(io::Error::last_os_error()) } else { Ok(()) }
}
