//! Fixed-size, mmap-backed buffer ring that rotates between kernel and
//! userland during streaming.

use crate::{error::Result, sys};
use libc::{c_int, c_void, MAP_SHARED, PROT_READ, PROT_WRITE};
use std::{mem, ptr, slice};
use v4l2_sys::{
    v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE, v4l2_buffer, v4l2_memory_V4L2_MEMORY_MMAP,
    v4l2_requestbuffers, V4L2_BUF_FLAG_QUEUED, VIDIOC_DQBUF, VIDIOC_QBUF, VIDIOC_QUERYBUF,
    VIDIOC_REQBUFS,
};

struct Slot {
    base: *mut u8,
    length: usize,
}

// SAFETY: the mmap'd region is only ever accessed through `&[u8]` borrows
// scoped to a single owning `Device`, which is itself not `Sync`; the raw
// pointer here is just storage for that region's address.
unsafe impl Send for Slot {}

/// A fixed-size sequence of mmap'd driver buffer slots. A slot's base
/// pointer is stable for the ring's lifetime; only the visible byte length
/// of a dequeued slot changes per-dequeue.
pub(crate) struct BufferRing {
    fd: c_int,
    slots: Vec<Slot>,
}

/// Description of a freshly dequeued slot.
pub(crate) struct Dequeued {
    pub index: u32,
    pub bytes_used: u32,
    pub timestamp_ns: u64,
    pub sequence: u32,
}

impl BufferRing {
    /// Issues `REQBUFS` for `count` buffers, then `QUERYBUF` + `mmap` for
    /// each, then `QBUF`s every slot so the driver can start filling them.
    ///
    /// # Errors
    ///
    /// Propagates any ioctl or mmap failure.
    pub fn new(fd: c_int, count: u32) -> Result<Self> {
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        req.count = count;
        req.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe { sys::ioctl(fd, VIDIOC_REQBUFS, ptr::addr_of_mut!(req).cast())? };

        let mut slots = Vec::with_capacity(req.count as usize);
        for i in 0..req.count {
            let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
            buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
            buf.index = i;
            buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
            unsafe { sys::ioctl(fd, VIDIOC_QUERYBUF, ptr::addr_of_mut!(buf).cast())? };

            let length = buf.length as usize;
            let base = unsafe {
                sys::mmap(ptr::null_mut(), length, PROT_READ | PROT_WRITE, MAP_SHARED, fd, buf.m.offset.into())?
            }
            .cast::<u8>();
            slots.push(Slot { base, length });
        }

        let ring = Self { fd, slots };
        for index in 0..ring.slots.len() as u32 {
            ring.enqueue(index)?;
        }
        Ok(ring)
    }

    /// Number of slots in the ring.
    #[must_use]
    pub fn count(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Returns every mapped slot's base pointer, so tests can assert they
    /// are all distinct and non-null.
    #[cfg(test)]
    pub(crate) fn slot_pointers(&self) -> Vec<*mut u8> {
        self.slots.iter().map(|s| s.base).collect()
    }

    /// Sends the slot at `index` back to the driver's queue.
    pub fn enqueue(&self, index: u32) -> Result<()> {
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.index = index;
        unsafe { sys::ioctl(self.fd, VIDIOC_QBUF, ptr::addr_of_mut!(buf).cast())? };
        Ok(())
    }

    /// Attempts to dequeue a filled slot. Returns `None` on `WouldBlock`
    /// (no frame ready yet), matching the non-blocking fd contract.
    pub fn dequeue(&self) -> Result<Option<Dequeued>> {
        let mut buf: v4l2_buffer = unsafe { mem::zeroed() };
        buf.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        buf.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        let ret = unsafe { sys::ioctl(self.fd, VIDIOC_DQBUF, ptr::addr_of_mut!(buf).cast()) };
        let ret = match ret {
            Ok(r) => r,
            Err(err) => return Err(crate::Error::from(err)),
        };
        if ret.is_none() {
            return Ok(None);
        }
        if buf.flags & V4L2_BUF_FLAG_QUEUED != 0 {
            return Ok(None);
        }
        #[allow(clippy::cast_sign_loss)]
        let timestamp_ns =
            buf.timestamp.tv_sec as u64 * 1_000_000_000 + buf.timestamp.tv_usec as u64 * 1_000;
        let timestamp_ns = if timestamp_ns == 0 { sys::now_ns().unwrap_or(0) } else { timestamp_ns };
        Ok(Some(Dequeued {
            index: buf.index,
            bytes_used: buf.bytesused,
            timestamp_ns,
            sequence: buf.sequence,
        }))
    }

    /// Returns the captured bytes for `index`, truncated to `bytes_used`.
    ///
    /// # Safety
    ///
    /// `index` must refer to a slot most recently returned by
    /// [`BufferRing::dequeue`] and not yet re-enqueued, and `bytes_used`
    /// must not exceed that slot's mapped length.
    pub unsafe fn slice(&self, index: u32, bytes_used: u32) -> &[u8] {
        let slot = &self.slots[index as usize];
        let len = (bytes_used as usize).min(slot.length);
        unsafe { slice::from_raw_parts(slot.base, len) }
    }

    fn free(&mut self) -> Result<()> {
        for slot in self.slots.drain(..) {
            unsafe { sys::munmap(slot.base.cast::<c_void>(), slot.length)? };
        }
        let mut req: v4l2_requestbuffers = unsafe { mem::zeroed() };
        req.memory = v4l2_memory_V4L2_MEMORY_MMAP;
        req.count = 0;
        req.type_ = v4l2_buf_type_V4L2_BUF_TYPE_VIDEO_CAPTURE;
        unsafe { sys::ioctl(self.fd, VIDIOC_REQBUFS, ptr::addr_of_mut!(req).cast())? };
        Ok(())
    }
}

impl Drop for BufferRing {
    fn drop(&mut self) {
        if let Err(err) = self.free() {
            log::error!("couldn't unmap/free video4linux buffer ring: {err}");
        }
    }
}
