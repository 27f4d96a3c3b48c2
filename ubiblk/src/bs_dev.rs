//! The backing-device contract consumed by the blob store.
//!
//! A backing device supplies the blocks "below" the blob store: either
//! the store's own base device, or the external-snapshot device this
//! module hands out for copy-on-write reads. The store talks to a device
//! through a per-thread [`BsDevChannel`]; channels never cross threads.
//!
//! Asynchronous hooks take a boxed continuation invoked exactly once with
//! `0` or a negated errno. Payload buffers (and every buffer referenced
//! by an iovec) must remain valid until that continuation fires; the
//! blob store guarantees this for all submissions.

use crate::ring::{IoCompletion, PollStatus};
use crate::{Error, Result};

/// One scatter/gather element, layout-compatible with `struct iovec`.
#[derive(Debug, Clone, Copy)]
pub struct IoVec {
    base: *mut u8,
    len: usize,
}

impl IoVec {
    /// Borrows a mutable buffer as an I/O vector.
    ///
    /// The returned vector carries a raw pointer: the buffer must outlive
    /// every submission it is passed to.
    pub const fn from_mut_slice(buf: &mut [u8]) -> Self {
        Self {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    /// Base pointer of the element.
    pub const fn base(&self) -> *mut u8 {
        self.base
    }

    /// Length of the element in bytes.
    pub const fn len(&self) -> usize {
        self.len
    }

    /// `true` if the element is empty.
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Materializes the element as a byte slice.
    ///
    /// # Safety
    ///
    /// The memory `base..base + len` must be live and initialized, and
    /// must not be mutated while the returned borrow is held.
    #[allow(unsafe_code)]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        // SAFETY: delegated to the caller per the contract above.
        unsafe { std::slice::from_raw_parts(self.base, self.len) }
    }

    /// Materializes the element as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The memory `base..base + len` must be live and exclusively owned
    /// by the caller while the returned borrow is held.
    #[allow(unsafe_code)]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        // SAFETY: delegated to the caller per the contract above.
        unsafe { std::slice::from_raw_parts_mut(self.base, self.len) }
    }
}

/// Total byte length described by an iovec array.
pub fn iov_bytes(iovs: &[IoVec]) -> u64 {
    iovs.iter().map(|v| v.len() as u64).sum()
}

/// Extended I/O options passed through `readv_ext`/`writev_ext`.
///
/// Nothing in this module interprets them; they exist so the store can
/// pass its extended submissions through unchanged.
#[derive(Debug, Default, Clone, Copy)]
#[non_exhaustive]
pub struct ExtIoOpts {}

/// Identity and validity surface of a backing device, plus its channel
/// factory.
pub trait BsDev {
    /// Block length in bytes.
    fn blocklen(&self) -> u32;

    /// Addressable blocks.
    fn blockcnt(&self) -> u64;

    /// Opens a per-thread I/O channel.
    fn create_channel(&self) -> Result<Box<dyn BsDevChannel>>;

    /// Releases channel-independent resources. The default does nothing;
    /// devices in this module release everything on drop.
    fn destroy(&self) {}

    /// Name of an underlying host block device, if this device wraps one.
    fn base_bdev_name(&self) -> Option<&str> {
        None
    }

    /// `true` iff the whole range `[lba, lba + lba_count)` is readable.
    fn is_range_valid(&self, lba: u64, lba_count: u64) -> bool;

    /// `true` iff reads of the range are defined to return zeroes.
    fn is_zeroes(&self, lba: u64, lba_count: u64) -> bool {
        !self.is_range_valid(lba, lba_count)
    }

    /// Maps a device LBA to an LBA on the underlying base device.
    fn translate_lba(&self, lba: u64) -> Option<u64> {
        Some(lba)
    }

    /// `true` if the device is operating degraded.
    fn is_degraded(&self) -> bool {
        false
    }
}

/// Per-thread I/O surface of a backing device.
pub trait BsDevChannel {
    /// Reads `lba_count` blocks starting at `lba` into `payload`.
    fn read(&mut self, payload: &mut [u8], lba: u64, lba_count: u32, complete: IoCompletion);

    /// Reads `lba_count` blocks starting at `lba` into the iovec list.
    fn readv(&mut self, iovs: &[IoVec], lba: u64, lba_count: u32, complete: IoCompletion);

    /// `readv` with extended options.
    fn readv_ext(
        &mut self,
        iovs: &[IoVec],
        lba: u64,
        lba_count: u32,
        _opts: &ExtIoOpts,
        complete: IoCompletion,
    ) {
        self.readv(iovs, lba, lba_count, complete);
    }

    /// Writes `lba_count` blocks starting at `lba` from `payload`.
    fn write(&mut self, payload: &[u8], lba: u64, lba_count: u32, complete: IoCompletion);

    /// Writes `lba_count` blocks starting at `lba` from the iovec list.
    fn writev(&mut self, iovs: &[IoVec], lba: u64, lba_count: u32, complete: IoCompletion);

    /// `writev` with extended options.
    fn writev_ext(
        &mut self,
        iovs: &[IoVec],
        lba: u64,
        lba_count: u32,
        _opts: &ExtIoOpts,
        complete: IoCompletion,
    ) {
        self.writev(iovs, lba, lba_count, complete);
    }

    /// Flushes acknowledged writes to stable storage.
    fn flush(&mut self, complete: IoCompletion);

    /// Writes zeroes over the range. Unsupported by every device in this
    /// module.
    fn write_zeroes(&mut self, _lba: u64, _lba_count: u64, complete: IoCompletion) {
        complete(Error::not_supported());
    }

    /// Deallocates the range. Unsupported by every device in this module.
    fn unmap(&mut self, _lba: u64, _lba_count: u64, complete: IoCompletion) {
        complete(Error::not_supported());
    }

    /// Copies blocks inside the device. Unsupported by every device in
    /// this module.
    fn copy(&mut self, _dst_lba: u64, _src_lba: u64, _lba_count: u64, complete: IoCompletion) {
        complete(Error::not_supported());
    }

    /// Drains pending completions for this channel.
    fn poll(&mut self) -> PollStatus;
}
