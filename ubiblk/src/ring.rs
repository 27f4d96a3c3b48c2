//! io_uring submission and completion plumbing for the file-backed
//! backing devices.
//!
//! Each per-thread channel owns one [`IoRing`]. Submissions carry a boxed
//! continuation; [`IoRing::poll`] drains up to [`POLL_BATCH`] completions
//! in one non-blocking sweep and invokes each continuation on the polling
//! thread with `0` on success or `-EIO` on a negative kernel result.
//! Completions within one sweep follow ring order; no ordering holds
//! across sweeps or between rings.
//!
//! All raw submission plumbing is confined to this module; the only other
//! unsafe surface in the crate is [`IoVec`]'s slice accessors.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::RawFd;

use io_uring::{IoUring, opcode, types};
use nix::errno::Errno;
use tracing::{error, warn};

use crate::bs_dev::IoVec;

/// Submission/completion queue depth of every channel ring.
pub const RING_DEPTH: u32 = 128;

/// Completions drained per [`IoRing::poll`] invocation.
const POLL_BATCH: usize = 64;

/// Continuation invoked when one ring operation completes: `0` on
/// success, a negated errno on failure.
pub type IoCompletion = Box<dyn FnOnce(i32)>;

/// Scheduling hint returned by pollers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum PollStatus {
    /// The poller did (or may soon have) work; keep polling.
    Busy,
    /// Nothing to do on this channel.
    Idle,
}

/// One in-flight operation: its continuation plus any iovec array that
/// must stay alive until the kernel is done with it.
struct Pending {
    complete: IoCompletion,
    _iovs: Option<Box<[libc::iovec]>>,
}

/// A submission/completion ring with a slot table of in-flight
/// continuations, keyed by the sqe user-data.
pub struct IoRing {
    ring: IoUring,
    slots: Vec<Option<Pending>>,
    free: Vec<usize>,
}

impl IoRing {
    /// Creates a ring of the given depth.
    pub fn new(depth: u32) -> io::Result<Self> {
        let ring = IoUring::new(depth)?;
        let depth = depth as usize;
        Ok(Self {
            ring,
            slots: (0..depth).map(|_| None).collect(),
            free: (0..depth).rev().collect(),
        })
    }

    /// Number of submitted operations whose continuation has not fired.
    pub fn in_flight(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// Submits a positioned read of `buf.len()` bytes from `fd` at byte
    /// `offset`.
    ///
    /// The buffer must remain valid until `complete` fires; the caller
    /// (the blob store) guarantees this for every submission.
    pub fn read_at(&mut self, fd: RawFd, buf: &mut [u8], offset: u64, complete: IoCompletion) {
        let Some(slot) = self.free.pop() else {
            warn!("ring full, failing read at offset {offset}");
            complete(-(Errno::EAGAIN as i32));
            return;
        };
        let len = buf.len() as u32;
        let ptr = buf.as_mut_ptr();
        self.slots[slot] = Some(Pending {
            complete,
            _iovs: None,
        });

        let sqe = opcode::Read::new(types::Fd(fd), ptr, len)
            .offset(offset)
            .build()
            .user_data(slot as u64);
        self.push_and_submit(slot, &sqe);
    }

    /// Submits a positioned vectored read from `fd` at byte `offset`.
    ///
    /// Every buffer referenced by `iovs` must remain valid until
    /// `complete` fires. The iovec array itself is copied and kept alive
    /// by the ring.
    pub fn readv_at(&mut self, fd: RawFd, iovs: &[IoVec], offset: u64, complete: IoCompletion) {
        let Some(slot) = self.free.pop() else {
            warn!("ring full, failing readv at offset {offset}");
            complete(-(Errno::EAGAIN as i32));
            return;
        };
        let raw: Box<[libc::iovec]> = iovs
            .iter()
            .map(|v| libc::iovec {
                iov_base: v.base().cast(),
                iov_len: v.len(),
            })
            .collect();
        // The boxed array's heap allocation stays put when the box moves
        // into the slot, so the pointer handed to the kernel stays valid.
        let ptr = raw.as_ptr();
        let cnt = raw.len() as u32;
        self.slots[slot] = Some(Pending {
            complete,
            _iovs: Some(raw),
        });

        let sqe = opcode::Readv::new(types::Fd(fd), ptr, cnt)
            .offset(offset)
            .build()
            .user_data(slot as u64);
        self.push_and_submit(slot, &sqe);
    }

    /// Pushes a prepared sqe and hands it to the kernel. On any failure
    /// the slot's continuation fires immediately with `-EIO`.
    fn push_and_submit(&mut self, slot: usize, sqe: &io_uring::squeue::Entry) {
        // SAFETY: the buffers referenced by the sqe are kept alive by the
        // submitter's contract (payload) and by the slot table (iovec
        // array) until the completion for this user-data is reaped.
        let pushed = unsafe { self.ring.submission().push(sqe) };
        if pushed.is_err() {
            error!("submission queue full");
            self.fail_slot(slot, -(Errno::EIO as i32));
            return;
        }
        if let Err(e) = self.ring.submit() {
            error!("ring submit: {e}");
            self.fail_slot(slot, -(Errno::EIO as i32));
        }
    }

    /// Releases `slot` and fires its continuation with `status`.
    fn fail_slot(&mut self, slot: usize, status: i32) {
        if let Some(pending) = self.slots[slot].take() {
            self.free.push(slot);
            (pending.complete)(status);
        }
    }

    /// Drains up to [`POLL_BATCH`] completions in one non-blocking sweep,
    /// invoking each continuation with `0` or `-EIO`. Never blocks; an
    /// empty completion queue makes the sweep a no-op.
    pub fn poll(&mut self) -> PollStatus {
        let mut reaped: Vec<(u64, i32)> = Vec::new();
        for cqe in self.ring.completion().take(POLL_BATCH) {
            let res = cqe.result();
            let status = if res < 0 {
                error!("ring completion: {}", Errno::from_raw(-res));
                -(Errno::EIO as i32)
            } else {
                0
            };
            reaped.push((cqe.user_data(), status));
        }

        for (token, status) in reaped {
            let slot = token as usize;
            match self.slots.get_mut(slot).and_then(Option::take) {
                Some(pending) => {
                    self.free.push(slot);
                    (pending.complete)(status);
                }
                None => error!("completion for unknown slot {slot}"),
            }
        }
        PollStatus::Busy
    }
}

impl std::fmt::Debug for IoRing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoRing")
            .field("depth", &self.slots.len())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}
