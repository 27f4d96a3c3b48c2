//! Per-thread volume I/O channel: translates host read/write/flush
//! submissions into blob-level I/O on the channel's blob-store
//! sub-channel.

use std::rc::Rc;

use tracing::{debug, error};

use crate::blobstore::BlobStoreChannel;
use crate::bs_dev::IoVec;
use crate::ring::PollStatus;
use crate::volume::Volume;

/// Host-visible I/O types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IoType {
    /// Read blocks.
    Read,
    /// Write blocks.
    Write,
    /// Make acknowledged writes durable.
    Flush,
    /// Zero a block range.
    WriteZeroes,
    /// Deallocate a block range.
    Unmap,
    /// Reset the device.
    Reset,
}

/// Host-visible completion status of one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum IoStatus {
    /// The submission completed successfully.
    Success,
    /// The submission failed or was unsupported.
    Failed,
}

/// One host submission routed into the volume.
#[derive(Debug)]
#[non_exhaustive]
pub enum VolumeIo {
    /// Read `num_blocks` blocks at `offset_blocks` into the buffers.
    Read {
        /// Destination buffers.
        iovs: Vec<IoVec>,
        /// First block of the request.
        offset_blocks: u64,
        /// Length of the request in blocks.
        num_blocks: u64,
    },
    /// Write `num_blocks` blocks at `offset_blocks` from the buffers.
    Write {
        /// Source buffers.
        iovs: Vec<IoVec>,
        /// First block of the request.
        offset_blocks: u64,
        /// Length of the request in blocks.
        num_blocks: u64,
    },
    /// Make acknowledged writes durable.
    Flush,
    /// Zero a block range (unsupported).
    WriteZeroes {
        /// First block of the range.
        offset_blocks: u64,
        /// Length of the range in blocks.
        num_blocks: u64,
    },
    /// Deallocate a block range (unsupported).
    Unmap {
        /// First block of the range.
        offset_blocks: u64,
        /// Length of the range in blocks.
        num_blocks: u64,
    },
    /// Reset the device (unsupported).
    Reset,
}

/// Continuation for one host submission.
pub type SubmitComplete = Box<dyn FnOnce(IoStatus)>;

/// Per-thread channel of one volume.
pub struct VolumeChannel {
    volume: Rc<Volume>,
    bs_channel: Box<dyn BlobStoreChannel>,
    blocks_read: u64,
    blocks_written: u64,
}

/// Maps a blob-level completion code to the host-visible status. The
/// specific code is logged, never surfaced as status bits.
fn map_status(op: &'static str) -> impl FnOnce(i32) -> IoStatus {
    move |status| {
        if status == 0 {
            IoStatus::Success
        } else {
            debug!("{op} failed with code {status}");
            IoStatus::Failed
        }
    }
}

impl VolumeChannel {
    pub(crate) fn new(volume: Rc<Volume>, bs_channel: Box<dyn BlobStoreChannel>) -> Self {
        Self {
            volume,
            bs_channel,
            blocks_read: 0,
            blocks_written: 0,
        }
    }

    /// Routes one host submission. The continuation fires exactly once.
    pub fn submit(&mut self, io: VolumeIo, complete: SubmitComplete) {
        let Some(blob) = self.volume.blob() else {
            error!("submission on a volume without an open blob");
            complete(IoStatus::Failed);
            return;
        };
        match io {
            VolumeIo::Read {
                iovs,
                offset_blocks,
                num_blocks,
            } => {
                self.blocks_read += num_blocks;
                let map = map_status("blob read");
                blob.readv(
                    &mut *self.bs_channel,
                    &iovs,
                    offset_blocks,
                    num_blocks,
                    Box::new(move |status| complete(map(status))),
                );
            }
            VolumeIo::Write {
                iovs,
                offset_blocks,
                num_blocks,
            } => {
                self.blocks_written += num_blocks;
                let map = map_status("blob write");
                blob.writev(
                    &mut *self.bs_channel,
                    &iovs,
                    offset_blocks,
                    num_blocks,
                    Box::new(move |status| complete(map(status))),
                );
            }
            VolumeIo::Flush => {
                if self.volume.no_sync() {
                    complete(IoStatus::Success);
                } else {
                    let map = map_status("metadata sync");
                    blob.sync_metadata(Box::new(move |status| complete(map(status))));
                }
            }
            other => {
                error!("unsupported I/O type {other:?} on '{}'", self.volume.name());
                complete(IoStatus::Failed);
            }
        }
    }

    /// Drains the channel's blob-store sub-channel. The volume itself
    /// queues no deferred work.
    pub fn poll(&mut self) -> PollStatus {
        self.bs_channel.poll()
    }

    /// Blocks read through this channel.
    pub const fn blocks_read(&self) -> u64 {
        self.blocks_read
    }

    /// Blocks written through this channel.
    pub const fn blocks_written(&self) -> u64 {
        self.blocks_written
    }
}

impl std::fmt::Debug for VolumeChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeChannel")
            .field("volume", &self.volume.name())
            .field("blocks_read", &self.blocks_read)
            .field("blocks_written", &self.blocks_written)
            .finish()
    }
}
