//! Delta backing device: the destination of a shallow copy, and the
//! reader of the overlay files it produces.
//!
//! A delta file is append-structured with an index at the head: the
//! cluster-map header occupies bytes `[0, HEADER_BYTES)`, cluster
//! payloads follow in the order they were written. A `Write`-direction
//! channel zeroes the header up front so payloads start at a known
//! offset, records each payload's position in the in-memory map, and
//! rewrites the header with the final map when the channel closes. A
//! `Read`-direction channel loads the header and serves mapped clusters
//! from their recorded offsets; unmapped clusters complete with
//! `-ENOTSUP`, the signal that the caller must read the base instead.
//!
//! One writer at a time per file; concurrency is enforced upstream.

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use tracing::{debug, error};

use crate::bs_dev::{BsDev, BsDevChannel, IoVec, iov_bytes};
use crate::cluster_map::{ClusterMap, HEADER_BYTES, MAX_CLUSTERS};
use crate::geometry::Geometry;
use crate::ring::{IoCompletion, IoRing, PollStatus, RING_DEPTH};
use crate::{Error, Result};

/// Which side of a shallow copy this device plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum DeltaDirection {
    /// Serve cluster payloads from an existing delta file.
    Read,
    /// Record cluster payloads copied out of a live volume.
    Write,
}

/// The delta backing device.
#[derive(Debug)]
pub struct DeltaBsDev {
    path: PathBuf,
    blockcnt: u64,
    geometry: Geometry,
    direction: DeltaDirection,
}

impl DeltaBsDev {
    /// Creates a delta device for the file at `path`.
    pub fn new(
        path: &Path,
        blockcnt: u64,
        blocklen: u32,
        cluster_blocks: u32,
        direction: DeltaDirection,
    ) -> Result<Self> {
        let geometry = Geometry::new(blocklen, cluster_blocks)?;
        let clusters = blockcnt.div_ceil(u64::from(cluster_blocks));
        if clusters > MAX_CLUSTERS as u64 {
            return Err(Error::TooManyClusters {
                needed: clusters,
                max: MAX_CLUSTERS as u64,
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            blockcnt,
            geometry,
            direction,
        })
    }
}

impl BsDev for DeltaBsDev {
    fn blocklen(&self) -> u32 {
        self.geometry.blocklen()
    }

    fn blockcnt(&self) -> u64 {
        self.blockcnt
    }

    fn create_channel(&self) -> Result<Box<dyn BsDevChannel>> {
        let (file, map, initialized) = match self.direction {
            DeltaDirection::Write => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&self.path)?;
                // Reserve the header so the payload region starts at a
                // known offset.
                let map = ClusterMap::zeroed();
                map.write_to(&mut file)?;
                (file, map, false)
            }
            DeltaDirection::Read => {
                let mut file = File::open(&self.path)?;
                let map = ClusterMap::read_from(&mut file)?;
                (file, map, true)
            }
        };
        let ring = IoRing::new(RING_DEPTH)?;
        Ok(Box::new(DeltaChannel {
            file,
            ring,
            map,
            initialized,
            append_off: HEADER_BYTES,
            direction: self.direction,
            geometry: self.geometry,
        }))
    }

    /// The shallow-copy driver only submits ranges it owns; the device
    /// does not second-guess them.
    fn is_range_valid(&self, _lba: u64, _lba_count: u64) -> bool {
        true
    }
}

/// Per-thread channel state for one delta file.
struct DeltaChannel {
    file: File,
    ring: IoRing,
    map: ClusterMap,
    /// `true` once the map reflects the on-disk header (read direction).
    initialized: bool,
    /// Next payload byte; the header region is never reused.
    append_off: u64,
    direction: DeltaDirection,
    geometry: Geometry,
}

impl DeltaChannel {
    /// Records `len` payload bytes for the cluster containing `lba` and
    /// advances the append offset.
    fn commit(&mut self, lba: u64, len: u64) {
        self.map.set(self.geometry.cluster_of(lba), self.append_off);
        self.append_off += len;
    }

    /// Resolves the overlay byte offset for a read at `lba`, if the
    /// cluster was copied into this file.
    fn mapped_offset(&self, lba: u64) -> Option<u64> {
        let mapped = self.map.get(self.geometry.cluster_of(lba));
        (mapped != 0).then(|| mapped + self.geometry.byte_in_cluster(lba))
    }
}

impl BsDevChannel for DeltaChannel {
    fn read(&mut self, payload: &mut [u8], lba: u64, _lba_count: u32, complete: IoCompletion) {
        if self.direction != DeltaDirection::Read || !self.initialized {
            complete(Error::not_supported());
            return;
        }
        match self.mapped_offset(lba) {
            Some(offset) => self.ring.read_at(self.file.as_raw_fd(), payload, offset, complete),
            None => {
                // Unmodified cluster: the caller reads the base instead.
                debug!("cluster of lba {lba} not in delta file, passing through");
                complete(Error::not_supported());
            }
        }
    }

    fn readv(&mut self, iovs: &[IoVec], lba: u64, _lba_count: u32, complete: IoCompletion) {
        if self.direction != DeltaDirection::Read || !self.initialized {
            complete(Error::not_supported());
            return;
        }
        match self.mapped_offset(lba) {
            Some(offset) => self
                .ring
                .readv_at(self.file.as_raw_fd(), iovs, offset, complete),
            None => {
                debug!("cluster of lba {lba} not in delta file, passing through");
                complete(Error::not_supported());
            }
        }
    }

    fn write(&mut self, payload: &[u8], lba: u64, lba_count: u32, complete: IoCompletion) {
        if self.direction != DeltaDirection::Write {
            complete(Error::not_supported());
            return;
        }
        let len = u64::from(lba_count) * u64::from(self.geometry.blocklen());
        debug_assert_eq!(payload.len() as u64, len);
        if let Err(e) = self.file.write_all_at(payload, self.append_off) {
            error!("delta write at {}: {e}", self.append_off);
            complete(-(Errno::EIO as i32));
            return;
        }
        self.commit(lba, len);
        complete(0);
    }

    #[allow(unsafe_code)]
    fn writev(&mut self, iovs: &[IoVec], lba: u64, _lba_count: u32, complete: IoCompletion) {
        if self.direction != DeltaDirection::Write {
            complete(Error::not_supported());
            return;
        }
        let mut offset = self.append_off;
        for iov in iovs {
            // SAFETY: the submitter keeps every referenced buffer alive
            // and unmodified for the duration of the call.
            let bytes = unsafe { iov.as_slice() };
            if let Err(e) = self.file.write_all_at(bytes, offset) {
                error!("delta writev at {offset}: {e}");
                complete(-(Errno::EIO as i32));
                return;
            }
            offset += bytes.len() as u64;
        }
        self.commit(lba, iov_bytes(iovs));
        complete(0);
    }

    fn flush(&mut self, complete: IoCompletion) {
        complete(Error::not_supported());
    }

    fn poll(&mut self) -> PollStatus {
        self.ring.poll()
    }
}

impl Drop for DeltaChannel {
    fn drop(&mut self) {
        if self.direction != DeltaDirection::Write {
            return;
        }
        // Persist the final cluster map over the placeholder header.
        if let Err(e) = self
            .file
            .seek(SeekFrom::Start(0))
            .and_then(|_| self.map.write_to(&mut self.file))
        {
            error!("rewriting delta header: {e}");
        }
    }
}
