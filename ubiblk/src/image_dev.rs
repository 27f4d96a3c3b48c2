//! Read-only copy-on-write backing device over a base image file and an
//! optional overlay file.
//!
//! The blob store installs this device as the external snapshot "below"
//! the live blob: every read of a cluster the blob has never written
//! lands here. Routing consults the overlay's cluster map: a zero entry
//! sends the read to the base image at the identity byte offset, a
//! non-zero entry sends it to the overlay at the recorded payload offset.
//! The device never writes; every mutating hook completes with
//! `-ENOTSUP`.

use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use nix::errno::Errno;
use tracing::{debug, error};

use crate::bs_dev::{BsDev, BsDevChannel, IoVec};
use crate::cluster_map::ClusterMap;
use crate::geometry::Geometry;
use crate::ring::{IoCompletion, IoRing, PollStatus, RING_DEPTH};
use crate::{Error, Result};

/// The copy-on-write image backing device.
///
/// The cluster map is loaded once from the overlay header when the device
/// is created and shared read-only with every channel; it only changes
/// when no channel exists (a snapshot writes a new overlay, then a new
/// device is created over it).
pub struct ImageBsDev {
    image_path: PathBuf,
    snapshot_path: Option<PathBuf>,
    geometry: Geometry,
    blockcnt: u64,
    directio: bool,
    map: Rc<ClusterMap>,
}

impl ImageBsDev {
    /// Creates a device over `image_path`, with overlay routing if
    /// `snapshot_path` is given. The block count is taken from the image
    /// file size.
    pub fn new(
        image_path: &Path,
        snapshot_path: Option<&Path>,
        blocklen: u32,
        cluster_blocks: u32,
        directio: bool,
    ) -> Result<Self> {
        let geometry = Geometry::new(blocklen, cluster_blocks)?;
        let image_bytes = std::fs::metadata(image_path)?.len();
        let map = match snapshot_path {
            Some(path) => ClusterMap::load(path)?,
            None => ClusterMap::zeroed(),
        };
        Ok(Self {
            image_path: image_path.to_path_buf(),
            snapshot_path: snapshot_path.map(Path::to_path_buf),
            geometry,
            blockcnt: image_bytes / u64::from(blocklen),
            directio,
            map: Rc::new(map),
        })
    }

    /// Opens one of the backing files in the configured I/O mode.
    fn open_backing(&self, path: &Path) -> Result<File> {
        let mut options = OpenOptions::new();
        options.read(true);
        if self.directio {
            options.custom_flags(libc::O_DIRECT);
        }
        Ok(options.open(path)?)
    }
}

impl BsDev for ImageBsDev {
    fn blocklen(&self) -> u32 {
        self.geometry.blocklen()
    }

    fn blockcnt(&self) -> u64 {
        self.blockcnt
    }

    fn create_channel(&self) -> Result<Box<dyn BsDevChannel>> {
        let image = self.open_backing(&self.image_path)?;
        let overlay = match &self.snapshot_path {
            Some(path) => Some(self.open_backing(path)?),
            None => None,
        };
        let ring = IoRing::new(RING_DEPTH)?;
        Ok(Box::new(ImageChannel {
            image,
            overlay,
            ring,
            map: Rc::clone(&self.map),
            geometry: self.geometry,
            blockcnt: self.blockcnt,
        }))
    }

    fn is_range_valid(&self, lba: u64, lba_count: u64) -> bool {
        if lba >= self.blockcnt {
            // The overlay may legally extend beyond the base image.
            return self.map.get(self.geometry.cluster_of(lba)) != 0;
        }
        if lba + lba_count > self.blockcnt {
            error!(
                "range [{lba}, +{lba_count}) partially overruns device of {} blocks",
                self.blockcnt
            );
            return false;
        }
        true
    }
}

impl std::fmt::Debug for ImageBsDev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageBsDev")
            .field("image_path", &self.image_path)
            .field("snapshot_path", &self.snapshot_path)
            .field("blockcnt", &self.blockcnt)
            .field("directio", &self.directio)
            .finish()
    }
}

/// Per-thread channel: open descriptors plus a submission ring.
struct ImageChannel {
    image: File,
    overlay: Option<File>,
    ring: IoRing,
    map: Rc<ClusterMap>,
    geometry: Geometry,
    blockcnt: u64,
}

/// Where one read request is routed.
enum Route {
    /// Byte offset into the given open file.
    File(std::os::fd::RawFd, u64),
    /// Complete immediately with this status, no I/O.
    Immediate(i32),
}

impl ImageChannel {
    /// Resolves the routing decision for a request starting at `lba`.
    ///
    /// The caller (the blob store) honors cluster alignment, so one
    /// decision covers the whole request.
    fn route(&self, lba: u64) -> Route {
        if lba >= self.blockcnt {
            // The store probes metadata regions past the end of the
            // device; those reads succeed without transferring anything.
            return Route::Immediate(0);
        }
        let mapped = self.map.get(self.geometry.cluster_of(lba));
        if mapped == 0 {
            return Route::File(self.image.as_raw_fd(), self.geometry.byte_of(lba));
        }
        match &self.overlay {
            Some(overlay) => Route::File(
                overlay.as_raw_fd(),
                mapped + self.geometry.byte_in_cluster(lba),
            ),
            None => {
                error!("cluster {} mapped but no overlay is open", lba);
                Route::Immediate(-(Errno::EIO as i32))
            }
        }
    }
}

impl BsDevChannel for ImageChannel {
    fn read(&mut self, payload: &mut [u8], lba: u64, _lba_count: u32, complete: IoCompletion) {
        match self.route(lba) {
            Route::File(fd, offset) => self.ring.read_at(fd, payload, offset, complete),
            Route::Immediate(status) => complete(status),
        }
    }

    fn readv(&mut self, iovs: &[IoVec], lba: u64, _lba_count: u32, complete: IoCompletion) {
        match self.route(lba) {
            Route::File(fd, offset) => self.ring.readv_at(fd, iovs, offset, complete),
            Route::Immediate(status) => complete(status),
        }
    }

    fn write(&mut self, _payload: &[u8], lba: u64, _lba_count: u32, complete: IoCompletion) {
        debug!("write at {lba} rejected, image device is read-only");
        complete(Error::not_supported());
    }

    fn writev(&mut self, _iovs: &[IoVec], lba: u64, _lba_count: u32, complete: IoCompletion) {
        debug!("writev at {lba} rejected, image device is read-only");
        complete(Error::not_supported());
    }

    fn flush(&mut self, complete: IoCompletion) {
        complete(Error::not_supported());
    }

    fn poll(&mut self) -> PollStatus {
        self.ring.poll()
    }
}
