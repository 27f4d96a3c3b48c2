//! User-space copy-on-write block volumes with snapshot export.
//!
//! `ubiblk` exposes a read-only disk image as a live virtual volume on
//! top of a content-addressed blob store. Reads of never-written
//! clusters are routed to the base image (or to an overlay file holding
//! modified clusters, via an on-disk cluster map); writes land in the
//! store. A running volume can be snapshotted online: the live blob is
//! cloned, decoupled, and shallow-copied into a new overlay file while
//! progress is queryable.
//!
//! The blob store itself and the host block-device framework are
//! external collaborators; [`blobstore`] defines the contracts they
//! implement, and [`bs_dev`] defines the backing-device interface this
//! crate hands back to the store. All file I/O runs through per-thread
//! io_uring channels drained by cooperative pollers; nothing blocks,
//! and nothing crosses threads.
//!
//! # Quick start
//!
//! ```no_run
//! use std::rc::Rc;
//! use ubiblk::{CreateVolume, VolumeManager};
//! # fn collaborators() -> (Rc<dyn ubiblk::blobstore::HostFramework>,
//! #                        Rc<dyn ubiblk::blobstore::BlobStoreProvider>) { unimplemented!() }
//!
//! let (framework, provider) = collaborators();
//! let manager = VolumeManager::new(framework, provider);
//!
//! let request = CreateVolume::new("vol0", "/images/base.raw", "nvme0n1");
//! manager.create(
//!     request,
//!     Box::new(|result| match result {
//!         Ok(volume) => println!("created {}", volume.name()),
//!         Err(e) => eprintln!("create failed: {e}"),
//!     }),
//! );
//! ```

pub mod blobstore;
pub mod bs_dev;
mod channel;
mod cluster_map;
mod delta_dev;
mod error;
mod geometry;
mod image_dev;
mod ring;
mod snapshot;
mod volume;

pub use channel::{IoStatus, IoType, SubmitComplete, VolumeChannel, VolumeIo};
pub use cluster_map::{ClusterMap, HEADER_BYTES, MAX_CLUSTERS};
pub use delta_dev::{DeltaBsDev, DeltaDirection};
pub use error::{Error, Result};
pub use geometry::Geometry;
pub use image_dev::ImageBsDev;
pub use ring::{IoCompletion, IoRing, PollStatus, RING_DEPTH};
pub use ubiblk_proto::{ConfigEntry, CreateVolume, RpcError, SnapshotStatusReply};
pub use volume::{
    CreateComplete, OpComplete, SnapshotRecord, Volume, VolumeManager, VOLUME_ALIGNMENT_BYTES,
};
