//! Volume lifecycle: creation over a base device, the process-wide
//! registry, teardown, and persisted configuration.
//!
//! A volume owns one blob store placed on a host base device, one live
//! blob inside it, and the paths of the image and overlay files its
//! external-snapshot device reads. Creation is a continuation chain
//! through the blob store; an explicit stage enum plus one idempotent
//! abort routine drives reverse-stage cleanup on any failure, and the
//! caller's completion fires exactly once on every path.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::thread::{self, ThreadId};

use nix::errno::Errno;
use tracing::{error, info, warn};
use ubiblk_proto::{ConfigEntry, CreateVolume, SnapshotStatusReply};

use crate::blobstore::{
    Blob, BlobId, BlobOpts, BlobStore, BlobStoreProvider, BsOpts, EsnapDevFactory, HostFramework,
};
use crate::channel::{IoType, VolumeChannel};
use crate::image_dev::ImageBsDev;
use crate::{Error, Result};

/// Esnap identifier registered on the live blob; the store hands it back
/// when it asks for the external-snapshot device.
pub(crate) const ESNAP_ID: &[u8] = b"ubi_image_esnap_id";

/// Alignment advertised to the host, in bytes.
pub const VOLUME_ALIGNMENT_BYTES: u32 = 4096;

/// Completion of a `create` request.
pub type CreateComplete = Box<dyn FnOnce(Result<Rc<Volume>>)>;

/// Completion of a delete or snapshot request: `0` or a negated errno.
pub type OpComplete = Box<dyn FnOnce(i32)>;

/// Progress record of the volume's snapshot workflow.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct SnapshotRecord {
    /// `true` while a workflow is running.
    pub in_progress: bool,
    /// `0`, or the negated errno of the last finished workflow.
    pub result: i32,
    /// Clusters copied so far.
    pub copied_clusters: u64,
    /// Total data clusters, latched when the workflow starts.
    pub total_clusters: u64,
}

/// One live virtual disk.
pub struct Volume {
    name: String,
    image_path: PathBuf,
    snapshot_path: Option<PathBuf>,
    blocklen: u32,
    blockcnt: u64,
    required_alignment: u32,
    optimal_io_boundary: u32,
    no_sync: bool,
    store: Rc<dyn BlobStore>,
    blob: RefCell<Option<Rc<dyn Blob>>>,
    blob_id: Cell<BlobId>,
    record: RefCell<SnapshotRecord>,
    /// The thread the base device was opened on; teardown must run here.
    home_thread: ThreadId,
}

impl Volume {
    /// Volume name, unique process-wide.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block length in bytes (the store's I/O unit size).
    pub const fn blocklen(&self) -> u32 {
        self.blocklen
    }

    /// Addressable blocks.
    pub const fn blockcnt(&self) -> u64 {
        self.blockcnt
    }

    /// Required buffer alignment as a power-of-two exponent.
    pub const fn required_alignment(&self) -> u32 {
        self.required_alignment
    }

    /// Optimal I/O boundary in blocks.
    pub const fn optimal_io_boundary(&self) -> u32 {
        self.optimal_io_boundary
    }

    /// The host should split submissions on the optimal boundary.
    pub const fn split_on_optimal_io_boundary(&self) -> bool {
        true
    }

    /// Product name advertised to the host.
    pub const fn product_name() -> &'static str {
        "Ubi disk"
    }

    /// The volume has no volatile write cache.
    pub const fn write_cache(&self) -> bool {
        false
    }

    /// `true` when FLUSH is degraded to a no-op.
    pub const fn no_sync(&self) -> bool {
        self.no_sync
    }

    /// I/O types this volume serves.
    pub fn io_type_supported(&self, io_type: IoType) -> bool {
        matches!(io_type, IoType::Read | IoType::Write | IoType::Flush)
    }

    /// A point-in-time copy of the snapshot progress record.
    pub fn snapshot_status(&self) -> SnapshotRecord {
        *self.record.borrow()
    }

    /// The persisted-configuration entry replaying this volume. Only the
    /// name and image path survive; other fields reload as defaults.
    pub fn write_config(&self) -> ConfigEntry {
        ConfigEntry::new(&self.name, self.image_path.display().to_string())
    }

    /// Opens a per-thread I/O channel for this volume.
    pub fn create_channel(self: &Rc<Self>) -> Result<VolumeChannel> {
        let bs_channel = self.store.alloc_channel()?;
        Ok(VolumeChannel::new(Rc::clone(self), bs_channel))
    }

    pub(crate) fn store(&self) -> &Rc<dyn BlobStore> {
        &self.store
    }

    pub(crate) fn blob(&self) -> Option<Rc<dyn Blob>> {
        self.blob.borrow().clone()
    }

    pub(crate) fn take_blob(&self) -> Option<Rc<dyn Blob>> {
        self.blob.borrow_mut().take()
    }

    pub(crate) const fn blob_id(&self) -> &Cell<BlobId> {
        &self.blob_id
    }

    pub(crate) const fn record(&self) -> &RefCell<SnapshotRecord> {
        &self.record
    }

    pub(crate) const fn home_thread(&self) -> ThreadId {
        self.home_thread
    }
}

impl std::fmt::Debug for Volume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Volume")
            .field("name", &self.name)
            .field("image_path", &self.image_path)
            .field("snapshot_path", &self.snapshot_path)
            .field("blocklen", &self.blocklen)
            .field("blockcnt", &self.blockcnt)
            .finish()
    }
}

/// Process-wide registry and entry point of the four public operations.
pub struct VolumeManager {
    framework: Rc<dyn HostFramework>,
    provider: Rc<dyn BlobStoreProvider>,
    volumes: RefCell<HashMap<String, Rc<Volume>>>,
}

/// Stages of an in-flight creation, in forward order. Cleanup runs in
/// reverse from whatever stage the failure hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CreateStage {
    Init,
    BsLoaded,
    BlobCreated,
    BlobOpened,
    Registered,
}

/// State threaded through the creation continuation chain.
struct CreateContext {
    manager: Rc<VolumeManager>,
    req: CreateVolume,
    stage: CreateStage,
    store: Option<Rc<dyn BlobStore>>,
    blob: Option<Rc<dyn Blob>>,
    blob_id: BlobId,
    home_thread: ThreadId,
    complete: Option<CreateComplete>,
}

impl VolumeManager {
    /// Creates a manager over the given host framework and blob-store
    /// subsystem.
    pub fn new(framework: Rc<dyn HostFramework>, provider: Rc<dyn BlobStoreProvider>) -> Rc<Self> {
        Rc::new(Self {
            framework,
            provider,
            volumes: RefCell::new(HashMap::new()),
        })
    }

    /// Looks up a live volume by name.
    pub fn get(&self, name: &str) -> Option<Rc<Volume>> {
        self.volumes.borrow().get(name).cloned()
    }

    /// Persisted-configuration entries for every live volume.
    pub fn write_config(&self) -> Vec<ConfigEntry> {
        self.volumes
            .borrow()
            .values()
            .map(|v| v.write_config())
            .collect()
    }

    /// Creates a volume. `complete` fires exactly once, with the
    /// registered volume or the first failure.
    pub fn create(self: &Rc<Self>, req: CreateVolume, complete: CreateComplete) {
        if req.name.is_empty() || req.image_path.is_empty() || req.base_bdev.is_empty() {
            complete(Err(Error::InvalidConfig(
                "name, image_path and base_bdev are required".into(),
            )));
            return;
        }
        if self.volumes.borrow().contains_key(&req.name) {
            complete(Err(Error::AlreadyExists(req.name)));
            return;
        }

        let base = match self.framework.open_base_dev(
            &req.base_bdev,
            Box::new(|dev, event| warn!("unhandled event {event:?} on base device '{dev}'")),
        ) {
            Ok(dev) => dev,
            Err(e) => {
                complete(Err(e));
                return;
            }
        };

        let factory = esnap_factory(&req);
        let format = req.format_bdev;
        let ctx = Rc::new(RefCell::new(CreateContext {
            manager: Rc::clone(self),
            req,
            stage: CreateStage::Init,
            store: None,
            blob: None,
            blob_id: 0,
            home_thread: thread::current().id(),
            complete: Some(complete),
        }));

        let opts = BsOpts {
            esnap_dev_factory: Some(factory),
        };
        let ctx2 = Rc::clone(&ctx);
        let done = Box::new(move |status, store| on_store_ready(&ctx2, status, store));
        if format {
            self.provider.init(base, opts, done);
        } else {
            self.provider.load(base, opts, done);
        }
    }

    /// Unregisters and tears down a volume. Framework rejections surface
    /// their error code; the teardown chain then closes the blob and
    /// unloads the store on the home thread.
    pub fn delete(&self, name: &str, complete: OpComplete) {
        let volume = self.get(name);
        let Some(volume) = volume else {
            complete(-(Errno::ENOENT as i32));
            return;
        };
        if let Err(e) = self.framework.unregister_volume(name) {
            complete(e.errno());
            return;
        }
        debug_assert_eq!(
            thread::current().id(),
            volume.home_thread(),
            "base device must be closed on the thread that opened it",
        );
        self.volumes.borrow_mut().remove(name);

        let store = Rc::clone(volume.store());
        match volume.take_blob() {
            Some(blob) => blob.close(Box::new(move |status| {
                if status != 0 {
                    error!("closing blob: code {status}");
                }
                unload_then(&store, complete);
            })),
            None => unload_then(&store, complete),
        }
    }

    /// Starts the snapshot workflow for the named volume. `complete`
    /// fires once: on the first failure, or as soon as the long-running
    /// copy has been submitted (progress is queried separately).
    pub fn snapshot(&self, name: &str, path: &Path, complete: OpComplete) {
        match self.get(name) {
            Some(volume) => crate::snapshot::start(volume, path.to_path_buf(), complete),
            None => complete(-(Errno::ENOENT as i32)),
        }
    }

    /// Snapshot progress of the named volume.
    pub fn snapshot_status(&self, name: &str) -> Result<SnapshotStatusReply> {
        let volume = self
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("volume '{name}'")))?;
        let record = volume.snapshot_status();
        Ok(SnapshotStatusReply::new(
            name,
            record.in_progress,
            record.result,
            record.copied_clusters,
            record.total_clusters,
        ))
    }
}

impl std::fmt::Debug for VolumeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeManager")
            .field("volumes", &self.volumes.borrow().len())
            .finish()
    }
}

/// Unloads the store, then fires the caller's completion.
fn unload_then(store: &Rc<dyn BlobStore>, complete: OpComplete) {
    store.unload(Box::new(move |status| {
        if status != 0 {
            error!("unloading blob store: code {status}");
        }
        complete(0);
    }));
}

/// Builds the factory the store calls to materialize the volume's
/// external-snapshot device.
fn esnap_factory(req: &CreateVolume) -> EsnapDevFactory {
    let image_path = PathBuf::from(&req.image_path);
    let snapshot_path = req
        .snapshot_path
        .as_deref()
        .filter(|p| !p.is_empty())
        .map(PathBuf::from);
    let directio = req.directio;
    Rc::new(move |store: &dyn BlobStore, id: &[u8]| {
        if id != ESNAP_ID {
            warn!("unexpected esnap id {id:?}");
        }
        let blocklen = store.io_unit_size();
        let cluster_blocks = u32::try_from(store.cluster_size() / u64::from(blocklen))
            .map_err(|_| Error::InvalidConfig("cluster size overflows a block count".into()))?;
        let dev = ImageBsDev::new(
            &image_path,
            snapshot_path.as_deref(),
            blocklen,
            cluster_blocks,
            directio,
        )?;
        Ok(Box::new(dev) as Box<dyn crate::bs_dev::BsDev>)
    })
}

fn on_store_ready(
    ctx: &Rc<RefCell<CreateContext>>,
    status: i32,
    store: Option<Rc<dyn BlobStore>>,
) {
    let Some(store) = store.filter(|_| status == 0) else {
        abort(ctx, Error::blob_store("blob store init", status));
        return;
    };
    let format = {
        let mut c = ctx.borrow_mut();
        c.store = Some(Rc::clone(&store));
        c.stage = CreateStage::BsLoaded;
        c.req.format_bdev
    };
    let ctx2 = Rc::clone(ctx);
    let store2 = Rc::clone(&store);
    if format {
        let opts = BlobOpts {
            thin_provision: true,
            num_clusters: store.total_data_clusters(),
            esnap_id: Some(ESNAP_ID.to_vec()),
        };
        store.create_blob(
            opts,
            Box::new(move |st, id| on_blob_created(&ctx2, &store2, st, id)),
        );
    } else {
        store.open_first_blob(Box::new(move |st, blob| {
            on_blob_opened(&ctx2, &store2, st, blob);
        }));
    }
}

fn on_blob_created(
    ctx: &Rc<RefCell<CreateContext>>,
    store: &Rc<dyn BlobStore>,
    status: i32,
    id: BlobId,
) {
    if status != 0 {
        abort(ctx, Error::blob_store("blob create", status));
        return;
    }
    {
        let mut c = ctx.borrow_mut();
        c.blob_id = id;
        c.stage = CreateStage::BlobCreated;
    }
    let ctx2 = Rc::clone(ctx);
    let store2 = Rc::clone(store);
    store.create_snapshot(
        id,
        Box::new(move |st, _snap| on_base_snapshot(&ctx2, &store2, st)),
    );
}

fn on_base_snapshot(ctx: &Rc<RefCell<CreateContext>>, store: &Rc<dyn BlobStore>, status: i32) {
    if status != 0 {
        abort(ctx, Error::blob_store("initial snapshot", status));
        return;
    }
    let id = ctx.borrow().blob_id;
    let ctx2 = Rc::clone(ctx);
    let store2 = Rc::clone(store);
    store.open_blob(
        id,
        Box::new(move |st, blob| on_blob_opened(&ctx2, &store2, st, blob)),
    );
}

fn on_blob_opened(
    ctx: &Rc<RefCell<CreateContext>>,
    store: &Rc<dyn BlobStore>,
    status: i32,
    blob: Option<Rc<dyn Blob>>,
) {
    let Some(blob) = blob.filter(|_| status == 0) else {
        abort(ctx, Error::blob_store("blob open", status));
        return;
    };
    let (manager, volume) = {
        let mut c = ctx.borrow_mut();
        c.blob = Some(Rc::clone(&blob));
        c.blob_id = blob.id();
        c.stage = CreateStage::BlobOpened;

        let blocklen = store.io_unit_size();
        let volume = Rc::new(Volume {
            name: c.req.name.clone(),
            image_path: PathBuf::from(&c.req.image_path),
            snapshot_path: c
                .req
                .snapshot_path
                .as_deref()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
            blocklen,
            blockcnt: blob.num_io_units(),
            required_alignment: VOLUME_ALIGNMENT_BYTES.ilog2(),
            optimal_io_boundary: VOLUME_ALIGNMENT_BYTES / blocklen,
            no_sync: c.req.no_sync,
            store: Rc::clone(store),
            blob: RefCell::new(Some(blob)),
            blob_id: Cell::new(c.blob_id),
            record: RefCell::new(SnapshotRecord::default()),
            home_thread: c.home_thread,
        });
        (Rc::clone(&c.manager), volume)
    };

    if let Err(e) = manager.framework.register_volume(&volume) {
        abort(ctx, e);
        return;
    }
    ctx.borrow_mut().stage = CreateStage::Registered;
    manager
        .volumes
        .borrow_mut()
        .insert(volume.name().to_owned(), Rc::clone(&volume));
    info!(
        "volume '{}' created with {} blocks of {} bytes",
        volume.name(),
        volume.blockcnt(),
        volume.blocklen(),
    );

    if let Some(complete) = ctx.borrow_mut().complete.take() {
        complete(Ok(volume));
    }
}

/// Aborts an in-flight creation: idempotent, fires the caller's
/// completion once, and tears down in reverse stage order.
fn abort(ctx: &Rc<RefCell<CreateContext>>, err: Error) {
    let (complete, blob, store, registered, name, manager) = {
        let mut c = ctx.borrow_mut();
        let Some(complete) = c.complete.take() else {
            return;
        };
        error!("creating volume '{}': {err}", c.req.name);
        (
            complete,
            c.blob.take(),
            c.store.take(),
            c.stage == CreateStage::Registered,
            c.req.name.clone(),
            Rc::clone(&c.manager),
        )
    };

    if registered {
        manager.volumes.borrow_mut().remove(&name);
        if let Err(e) = manager.framework.unregister_volume(&name) {
            warn!("unregistering '{name}' during abort: {e}");
        }
    }

    fn teardown(store: Option<Rc<dyn BlobStore>>, complete: CreateComplete, err: Error) {
        match store {
            Some(store) => store.unload(Box::new(move |status| {
                if status != 0 {
                    error!("unloading blob store during abort: code {status}");
                }
                complete(Err(err));
            })),
            None => complete(Err(err)),
        }
    }

    match blob {
        Some(blob) => blob.close(Box::new(move |status| {
            if status != 0 {
                error!("closing blob during abort: code {status}");
            }
            teardown(store, complete, err);
        })),
        None => teardown(store, complete, err),
    }
}
