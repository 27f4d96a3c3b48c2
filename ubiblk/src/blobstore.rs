//! Contracts for the external collaborators: the blob store that owns
//! allocation, metadata, clone/snapshot and shallow-copy primitives, and
//! the host framework that owns device naming and volume visibility.
//!
//! Both live outside this crate; the traits here define exactly the
//! surface the volume lifecycle and snapshot workflow consume. Following
//! the store's native style, asynchronous operations complete through
//! boxed continuations carrying `0` or a negated errno, invoked exactly
//! once on the submitting thread.

use std::rc::Rc;

use crate::bs_dev::{BsDev, IoVec};
use crate::ring::PollStatus;
use crate::volume::Volume;
use crate::Result;

/// Identifier of a blob within a store.
pub type BlobId = u64;

/// Continuation of a unit-result store operation.
pub type BsComplete = Box<dyn FnOnce(i32)>;

/// Continuation receiving a blob id (`0` when the operation failed).
pub type BsIdComplete = Box<dyn FnOnce(i32, BlobId)>;

/// Continuation receiving an opened blob handle.
pub type BsOpenComplete = Box<dyn FnOnce(i32, Option<Rc<dyn Blob>>)>;

/// Continuation receiving an initialized or loaded store.
pub type BsStoreComplete = Box<dyn FnOnce(i32, Option<Rc<dyn BlobStore>>)>;

/// Factory the store invokes when it materializes an external snapshot:
/// given the store and the registered esnap id, it returns the backing
/// device serving the blob's unwritten clusters.
pub type EsnapDevFactory = Rc<dyn Fn(&dyn BlobStore, &[u8]) -> Result<Box<dyn BsDev>>>;

/// Options for initializing or loading a blob store.
#[non_exhaustive]
pub struct BsOpts {
    /// Installed as the store's external-snapshot device creator.
    pub esnap_dev_factory: Option<EsnapDevFactory>,
}

impl BsOpts {
    /// Options with no external-snapshot support.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            esnap_dev_factory: None,
        }
    }
}

impl Default for BsOpts {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for BsOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BsOpts")
            .field("esnap_dev_factory", &self.esnap_dev_factory.is_some())
            .finish()
    }
}

/// Options for creating a blob.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct BlobOpts {
    /// Allocate clusters on first write instead of up front.
    pub thin_provision: bool,
    /// Logical size of the blob in clusters.
    pub num_clusters: u64,
    /// External-snapshot id resolved through the store's device factory.
    pub esnap_id: Option<Vec<u8>>,
}

/// Entry points of the blob-store subsystem over a backing device.
pub trait BlobStoreProvider {
    /// Formats a new store on `dev`.
    fn init(&self, dev: Box<dyn BsDev>, opts: BsOpts, complete: BsStoreComplete);

    /// Loads an existing store from `dev`.
    fn load(&self, dev: Box<dyn BsDev>, opts: BsOpts, complete: BsStoreComplete);
}

/// An initialized blob store.
pub trait BlobStore {
    /// I/O unit size in bytes; the volume adopts it as its block length.
    fn io_unit_size(&self) -> u32;

    /// Cluster size in bytes.
    fn cluster_size(&self) -> u64;

    /// Total data clusters backing the store.
    fn total_data_clusters(&self) -> u64;

    /// Allocates a per-thread I/O channel.
    fn alloc_channel(&self) -> Result<Box<dyn BlobStoreChannel>>;

    /// Creates a blob.
    fn create_blob(&self, opts: BlobOpts, complete: BsIdComplete);

    /// Takes a point-in-time snapshot of `blob`.
    fn create_snapshot(&self, blob: BlobId, complete: BsIdComplete);

    /// Creates a writable clone of the snapshot `snapshot`.
    fn create_clone(&self, snapshot: BlobId, complete: BsIdComplete);

    /// Opens a blob by id.
    fn open_blob(&self, id: BlobId, complete: BsOpenComplete);

    /// Opens the first blob of the store (used after `load`, when the
    /// store holds exactly one).
    fn open_first_blob(&self, complete: BsOpenComplete);

    /// Detaches `blob` from its parent, copying shared clusters in.
    fn decouple_parent(&self, blob: BlobId, complete: BsComplete);

    /// Writes every cluster owned by `blob` to `dst`, reporting the
    /// running cluster count through `progress`. Returns an error if the
    /// copy could not be submitted; `complete` fires when the copy
    /// finishes.
    fn shallow_copy(
        &self,
        blob: BlobId,
        dst: Rc<dyn BsDev>,
        progress: Box<dyn FnMut(u64)>,
        complete: BsComplete,
    ) -> Result<()>;

    /// Unloads the store.
    fn unload(&self, complete: BsComplete);
}

/// An open blob.
pub trait Blob {
    /// The blob's id.
    fn id(&self) -> BlobId;

    /// Logical size in I/O units.
    fn num_io_units(&self) -> u64;

    /// Marks the blob read-only from this point on.
    fn set_read_only(&self);

    /// Persists the blob's metadata.
    fn sync_metadata(&self, complete: BsComplete);

    /// Closes the blob.
    fn close(&self, complete: BsComplete);

    /// Reads `num_blocks` I/O units at `offset_blocks` into `iovs`.
    fn readv(
        &self,
        channel: &mut dyn BlobStoreChannel,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        complete: BsComplete,
    );

    /// Writes `num_blocks` I/O units at `offset_blocks` from `iovs`.
    fn writev(
        &self,
        channel: &mut dyn BlobStoreChannel,
        iovs: &[IoVec],
        offset_blocks: u64,
        num_blocks: u64,
        complete: BsComplete,
    );
}

/// Per-thread channel of a blob store.
pub trait BlobStoreChannel {
    /// Drains the channel's pending completions.
    fn poll(&mut self) -> PollStatus;
}

/// Events the host framework reports for a base device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum BaseDevEvent {
    /// The device is being removed.
    Remove,
    /// The device was resized.
    Resize,
}

/// Callback receiving base-device events for a named device.
pub type BaseDevEventFn = Box<dyn Fn(&str, BaseDevEvent)>;

/// The host block-device framework.
pub trait HostFramework {
    /// Opens the named host block device as a blob-store backing device,
    /// registering `on_event` for device events.
    fn open_base_dev(&self, name: &str, on_event: BaseDevEventFn) -> Result<Box<dyn BsDev>>;

    /// Makes a volume visible to the host I/O stack.
    fn register_volume(&self, volume: &Rc<Volume>) -> Result<()>;

    /// Revokes a volume's visibility. Rejections (unknown name, busy)
    /// surface the framework's error.
    fn unregister_volume(&self, name: &str) -> Result<()>;
}

#[cfg(test)]
#[allow(unsafe_code, clippy::unwrap_used, clippy::expect_used)]
pub(crate) mod mem {
    //! Minimal in-memory blob store and host framework used to drive the
    //! volume lifecycle, snapshot workflow, and submission shim in tests.
    //!
    //! Completions fire synchronously, except `shallow_copy`, which is
    //! pumped one cluster at a time through [`MemStore::pump_copy`] so
    //! tests can observe mid-copy state.

    use super::*;
    use crate::bs_dev::BsDevChannel;
    use crate::error::Error;
    use crate::geometry::Geometry;
    use crate::ring::IoCompletion;
    use std::cell::{Cell, RefCell};
    use std::collections::HashMap;
    use std::rc::Weak;

    /// Planned single-shot failures, keyed by operation name.
    pub type FailPlan = Rc<RefCell<HashMap<&'static str, i32>>>;

    // ------------------------------------------------------------------
    // Host framework
    // ------------------------------------------------------------------

    /// In-memory host framework with named base devices.
    #[derive(Default)]
    pub struct MemFramework {
        bases: RefCell<HashMap<String, (u32, u64)>>,
        pub registered: RefCell<Vec<String>>,
        pub reject_unregister: Cell<Option<i32>>,
    }

    impl MemFramework {
        pub fn with_base(name: &str, blocklen: u32, size_bytes: u64) -> Rc<Self> {
            let framework = Self::default();
            framework
                .bases
                .borrow_mut()
                .insert(name.to_owned(), (blocklen, size_bytes));
            Rc::new(framework)
        }
    }

    impl HostFramework for MemFramework {
        fn open_base_dev(&self, name: &str, _on_event: BaseDevEventFn) -> Result<Box<dyn BsDev>> {
            match self.bases.borrow().get(name) {
                Some(&(blocklen, size_bytes)) => Ok(Box::new(MemBaseDev {
                    blocklen,
                    blockcnt: size_bytes / u64::from(blocklen),
                })),
                None => Err(Error::NotFound(format!("base device '{name}'"))),
            }
        }

        fn register_volume(&self, volume: &Rc<Volume>) -> Result<()> {
            self.registered.borrow_mut().push(volume.name().to_owned());
            Ok(())
        }

        fn unregister_volume(&self, name: &str) -> Result<()> {
            if let Some(code) = self.reject_unregister.get() {
                return Err(Error::blob_store("unregister", code));
            }
            let mut registered = self.registered.borrow_mut();
            match registered.iter().position(|n| n == name) {
                Some(idx) => {
                    registered.remove(idx);
                    Ok(())
                }
                None => Err(Error::NotFound(format!("volume '{name}'"))),
            }
        }
    }

    /// Base device stub; the in-memory store never performs I/O on it.
    struct MemBaseDev {
        blocklen: u32,
        blockcnt: u64,
    }

    impl BsDev for MemBaseDev {
        fn blocklen(&self) -> u32 {
            self.blocklen
        }

        fn blockcnt(&self) -> u64 {
            self.blockcnt
        }

        fn create_channel(&self) -> Result<Box<dyn BsDevChannel>> {
            Ok(Box::new(MemNullChannel))
        }

        fn is_range_valid(&self, lba: u64, lba_count: u64) -> bool {
            lba + lba_count <= self.blockcnt
        }
    }

    struct MemNullChannel;

    impl BsDevChannel for MemNullChannel {
        fn read(&mut self, _payload: &mut [u8], _lba: u64, _n: u32, complete: IoCompletion) {
            complete(0);
        }
        fn readv(&mut self, _iovs: &[IoVec], _lba: u64, _n: u32, complete: IoCompletion) {
            complete(0);
        }
        fn write(&mut self, _payload: &[u8], _lba: u64, _n: u32, complete: IoCompletion) {
            complete(0);
        }
        fn writev(&mut self, _iovs: &[IoVec], _lba: u64, _n: u32, complete: IoCompletion) {
            complete(0);
        }
        fn flush(&mut self, complete: IoCompletion) {
            complete(0);
        }
        fn poll(&mut self) -> PollStatus {
            PollStatus::Idle
        }
    }

    // ------------------------------------------------------------------
    // Blob store
    // ------------------------------------------------------------------

    /// Provider handing out [`MemStore`] instances.
    pub struct MemProvider {
        pub cluster_blocks: u32,
        pub fail: FailPlan,
        pub last_store: RefCell<Option<Rc<MemStore>>>,
    }

    impl MemProvider {
        pub fn new(cluster_blocks: u32) -> Rc<Self> {
            Rc::new(Self {
                cluster_blocks,
                fail: Rc::new(RefCell::new(HashMap::new())),
                last_store: RefCell::new(None),
            })
        }

        /// Arms a one-shot failure for the named operation.
        pub fn fail_next(&self, op: &'static str, code: i32) {
            self.fail.borrow_mut().insert(op, code);
        }

        fn build(&self, dev: Box<dyn BsDev>, opts: BsOpts) -> Rc<MemStore> {
            let store = Rc::new_cyclic(|this| MemStore {
                this: this.clone(),
                blocklen: dev.blocklen(),
                blockcnt: dev.blockcnt(),
                cluster_blocks: self.cluster_blocks,
                _base: dev,
                esnap_factory: opts.esnap_dev_factory,
                esnap_channel: RefCell::new(None),
                next_id: Cell::new(1),
                blobs: RefCell::new(HashMap::new()),
                copy_job: RefCell::new(None),
                fail: Rc::clone(&self.fail),
                unloaded: Cell::new(false),
                channels_alive: Cell::new(0),
            });
            *self.last_store.borrow_mut() = Some(Rc::clone(&store));
            store
        }
    }

    impl BlobStoreProvider for MemProvider {
        fn init(&self, dev: Box<dyn BsDev>, opts: BsOpts, complete: BsStoreComplete) {
            if let Some(code) = self.fail.borrow_mut().remove("init") {
                complete(code, None);
                return;
            }
            let store = self.build(dev, opts);
            complete(0, Some(store as Rc<dyn BlobStore>));
        }

        fn load(&self, dev: Box<dyn BsDev>, opts: BsOpts, complete: BsStoreComplete) {
            if let Some(code) = self.fail.borrow_mut().remove("load") {
                complete(code, None);
                return;
            }
            let store = self.build(dev, opts);
            // A previously formatted store holds exactly one live blob.
            let blob = store.new_blob(BlobOpts {
                thin_provision: true,
                num_clusters: store.total_data_clusters(),
                esnap_id: None,
            });
            store.blobs.borrow_mut().insert(blob.blob_id, blob);
            complete(0, Some(store as Rc<dyn BlobStore>));
        }
    }

    /// One in-flight shallow copy, advanced by [`MemStore::pump_copy`].
    struct CopyJob {
        clusters: Vec<(u64, Vec<u8>)>,
        next: usize,
        status: i32,
        channel: Box<dyn BsDevChannel>,
        _dst: Rc<dyn BsDev>,
        progress: Box<dyn FnMut(u64)>,
        complete: Option<BsComplete>,
    }

    /// In-memory blob store.
    pub struct MemStore {
        this: Weak<MemStore>,
        blocklen: u32,
        blockcnt: u64,
        cluster_blocks: u32,
        _base: Box<dyn BsDev>,
        esnap_factory: Option<EsnapDevFactory>,
        esnap_channel: RefCell<Option<Box<dyn BsDevChannel>>>,
        next_id: Cell<BlobId>,
        blobs: RefCell<HashMap<BlobId, Rc<MemBlob>>>,
        copy_job: RefCell<Option<CopyJob>>,
        fail: FailPlan,
        pub unloaded: Cell<bool>,
        pub channels_alive: Cell<u32>,
    }

    impl MemStore {
        fn take_fail(&self, op: &'static str) -> Option<i32> {
            self.fail.borrow_mut().remove(op)
        }

        fn cluster_bytes(&self) -> usize {
            (self.cluster_blocks as usize) * (self.blocklen as usize)
        }

        fn new_blob(&self, opts: BlobOpts) -> Rc<MemBlob> {
            let id = self.next_id.get();
            self.next_id.set(id + 1);
            Rc::new(MemBlob {
                blob_id: id,
                num_clusters: opts.num_clusters,
                esnap_id: opts.esnap_id,
                read_only: Cell::new(false),
                open: Cell::new(false),
                data: RefCell::new(HashMap::new()),
                store: self.this.clone(),
            })
        }

        fn get_blob(&self, id: BlobId) -> Option<Rc<MemBlob>> {
            self.blobs.borrow().get(&id).cloned()
        }

        /// Fills cluster contents for a blob test fixture.
        pub fn seed_clusters(&self, blob: BlobId, count: u64) {
            let blob = self.get_blob(blob).expect("seeding unknown blob");
            let bytes = self.cluster_bytes();
            let mut data = blob.data.borrow_mut();
            for cluster in 0..count {
                data.insert(cluster, vec![cluster_fill(cluster); bytes]);
            }
        }

        /// Reads one full cluster through the external-snapshot device,
        /// materializing it on first use.
        fn esnap_read_cluster(&self, cluster: u64) -> Vec<u8> {
            let bytes = self.cluster_bytes();
            let mut buf = vec![0u8; bytes];
            let factory = match &self.esnap_factory {
                Some(f) => Rc::clone(f),
                None => return buf,
            };
            {
                let mut slot = self.esnap_channel.borrow_mut();
                if slot.is_none() {
                    let dev = factory(self, crate::volume::ESNAP_ID)
                        .expect("esnap device factory failed");
                    *slot = Some(dev.create_channel().expect("esnap channel failed"));
                }
            }
            let lba = cluster * u64::from(self.cluster_blocks);
            let done = Rc::new(Cell::new(None));
            let done2 = Rc::clone(&done);
            let mut slot = self.esnap_channel.borrow_mut();
            let channel = slot.as_mut().unwrap();
            channel.read(
                &mut buf,
                lba,
                self.cluster_blocks,
                Box::new(move |s| done2.set(Some(s))),
            );
            while done.get().is_none() {
                channel.poll();
                std::thread::yield_now();
            }
            assert_eq!(done.get(), Some(0), "esnap read failed");
            buf
        }

        /// Copies one cluster of the pending shallow copy. Returns `true`
        /// while work remains.
        pub fn pump_copy(&self) -> bool {
            let mut finished = None;
            {
                let mut slot = self.copy_job.borrow_mut();
                let Some(job) = slot.as_mut() else {
                    return false;
                };
                if job.next < job.clusters.len() && job.status == 0 {
                    let (cluster, data) = job.clusters[job.next].clone();
                    let lba = cluster * u64::from(self.cluster_blocks);
                    let status = Rc::new(Cell::new(0));
                    let status2 = Rc::clone(&status);
                    job.channel.write(
                        &data,
                        lba,
                        self.cluster_blocks,
                        Box::new(move |s| status2.set(s)),
                    );
                    job.next += 1;
                    if status.get() == 0 {
                        (job.progress)(job.next as u64);
                    } else {
                        job.status = status.get();
                    }
                }
                if job.next >= job.clusters.len() || job.status != 0 {
                    finished = slot.take();
                }
            }
            match finished {
                Some(job) => {
                    // Closing the writer channel persists the header.
                    drop(job.channel);
                    if let Some(complete) = job.complete {
                        complete(job.status);
                    }
                    false
                }
                None => true,
            }
        }

        /// Drives the pending shallow copy to completion.
        pub fn run_copy(&self) {
            while self.pump_copy() {}
        }
    }

    impl BlobStore for MemStore {
        fn io_unit_size(&self) -> u32 {
            self.blocklen
        }

        fn cluster_size(&self) -> u64 {
            u64::from(self.blocklen) * u64::from(self.cluster_blocks)
        }

        fn total_data_clusters(&self) -> u64 {
            self.blockcnt / u64::from(self.cluster_blocks)
        }

        fn alloc_channel(&self) -> Result<Box<dyn BlobStoreChannel>> {
            if let Some(code) = self.take_fail("alloc_channel") {
                return Err(Error::blob_store("alloc_channel", code));
            }
            self.channels_alive.set(self.channels_alive.get() + 1);
            Ok(Box::new(MemStoreChannel {
                store: self.this.clone(),
            }))
        }

        fn create_blob(&self, opts: BlobOpts, complete: BsIdComplete) {
            if let Some(code) = self.take_fail("create_blob") {
                complete(code, 0);
                return;
            }
            let blob = self.new_blob(opts);
            let id = blob.blob_id;
            self.blobs.borrow_mut().insert(id, blob);
            complete(0, id);
        }

        fn create_snapshot(&self, blob: BlobId, complete: BsIdComplete) {
            if let Some(code) = self.take_fail("create_snapshot") {
                complete(code, 0);
                return;
            }
            let Some(live) = self.get_blob(blob) else {
                complete(-libc::ENOENT, 0);
                return;
            };
            let snapshot = self.new_blob(BlobOpts {
                thin_provision: true,
                num_clusters: live.num_clusters,
                esnap_id: live.esnap_id.clone(),
            });
            // The snapshot takes over the clusters written so far; the
            // live blob keeps accumulating new writes on top of it.
            *snapshot.data.borrow_mut() = live.data.take();
            snapshot.read_only.set(true);
            let id = snapshot.blob_id;
            self.blobs.borrow_mut().insert(id, snapshot);
            complete(0, id);
        }

        fn create_clone(&self, snapshot: BlobId, complete: BsIdComplete) {
            if let Some(code) = self.take_fail("create_clone") {
                complete(code, 0);
                return;
            }
            let Some(parent) = self.get_blob(snapshot) else {
                complete(-libc::ENOENT, 0);
                return;
            };
            let clone = self.new_blob(BlobOpts {
                thin_provision: true,
                num_clusters: parent.num_clusters,
                esnap_id: parent.esnap_id.clone(),
            });
            let id = clone.blob_id;
            self.blobs.borrow_mut().insert(id, clone);
            complete(0, id);
        }

        fn open_blob(&self, id: BlobId, complete: BsOpenComplete) {
            if let Some(code) = self.take_fail("open_blob") {
                complete(code, None);
                return;
            }
            match self.get_blob(id) {
                Some(blob) => {
                    blob.open.set(true);
                    complete(0, Some(blob as Rc<dyn Blob>));
                }
                None => complete(-libc::ENOENT, None),
            }
        }

        fn open_first_blob(&self, complete: BsOpenComplete) {
            if let Some(code) = self.take_fail("open_first_blob") {
                complete(code, None);
                return;
            }
            let first = {
                let blobs = self.blobs.borrow();
                blobs.keys().min().copied().and_then(|id| blobs.get(&id).cloned())
            };
            match first {
                Some(blob) => {
                    blob.open.set(true);
                    complete(0, Some(blob as Rc<dyn Blob>));
                }
                None => complete(-libc::ENOENT, None),
            }
        }

        fn decouple_parent(&self, blob: BlobId, complete: BsComplete) {
            if let Some(code) = self.take_fail("decouple_parent") {
                complete(code);
                return;
            }
            let Some(clone) = self.get_blob(blob) else {
                complete(-libc::ENOENT);
                return;
            };
            // The most recent snapshot is the clone's parent; copy its
            // clusters in so the clone owns them outright.
            let parent = {
                let blobs = self.blobs.borrow();
                blobs
                    .values()
                    .filter(|b| b.read_only.get() && b.blob_id != blob)
                    .max_by_key(|b| b.blob_id)
                    .cloned()
            };
            if let Some(parent) = parent {
                let mut data = clone.data.borrow_mut();
                for (cluster, payload) in parent.data.borrow().iter() {
                    data.entry(*cluster).or_insert_with(|| payload.clone());
                }
            }
            complete(0);
        }

        fn shallow_copy(
            &self,
            blob: BlobId,
            dst: Rc<dyn BsDev>,
            progress: Box<dyn FnMut(u64)>,
            complete: BsComplete,
        ) -> Result<()> {
            if let Some(code) = self.take_fail("shallow_copy") {
                return Err(Error::blob_store("shallow_copy", code));
            }
            let source = self
                .get_blob(blob)
                .ok_or(Error::blob_store("shallow_copy", -libc::ENOENT))?;
            let mut clusters: Vec<(u64, Vec<u8>)> = source
                .data
                .borrow()
                .iter()
                .map(|(c, d)| (*c, d.clone()))
                .collect();
            clusters.sort_by_key(|(c, _)| *c);
            let channel = dst.create_channel()?;
            *self.copy_job.borrow_mut() = Some(CopyJob {
                clusters,
                next: 0,
                status: 0,
                channel,
                _dst: dst,
                progress,
                complete: Some(complete),
            });
            Ok(())
        }

        fn unload(&self, complete: BsComplete) {
            self.unloaded.set(true);
            complete(0);
        }
    }

    struct MemStoreChannel {
        store: Weak<MemStore>,
    }

    impl Drop for MemStoreChannel {
        fn drop(&mut self) {
            if let Some(store) = self.store.upgrade() {
                store.channels_alive.set(store.channels_alive.get() - 1);
            }
        }
    }

    impl BlobStoreChannel for MemStoreChannel {
        fn poll(&mut self) -> PollStatus {
            PollStatus::Idle
        }
    }

    /// In-memory blob: clusters written since the last snapshot point.
    pub struct MemBlob {
        pub blob_id: BlobId,
        num_clusters: u64,
        esnap_id: Option<Vec<u8>>,
        pub read_only: Cell<bool>,
        pub open: Cell<bool>,
        data: RefCell<HashMap<u64, Vec<u8>>>,
        store: Weak<MemStore>,
    }

    impl MemBlob {
        fn store(&self) -> Rc<MemStore> {
            self.store.upgrade().expect("store dropped while blob open")
        }

        fn geometry(&self) -> Geometry {
            let store = self.store();
            Geometry::new(store.blocklen, store.cluster_blocks).expect("store geometry")
        }
    }

    impl Blob for MemBlob {
        fn id(&self) -> BlobId {
            self.blob_id
        }

        fn num_io_units(&self) -> u64 {
            let store = self.store();
            self.num_clusters * u64::from(store.cluster_blocks)
        }

        fn set_read_only(&self) {
            self.read_only.set(true);
        }

        fn sync_metadata(&self, complete: BsComplete) {
            let store = self.store();
            if let Some(code) = store.take_fail("sync_metadata") {
                complete(code);
                return;
            }
            complete(0);
        }

        fn close(&self, complete: BsComplete) {
            self.open.set(false);
            complete(0);
        }

        fn readv(
            &self,
            _channel: &mut dyn BlobStoreChannel,
            iovs: &[IoVec],
            offset_blocks: u64,
            _num_blocks: u64,
            complete: BsComplete,
        ) {
            let store = self.store();
            let geometry = self.geometry();
            let cluster = geometry.cluster_of(offset_blocks);
            let start = geometry.byte_in_cluster(offset_blocks) as usize;
            let payload = match self.data.borrow().get(&cluster) {
                Some(data) => data.clone(),
                // Unwritten cluster: the data lives below, in the
                // external snapshot.
                None => store.esnap_read_cluster(cluster),
            };
            let mut at = start;
            for iov in iovs {
                // SAFETY: test fixture owns the buffers for the call.
                let buf = unsafe { iov.as_mut_slice() };
                buf.copy_from_slice(&payload[at..at + buf.len()]);
                at += buf.len();
            }
            complete(0);
        }

        fn writev(
            &self,
            _channel: &mut dyn BlobStoreChannel,
            iovs: &[IoVec],
            offset_blocks: u64,
            _num_blocks: u64,
            complete: BsComplete,
        ) {
            let store = self.store();
            if self.read_only.get() {
                complete(-libc::EPERM);
                return;
            }
            let geometry = self.geometry();
            let cluster = geometry.cluster_of(offset_blocks);
            let start = geometry.byte_in_cluster(offset_blocks) as usize;
            // Copy-on-write: a freshly allocated cluster is seeded from
            // the external snapshot before the write lands.
            let seed = {
                let data = self.data.borrow();
                if data.contains_key(&cluster) {
                    None
                } else {
                    Some(store.esnap_read_cluster(cluster))
                }
            };
            let mut data = self.data.borrow_mut();
            let payload = data
                .entry(cluster)
                .or_insert_with(|| seed.unwrap_or_else(|| vec![0; store.cluster_bytes()]));
            let mut at = start;
            for iov in iovs {
                // SAFETY: test fixture owns the buffers for the call.
                let buf = unsafe { iov.as_slice() };
                payload[at..at + buf.len()].copy_from_slice(buf);
                at += buf.len();
            }
            drop(data);
            complete(0);
        }
    }

    /// Deterministic non-zero fill byte for a seeded cluster.
    pub fn cluster_fill(cluster: u64) -> u8 {
        (cluster % 251) as u8 + 1
    }
}
