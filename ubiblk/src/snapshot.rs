//! The snapshot workflow: convert the live blob into a persistent delta
//! file while the volume stays online.
//!
//! The chain runs: snapshot the live blob, allocate a per-operation
//! channel, clone the snapshot, open the clone and freeze it, decouple
//! it from its parent, then hand a write-direction delta device to the
//! store's shallow copy. The caller's completion fires exactly once: on
//! the first failure, or as soon as the copy is submitted; the long
//! copy tail publishes progress through the volume's status record,
//! which flips `in_progress` off only after the final result is stored.
//!
//! A failure after the snapshot was taken leaves the orphaned snapshot
//! in the store; the operator removes it out of band.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use nix::errno::Errno;
use tracing::{error, info};

use crate::blobstore::{Blob, BlobId, BlobStoreChannel};
use crate::bs_dev::BsDev;
use crate::delta_dev::{DeltaBsDev, DeltaDirection};
use crate::volume::{OpComplete, Volume};

/// State carried across the workflow's suspension points.
struct SnapshotCtx {
    volume: Rc<Volume>,
    path: PathBuf,
    channel: Option<Box<dyn BlobStoreChannel>>,
    clone_id: BlobId,
    delta: Option<Rc<dyn BsDev>>,
    /// `true` once this workflow flipped the volume's `in_progress`.
    guard_set: bool,
    complete: Option<OpComplete>,
}

/// Starts the workflow. Rejected with `-EBUSY`, without touching any
/// state, while another workflow owns the volume.
pub(crate) fn start(volume: Rc<Volume>, path: PathBuf, complete: OpComplete) {
    if volume.record().borrow().in_progress {
        complete(-(Errno::EBUSY as i32));
        return;
    }
    let store = Rc::clone(volume.store());
    let live = volume.blob_id().get();
    let ctx = Rc::new(RefCell::new(SnapshotCtx {
        volume,
        path,
        channel: None,
        clone_id: 0,
        delta: None,
        guard_set: false,
        complete: Some(complete),
    }));
    let ctx2 = Rc::clone(&ctx);
    store.create_snapshot(
        live,
        Box::new(move |status, id| on_snapshot_created(&ctx2, status, id)),
    );
}

fn on_snapshot_created(ctx: &Rc<RefCell<SnapshotCtx>>, status: i32, snapshot_id: BlobId) {
    if status != 0 {
        fail(ctx, "snapshot", status);
        return;
    }
    let (volume, store) = {
        let c = ctx.borrow();
        (Rc::clone(&c.volume), Rc::clone(c.volume.store()))
    };
    // Latch the copy target size first; the guard flips last so a status
    // reader never sees `in_progress` without totals.
    {
        let mut record = volume.record().borrow_mut();
        record.total_clusters = store.total_data_clusters();
        record.copied_clusters = 0;
        record.result = 0;
        record.in_progress = true;
    }
    ctx.borrow_mut().guard_set = true;

    let channel = match store.alloc_channel() {
        Ok(channel) => channel,
        Err(e) => {
            fail(ctx, "channel allocation", e.errno());
            return;
        }
    };
    ctx.borrow_mut().channel = Some(channel);

    let ctx2 = Rc::clone(ctx);
    store.create_clone(
        snapshot_id,
        Box::new(move |st, clone_id| on_clone_created(&ctx2, st, clone_id)),
    );
}

fn on_clone_created(ctx: &Rc<RefCell<SnapshotCtx>>, status: i32, clone_id: BlobId) {
    if status != 0 {
        fail(ctx, "clone", status);
        return;
    }
    let store = {
        let mut c = ctx.borrow_mut();
        c.clone_id = clone_id;
        Rc::clone(c.volume.store())
    };
    let ctx2 = Rc::clone(ctx);
    store.open_blob(
        clone_id,
        Box::new(move |st, blob| on_clone_opened(&ctx2, st, blob)),
    );
}

fn on_clone_opened(ctx: &Rc<RefCell<SnapshotCtx>>, status: i32, blob: Option<Rc<dyn Blob>>) {
    let Some(blob) = blob.filter(|_| status == 0) else {
        fail(ctx, "clone open", status);
        return;
    };
    // The clone is a frozen source for the copy; nothing may write it.
    blob.set_read_only();
    let ctx2 = Rc::clone(ctx);
    blob.close(Box::new(move |st| on_clone_closed(&ctx2, st)));
}

fn on_clone_closed(ctx: &Rc<RefCell<SnapshotCtx>>, status: i32) {
    if status != 0 {
        fail(ctx, "clone close", status);
        return;
    }
    let (store, clone_id) = {
        let c = ctx.borrow();
        (Rc::clone(c.volume.store()), c.clone_id)
    };
    let ctx2 = Rc::clone(ctx);
    store.decouple_parent(clone_id, Box::new(move |st| on_decoupled(&ctx2, st)));
}

fn on_decoupled(ctx: &Rc<RefCell<SnapshotCtx>>, status: i32) {
    if status != 0 {
        fail(ctx, "decouple", status);
        return;
    }
    let (volume, store, path, clone_id) = {
        let c = ctx.borrow();
        (
            Rc::clone(&c.volume),
            Rc::clone(c.volume.store()),
            c.path.clone(),
            c.clone_id,
        )
    };

    let blocklen = volume.blocklen();
    let cluster_blocks = match u32::try_from(store.cluster_size() / u64::from(blocklen)) {
        Ok(blocks) => blocks,
        Err(_) => {
            fail(ctx, "delta geometry", -(Errno::EINVAL as i32));
            return;
        }
    };
    let delta = match DeltaBsDev::new(
        &path,
        volume.blockcnt(),
        blocklen,
        cluster_blocks,
        DeltaDirection::Write,
    ) {
        Ok(dev) => Rc::new(dev) as Rc<dyn BsDev>,
        Err(e) => {
            fail(ctx, "delta device", e.errno());
            return;
        }
    };
    ctx.borrow_mut().delta = Some(Rc::clone(&delta));

    let progress_volume = Rc::clone(&volume);
    let progress = Box::new(move |copied: u64| {
        progress_volume.record().borrow_mut().copied_clusters = copied;
    });
    let ctx2 = Rc::clone(ctx);
    let submitted = store.shallow_copy(
        clone_id,
        delta,
        progress,
        Box::new(move |st| on_copy_done(&ctx2, st)),
    );
    match submitted {
        Err(e) => fail(ctx, "copy submission", e.errno()),
        Ok(()) => {
            info!(
                "snapshot copy of '{}' to {} submitted",
                volume.name(),
                path.display(),
            );
            // The caller unblocks here; the copy tail is observed
            // through the status query.
            if let Some(complete) = ctx.borrow_mut().complete.take() {
                complete(0);
            }
        }
    }
}

fn on_copy_done(ctx: &Rc<RefCell<SnapshotCtx>>, status: i32) {
    let volume = {
        let mut c = ctx.borrow_mut();
        c.delta.take();
        c.channel.take();
        Rc::clone(&c.volume)
    };
    {
        let mut record = volume.record().borrow_mut();
        record.result = status;
        record.in_progress = false;
    }
    if status == 0 {
        info!("snapshot copy of '{}' complete", volume.name());
    } else {
        error!("snapshot copy of '{}' failed: code {status}", volume.name());
    }
}

/// Aborts the workflow: releases whatever the failed stage had
/// allocated, clears the guard if it was set, and fires the caller's
/// completion exactly once.
fn fail(ctx: &Rc<RefCell<SnapshotCtx>>, stage: &'static str, status: i32) {
    let (volume, guard_set, complete) = {
        let mut c = ctx.borrow_mut();
        c.delta.take();
        c.channel.take();
        (Rc::clone(&c.volume), c.guard_set, c.complete.take())
    };
    error!(
        "snapshot of '{}' failed at {stage}: code {status}",
        volume.name(),
    );
    if guard_set {
        let mut record = volume.record().borrow_mut();
        record.result = status;
        record.in_progress = false;
    }
    if let Some(complete) = complete {
        complete(status);
    }
}
