//! Control-API types for ubiblk volume management.
//!
//! The four public operations (`volume_create`, `volume_delete`,
//! `volume_snapshot`, `volume_snapshot_status`) are addressed by JSON-RPC
//! style requests. This crate defines their parameter and result payloads
//! as [`serde`] types; the plane that frames requests and routes them by
//! method name lives outside this workspace.

mod message;

pub use message::{
    ConfigEntry, ConfigParams, CreateVolume, DeleteVolume, RpcError, Snapshot, SnapshotStatus,
    SnapshotStatusReply, CONFIG_METHOD,
};
