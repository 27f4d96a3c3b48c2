//! Parameter and result payloads for the volume control API.
//!
//! Field names and defaults match what the RPC plane puts on the wire:
//! unknown fields are rejected, optional fields fall back to the
//! documented defaults, and two long-deprecated tuning knobs are still
//! accepted (and ignored) so old orchestrator configs keep loading.

use serde::{Deserialize, Serialize};

/// Method name emitted in persisted-configuration dumps.
pub const CONFIG_METHOD: &str = "bdev_ubi_create";

/// Parameters of `volume_create`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct CreateVolume {
    /// Volume name, unique process-wide.
    pub name: String,
    /// Path of the read-only base image file.
    pub image_path: String,
    /// Name of the base block device the blob store is placed on.
    pub base_bdev: String,
    /// Format the blob store on the base device (default: `true`).
    /// When `false` an existing store is loaded instead.
    #[serde(default = "default_true")]
    pub format_bdev: bool,
    /// Degrade FLUSH to a no-op (default: `false`).
    #[serde(default)]
    pub no_sync: bool,
    /// Open image and overlay files with direct I/O (default: `true`).
    #[serde(default = "default_true")]
    pub directio: bool,
    /// Path of an overlay file holding modified clusters, if any.
    #[serde(default)]
    pub snapshot_path: Option<String>,
    /// Deprecated, ignored.
    #[serde(default)]
    pub stripe_size_kb: Option<u32>,
    /// Deprecated, ignored.
    #[serde(default)]
    pub copy_on_read: Option<bool>,
}

impl CreateVolume {
    /// Creates a request with the given required fields and default options.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        image_path: impl Into<String>,
        base_bdev: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            image_path: image_path.into(),
            base_bdev: base_bdev.into(),
            format_bdev: true,
            no_sync: false,
            directio: true,
            snapshot_path: None,
            stripe_size_kb: None,
            copy_on_read: None,
        }
    }
}

const fn default_true() -> bool {
    true
}

/// Parameters of `volume_delete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct DeleteVolume {
    /// Name of the volume to unregister.
    pub name: String,
}

/// Parameters of `volume_snapshot`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct Snapshot {
    /// Name of the live volume to snapshot.
    pub name: String,
    /// Destination path of the delta file.
    pub path: String,
}

/// Parameters of `volume_snapshot_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct SnapshotStatus {
    /// Name of the volume to query.
    pub name: String,
}

/// Result of `volume_snapshot_status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SnapshotStatusReply {
    /// Volume name, echoed back.
    pub name: String,
    /// `true` while a snapshot workflow is running.
    pub in_progress: bool,
    /// `0`, or the negated errno of the last completed workflow.
    pub result: i32,
    /// Clusters copied into the delta file so far.
    pub copied_clusters: u64,
    /// Total data clusters of the store, latched when the workflow starts.
    pub total_clusters: u64,
}

impl SnapshotStatusReply {
    /// Builds a status reply for the named volume.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        in_progress: bool,
        result: i32,
        copied_clusters: u64,
        total_clusters: u64,
    ) -> Self {
        Self {
            name: name.into(),
            in_progress,
            result,
            copied_clusters,
            total_clusters,
        }
    }
}

/// Error payload returned for a failed operation: the numeric error code
/// together with its symbolic rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct RpcError {
    /// Negated errno.
    pub code: i32,
    /// Human-readable error description.
    pub message: String,
}

impl RpcError {
    /// Creates an error payload from a negated errno and message.
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code)
    }
}

impl std::error::Error for RpcError {}

/// One persisted-configuration entry, replayed as a `volume_create` on
/// reload. Only the name and image path survive a dump; every other field
/// is reconstructed from defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ConfigEntry {
    /// Always [`CONFIG_METHOD`].
    pub method: String,
    /// Replayed creation parameters.
    pub params: ConfigParams,
}

/// Parameters stored inside a [`ConfigEntry`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ConfigParams {
    /// Volume name.
    pub name: String,
    /// Base image path.
    pub image_path: String,
}

impl ConfigEntry {
    /// Builds the config entry for a volume.
    pub fn new(name: impl Into<String>, image_path: impl Into<String>) -> Self {
        Self {
            method: CONFIG_METHOD.to_owned(),
            params: ConfigParams {
                name: name.into(),
                image_path: image_path.into(),
            },
        }
    }
}
