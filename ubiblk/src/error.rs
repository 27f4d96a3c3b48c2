//! Error types for ubiblk operations.

use nix::errno::Errno;

/// Alias for `Result<T, ubiblk::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by volume and backing-device operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The blob store returned a negative error code.
    #[error("{op}: blob store error code {code}")]
    BlobStore {
        /// The blob-store operation that failed.
        op: &'static str,
        /// The negated errno it reported.
        code: i32,
    },

    /// No volume or device is registered under the given name.
    #[error("{0} not found")]
    NotFound(String),

    /// A volume with this name is already registered.
    #[error("volume '{0}' already exists")]
    AlreadyExists(String),

    /// A snapshot workflow is already running on this volume.
    #[error("snapshot already in progress")]
    Busy,

    /// A creation parameter was missing or malformed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The volume geometry cannot be represented by the cluster map.
    #[error("volume needs {needed} clusters, cluster map holds {max}")]
    TooManyClusters {
        /// Clusters the volume would need.
        needed: u64,
        /// Entries in the fixed-size map.
        max: u64,
    },

    /// An I/O error from file, ring, or channel setup.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps a negative blob-store completion code.
    pub const fn blob_store(op: &'static str, code: i32) -> Self {
        Self::BlobStore { op, code }
    }

    /// Completion status of an unsupported backing-device hook.
    pub const fn not_supported() -> i32 {
        -(Errno::EOPNOTSUPP as i32)
    }

    /// The negated errno surfaced through the control API for this error.
    pub fn errno(&self) -> i32 {
        match self {
            Self::BlobStore { code, .. } => *code,
            Self::NotFound(_) => -(Errno::ENOENT as i32),
            Self::AlreadyExists(_) => -(Errno::EEXIST as i32),
            Self::Busy => -(Errno::EBUSY as i32),
            Self::InvalidConfig(_) | Self::TooManyClusters { .. } => -(Errno::EINVAL as i32),
            Self::Io(e) => e
                .raw_os_error()
                .map_or(-(Errno::EIO as i32), |code| -code),
        }
    }
}
