//! The on-disk cluster map indexing an overlay file.
//!
//! An overlay (delta) file starts with a fixed-size header: a densely
//! packed array of [`MAX_CLUSTERS`] little-endian `u64` values. Entry *c*
//! is the absolute byte offset of cluster *c*'s payload within the same
//! file, or `0` if the cluster is unmodified and still lives in the base
//! image. Payloads follow the header in the order they were written.
//!
//! There is no magic number, checksum, or version field; overlay files are
//! identified by out-of-band path.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

/// Number of entries in every cluster map.
///
/// Volumes with more data clusters than this are outside defined
/// behavior; creation rejects them up front.
pub const MAX_CLUSTERS: usize = 8 * 1024 * 1024;

/// Size of the serialized header in bytes.
pub const HEADER_BYTES: u64 = (MAX_CLUSTERS as u64) * 8;

/// Transfer unit for header serialization (1 MiB divides the header
/// evenly).
const CHUNK_BYTES: usize = 1 << 20;

/// In-memory cluster map, mirroring the overlay header.
pub struct ClusterMap {
    entries: Box<[u64]>,
}

impl ClusterMap {
    /// A map with every cluster unmodified.
    #[must_use]
    pub fn zeroed() -> Self {
        Self {
            entries: vec![0u64; MAX_CLUSTERS].into_boxed_slice(),
        }
    }

    /// Overlay byte offset of cluster `cluster`, or `0` if it lives in the
    /// base image. Clusters beyond the map read as unmodified.
    pub fn get(&self, cluster: u64) -> u64 {
        usize::try_from(cluster)
            .ok()
            .and_then(|c| self.entries.get(c))
            .copied()
            .unwrap_or(0)
    }

    /// Records the overlay byte offset of cluster `cluster`.
    pub fn set(&mut self, cluster: u64, offset: u64) {
        if let Some(entry) = usize::try_from(cluster)
            .ok()
            .and_then(|c| self.entries.get_mut(c))
        {
            *entry = offset;
        }
    }

    /// `true` if no cluster has an overlay mapping.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|&e| e == 0)
    }

    /// Reads a full header from `r`.
    pub fn read_from(r: &mut impl Read) -> io::Result<Self> {
        let mut entries = vec![0u64; MAX_CLUSTERS];
        let mut buf = vec![0u8; CHUNK_BYTES];
        let mut idx = 0;
        while idx < MAX_CLUSTERS {
            r.read_exact(&mut buf)?;
            for bytes in buf.chunks_exact(8) {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                entries[idx] = u64::from_le_bytes(raw);
                idx += 1;
            }
        }
        Ok(Self {
            entries: entries.into_boxed_slice(),
        })
    }

    /// Writes the full header to `w`.
    pub fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        let mut buf = vec![0u8; CHUNK_BYTES];
        for entries in self.entries.chunks(CHUNK_BYTES / 8) {
            for (bytes, entry) in buf.chunks_exact_mut(8).zip(entries) {
                bytes.copy_from_slice(&entry.to_le_bytes());
            }
            w.write_all(&buf)?;
        }
        Ok(())
    }

    /// Loads the header from the start of the file at `path`.
    pub fn load(path: &Path) -> io::Result<Self> {
        let mut file = File::open(path)?;
        Self::read_from(&mut file)
    }
}

impl std::fmt::Debug for ClusterMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mapped = self.entries.iter().filter(|&&e| e != 0).count();
        f.debug_struct("ClusterMap")
            .field("entries", &MAX_CLUSTERS)
            .field("mapped", &mapped)
            .finish()
    }
}
