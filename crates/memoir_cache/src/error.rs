//! Cache failures.

use std::path::PathBuf;

/// A failure to read or write the persistent store.
///
/// Lookups never surface these: a damaged entry is reported as a miss. The
/// engine sees them from `commit` and `save`, and stops caching for the
/// rest of the run.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Filesystem access failed.
    #[error("cannot access {}: {source}", path.display())]
    Io {
        /// File or directory being accessed.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },

    /// `manifest.json` exists but does not describe a cache.
    #[error("unreadable manifest {}: {reason}", path.display())]
    Manifest {
        /// Manifest path.
        path: PathBuf,
        /// Parser message.
        reason: String,
    },

    /// A result payload file is truncated or its header is malformed.
    #[error("damaged result payload {}: {reason}", path.display())]
    DamagedPayload {
        /// Payload path.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// A result payload's bytes do not hash to the checksum in its header.
    #[error("result payload {} fails its checksum: recorded {recorded}, computed {computed}", path.display())]
    PayloadChecksum {
        /// Payload path.
        path: PathBuf,
        /// Checksum stored in the header.
        recorded: String,
        /// Checksum of the bytes on disk.
        computed: String,
    },

    /// A result payload was written by an incompatible store layout.
    #[error("result payload {} has format {found}, this build reads {supported}", path.display())]
    PayloadFormat {
        /// Payload path.
        path: PathBuf,
        /// Format version in the header.
        found: u32,
        /// Format version this build writes.
        supported: u32,
    },

    /// Cache metadata could not be encoded.
    #[error("cannot encode {what}: {reason}")]
    Encode {
        /// What was being encoded.
        what: &'static str,
        /// Encoder message.
        reason: String,
    },
}
