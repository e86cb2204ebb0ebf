//! # Defragmentation Error Kinds
//!
//! Typed error classification for the defragmentation engine. Most of the
//! crate propagates `eyre::Result`; the variants here are attached to the
//! report chain wherever the *kind* of failure matters to a caller (skip
//! versus retry versus abort), and can be recovered with
//! `Report::downcast_ref::<DefragmentationError>()`.
//!
//! ## Classification
//!
//! - `PageIo` — read/write/sync/rename failure. Fatal for the current
//!   cache group; partial `.tmp` files are left on disk for the next run.
//! - `UnsupportedMetaVersion` — the old partition meta page carries a
//!   version this engine does not know how to copy. Nothing is renamed.
//! - `IndexDefragmentationFailed` — the indexing subsystem failed while
//!   rebuilding the index partition. The completion marker is not
//!   written, so the group is retried on the next run.
//! - `CheckpointFailed` — a forced checkpoint resolved with an error, or
//!   the checkpointer was stopped. Fatal for the run.
//! - `EncryptedGroupCounters` — the old meta carries non-zero encrypted
//!   page counters for an encrypted group. Copying would silently drop
//!   them, so the engine refuses.
//!
//! "Already defragmented" is deliberately *not* an error: the skip checks
//! in `defrag::file_utils` return `bool`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DefragmentationError {
    #[error("page store I/O failure: {0}")]
    PageIo(String),

    #[error(
        "partition meta version {version} is not supported by the defragmentation \
         algorithm, supported versions are 1-3"
    )]
    UnsupportedMetaVersion { version: u8 },

    #[error("index defragmentation failed: {0}")]
    IndexDefragmentationFailed(String),

    #[error("checkpoint failed: {0}")]
    CheckpointFailed(String),

    #[error(
        "encrypted group carries {count} encrypted pages (reindex position {index}); \
         defragmentation would drop the encryption progress counters"
    )]
    EncryptedGroupCounters { count: u32, index: u32 },
}
