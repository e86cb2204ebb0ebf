//! # Checkpointing
//!
//! The durability discipline of the defragmentation engine:
//!
//! - `lock`: the re-entrant checkpoint read lock mediating between
//!   workers and the flusher
//! - `controller`: the checkpointer thread, forced checkpoints, and
//!   their futures
//!
//! Every page allocation, meta-page mutation, and free-list insertion
//! happens under the read lock. Holding it blocks a flush from starting,
//! so long spans of work must release and re-acquire it on the
//! `CHECKPOINT_LOCK_HOLD_LIMIT` cadence; the copy loops check wall clock
//! between tree entries rather than running a timer.

mod controller;
mod lock;

pub use controller::{CheckpointController, CheckpointFuture, CompoundFuture};
pub use lock::{CheckpointLock, CpReadGuard};

use std::time::Duration;

/// How long a worker may hold the checkpoint read lock before yielding.
pub const CHECKPOINT_LOCK_HOLD_LIMIT: Duration = Duration::from_millis(150);
