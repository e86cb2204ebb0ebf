//! # Checkpoint Read Lock
//!
//! The cooperative latch between defragmentation workers and the
//! checkpointer. Workers hold the read side while allocating pages,
//! mutating meta pages, or inserting into free lists; the checkpointer
//! takes the exclusive side for the duration of a flush.
//!
//! ## Contract
//!
//! - `read_lock()` is re-entrant per thread: a thread already holding the
//!   lock acquires again without blocking, even while a flush is waiting.
//!   This is what makes nested store-creation-under-lock safe.
//! - A pending flush blocks *new* reader threads, so the flusher cannot
//!   be starved; it then waits for the existing readers to drain.
//! - Acquisition is infallible; there is no poisoning and no timeout.
//!   Long-running holders must release and re-acquire on the yield
//!   cadence (see `CHECKPOINT_LOCK_HOLD_LIMIT`) to let flushes through.

use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct LockState {
    /// Re-entrancy depth per reader thread.
    readers: HashMap<ThreadId, usize>,
    flush_waiting: bool,
    flushing: bool,
}

#[derive(Debug, Default)]
pub struct CheckpointLock {
    state: Mutex<LockState>,
    readers_gone: Condvar,
    flush_done: Condvar,
}

impl CheckpointLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read_lock(&self) -> CpReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        loop {
            let already_held = state.readers.get(&me).copied().unwrap_or(0) > 0;
            if already_held || (!state.flushing && !state.flush_waiting) {
                break;
            }
            self.flush_done.wait(&mut state);
        }

        *state.readers.entry(me).or_insert(0) += 1;
        CpReadGuard { lock: self }
    }

    pub fn held_by_current_thread(&self) -> bool {
        let me = thread::current().id();
        self.state.lock().readers.get(&me).copied().unwrap_or(0) > 0
    }

    fn unlock_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();

        let depth = state
            .readers
            .get_mut(&me)
            .expect("checkpoint read lock released by a thread that does not hold it");
        *depth -= 1;
        if *depth == 0 {
            state.readers.remove(&me);
            if state.readers.is_empty() {
                self.readers_gone.notify_all();
            }
        }
    }

    /// Blocks new readers and waits until current readers drain. Called
    /// only by the checkpointer thread.
    pub(crate) fn begin_flush(&self) {
        let mut state = self.state.lock();
        state.flush_waiting = true;
        while !state.readers.is_empty() {
            self.readers_gone.wait(&mut state);
        }
        state.flush_waiting = false;
        state.flushing = true;
    }

    pub(crate) fn end_flush(&self) {
        let mut state = self.state.lock();
        state.flushing = false;
        self.flush_done.notify_all();
    }
}

pub struct CpReadGuard<'a> {
    lock: &'a CheckpointLock,
}

impl Drop for CpReadGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock_read();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn read_lock_is_reentrant() {
        let lock = CheckpointLock::new();

        let outer = lock.read_lock();
        let inner = lock.read_lock();
        assert!(lock.held_by_current_thread());

        drop(inner);
        assert!(lock.held_by_current_thread());
        drop(outer);
        assert!(!lock.held_by_current_thread());
    }

    #[test]
    fn flush_waits_for_readers_to_drain() {
        let lock = Arc::new(CheckpointLock::new());
        let guard = lock.read_lock();

        let flusher = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.begin_flush();
                lock.end_flush();
            })
        };

        // The flusher cannot finish while the guard is held.
        std::thread::sleep(Duration::from_millis(50));
        assert!(!flusher.is_finished());

        drop(guard);
        flusher.join().unwrap();
    }

    #[test]
    fn new_readers_wait_for_flush_to_finish() {
        let lock = Arc::new(CheckpointLock::new());

        lock.begin_flush();

        let reader = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                let _guard = lock.read_lock();
            })
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());

        lock.end_flush();
        reader.join().unwrap();
    }
}
