//! # Checkpoint Controller
//!
//! Drives flush cycles for a set of data regions from a dedicated
//! checkpointer thread. `force_checkpoint` enqueues a request and returns
//! a condvar-backed future; the thread takes the exclusive side of the
//! checkpoint lock, flushes every dirty store of its regions, runs the
//! future's listeners, and only then marks the future finished, so a
//! caller observing completion knows the listeners (which perform the
//! partition renames) already ran.
//!
//! The node checkpoint and the defragmentation checkpoint are two
//! instances of this type over different region sets.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::Result;
use parking_lot::{Condvar, Mutex};
use smallvec::SmallVec;

use crate::error::DefragmentationError;
use crate::memory::DataRegion;

use super::lock::CheckpointLock;

type Listener = Box<dyn FnOnce() -> Result<()> + Send>;

#[derive(Default)]
struct ProgressState {
    done: bool,
    finishing: bool,
    error: Option<String>,
    listeners: SmallVec<[Listener; 2]>,
}

#[derive(Default)]
pub struct CheckpointProgress {
    state: Mutex<ProgressState>,
    cond: Condvar,
}

impl CheckpointProgress {
    /// Runs pending listeners and flips the future to finished. Listeners
    /// are skipped when the flush itself failed; a listener error fails
    /// the future.
    fn complete(&self, flush_error: Option<String>) {
        let listeners = {
            let mut state = self.state.lock();
            state.finishing = true;
            std::mem::take(&mut state.listeners)
        };

        let mut error = flush_error;
        if error.is_none() {
            for listener in listeners {
                if let Err(e) = listener() {
                    error = Some(format!("{e:#}"));
                    break;
                }
            }
        }

        let mut state = self.state.lock();
        state.done = true;
        state.error = error;
        self.cond.notify_all();
    }
}

/// Handle to a checkpoint's completion, shared by waiters and listeners.
#[derive(Clone, Default)]
pub struct CheckpointFuture {
    progress: Arc<CheckpointProgress>,
}

impl std::fmt::Debug for CheckpointFuture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointFuture").finish_non_exhaustive()
    }
}

impl CheckpointFuture {
    fn new(progress: Arc<CheckpointProgress>) -> Self {
        Self { progress }
    }

    /// An already-finished future; stands in for the index checkpoint
    /// when a group has no index store.
    pub fn finished() -> Self {
        let future = Self::default();
        future.progress.complete(None);
        future
    }

    /// Blocks until the checkpoint (listeners included) completed.
    pub fn wait(&self) -> Result<()> {
        let mut state = self.progress.state.lock();
        while !state.done {
            self.progress.cond.wait(&mut state);
        }
        match &state.error {
            None => Ok(()),
            Some(e) => Err(DefragmentationError::CheckpointFailed(e.clone()).into()),
        }
    }

    pub fn is_done(&self) -> bool {
        self.progress.state.lock().done
    }

    /// Attaches a completion listener. Listeners run on the checkpointer
    /// thread before waiters wake; attaching to an already-finished
    /// successful future runs the listener inline.
    pub fn listen(&self, listener: impl FnOnce() -> Result<()> + Send + 'static) {
        let run_now = {
            let mut state = self.progress.state.lock();
            if state.finishing || state.done {
                while !state.done {
                    self.progress.cond.wait(&mut state);
                }
                state.error.is_none()
            } else {
                state.listeners.push(Box::new(listener));
                return;
            }
        };

        if run_now {
            if let Err(e) = listener() {
                let mut state = self.progress.state.lock();
                state.error = Some(format!("{e:#}"));
            }
        }
    }
}

/// Collects per-partition checkpoint futures so a cache group is released
/// only after all of them (renames included) resolved.
#[derive(Default)]
pub struct CompoundFuture {
    futures: Vec<CheckpointFuture>,
}

impl CompoundFuture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, future: CheckpointFuture) {
        self.futures.push(future);
    }

    pub fn wait_all(&self) -> Result<()> {
        let mut first_error = None;
        for future in &self.futures {
            if let Err(e) = future.wait() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

struct CheckpointRequest {
    reason: String,
    progress: Arc<CheckpointProgress>,
}

struct ControllerShared {
    name: String,
    lock: Arc<CheckpointLock>,
    regions: Vec<DataRegion>,
    queue: Mutex<VecDeque<CheckpointRequest>>,
    work: Condvar,
    stopped: AtomicBool,
    flush_on_stop: AtomicBool,
}

impl ControllerShared {
    fn flush_regions(&self) -> Result<u64> {
        let mut flushed = 0;
        for region in &self.regions {
            flushed += region.page_memory().flush_dirty()?;
        }
        Ok(flushed)
    }

    fn run_checkpoint(&self, request: CheckpointRequest) {
        self.lock.begin_flush();
        let result = self.flush_regions();
        self.lock.end_flush();

        match result {
            Ok(pages) => {
                log::debug!(
                    "checkpoint '{}' flushed {} pages (reason: {})",
                    self.name,
                    pages,
                    request.reason
                );
                request.progress.complete(None);
            }
            Err(e) => {
                log::warn!(
                    "checkpoint '{}' failed (reason: {}): {:#}",
                    self.name,
                    request.reason,
                    e
                );
                request.progress.complete(Some(format!("{e:#}")));
            }
        }
    }

    fn worker_loop(&self) {
        loop {
            let request = {
                let mut queue = self.queue.lock();
                loop {
                    if let Some(request) = queue.pop_front() {
                        break Some(request);
                    }
                    if self.stopped.load(Ordering::Acquire) {
                        break None;
                    }
                    self.work.wait(&mut queue);
                }
            };

            match request {
                Some(request) => self.run_checkpoint(request),
                None => break,
            }
        }

        // Fail whatever raced in after the stop flag.
        let leftovers: Vec<_> = self.queue.lock().drain(..).collect();
        for request in leftovers {
            request
                .progress
                .complete(Some("checkpointer is stopped".to_string()));
        }

        if self.flush_on_stop.load(Ordering::Acquire) {
            self.lock.begin_flush();
            let result = self.flush_regions();
            self.lock.end_flush();
            if let Err(e) = result {
                log::warn!("final flush of checkpoint '{}' failed: {:#}", self.name, e);
            }
        }
    }
}

pub struct CheckpointController {
    shared: Arc<ControllerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CheckpointController {
    pub fn new(name: impl Into<String>, regions: Vec<DataRegion>) -> Self {
        let shared = Arc::new(ControllerShared {
            name: name.into(),
            lock: Arc::new(CheckpointLock::new()),
            regions,
            queue: Mutex::new(VecDeque::new()),
            work: Condvar::new(),
            stopped: AtomicBool::new(false),
            flush_on_stop: AtomicBool::new(false),
        });

        let worker = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("checkpointer-{}", shared.name))
                .spawn(move || shared.worker_loop())
                .expect("failed to spawn checkpointer thread")
        };

        Self {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    pub fn checkpoint_lock(&self) -> Arc<CheckpointLock> {
        Arc::clone(&self.shared.lock)
    }

    /// Enqueues a flush of this controller's regions. Non-blocking;
    /// completion is observed through the returned future.
    pub fn force_checkpoint(&self, reason: &str) -> Result<CheckpointFuture> {
        let progress = Arc::new(CheckpointProgress::default());
        let future = CheckpointFuture::new(Arc::clone(&progress));

        let mut queue = self.shared.queue.lock();
        // Checked under the queue lock; a request enqueued after the stop
        // flag would never be drained.
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(
                DefragmentationError::CheckpointFailed("checkpointer is stopped".to_string())
                    .into(),
            );
        }

        queue.push_back(CheckpointRequest {
            reason: reason.to_string(),
            progress,
        });
        self.shared.work.notify_one();

        Ok(future)
    }

    /// Stops the checkpointer thread, optionally flushing the regions one
    /// last time. Idempotent; always joins the worker.
    pub fn stop(&self, flush_on_stop: bool) {
        self.shared
            .flush_on_stop
            .fetch_or(flush_on_stop, Ordering::Release);

        {
            // The stop flag must flip under the queue lock or the worker
            // could re-check it just before parking and sleep through the
            // notification.
            let _queue = self.shared.queue.lock();
            self.shared.stopped.store(true, Ordering::Release);
            self.shared.work.notify_all();
        }

        if let Some(worker) = self.worker.lock().take() {
            if let Err(e) = worker.join() {
                log::warn!("checkpointer '{}' panicked: {:?}", self.shared.name, e);
            }
        }
    }
}

impl Drop for CheckpointController {
    fn drop(&mut self) {
        self.stop(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{PageEvictionMode, PageStoreHandle, StoreKey};
    use crate::storage::{MmapStorage, PageStoreState};
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;

    fn region_with_store(dir: &std::path::Path) -> (DataRegion, Arc<PageStoreHandle>) {
        let region = DataRegion::new("cp-test", PageEvictionMode::Disabled);
        let storage = MmapStorage::create(dir.join("store.bin"), 1).unwrap();
        let handle = PageStoreHandle::new(StoreKey::new(1, 0), PageStoreState::new(storage));
        region.page_memory().add_store(Arc::clone(&handle));
        (region, handle)
    }

    #[test]
    fn force_checkpoint_flushes_dirty_pages() {
        let dir = tempdir().unwrap();
        let (region, handle) = region_with_store(dir.path());
        let controller = CheckpointController::new("test", vec![region]);

        handle.state().unwrap().page_mut(0).unwrap()[0] = 1;
        assert_eq!(handle.state().unwrap().dirty_count(), 1);

        controller.force_checkpoint("test reason").unwrap().wait().unwrap();
        assert_eq!(handle.state().unwrap().dirty_count(), 0);

        controller.stop(false);
    }

    #[test]
    fn listeners_run_before_wait_returns() {
        let dir = tempdir().unwrap();
        let (region, _handle) = region_with_store(dir.path());
        let controller = CheckpointController::new("test", vec![region]);

        let order = Arc::new(AtomicUsize::new(0));
        let future = controller.force_checkpoint("listener order").unwrap();

        let seen = Arc::clone(&order);
        future.listen(move || {
            seen.store(1, Ordering::SeqCst);
            Ok(())
        });

        future.wait().unwrap();
        assert_eq!(order.load(Ordering::SeqCst), 1);

        controller.stop(false);
    }

    #[test]
    fn listener_failure_fails_the_future() {
        let dir = tempdir().unwrap();
        let (region, _handle) = region_with_store(dir.path());
        let controller = CheckpointController::new("test", vec![region]);

        let future = controller.force_checkpoint("failing listener").unwrap();
        future.listen(|| eyre::bail!("rename blew up"));

        let err = future.wait().unwrap_err();
        assert!(err.to_string().contains("checkpoint failed"));

        controller.stop(false);
    }

    #[test]
    fn stopped_controller_rejects_requests() {
        let dir = tempdir().unwrap();
        let (region, _handle) = region_with_store(dir.path());
        let controller = CheckpointController::new("test", vec![region]);

        controller.stop(true);

        let err = controller.force_checkpoint("too late").unwrap_err();
        assert!(err
            .downcast_ref::<DefragmentationError>()
            .is_some_and(|e| matches!(e, DefragmentationError::CheckpointFailed(_))));
    }

    #[test]
    fn finished_future_runs_listener_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let future = CheckpointFuture::finished();

        let seen = Arc::clone(&ran);
        future.listen(move || {
            seen.store(7, Ordering::SeqCst);
            Ok(())
        });

        assert_eq!(ran.load(Ordering::SeqCst), 7);
        future.wait().unwrap();
    }
}
