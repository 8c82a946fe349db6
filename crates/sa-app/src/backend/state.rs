use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use crate::context::AppContext;
use crate::worker::WorkerControl;

/// Shared by every handler. The context lock is held for the whole of a
/// run, so a failed `try_lock` means another request owns the worker.
pub struct BackendState {
    ctx: Arc<Mutex<AppContext>>,
    worker: WorkerControl,
}

impl BackendState {
    pub fn new(ctx: AppContext) -> Self {
        let worker = ctx.worker().control();
        Self {
            ctx: Arc::new(Mutex::new(ctx)),
            worker,
        }
    }

    pub fn try_acquire(&self) -> Option<OwnedMutexGuard<AppContext>> {
        self.ctx.clone().try_lock_owned().ok()
    }

    /// Whether a run is in progress on the worker
    pub fn is_busy(&self) -> bool {
        self.worker.is_running()
    }

    /// Signal the running job without waiting for the context lock.
    /// Returns whether a run was active.
    pub fn cancel(&self) -> bool {
        self.worker.cancel()
    }
}
