use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts dispatched jobs that have not signaled completion yet.
///
/// The producer takes a [`CompletionGuard`] per job before enqueueing it; the
/// guard travels with the job and releases its slot when dropped, so every
/// code path (success, failure, panic, a job that never left the queue)
/// signals exactly once.
#[derive(Debug, Default)]
pub struct CompletionBarrier {
    pending: AtomicUsize,
    notify: Notify,
}

impl CompletionBarrier {
    pub fn new() -> Self {
        Self {
            pending: AtomicUsize::new(0),
            notify: Notify::new(),
        }
    }

    pub fn enter(self: &Arc<Self>) -> CompletionGuard {
        self.pending.fetch_add(1, Ordering::SeqCst);
        CompletionGuard {
            barrier: Arc::clone(self),
            active: true,
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Resolves once every guard handed out so far has been released.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn release(&self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.notify.notify_waiters();
        }
    }
}

pub struct CompletionGuard {
    barrier: Arc<CompletionBarrier>,
    active: bool,
}

impl CompletionGuard {
    /// Signals completion now instead of at drop.
    pub fn complete(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.active {
            self.barrier.release();
            self.active = false;
        }
    }
}

impl Drop for CompletionGuard {
    fn drop(&mut self) {
        self.release();
    }
}
