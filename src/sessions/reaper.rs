//! Per-session idle timer.
//!
//! Each live session owns one [`IdleTimer`]. Every touching operation calls
//! [`IdleTimer::reschedule`], which bumps the generation, aborts the pending
//! task and starts a new one. The fired callback receives the generation it
//! was scheduled with; the registry evicts only when that still matches the
//! session's current generation, so a touch racing a firing timer neither
//! double-evicts nor gets lost.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

#[derive(Debug, Default)]
pub struct IdleTimer {
    generation: u64,
    handle: Option<JoinHandle<()>>,
}

impl IdleTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generation of the most recently scheduled timer.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the pending timer with one that calls `on_fire(generation)`
    /// after `timeout`. The generation is bumped even when `timeout` is
    /// `None` (reaping disabled), which only cancels.
    pub fn reschedule<F, Fut>(&mut self, timeout: Option<Duration>, on_fire: F)
    where
        F: FnOnce(u64) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel();
        self.generation += 1;
        let Some(timeout) = timeout else { return };
        let generation = self.generation;
        self.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            on_fire(generation).await;
        }));
    }

    /// Abort the pending timer, if any.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Forget the pending timer without aborting it. Used by the eviction
    /// path, which runs inside that very task.
    pub fn disarm(&mut self) {
        self.handle.take();
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for IdleTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}
