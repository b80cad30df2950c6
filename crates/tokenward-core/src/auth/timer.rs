use std::future::Future;

use tokio::task::JoinHandle;
use tracing::debug;

/// Owned handle to the recurring refresh task.
///
/// At most one task is live per timer: [`RefreshTimer::arm`] always disarms
/// the previous task before spawning the next one. Dropping the timer
/// disarms it.
#[derive(Debug, Default)]
pub struct RefreshTimer {
    handle: Option<JoinHandle<()>>,
    generation: u64,
}

impl RefreshTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel any live task, then spawn `build(generation)`.
    ///
    /// The generation identifies this arming so the task can later release
    /// itself without touching a newer task.
    pub fn arm<F, Fut>(&mut self, build: F) -> u64
    where
        F: FnOnce(u64) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disarm();
        self.generation += 1;
        self.handle = Some(tokio::spawn(build(self.generation)));
        debug!(generation = self.generation, "Refresh timer armed");
        self.generation
    }

    /// Cancel the live task, if any. Returns whether one was cancelled.
    pub fn disarm(&mut self) -> bool {
        match self.handle.take() {
            Some(handle) => {
                handle.abort();
                debug!(generation = self.generation, "Refresh timer disarmed");
                true
            }
            None => false,
        }
    }

    /// Forget the task of `generation` without aborting it.
    ///
    /// Used by the task itself when it stops on its own; aborting would
    /// cancel the teardown it is about to run.
    pub fn release(&mut self, generation: u64) -> bool {
        if self.generation == generation && self.handle.is_some() {
            self.handle = None;
            debug!(generation, "Refresh timer released");
            true
        } else {
            false
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for RefreshTimer {
    fn drop(&mut self) {
        self.disarm();
    }
}
