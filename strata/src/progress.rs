//! Load progress reporting, every region generation is bracketed by a start and an end
//! notification so that a loading screen can count outstanding work.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;


/// A collaborator notified around every region generation.
pub trait LoadProgress: Send + Sync {

    /// Called when a generation request starts.
    fn start_load(&self);

    /// Called when a generation request ends, whatever its result.
    fn end_load(&self);

}

/// Progress sink that ignores every notification.
#[derive(Debug, Default)]
pub struct NoProgress;

impl LoadProgress for NoProgress {
    fn start_load(&self) { }
    fn end_load(&self) { }
}

/// Progress sink counting started and ended loads.
#[derive(Debug, Default)]
pub struct LoadCounter {
    started: AtomicU64,
    ended: AtomicU64,
}

impl LoadCounter {

    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn started(&self) -> u64 {
        self.started.load(Ordering::Acquire)
    }

    #[inline]
    pub fn ended(&self) -> u64 {
        self.ended.load(Ordering::Acquire)
    }

    /// Number of loads started but not yet ended.
    pub fn outstanding(&self) -> u64 {
        // Read the end first, so a concurrent end never makes this negative.
        let ended = self.ended();
        self.started().saturating_sub(ended)
    }

}

impl LoadProgress for LoadCounter {

    fn start_load(&self) {
        self.started.fetch_add(1, Ordering::AcqRel);
    }

    fn end_load(&self) {
        self.ended.fetch_add(1, Ordering::AcqRel);
    }

}

/// Guard calling [`LoadProgress::end_load`] when dropped, created by
/// [`LoadGuard::start`].
pub(crate) struct LoadGuard {
    progress: Arc<dyn LoadProgress>,
}

impl LoadGuard {

    pub fn start(progress: Arc<dyn LoadProgress>) -> Self {
        progress.start_load();
        Self { progress }
    }

}

impl Drop for LoadGuard {
    fn drop(&mut self) {
        self.progress.end_load();
    }
}
