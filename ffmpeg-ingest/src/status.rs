use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio_util::sync::CancellationToken;

/// Process-wide run state shared by every thread of the pipeline.
///
/// The emergency flag is a cancellation token: raising it makes every loop
/// exit at its next iteration without finishing its drain. Components that
/// need their own orderly stop take a child token, so stopping one component
/// never raises the emergency for the others.
#[derive(Clone)]
pub struct Status {
    inner: Arc<StatusInner>,
}

struct StatusInner {
    emergency: CancellationToken,
    paused: AtomicBool,
}

impl Status {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StatusInner {
                emergency: CancellationToken::new(),
                paused: AtomicBool::new(false),
            }),
        }
    }

    pub fn set_emergency(&self) {
        if !self.inner.emergency.is_cancelled() {
            log::error!("emergency stop raised, all pipeline threads are going down");
        }
        self.inner.emergency.cancel();
    }

    pub fn is_emergency(&self) -> bool {
        self.inner.emergency.is_cancelled()
    }

    /// Token cancelled by the emergency and, additionally, by its owner.
    pub fn child_token(&self) -> CancellationToken {
        self.inner.emergency.child_token()
    }

    pub fn set_paused(&self, paused: bool) {
        let was = self.inner.paused.swap(paused, Ordering::SeqCst);
        if was != paused {
            log::info!("pipeline {}", if paused { "paused" } else { "resumed" });
        }
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }
}

impl Default for Status {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_token_follows_emergency() {
        let status = Status::new();
        let child = status.child_token();
        let sibling = status.child_token();

        child.cancel();
        assert!(!status.is_emergency());
        assert!(!sibling.is_cancelled());

        status.set_emergency();
        assert!(status.is_emergency());
        assert!(sibling.is_cancelled());
    }

    #[test]
    fn test_pause_flag() {
        let status = Status::new();
        assert!(!status.is_paused());
        status.set_paused(true);
        assert!(status.clone().is_paused());
        status.set_paused(false);
        assert!(!status.is_paused());
    }
}
