//! Process lifecycle context.
//!
//! Host applications that background and foreground hand a [`Lifecycle`]
//! to the swarm at construction instead of wiring up ambient global
//! hooks. Suspending parks all network activity; resuming picks it up
//! with all membership and connection state intact.

use std::sync::Arc;

use tokio::sync::watch;

/// Whether the process wants network activity right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LifecycleState {
    /// Normal operation.
    #[default]
    Running,
    /// The host is backgrounded: no lookups, announces or new
    /// connections, and existing streams stop exchanging data.
    Suspended,
}

/// Handle for driving suspend/resume from the host application.
///
/// Clones share state; every component subscribed to the same lifecycle
/// observes transitions in order.
#[derive(Debug, Clone)]
pub struct Lifecycle {
    state_tx: Arc<watch::Sender<LifecycleState>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// A lifecycle in the [`LifecycleState::Running`] state.
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(LifecycleState::default());
        Self {
            state_tx: Arc::new(state_tx),
        }
    }

    /// Park all network activity.
    pub fn suspend(&self) {
        let _ = self.state_tx.send(LifecycleState::Suspended);
    }

    /// Resume after [`Lifecycle::suspend`].
    pub fn resume(&self) {
        let _ = self.state_tx.send(LifecycleState::Running);
    }

    /// The current state.
    pub fn state(&self) -> LifecycleState {
        *self.state_tx.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_observable() {
        let lifecycle = Lifecycle::new();
        let rx = lifecycle.subscribe();
        assert_eq!(lifecycle.state(), LifecycleState::Running);
        lifecycle.suspend();
        assert_eq!(*rx.borrow(), LifecycleState::Suspended);
        lifecycle.resume();
        assert_eq!(*rx.borrow(), LifecycleState::Running);
    }

    #[test]
    fn test_clones_share_state() {
        let lifecycle = Lifecycle::new();
        let other = lifecycle.clone();
        other.suspend();
        assert_eq!(lifecycle.state(), LifecycleState::Suspended);
    }
}
