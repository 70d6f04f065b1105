//! LifeCycle state machine shared by the Runtime, each pilot worker, and
//! each console listener.
//!
//! Transitions are guarded by a single mutex + condition variable per
//! machine; no transition skips a state, and every wait is interruptible
//! by any state-transition notification so callers can re-check whatever
//! predicate they actually care about after waking.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// `INIT → STARTING → STARTED → STOPPING → STOPPED`, with `STOPPED`
/// able to restart back through `STARTING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifeCycleState {
    Init,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// A blocking state machine. Cheaply shared via `Arc` by callers.
pub struct LifeCycle {
    name: &'static str,
    state: Mutex<LifeCycleState>,
    cond: Condvar,
}

impl LifeCycle {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(LifeCycleState::Init),
            cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> LifeCycleState {
        *self.state.lock().unwrap()
    }

    /// Request a start. No-op (but logged) if already starting/started.
    /// Returns `true` if this call actually initiated a transition out
    /// of `INIT`/`STOPPED`, i.e. the caller should proceed to do setup
    /// work and then call [`LifeCycle::mark_started`].
    pub fn begin_start(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        match *guard {
            LifeCycleState::Init | LifeCycleState::Stopped => {
                self.transition(&mut guard, LifeCycleState::Starting);
                true
            }
            LifeCycleState::Starting | LifeCycleState::Started => false,
            LifeCycleState::Stopping => {
                warn!(machine = self.name, "start requested while stopping");
                false
            }
        }
    }

    pub fn mark_started(&self) {
        let mut guard = self.state.lock().unwrap();
        if *guard == LifeCycleState::Starting {
            self.transition(&mut guard, LifeCycleState::Started);
        }
    }

    /// Request a stop. Idempotent from `INIT`/`STOPPED` per the
    /// runtime's round-trip law — those cases return `false` and the
    /// caller should not run teardown a second time. Otherwise begins
    /// `STOPPING` and returns `true`.
    pub fn begin_stop(&self) -> bool {
        let mut guard = self.state.lock().unwrap();
        match *guard {
            LifeCycleState::Init => {
                self.transition(&mut guard, LifeCycleState::Stopped);
                false
            }
            LifeCycleState::Stopped | LifeCycleState::Stopping => false,
            LifeCycleState::Starting | LifeCycleState::Started => {
                self.transition(&mut guard, LifeCycleState::Stopping);
                true
            }
        }
    }

    pub fn mark_stopped(&self) {
        let mut guard = self.state.lock().unwrap();
        if *guard == LifeCycleState::Stopping {
            self.transition(&mut guard, LifeCycleState::Stopped);
        }
    }

    fn transition(&self, guard: &mut LifeCycleState, next: LifeCycleState) {
        info!(machine = self.name, from = ?*guard, to = ?next, "lifecycle transition");
        *guard = next;
        self.cond.notify_all();
    }

    /// Block until `state` is reached or `timeout` elapses, waking on
    /// every transition in between so a caller polling for a different
    /// terminal condition observes intermediate states too. Returns
    /// `true` iff the target state was reached.
    pub fn wait_for(&self, target: LifeCycleState, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|d| Instant::now() + d);
        let mut guard = self.state.lock().unwrap();
        loop {
            if *guard == target {
                return true;
            }
            match deadline {
                None => guard = self.cond.wait(guard).unwrap(),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return *guard == target;
                    }
                    let (next_guard, timeout_result) =
                        self.cond.wait_timeout(guard, deadline - now).unwrap();
                    guard = next_guard;
                    if timeout_result.timed_out() && *guard != target {
                        return false;
                    }
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == LifeCycleState::Started
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state(), LifeCycleState::Stopped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn starts_from_init_and_stopped() {
        let lc = LifeCycle::new("test");
        assert!(lc.begin_start());
        lc.mark_started();
        assert_eq!(lc.state(), LifeCycleState::Started);

        assert!(lc.begin_stop());
        lc.mark_stopped();
        assert_eq!(lc.state(), LifeCycleState::Stopped);

        // Restart from STOPPED.
        assert!(lc.begin_start());
        assert_eq!(lc.state(), LifeCycleState::Starting);
    }

    #[test]
    fn stop_is_idempotent_from_init_and_stopped() {
        let lc = LifeCycle::new("test");
        assert!(!lc.begin_stop());
        assert_eq!(lc.state(), LifeCycleState::Stopped);
        assert!(!lc.begin_stop());
        assert_eq!(lc.state(), LifeCycleState::Stopped);
    }

    #[test]
    fn start_is_idempotent_when_already_starting_or_started() {
        let lc = LifeCycle::new("test");
        assert!(lc.begin_start());
        assert!(!lc.begin_start());
        lc.mark_started();
        assert!(!lc.begin_start());
    }

    #[test]
    fn wait_for_wakes_on_transition_notification() {
        let lc = Arc::new(LifeCycle::new("test"));
        let lc2 = lc.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            lc2.begin_start();
            lc2.mark_started();
        });
        assert!(lc.wait_for(LifeCycleState::Started, Some(Duration::from_secs(2))));
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_times_out_when_state_never_reached() {
        let lc = LifeCycle::new("test");
        assert!(!lc.wait_for(LifeCycleState::Started, Some(Duration::from_millis(20))));
    }

    #[test]
    fn no_transition_skips_starting_on_the_way_to_started() {
        let lc = LifeCycle::new("test");
        // mark_started without begin_start first has no effect: still Init.
        lc.mark_started();
        assert_eq!(lc.state(), LifeCycleState::Init);
    }
}
