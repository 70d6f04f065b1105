//! Per-pilot worker threads and the registry the Arbiter polls.
//!
//! Each registered [`types::Pilot`] gets its own dedicated worker: it
//! watches the dashboard pipeline for a new tick, invokes `inquire`
//! exactly once per tick, and publishes `(command, elapsed)` into the
//! pilot's slot. The Arbiter wakes each pilot's slot in priority order
//! and waits up to `response_timeout` for a matching answer.

use dashboard::{DashboardPipeline, Editor};
use state::LifeCycle;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use types::{Dashboard, DriveCommand, Pilot, Priority, SortKey};

struct SlotState {
    last_timestamp: Option<f64>,
    command: Option<DriveCommand>,
    elapsed: Duration,
}

struct PilotSlot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

impl PilotSlot {
    fn new() -> Self {
        Self {
            state: Mutex::new(SlotState { last_timestamp: None, command: None, elapsed: Duration::ZERO }),
            cond: Condvar::new(),
        }
    }
}

/// Bridges a [`types::Pilot`]'s optional `edit` into the dashboard
/// pipeline's editor chain.
struct PilotEditor(Arc<dyn Pilot>);

impl Editor for PilotEditor {
    fn name(&self) -> &str {
        self.0.name()
    }
    fn priority(&self) -> Priority {
        self.0.priority()
    }
    fn edit(&self, dashboard: &mut Dashboard) -> bool {
        self.0.edit(dashboard)
    }
}

pub struct PilotHandle {
    pub name: String,
    pub sort_key: SortKey,
    slot: Arc<PilotSlot>,
}

impl PilotHandle {
    /// Wake this pilot's worker for `timestamp` and wait up to
    /// `timeout` for a matching answer. Returns `None` if the pilot
    /// timed out or returned nothing for this tick.
    pub fn wait_for_response(&self, timestamp: f64, timeout: Duration) -> Option<DriveCommand> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.slot.state.lock().unwrap();
        loop {
            if guard.last_timestamp == Some(timestamp) {
                return guard.command.clone();
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(pilot = %self.name, "pilot response timed out");
                return None;
            }
            let (next, result) = self.slot.cond.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
            if result.timed_out() && guard.last_timestamp != Some(timestamp) {
                warn!(pilot = %self.name, "pilot response timed out");
                return None;
            }
        }
    }
}

pub struct PilotRegistry {
    handles: Vec<PilotHandle>,
}

impl PilotRegistry {
    /// Instantiate workers for `pilots` (in the given declaration
    /// order), registering each pilot's `edit` with the dashboard
    /// pipeline and spawning one worker thread per pilot. Returns the
    /// registry plus the join handles so the runtime can track them.
    pub fn build(
        pilots: Vec<Arc<dyn Pilot>>,
        dashboard: Arc<DashboardPipeline>,
        lifecycle: Arc<LifeCycle>,
        response_timeout: Duration,
    ) -> (Arc<PilotRegistry>, Vec<std::thread::JoinHandle<()>>) {
        let mut handles = Vec::with_capacity(pilots.len());
        let mut join_handles = Vec::with_capacity(pilots.len());

        for (index, pilot) in pilots.into_iter().enumerate() {
            let sort_key = SortKey { priority: pilot.priority(), insertion_index: index as u64 };
            let slot = Arc::new(PilotSlot::new());

            dashboard.register_editor(pilot.priority(), Arc::new(PilotEditor(pilot.clone())));

            let worker_pilot = pilot.clone();
            let worker_slot = slot.clone();
            let worker_dashboard = dashboard.clone();
            let worker_lifecycle = lifecycle.clone();
            let name = worker_pilot.name().to_string();

            join_handles.push(std::thread::spawn(move || {
                run_pilot_worker(worker_pilot, worker_dashboard, worker_slot, worker_lifecycle, response_timeout)
            }));

            handles.push(PilotHandle { name, sort_key, slot });
        }

        handles.sort_by(|a, b| a.sort_key.cmp(&b.sort_key));
        (Arc::new(PilotRegistry { handles }), join_handles)
    }

    /// Pilots in effective priority order: HIGH first, ties by
    /// declaration order.
    pub fn ordered(&self) -> &[PilotHandle] {
        &self.handles
    }
}

fn run_pilot_worker(
    pilot: Arc<dyn Pilot>,
    dashboard: Arc<DashboardPipeline>,
    slot: Arc<PilotSlot>,
    lifecycle: Arc<LifeCycle>,
    response_timeout: Duration,
) {
    info!(pilot = pilot.name(), "pilot worker started");
    let mut last_seen: Option<f64> = None;

    while lifecycle.is_running() {
        let Some(dash) = dashboard.wait_for_tick_after(last_seen, Duration::from_millis(200)) else {
            continue;
        };
        last_seen = Some(dash.timestamp);

        let last_result = slot.state.lock().unwrap().command.clone();
        let started = Instant::now();

        let abandon_after = response_timeout.mul_f64(5.0);
        let outcome = catch_unwind(AssertUnwindSafe(|| pilot.inquire(&dash, last_result.as_ref())));
        let elapsed = started.elapsed();
        if elapsed > abandon_after {
            warn!(pilot = pilot.name(), ?elapsed, "pilot inquire ran far past its response budget");
        }

        let command = match outcome {
            Ok(command) => command,
            Err(_) => {
                warn!(pilot = pilot.name(), "pilot panicked during inquire; retrying next tick");
                None
            }
        };

        let mut state = slot.state.lock().unwrap();
        state.last_timestamp = Some(dash.timestamp);
        state.command = command;
        state.elapsed = elapsed;
        slot.cond.notify_all();
    }
    info!(pilot = pilot.name(), "pilot worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use dashboard::SystemClock;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex as StdMutex;

    struct StubPilot {
        name: &'static str,
        priority: Priority,
        answer: StdMutex<Option<DriveCommand>>,
    }

    impl Pilot for StubPilot {
        fn name(&self) -> &str {
            self.name
        }
        fn priority(&self) -> Priority {
            self.priority
        }
        fn inquire(&self, _dashboard: &Dashboard, _last: Option<&DriveCommand>) -> Option<DriveCommand> {
            self.answer.lock().unwrap().clone()
        }
    }

    #[test]
    fn registry_orders_by_priority_then_declaration() {
        let lifecycle = Arc::new(LifeCycle::new("test"));
        lifecycle.begin_start();
        lifecycle.mark_started();
        let pipeline = DashboardPipeline::new(
            10.0,
            camera::CameraCache::new(Duration::from_secs(5)),
            false,
            Arc::new(AtomicBool::new(false)),
            lifecycle.clone(),
            Arc::new(SystemClock::new()),
        );

        let low = Arc::new(StubPilot { name: "low", priority: Priority::LOW, answer: StdMutex::new(None) });
        let high = Arc::new(StubPilot { name: "high", priority: Priority::HIGH, answer: StdMutex::new(None) });

        let (registry, _handles) = PilotRegistry::build(
            vec![low, high],
            pipeline,
            lifecycle.clone(),
            Duration::from_millis(100),
        );

        let names: Vec<&str> = registry.ordered().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["high", "low"]);

        lifecycle.begin_stop();
        lifecycle.mark_stopped();
    }
}
