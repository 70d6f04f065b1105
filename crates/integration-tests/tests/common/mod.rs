//! Harness shared by the end-to-end scenario tests: a scripted clock,
//! a stub pilot, and a test-only go-sign editor that stands in for
//! `godetect::GoDetectEditor` without spawning a real child process.

use dashboard::{Clock, DashboardPipeline, Editor};
use state::LifeCycle;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use types::{Dashboard, DriveCommand, Pilot, Priority, TriState};

/// A clock callers advance by hand instead of letting wall time pass.
pub struct ScriptedClock {
    micros: AtomicU64,
}

impl ScriptedClock {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { micros: AtomicU64::new(0) })
    }

    pub fn advance(&self, secs: f64) {
        self.micros.fetch_add((secs * 1_000_000.0) as u64, Ordering::SeqCst);
    }
}

impl Clock for ScriptedClock {
    fn now(&self) -> f64 {
        self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
    }
}

/// A pilot whose answer and response latency are set from the test
/// body, standing in for a real vision/planning pilot.
pub struct ScriptedPilot {
    name: &'static str,
    priority: Priority,
    answer: Mutex<Option<DriveCommand>>,
    delay: Mutex<Duration>,
}

impl ScriptedPilot {
    pub fn new(name: &'static str, priority: Priority) -> Arc<Self> {
        Arc::new(Self { name, priority, answer: Mutex::new(None), delay: Mutex::new(Duration::ZERO) })
    }

    pub fn set_answer(&self, command: Option<DriveCommand>) {
        *self.answer.lock().unwrap() = command;
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
}

impl Pilot for ScriptedPilot {
    fn name(&self) -> &str {
        self.name
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn inquire(&self, _dashboard: &Dashboard, _last_result: Option<&DriveCommand>) -> Option<DriveCommand> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        self.answer.lock().unwrap().clone()
    }
}

/// Stands in for `godetect::GoDetectEditor`: a HIGH-priority editor
/// that paints whatever `TriState` the test last set onto the
/// dashboard, without a child process in the loop.
pub struct TestGoSignEditor {
    state: Arc<Mutex<TriState>>,
}

impl TestGoSignEditor {
    pub fn new() -> (Arc<Self>, Arc<Mutex<TriState>>) {
        let state = Arc::new(Mutex::new(TriState::Unknown));
        (Arc::new(Self { state: state.clone() }), state)
    }
}

impl Editor for TestGoSignEditor {
    fn name(&self) -> &str {
        "test-godetect"
    }

    fn priority(&self) -> Priority {
        Priority::HIGH
    }

    fn edit(&self, dashboard: &mut Dashboard) -> bool {
        dashboard.ready_to_go = *self.state.lock().unwrap();
        false
    }
}

/// A freshly-started `LifeCycle` plus a fast-cadence `DashboardPipeline`
/// driven by a real worker thread, wired the way `bins/bvrd` wires them.
pub struct Harness {
    pub lifecycle: Arc<LifeCycle>,
    pub dashboard: Arc<DashboardPipeline>,
    pub autodrive_started: Arc<AtomicBool>,
    dashboard_handle: Option<std::thread::JoinHandle<()>>,
}

impl Harness {
    /// `frame_rate` controls the real wall-clock cadence of dashboard
    /// ticks; keep it high in tests so scenarios don't need to wait long
    /// for the next tick to land.
    pub fn start(frame_rate: f64) -> Self {
        let lifecycle = Arc::new(LifeCycle::new("integration-test"));
        lifecycle.begin_start();
        lifecycle.mark_started();

        let autodrive_started = Arc::new(AtomicBool::new(false));
        let dashboard = DashboardPipeline::new(
            frame_rate,
            camera::CameraCache::new(Duration::from_secs(5)),
            false,
            autodrive_started.clone(),
            lifecycle.clone(),
            Arc::new(dashboard::SystemClock::new()),
        );
        let handle = dashboard.spawn_worker();

        Self { lifecycle, dashboard, autodrive_started, dashboard_handle: Some(handle) }
    }

    pub fn stop(mut self) {
        self.lifecycle.begin_stop();
        self.lifecycle.mark_stopped();
        if let Some(handle) = self.dashboard_handle.take() {
            let _ = handle.join();
        }
    }
}

pub fn running_dispatcher(
    lifecycle: Arc<LifeCycle>,
    max_queued: usize,
) -> Arc<dispatch::Dispatcher> {
    dispatch::Dispatcher::new(
        max_queued,
        lifecycle,
        motor::MotorModel::new(motor::MotorConfig::default()),
        kinematics::KinematicConfig::default(),
    )
}
