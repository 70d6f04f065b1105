//! The Arbiter's per-tick decision loop, the runtime that wires every
//! worker together and drives the shared [`state::LifeCycle`], and a
//! minimal session recorder.
//!
//! The Arbiter runs on its own dedicated thread rather than literally
//! as a registered [`dashboard::Observer`] callback: its per-tick logic
//! needs a self-contained wait/timeout/defensive-stop loop (waiting up
//! to `dashboard_max_renew_interval` for the next tick, and issuing a
//! defensive stop if the gap exceeds `camera_lag_tolerance_seconds`)
//! that a callback invoked synchronously from inside the pipeline's own
//! tick cadence can't express without blocking that cadence. It reads
//! `ready_to_go` off each tick the same way an observer would.

use dashboard::DashboardPipeline;
use pilot::PilotRegistry;
use serde::{Deserialize, Serialize};
use state::LifeCycle;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tracing::{info, warn};
use types::{Dashboard, DriveCommand, TriState};

#[derive(Error, Debug)]
pub enum Error {
    #[error("dispatcher: {0}")]
    Dispatch(#[from] dispatch::Error),
    #[error("recording io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AutopilotConfig {
    pub response_timeout: f64,
    pub max_activation_seconds: f64,
    pub min_starting_straight_seconds: f64,
    pub starting_straight_throttle: f64,
    pub camera_lag_tolerance_seconds: f64,
    pub dashboard_max_renew_interval: f64,
    pub max_idle_taking_over: f64,
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            response_timeout: 0.75,
            max_activation_seconds: 320.0,
            min_starting_straight_seconds: 0.5,
            starting_straight_throttle: 0.0,
            camera_lag_tolerance_seconds: 1.0,
            dashboard_max_renew_interval: 0.1,
            max_idle_taking_over: 3.0,
        }
    }
}

fn wall_now() -> f64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs_f64()
}

#[derive(Serialize)]
struct RecordedEntry<'a> {
    timestamp: f64,
    command: &'a DriveCommand,
}

/// Minimal JSON-lines-per-accepted-command session log. Not a
/// telemetry/replay system: one line per command the Dispatcher
/// actually received.
pub struct Recorder {
    file: Mutex<Option<BufWriter<File>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self { file: Mutex::new(None) }
    }

    pub fn start(&self, directory: &Path) -> Result<(), Error> {
        std::fs::create_dir_all(directory)?;
        let name = format!("session-{}.jsonl", chrono::Utc::now().format("%Y%m%dT%H%M%S%.3fZ"));
        let path = directory.join(name);
        let file = File::create(&path)?;
        *self.file.lock().unwrap() = Some(BufWriter::new(file));
        info!(?path, "recording started");
        Ok(())
    }

    pub fn stop(&self) {
        if self.file.lock().unwrap().take().is_some() {
            info!("recording stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.file.lock().unwrap().is_some()
    }

    fn record(&self, dashboard: &Dashboard, command: &DriveCommand) {
        let mut guard = self.file.lock().unwrap();
        if let Some(writer) = guard.as_mut() {
            let entry = RecordedEntry { timestamp: dashboard.timestamp, command };
            match serde_json::to_string(&entry) {
                Ok(line) => {
                    let _ = writeln!(writer, "{line}");
                    let _ = writer.flush();
                }
                Err(e) => warn!(?e, "failed to serialize recording entry"),
            }
        }
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Arbiter {
    config: AutopilotConfig,
    dispatcher: Arc<dispatch::Dispatcher>,
    pilots: Arc<PilotRegistry>,
    dashboard: Arc<DashboardPipeline>,
    lifecycle: Arc<LifeCycle>,
    remote_control_enabled: AtomicBool,
    autodrive_started: Arc<AtomicBool>,
    autodrive_activated_at: Mutex<Option<Instant>>,
    starting_straight_until: Mutex<Option<Instant>>,
    taking_over_until: Mutex<Option<Instant>>,
    go_sign_fired_this_epoch: AtomicBool,
    last_ready_to_go: Mutex<TriState>,
    recorder: Recorder,
}

impl Arbiter {
    pub fn new(
        config: AutopilotConfig,
        dispatcher: Arc<dispatch::Dispatcher>,
        pilots: Arc<PilotRegistry>,
        dashboard: Arc<DashboardPipeline>,
        lifecycle: Arc<LifeCycle>,
        autodrive_started: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            dispatcher,
            pilots,
            dashboard,
            lifecycle,
            remote_control_enabled: AtomicBool::new(false),
            autodrive_started,
            autodrive_activated_at: Mutex::new(None),
            starting_straight_until: Mutex::new(None),
            taking_over_until: Mutex::new(None),
            go_sign_fired_this_epoch: AtomicBool::new(false),
            last_ready_to_go: Mutex::new(TriState::Unknown),
            recorder: Recorder::new(),
        })
    }

    pub fn start_autodrive(&self) {
        if self.remote_control_enabled.load(Ordering::Relaxed) {
            warn!("refusing to start autodrive while remote control is enabled");
            return;
        }
        self.autodrive_started.store(true, Ordering::Relaxed);
        let now = Instant::now();
        *self.autodrive_activated_at.lock().unwrap() = Some(now);
        *self.starting_straight_until.lock().unwrap() =
            Some(now + Duration::from_secs_f64(self.config.min_starting_straight_seconds));
        info!("autodrive started");
    }

    pub fn stop_autodrive(&self) {
        self.autodrive_started.store(false, Ordering::Relaxed);
        *self.autodrive_activated_at.lock().unwrap() = None;
        *self.starting_straight_until.lock().unwrap() = None;
        self.go_sign_fired_this_epoch.store(false, Ordering::Relaxed);
        info!("autodrive stopped");
    }

    pub fn enable_remote_control(&self) {
        self.remote_control_enabled.store(true, Ordering::Relaxed);
        self.stop_autodrive();
        info!("remote control enabled");
    }

    pub fn disable_remote_control(&self) {
        self.remote_control_enabled.store(false, Ordering::Relaxed);
        info!("remote control disabled");
    }

    pub fn set_taking_over(&self, value: bool) {
        let mut guard = self.taking_over_until.lock().unwrap();
        *guard = if value {
            Some(Instant::now() + Duration::from_secs_f64(self.config.max_idle_taking_over))
        } else {
            None
        };
    }

    pub fn get_taking_over(&self) -> bool {
        self.taking_over_until
            .lock()
            .unwrap()
            .map(|deadline| Instant::now() < deadline)
            .unwrap_or(false)
    }

    /// Manual drive, preempting whatever the pilot arbitration would
    /// have chosen this tick. Still subject to the starting-straight
    /// safety gate.
    pub fn drive(&self, steering: f64, throttle: f64) -> Result<(), Error> {
        self.set_taking_over(true);
        let command = DriveCommand::SteeringThrottle {
            steering,
            throttle,
            duration: 0.0,
            flipped: false,
            r#override: false,
        };
        let gated = self.apply_starting_straight_gate(command);
        self.dispatcher.submit(wall_now(), gated)?;
        Ok(())
    }

    pub fn start_recording(&self, directory: &Path) -> Result<(), Error> {
        self.recorder.start(directory)
    }

    pub fn stop_recording(&self) {
        self.recorder.stop();
    }

    pub fn is_recording(&self) -> bool {
        self.recorder.is_active()
    }

    fn apply_starting_straight_gate(&self, command: DriveCommand) -> DriveCommand {
        if !self.autodrive_started.load(Ordering::Relaxed) {
            return command;
        }
        let within_window = self
            .starting_straight_until
            .lock()
            .unwrap()
            .map(|deadline| Instant::now() < deadline)
            .unwrap_or(false);
        if !within_window {
            return command;
        }
        match command {
            DriveCommand::SteeringThrottle { throttle, duration, flipped, r#override, .. } => {
                let forced_throttle = if self.config.starting_straight_throttle > 0.0 {
                    self.config.starting_straight_throttle
                } else {
                    throttle
                };
                DriveCommand::SteeringThrottle {
                    steering: 0.0,
                    throttle: forced_throttle,
                    duration,
                    flipped,
                    r#override,
                }
            }
            other @ DriveCommand::Pwm { .. } => other,
        }
    }

    fn handle_go_sign(&self, dashboard: &Dashboard) {
        let prev = {
            let mut last = self.last_ready_to_go.lock().unwrap();
            let prev = *last;
            *last = dashboard.ready_to_go;
            prev
        };

        let rising_edge = matches!(prev, TriState::Unknown | TriState::No) && dashboard.ready_to_go == TriState::Yes;
        if rising_edge
            && !self.go_sign_fired_this_epoch.load(Ordering::Relaxed)
            && !self.remote_control_enabled.load(Ordering::Relaxed)
        {
            self.go_sign_fired_this_epoch.store(true, Ordering::Relaxed);
            self.start_autodrive();
        }
    }

    fn process_tick(&self, dashboard: &Dashboard) {
        if self.autodrive_started.load(Ordering::Relaxed) {
            let expired = self
                .autodrive_activated_at
                .lock()
                .unwrap()
                .map(|activated| activated.elapsed().as_secs_f64() > self.config.max_activation_seconds)
                .unwrap_or(false);
            if expired {
                warn!("autodrive exceeded max_activation_seconds; stopping");
                self.stop_autodrive();
            }
        }

        if self.get_taking_over() {
            self.recorder.record(dashboard, &DriveCommand::stop());
            return;
        }

        let mut winner: Option<DriveCommand> = None;
        for handle in self.pilots.ordered() {
            if let Some(command) =
                handle.wait_for_response(dashboard.timestamp, Duration::from_secs_f64(self.config.response_timeout))
            {
                winner = Some(command);
                break;
            }
        }

        let command = match winner {
            Some(command) => self.apply_starting_straight_gate(command),
            None => DriveCommand::stop(),
        };

        if let Err(e) = self.dispatcher.submit(dashboard.timestamp, command.clone()) {
            warn!(?e, "failed to submit arbitrated command");
        }
        self.recorder.record(dashboard, &command);
    }

    pub fn run_worker(self: &Arc<Self>) {
        info!("arbiter started");
        let mut last_processed: Option<f64> = None;
        let mut last_tick_at = Instant::now();

        while self.lifecycle.is_running() {
            let wait = Duration::from_secs_f64(self.config.dashboard_max_renew_interval);
            match self.dashboard.wait_for_tick_after(last_processed, wait) {
                Some(dash) => {
                    last_processed = Some(dash.timestamp);
                    last_tick_at = Instant::now();
                    self.handle_go_sign(&dash);
                    self.process_tick(&dash);
                }
                None => {
                    if last_tick_at.elapsed().as_secs_f64() > self.config.camera_lag_tolerance_seconds {
                        warn!("dashboard stalled past camera lag tolerance; issuing defensive stop");
                        if let Err(e) = self.dispatcher.submit(wall_now(), DriveCommand::stop()) {
                            warn!(?e, "failed to submit defensive stop");
                        }
                    }
                }
            }
        }
        info!("arbiter stopped");
    }

    pub fn spawn_worker(self: &Arc<Self>) -> JoinHandle<()> {
        let arbiter = self.clone();
        std::thread::spawn(move || arbiter.run_worker())
    }
}

/// Owns every worker and the shared [`LifeCycle`]. `start()`/`stop()`
/// cascade: asking the lifecycle to transition wakes every worker's
/// `is_running()` poll, and `stop()` joins the ones that must finish
/// cleanly before the device handle is released.
pub struct Runtime {
    lifecycle: Arc<LifeCycle>,
    dashboard: Arc<DashboardPipeline>,
    dispatcher: Arc<dispatch::Dispatcher>,
    arbiter: Arc<Arbiter>,
    dashboard_handle: Mutex<Option<JoinHandle<()>>>,
    dispatcher_handle: Mutex<Option<JoinHandle<()>>>,
    arbiter_handle: Mutex<Option<JoinHandle<()>>>,
    pilot_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(
        lifecycle: Arc<LifeCycle>,
        dashboard: Arc<DashboardPipeline>,
        dispatcher: Arc<dispatch::Dispatcher>,
        arbiter: Arc<Arbiter>,
        pilot_handles: Vec<JoinHandle<()>>,
    ) -> Self {
        Self {
            lifecycle,
            dashboard,
            dispatcher,
            arbiter,
            dashboard_handle: Mutex::new(None),
            dispatcher_handle: Mutex::new(None),
            arbiter_handle: Mutex::new(None),
            pilot_handles: Mutex::new(pilot_handles),
        }
    }

    pub fn arbiter(&self) -> &Arc<Arbiter> {
        &self.arbiter
    }

    pub fn start(&self) {
        if !self.lifecycle.begin_start() {
            return;
        }
        self.dispatcher.vibrate(2, 0.15);
        *self.dashboard_handle.lock().unwrap() = Some(self.dashboard.spawn_worker());
        *self.dispatcher_handle.lock().unwrap() = Some(self.dispatcher.spawn_worker());
        *self.arbiter_handle.lock().unwrap() = Some(self.arbiter.spawn_worker());
        self.lifecycle.mark_started();
    }

    /// Idempotent from `INIT`/`STOPPED`. Cascades: ask the lifecycle to
    /// stop (every worker's `is_running()` check now fails), join the
    /// dashboard/dispatcher/arbiter threads, then vibrate. Pilot
    /// workers are daemon-like and are not joined here.
    pub fn stop(&self) {
        if !self.lifecycle.begin_stop() {
            return;
        }
        if let Some(handle) = self.dashboard_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.arbiter_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher_handle.lock().unwrap().take() {
            let _ = handle.join();
        }
        self.pilot_handles.lock().unwrap().clear();
        self.dispatcher.vibrate(1, 0.15);
        self.lifecycle.mark_stopped();
    }
}
