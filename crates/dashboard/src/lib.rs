//! Periodic dashboard acquisition and the priority-ordered editor and
//! observer chains that run over each tick.
//!
//! One worker runs at a target cadence (`1 / frame_rate`): acquire the
//! latest camera frame, build a [`types::Dashboard`] record, run every
//! registered editor in priority order (mutating the record, any of
//! which may short-circuit the rest), then run every observer over the
//! finished record (short-circuiting only the observer chain).

use camera::CameraCache;
use state::LifeCycle;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tracing::{info, warn};
use types::{Dashboard, Frame, Priority, SortKey, TrackViewInfo};

/// Mutates a Dashboard in place before it is broadcast. Returning
/// `true` short-circuits the rest of the editor chain.
pub trait Editor: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> Priority {
        Priority::default()
    }
    fn edit(&self, dashboard: &mut Dashboard) -> bool;
}

/// Reacts to a finished Dashboard. Returning `true` short-circuits the
/// rest of the observer chain (not the editor chain, already done).
pub trait Observer: Send + Sync {
    fn name(&self) -> &str;
    fn priority(&self) -> Priority {
        Priority::default()
    }
    fn observe(&self, dashboard: &Dashboard) -> bool;
}

/// A source of monotonic seconds. Abstracted so tests can drive the
/// pipeline with a scripted clock instead of the wall clock.
pub trait Clock: Send + Sync {
    fn now(&self) -> f64;
}

pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self { epoch: Instant::now() }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }
}

/// Priority-bucketed list with lazy reflattening: registering a new
/// entry sets a dirty flag instead of re-sorting immediately, so churn
/// during a tick doesn't block whatever's mid-iteration.
struct Registry<T: Clone> {
    entries: Vec<(SortKey, T)>,
    flattened: Vec<(SortKey, T)>,
    dirty: bool,
    next_index: u64,
}

impl<T: Clone> Registry<T> {
    fn new() -> Self {
        Self { entries: Vec::new(), flattened: Vec::new(), dirty: false, next_index: 0 }
    }

    fn register(&mut self, priority: Priority, item: T) {
        let key = SortKey { priority, insertion_index: self.next_index };
        self.next_index += 1;
        self.entries.push((key, item));
        self.dirty = true;
    }

    fn flatten(&mut self) -> &[(SortKey, T)] {
        if self.dirty {
            self.flattened = self.entries.clone();
            self.flattened.sort_by(|a, b| a.0.cmp(&b.0));
            self.dirty = false;
        }
        &self.flattened
    }
}

pub struct DashboardPipeline {
    target_interval: Duration,
    editors: Mutex<Registry<Arc<dyn Editor>>>,
    observers: Mutex<Registry<Arc<dyn Observer>>>,
    camera: CameraCache,
    clock: Arc<dyn Clock>,
    flipped: bool,
    started: Arc<AtomicBool>,
    lifecycle: Arc<LifeCycle>,
    latest: Mutex<Option<Arc<Dashboard>>>,
    tick_cond: Condvar,
    rate_window: Mutex<VecDeque<f64>>,
}

impl DashboardPipeline {
    pub fn new(
        frame_rate: f64,
        camera: CameraCache,
        flipped: bool,
        started: Arc<AtomicBool>,
        lifecycle: Arc<LifeCycle>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            target_interval: Duration::from_secs_f64(1.0 / frame_rate.max(0.1)),
            editors: Mutex::new(Registry::new()),
            observers: Mutex::new(Registry::new()),
            camera,
            clock,
            flipped,
            started,
            lifecycle,
            latest: Mutex::new(None),
            tick_cond: Condvar::new(),
            rate_window: Mutex::new(VecDeque::new()),
        })
    }

    pub fn register_editor(&self, priority: Priority, editor: Arc<dyn Editor>) {
        self.editors.lock().unwrap().register(priority, editor);
    }

    pub fn register_observer(&self, priority: Priority, observer: Arc<dyn Observer>) {
        self.observers.lock().unwrap().register(priority, observer);
    }

    pub fn latest(&self) -> Option<Arc<Dashboard>> {
        self.latest.lock().unwrap().clone()
    }

    /// Block until a tick newer than `after_timestamp` is published, or
    /// `timeout` elapses.
    pub fn wait_for_tick_after(&self, after_timestamp: Option<f64>, timeout: Duration) -> Option<Arc<Dashboard>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.latest.lock().unwrap();
        loop {
            if let Some(dashboard) = guard.as_ref() {
                if after_timestamp.map(|t| dashboard.timestamp > t).unwrap_or(true) {
                    return Some(dashboard.clone());
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, result) = self.tick_cond.wait_timeout(guard, deadline - now).unwrap();
            guard = next;
            if result.timed_out() {
                return match guard.as_ref() {
                    Some(dashboard) if after_timestamp.map(|t| dashboard.timestamp > t).unwrap_or(true) => {
                        Some(dashboard.clone())
                    }
                    _ => None,
                };
            }
        }
    }

    fn estimate_frame_rate(&self, now: f64) -> f64 {
        let mut window = self.rate_window.lock().unwrap();
        window.push_back(now);
        while let Some(&front) = window.front() {
            if now - front > 1.0 {
                window.pop_front();
            } else {
                break;
            }
        }
        let span = now - *window.front().unwrap_or(&now);
        if span <= 0.0 {
            0.0
        } else {
            window.len() as f64 / span
        }
    }

    fn tick(&self) -> Dashboard {
        let started_at = self.clock.now();
        let frame = self.camera.retrieve();
        let frame_rate = self.estimate_frame_rate(started_at);

        let mut dashboard = Dashboard::new(started_at, frame, frame_rate);
        dashboard.started = self.started.load(Ordering::Relaxed);
        dashboard.flipped = self.flipped;

        {
            let mut editors = self.editors.lock().unwrap();
            for (_, editor) in editors.flatten() {
                if editor.edit(&mut dashboard) {
                    break;
                }
            }
        }

        {
            let mut observers = self.observers.lock().unwrap();
            for (_, observer) in observers.flatten() {
                if observer.observe(&dashboard) {
                    break;
                }
            }
        }

        dashboard.last_process_time = self.clock.now() - started_at;
        dashboard
    }

    pub fn run_worker(self: &Arc<Self>) {
        info!("dashboard pipeline started");
        while self.lifecycle.is_running() {
            let tick_start = Instant::now();
            let dashboard = self.tick();

            {
                let mut latest = self.latest.lock().unwrap();
                *latest = Some(Arc::new(dashboard));
                self.tick_cond.notify_all();
            }

            let elapsed = tick_start.elapsed();
            if elapsed < self.target_interval {
                std::thread::sleep(self.target_interval - elapsed);
            } else {
                warn!(?elapsed, budget = ?self.target_interval, "dashboard tick overran its cadence");
            }
        }
        info!("dashboard pipeline stopped");
    }

    pub fn spawn_worker(self: &Arc<Self>) -> std::thread::JoinHandle<()> {
        let pipeline = self.clone();
        std::thread::spawn(move || pipeline.run_worker())
    }
}

/// Crops the bottom band of each frame into `track_view`/`track_view_info`,
/// the region the rest of the runtime treats as road surface. Runs
/// independently of go-sign detection: neither editor gates the other.
pub struct TrackViewEditor {
    top_fraction: f64,
    bottom_fraction: f64,
}

impl TrackViewEditor {
    pub fn new(top_fraction: f64, bottom_fraction: f64) -> Self {
        Self { top_fraction, bottom_fraction }
    }
}

impl Default for TrackViewEditor {
    /// Bottom 45% of the frame, the band the reference rig's camera
    /// mount keeps pointed at the track surface.
    fn default() -> Self {
        Self::new(0.55, 1.00)
    }
}

impl Editor for TrackViewEditor {
    fn name(&self) -> &str {
        "track_view"
    }

    fn edit(&self, dashboard: &mut Dashboard) -> bool {
        let Some(frame) = dashboard.frame.as_ref() else {
            return false;
        };
        let y_start = (self.top_fraction * frame.height as f64).round() as i32;
        let y_stop = (self.bottom_fraction * frame.height as f64).round() as i32;
        dashboard.track_view = crop_rows(frame, y_start, y_stop);
        dashboard.track_view_info = Some(TrackViewInfo { y_start, y_stop, heading_deg: None });
        false
    }
}

/// Crops rows `[y_start, y_stop)` out of an RGB8 frame. `None` if the
/// range is empty or falls outside the frame.
fn crop_rows(frame: &Frame, y_start: i32, y_stop: i32) -> Option<Frame> {
    let y_start = y_start.clamp(0, frame.height as i32) as u32;
    let y_stop = y_stop.clamp(0, frame.height as i32) as u32;
    if y_stop <= y_start {
        return None;
    }
    let row_bytes = frame.width as usize * 3;
    let start = y_start as usize * row_bytes;
    let end = y_stop as usize * row_bytes;
    if end > frame.data.len() {
        return None;
    }
    let cropped = frame.data[start..end].to_vec();
    Some(Frame::new(cropped, frame.width, y_stop - y_start, frame.timestamp_ms))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    struct ScriptedClock {
        micros: AtomicU64,
    }

    impl ScriptedClock {
        fn new() -> Self {
            Self { micros: AtomicU64::new(0) }
        }
        fn advance(&self, secs: f64) {
            self.micros.fetch_add((secs * 1_000_000.0) as u64, Ordering::SeqCst);
        }
    }

    impl Clock for ScriptedClock {
        fn now(&self) -> f64 {
            self.micros.load(Ordering::SeqCst) as f64 / 1_000_000.0
        }
    }

    struct ShortCircuitEditor {
        stamp: &'static str,
    }

    impl Editor for ShortCircuitEditor {
        fn name(&self) -> &str {
            self.stamp
        }
        fn priority(&self) -> Priority {
            Priority::HIGH
        }
        fn edit(&self, dashboard: &mut Dashboard) -> bool {
            dashboard.track_view_info = Some(types::TrackViewInfo { y_start: 0, y_stop: 1, heading_deg: None });
            true
        }
    }

    struct NeverRunsEditor;
    impl Editor for NeverRunsEditor {
        fn name(&self) -> &str {
            "never"
        }
        fn priority(&self) -> Priority {
            Priority::LOW
        }
        fn edit(&self, dashboard: &mut Dashboard) -> bool {
            dashboard.focused_rect = Some(types::Rect { x: 0, y: 0, width: 1, height: 1 });
            false
        }
    }

    fn camera_with_frame() -> CameraCache {
        CameraCache::new(Duration::from_secs(5))
    }

    #[test]
    fn higher_priority_editor_short_circuits_lower_priority_one() {
        let clock = Arc::new(ScriptedClock::new());
        let lifecycle = Arc::new(LifeCycle::new("test"));
        lifecycle.begin_start();
        lifecycle.mark_started();
        let pipeline = DashboardPipeline::new(
            10.0,
            camera_with_frame(),
            false,
            Arc::new(AtomicBool::new(false)),
            lifecycle,
            clock,
        );
        pipeline.register_editor(Priority::HIGH, Arc::new(ShortCircuitEditor { stamp: "hi" }));
        pipeline.register_editor(Priority::LOW, Arc::new(NeverRunsEditor));

        let dashboard = pipeline.tick();
        assert!(dashboard.track_view_info.is_some());
        assert!(dashboard.focused_rect.is_none());
    }

    #[test]
    fn wait_for_tick_after_returns_none_before_any_publish() {
        let clock = Arc::new(SystemClock::new());
        let lifecycle = Arc::new(LifeCycle::new("test"));
        let pipeline = DashboardPipeline::new(
            10.0,
            camera_with_frame(),
            false,
            Arc::new(AtomicBool::new(false)),
            lifecycle,
            clock,
        );
        assert!(pipeline.wait_for_tick_after(None, Duration::from_millis(20)).is_none());
    }

    #[test]
    fn wait_for_tick_after_times_out_to_none_once_caller_has_seen_the_latest_tick() {
        let clock = Arc::new(SystemClock::new());
        let lifecycle = Arc::new(LifeCycle::new("test"));
        let pipeline = DashboardPipeline::new(
            10.0,
            camera_with_frame(),
            false,
            Arc::new(AtomicBool::new(false)),
            lifecycle,
            clock,
        );
        let first = pipeline.tick();
        let timestamp = first.timestamp;
        *pipeline.latest.lock().unwrap() = Some(Arc::new(first));

        // No newer tick ever arrives; the caller already has `timestamp`,
        // so a timed-out wait must return None, not the stale tick.
        assert!(pipeline.wait_for_tick_after(Some(timestamp), Duration::from_millis(30)).is_none());
    }

    #[test]
    fn track_view_editor_crops_bottom_band_and_never_short_circuits() {
        let width = 4u32;
        let height = 10u32;
        let data: Vec<u8> = (0..(width * height * 3) as usize).map(|i| i as u8).collect();
        let frame = types::Frame::new(data, width, height, 0);
        let mut dashboard = Dashboard::new(0.0, Some(frame), 10.0);

        let editor = TrackViewEditor::default();
        assert!(!editor.edit(&mut dashboard));

        let info = dashboard.track_view_info.expect("track_view_info set");
        assert_eq!(info.y_start, 6);
        assert_eq!(info.y_stop, 10);
        let cropped = dashboard.track_view.expect("track_view set");
        assert_eq!(cropped.height, 4);
        assert_eq!(cropped.width, width);
    }
}
