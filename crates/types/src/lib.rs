//! Shared types and message definitions for the car control runtime.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// One wheel of the 4-wheel chassis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Wheel {
    FrontLeft,
    RearLeft,
    FrontRight,
    RearRight,
}

impl Wheel {
    pub const ALL: [Wheel; 4] = [
        Wheel::FrontLeft,
        Wheel::RearLeft,
        Wheel::FrontRight,
        Wheel::RearRight,
    ];

    pub fn index(&self) -> usize {
        match self {
            Self::FrontLeft => 0,
            Self::RearLeft => 1,
            Self::FrontRight => 2,
            Self::RearRight => 3,
        }
    }

    pub fn from_index(i: usize) -> Option<Self> {
        match i {
            0 => Some(Self::FrontLeft),
            1 => Some(Self::RearLeft),
            2 => Some(Self::FrontRight),
            3 => Some(Self::RearRight),
            _ => None,
        }
    }
}

/// Signed PWM for all four wheels, always clamped to [-1, 1].
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct WheelPwms {
    pub fl: f64,
    pub rl: f64,
    pub fr: f64,
    pub rr: f64,
}

impl WheelPwms {
    pub fn new(fl: f64, rl: f64, fr: f64, rr: f64) -> Self {
        Self {
            fl: fl.clamp(-1.0, 1.0),
            rl: rl.clamp(-1.0, 1.0),
            fr: fr.clamp(-1.0, 1.0),
            rr: rr.clamp(-1.0, 1.0),
        }
    }

    pub fn zero() -> Self {
        Self::default()
    }

    pub fn get(&self, wheel: Wheel) -> f64 {
        match wheel {
            Wheel::FrontLeft => self.fl,
            Wheel::RearLeft => self.rl,
            Wheel::FrontRight => self.fr,
            Wheel::RearRight => self.rr,
        }
    }

    pub fn max_abs(&self) -> f64 {
        [self.fl, self.rl, self.fr, self.rr]
            .into_iter()
            .fold(0.0_f64, |acc, v| acc.max(v.abs()))
    }
}

/// Pilot priority. Higher sorts first; ties break by declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Priority(u8);

impl Priority {
    pub const LOW: Priority = Priority(1);
    pub const NORMAL: Priority = Priority(5);
    pub const HIGH: Priority = Priority(9);

    /// Clamp an arbitrary integer into the accepted [1, 9] range.
    pub fn clamped(value: i64) -> Self {
        Priority(value.clamp(1, 9) as u8)
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// A registered handler (editor, observer, or pilot) plus its effective
/// sort key: `(-priority, insertion_index)`, so HIGH priority runs first
/// and ties break by declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKey {
    pub priority: Priority,
    pub insertion_index: u64,
}

impl PartialOrd for SortKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SortKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Descending priority, ascending insertion index.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| self.insertion_index.cmp(&other.insertion_index))
    }
}

/// Tri-state readiness signal produced by go-sign detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TriState {
    #[default]
    Unknown,
    Yes,
    No,
}

/// An axis-aligned rectangle in frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

/// Heading/vertical-band info attached by the track-view editor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrackViewInfo {
    pub y_start: i32,
    pub y_stop: i32,
    pub heading_deg: Option<f64>,
}

/// A captured image frame, decoupled from any particular capture backend.
/// Cheaply cloneable: `data` is reference-counted.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    /// Capture timestamp in milliseconds since UNIX epoch.
    pub timestamp_ms: u64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32, timestamp_ms: u64) -> Self {
        Self {
            data: Arc::from(data),
            width,
            height,
            timestamp_ms,
        }
    }
}

/// The per-tick immutable snapshot fed to editors, observers, and pilots.
///
/// Built fresh by the DashboardPipeline each tick; editors may add the
/// optional fields below before the record is broadcast. Once broadcast
/// a Dashboard is never mutated again — it is handed out as `Arc<Dashboard>`.
#[derive(Debug, Clone)]
pub struct Dashboard {
    /// Monotonic seconds since runtime start.
    pub timestamp: f64,
    pub frame: Option<Frame>,
    pub frame_width: u32,
    pub frame_height: u32,
    pub frame_rate: f64,
    pub last_process_time: f64,
    pub ready_to_go: TriState,
    pub started: bool,
    pub flipped: bool,
    pub track_view: Option<Frame>,
    pub track_view_info: Option<TrackViewInfo>,
    pub focused_rect: Option<Rect>,
    pub focused_nr_rect: Option<Rect>,
}

impl Dashboard {
    pub fn new(timestamp: f64, frame: Option<Frame>, frame_rate: f64) -> Self {
        let (frame_width, frame_height) = frame
            .as_ref()
            .map(|f| (f.width, f.height))
            .unwrap_or((0, 0));
        Self {
            timestamp,
            frame,
            frame_width,
            frame_height,
            frame_rate,
            last_process_time: 0.0,
            ready_to_go: TriState::Unknown,
            started: false,
            flipped: false,
            track_view: None,
            track_view_info: None,
            focused_rect: None,
            focused_nr_rect: None,
        }
    }
}

/// A proposed or accepted drive command: either steering/throttle, or a
/// fully explicit per-wheel PWM set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DriveCommand {
    SteeringThrottle {
        /// Degrees, [-90, 90].
        steering: f64,
        /// [-1, 1].
        throttle: f64,
        /// Seconds, [0, 5]; 0 means "until superseded".
        #[serde(default)]
        duration: f64,
        #[serde(default)]
        flipped: bool,
        #[serde(default)]
        r#override: bool,
    },
    Pwm {
        #[serde(flatten)]
        pwms: WheelPwms,
        #[serde(default)]
        duration: f64,
        #[serde(default)]
        r#override: bool,
    },
}

impl DriveCommand {
    pub fn stop() -> Self {
        DriveCommand::SteeringThrottle {
            steering: 0.0,
            throttle: 0.0,
            duration: 0.0,
            flipped: false,
            r#override: false,
        }
    }

    pub fn is_override(&self) -> bool {
        match self {
            DriveCommand::SteeringThrottle { r#override, .. } => *r#override,
            DriveCommand::Pwm { r#override, .. } => *r#override,
        }
    }

    /// True when the command is well-formed per §7 PilotMalformed: a
    /// `Pwm` command always qualifies, a `SteeringThrottle` command
    /// must carry finite steering and throttle.
    pub fn is_well_formed(&self) -> bool {
        match self {
            DriveCommand::SteeringThrottle { steering, throttle, .. } => {
                steering.is_finite() && throttle.is_finite()
            }
            DriveCommand::Pwm { pwms, .. } => {
                [pwms.fl, pwms.rl, pwms.fr, pwms.rr].iter().all(|v| v.is_finite())
            }
        }
    }
}

/// The kind of device call a DispatcherRequest ultimately performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    Drive,
    DrivePwm,
}

/// A queued (and potentially coalesced) request to actuate the motor model.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherRequest {
    pub created: f64,
    pub updated: f64,
    pub count: u32,
    pub kind: RequestKind,
    pub params: DriveCommand,
}

impl DispatcherRequest {
    pub fn new(now: f64, command: DriveCommand) -> Self {
        let kind = match &command {
            DriveCommand::SteeringThrottle { .. } => RequestKind::Drive,
            DriveCommand::Pwm { .. } => RequestKind::DrivePwm,
        };
        Self {
            created: now,
            updated: now,
            count: 1,
            kind,
            params: command,
        }
    }

    /// Two requests coalesce when their kind and params match exactly.
    pub fn matches(&self, command: &DriveCommand) -> bool {
        &self.params == command
    }

    pub fn coalesce(&mut self, now: f64) {
        self.count += 1;
        self.updated = now;
    }
}

/// The contract an autonomous pilot module implements.
///
/// `inquire` is invoked at most once per dashboard tick (keyed by
/// `Dashboard::timestamp`) and must return within the runtime's
/// `response_timeout` or it will be skipped for that tick (see the
/// `pilot` crate's runner). `edit` is optional; pilots that don't
/// contribute to dashboard editing should leave it at the default.
pub trait Pilot: Send + Sync {
    fn name(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    fn inquire(&self, dashboard: &Dashboard, last_result: Option<&DriveCommand>) -> Option<DriveCommand>;

    /// Mutate the in-flight dashboard. Returning `true` short-circuits
    /// the remaining editor chain for this tick.
    fn edit(&self, _dashboard: &mut Dashboard) -> bool {
        false
    }
}
