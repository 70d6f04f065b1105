//! Device abstraction bundling the motor bus and the cameras: per-wheel
//! PWM, camera snapshot retrieval, and startup/shutdown "vibrate"
//! feedback. This is the only crate that touches `motorbus::Bus`
//! directly; everything upstream talks to [`MotorModel`].

use motorbus::Bus;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};
use types::{TriState, Wheel};

#[derive(Error, Debug)]
pub enum Error {
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct WheelChannels {
    pub anode: u8,
    pub cathode: u8,
    pub enable: u8,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MotorConfig {
    pub i2c_path: String,
    pub i2c_address: u16,
    pub pwm_freq_hz: f64,
    pub min_valid_motor_pwm: f64,
    pub max_valid_motor_pwm: f64,
    pub channels: HashMap<Wheel, WheelChannels>,
    pub cameras: Vec<camera::Config>,
}

impl Default for MotorConfig {
    fn default() -> Self {
        let mut channels = HashMap::new();
        channels.insert(Wheel::FrontLeft, WheelChannels { anode: 0, cathode: 1, enable: 2 });
        channels.insert(Wheel::RearLeft, WheelChannels { anode: 3, cathode: 4, enable: 5 });
        channels.insert(Wheel::FrontRight, WheelChannels { anode: 6, cathode: 7, enable: 8 });
        channels.insert(Wheel::RearRight, WheelChannels { anode: 9, cathode: 10, enable: 11 });

        Self {
            i2c_path: "/dev/i2c-1".to_string(),
            i2c_address: 0x40,
            pwm_freq_hz: 50.0,
            min_valid_motor_pwm: 0.2,
            max_valid_motor_pwm: 1.0,
            channels,
            cameras: vec![camera::Config::default()],
        }
    }
}

struct CameraHandle {
    cache: camera::CameraCache,
    // Capture threads loop forever; there's no cooperative stop signal
    // today, so `end()` drops the handle without joining.
    _join: JoinHandle<()>,
}

pub struct MotorModel {
    config: MotorConfig,
    bus: Option<Bus>,
    cameras: Vec<CameraHandle>,
}

impl MotorModel {
    pub fn new(config: MotorConfig) -> Self {
        Self { config, bus: None, cameras: Vec::new() }
    }

    /// Bring the device up: open the motor bus and start one capture
    /// thread per configured camera.
    ///
    /// `detect` additionally logs what cameras nokhwa can see before
    /// opening them, useful when diagnosing a fresh rig. Unless
    /// `ignore_platform_check` is set, this refuses to run on a
    /// non-Linux host, since the real PCA9685 bus only exists there.
    pub fn begin(&mut self, detect: bool, ignore_platform_check: bool) -> Result<(), Error> {
        if !ignore_platform_check && std::env::consts::OS != "linux" {
            return Err(Error::DeviceUnavailable(
                "motor bus requires Linux I2C; pass ignore_platform_check to run mocked".into(),
            ));
        }

        if detect {
            info!(count = self.config.cameras.len(), "detecting configured cameras");
        }

        let bus = Bus::open(&self.config.i2c_path, self.config.i2c_address, self.config.pwm_freq_hz)
            .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
        self.bus = Some(bus);

        for cam_config in &self.config.cameras {
            let (cache, join) = camera::spawn_capture_thread(cam_config.clone())
                .map_err(|e| Error::DeviceUnavailable(e.to_string()))?;
            self.cameras.push(CameraHandle { cache, _join: join });
        }

        info!(cameras = self.cameras.len(), "motor model started");
        Ok(())
    }

    /// Zero and disable every wheel, then drop the bus.
    pub fn end(&mut self) {
        if self.bus.is_some() {
            for wheel in Wheel::ALL {
                self.set_motor(wheel, 0.0);
            }
        }
        self.bus = None;
        self.cameras.clear();
        info!("motor model stopped");
    }

    /// Map a signed PWM to (anode duty, cathode duty, enable) and write
    /// the three channels. Returns `false` on a transient device
    /// failure rather than propagating; the caller keeps running.
    pub fn set_motor(&mut self, wheel: Wheel, signed_pwm: f64) -> bool {
        let Some(bus) = self.bus.as_mut() else {
            warn!(?wheel, "set_motor called before begin()");
            return false;
        };
        let Some(channels) = self.config.channels.get(&wheel).copied() else {
            warn!(?wheel, "no channel mapping configured for wheel");
            return false;
        };

        let magnitude = signed_pwm.clamp(-1.0, 1.0).abs();
        let enable = magnitude > 0.0;
        let scaled = if enable {
            self.config.min_valid_motor_pwm
                + magnitude * (self.config.max_valid_motor_pwm - self.config.min_valid_motor_pwm)
        } else {
            0.0
        };
        let (anode_duty, cathode_duty) = if signed_pwm >= 0.0 {
            (scaled, 0.0)
        } else {
            (0.0, scaled)
        };

        let anode = bus.set_channel(channels.anode, anode_duty * 100.0, enable);
        let cathode = bus.set_channel(channels.cathode, cathode_duty * 100.0, enable);
        let enable_write = bus.set_channel(channels.enable, if enable { 100.0 } else { 0.0 }, enable);

        if anode.is_err() || cathode.is_err() || enable_write.is_err() {
            warn!(?wheel, "transient motor bus write failure");
            return false;
        }
        true
    }

    /// Latest JPEG-encoded frame from the camera at `index`, or `None`
    /// if no camera is configured at that index or nothing has been
    /// grabbed yet.
    pub fn get_snapshot(&self, index: usize) -> Option<Vec<u8>> {
        let handle = self.cameras.get(index)?;
        let frame = handle.cache.retrieve()?;
        match camera::encode_jpeg(&frame, 80) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                error!(?e, "failed to encode snapshot");
                None
            }
        }
    }

    /// Pulse every wheel briefly as haptic/audible startup or shutdown
    /// feedback.
    pub fn vibrate(&mut self, count: u32, interval_s: f64) {
        const VIBRATE_PWM: f64 = 0.3;
        for _ in 0..count {
            for wheel in Wheel::ALL {
                self.set_motor(wheel, VIBRATE_PWM);
            }
            std::thread::sleep(Duration::from_secs_f64(interval_s));
            for wheel in Wheel::ALL {
                self.set_motor(wheel, 0.0);
            }
            std::thread::sleep(Duration::from_secs_f64(interval_s));
        }
    }

    /// Hardware-level readiness: whether the bus is open and every
    /// configured camera has produced at least one frame. This is
    /// independent of the vision-based "is there a go-sign" reading
    /// that ends up on the dashboard.
    pub fn ready_to_go(&self) -> TriState {
        if self.bus.is_none() {
            return TriState::Unknown;
        }
        if self.cameras.iter().all(|c| c.cache.retrieve().is_some()) {
            TriState::Yes
        } else {
            TriState::No
        }
    }
}
