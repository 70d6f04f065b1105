//! Steering/throttle to per-wheel PWM mapping.
//!
//! [`map`] is a pure function: no I/O, no shared state, no clock. It
//! takes a steering angle in degrees, a throttle in `[-1, 1]`, the
//! `flipped` flag carried on the drive command itself, and a
//! [`KinematicConfig`], and returns the four wheel PWMs to send to the
//! motor controller.

use serde::{Deserialize, Serialize};
use types::WheelPwms;

/// Steering angles at or beyond this magnitude (in either direction)
/// are treated as zero: below the deadband a tiny joystick jitter
/// shouldn't perturb a commanded-straight drive.
const STEERING_DEADBAND_DEG: f64 = 0.005;

/// Throttle magnitudes below this are treated as a stop.
const THROTTLE_DEADBAND: f64 = 0.002;

/// Steering magnitudes at or below this drive all four wheels at the
/// same PWM as a full stop (no differential steering effort).
const STRAIGHT_DEADBAND_DEG: f64 = 5.0;

/// Steering magnitudes at or beyond this are a spin-in-place turn.
const SPIN_THRESHOLD_DEG: f64 = 90.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KinematicConfig {
    /// When true, use the low-friction two-segment shaping curve
    /// (knee at `sharp_turning_angle`, linear ramp to `sharp_turning_min_pwm`
    /// beyond it). When false, use the plain linear `(90 - |steering|) / 90`
    /// outer-wheel falloff.
    pub steering_with_low_friction: bool,
    /// Steering magnitude, in degrees, at which the low-friction curve's
    /// knee sits.
    pub sharp_turning_angle: f64,
    /// Inner-wheel PWM magnitude at the knee, ramping to 1.0 at 90 degrees.
    pub sharp_turning_min_pwm: f64,
    /// Invert the sign of steering before anything else runs. Applied
    /// before `flipped`.
    pub steering_inversed: bool,
}

impl Default for KinematicConfig {
    fn default() -> Self {
        Self {
            steering_with_low_friction: true,
            sharp_turning_angle: 40.0,
            sharp_turning_min_pwm: 0.67,
            steering_inversed: false,
        }
    }
}

/// Map a steering/throttle pair to per-wheel PWMs.
///
/// `steering_deg` is expected in `[-90, 90]`; `throttle` in `[-1, 1]`.
/// `flipped` mirrors both steering and throttle after `steering_inversed`
/// has already been applied, matching a camera or chassis mounted
/// back-to-front.
pub fn map(steering_deg: f64, throttle: f64, flipped: bool, config: &KinematicConfig) -> WheelPwms {
    let mut steering = steering_deg;
    let mut throttle = throttle;

    if config.steering_inversed {
        steering = -steering;
    }
    if flipped {
        steering = -steering;
        throttle = -throttle;
    }

    if throttle.abs() < THROTTLE_DEADBAND {
        return WheelPwms::zero();
    }
    if steering.abs() <= STEERING_DEADBAND_DEG {
        steering = 0.0;
    }

    if steering == 0.0 || steering.abs() <= STRAIGHT_DEADBAND_DEG {
        return wheels_equal(throttle);
    }

    if steering >= SPIN_THRESHOLD_DEG {
        return wheels_from(throttle, throttle, -throttle, -throttle);
    }
    if steering <= -SPIN_THRESHOLD_DEG {
        return wheels_from(-throttle, -throttle, throttle, throttle);
    }

    let (inner, outer) = shape(steering, throttle, config);
    wheels_from_side(steering, inner, outer)
}

/// All four wheels at the same PWM (straight drive or sub-deadband turn).
fn wheels_equal(throttle: f64) -> WheelPwms {
    WheelPwms::new(throttle, throttle, throttle, throttle)
}

fn wheels_from(fl: f64, rl: f64, fr: f64, rr: f64) -> WheelPwms {
    WheelPwms::new(fl, rl, fr, rr)
}

/// Compute the (signed) inner-side and outer-side PWM for a steering
/// magnitude strictly between the straight deadband and the spin
/// threshold.
fn shape(steering: f64, throttle: f64, config: &KinematicConfig) -> (f64, f64) {
    let abs_steering = steering.abs();

    if !config.steering_with_low_friction {
        let inner = throttle;
        let outer = throttle * (SPIN_THRESHOLD_DEG - abs_steering) / SPIN_THRESHOLD_DEG;
        return (inner, outer);
    }

    if abs_steering <= config.sharp_turning_angle {
        let pwm_diff = abs_steering / config.sharp_turning_angle;
        let inner = throttle;
        let outer_mag = (throttle.abs() - pwm_diff).max(0.0);
        let outer = outer_mag * throttle.signum();
        (inner, outer)
    } else {
        let span = SPIN_THRESHOLD_DEG - config.sharp_turning_angle;
        let frac = (abs_steering - config.sharp_turning_angle) / span;
        let inner_mag = config.sharp_turning_min_pwm + frac * (1.0 - config.sharp_turning_min_pwm);
        let inner = inner_mag * throttle.signum();
        let outer = -0.01 * throttle.signum();
        (inner, outer)
    }
}

/// Assign inner/outer PWM to wheels by steering sign: positive steering
/// (turning right) puts the outer/braking side on the right wheels,
/// negative steering puts it on the left wheels.
fn wheels_from_side(steering: f64, inner: f64, outer: f64) -> WheelPwms {
    if steering > 0.0 {
        wheels_from(inner, inner, outer, outer)
    } else {
        wheels_from(outer, outer, inner, inner)
    }
}
