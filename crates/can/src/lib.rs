//! PCA9685-like 16-channel PWM expander driver.
//!
//! On Linux, talks to the real chip over I2C. On other platforms,
//! provides an in-memory mock so the rest of the runtime can be
//! exercised without hardware.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BusError {
    #[error("i2c error: {0}")]
    Io(String),
    #[error("channel {0} out of range (0-15)")]
    InvalidChannel(u8),
    #[error("not supported on this platform")]
    NotSupported,
}

const MODE1: u8 = 0x00;
const MODE2: u8 = 0x01;
const LED0_ON_L: u8 = 0x06;
const ALL_LED_ON_L: u8 = 0xFA;
const ALL_LED_ON_H: u8 = 0xFB;
const ALL_LED_OFF_L: u8 = 0xFC;
const ALL_LED_OFF_H: u8 = 0xFD;
const PRESCALE: u8 = 0xFE;

const MODE1_AI: u8 = 1 << 5;
const MODE1_SLEEP: u8 = 1 << 4;
const MODE1_ALLCALL: u8 = 1 << 0;
const MODE2_OUTDRV: u8 = 1 << 2;

const FULL_OFF_BIT: u8 = 0x10;

/// Current on/off register pair for one channel, as cached in software.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ChannelRegs {
    on: u16,
    off: u16,
}

fn prescale_for(freq_hz: f64) -> u8 {
    // Per the datasheet: prescale = round(osc / 4096 / freq) - 1, osc = 25MHz.
    let raw = 25_000_000.0 / 4096.0 / freq_hz - 1.0;
    raw.round().clamp(3.0, 255.0) as u8
}

fn duty_to_12bit(duty_percent: f64) -> u16 {
    let clamped = duty_percent.clamp(0.0, 100.0);
    (4095.0 / 100.0 * clamped).round() as u16
}

fn channel_base(channel: u8) -> Result<u8, BusError> {
    if channel > 15 {
        return Err(BusError::InvalidChannel(channel));
    }
    Ok(LED0_ON_L + channel * 4)
}

#[cfg(target_os = "linux")]
mod platform {
    use super::*;
    use i2cdev::core::I2CDevice;
    use i2cdev::linux::LinuxI2CDevice;
    use std::collections::HashMap;
    use std::thread::sleep;
    use std::time::Duration;

    /// Real PCA9685 bus over Linux I2C.
    pub struct Bus {
        dev: LinuxI2CDevice,
        cache: HashMap<u8, ChannelRegs>,
    }

    impl Bus {
        pub fn open(i2c_path: &str, address: u16, pwm_freq_hz: f64) -> Result<Self, BusError> {
            let dev = LinuxI2CDevice::new(i2c_path, address).map_err(|e| BusError::Io(e.to_string()))?;
            let mut bus = Self { dev, cache: HashMap::new() };
            bus.reset(pwm_freq_hz)?;
            Ok(bus)
        }

        fn write_byte(&mut self, reg: u8, value: u8) -> Result<(), BusError> {
            self.dev
                .smbus_write_byte_data(reg, value)
                .map_err(|e| BusError::Io(e.to_string()))
        }

        pub fn reset(&mut self, pwm_freq_hz: f64) -> Result<(), BusError> {
            self.cache.clear();
            self.write_byte(ALL_LED_ON_L, 0)?;
            self.write_byte(ALL_LED_ON_H, 0)?;
            self.write_byte(ALL_LED_OFF_L, 0)?;
            self.write_byte(ALL_LED_OFF_H, 0)?;

            self.write_byte(MODE1, MODE1_SLEEP)?;
            sleep(Duration::from_millis(5));
            self.write_byte(PRESCALE, prescale_for(pwm_freq_hz))?;
            self.write_byte(MODE2, MODE2_OUTDRV)?;
            self.write_byte(MODE1, MODE1_ALLCALL | MODE1_AI)?;
            sleep(Duration::from_millis(5));
            Ok(())
        }

        pub fn set_channel(&mut self, channel: u8, duty_percent: f64, on: bool) -> Result<(), BusError> {
            let base = channel_base(channel)?;
            let duty = duty_to_12bit(duty_percent);
            let mut off = duty;
            if !on {
                off |= FULL_OFF_BIT as u16;
            }
            let regs = ChannelRegs { on: 0, off };
            if self.cache.get(&channel) == Some(&regs) {
                return Ok(());
            }
            self.write_byte(base, (regs.on & 0xff) as u8)?;
            self.write_byte(base + 1, (regs.on >> 8) as u8)?;
            self.write_byte(base + 2, (regs.off & 0xff) as u8)?;
            self.write_byte(base + 3, (regs.off >> 8) as u8)?;
            self.cache.insert(channel, regs);
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod platform {
    use super::*;
    use std::collections::HashMap;
    use tracing::debug;

    /// In-memory mock bus for development off Linux.
    pub struct Bus {
        cache: HashMap<u8, ChannelRegs>,
        freq_hz: f64,
    }

    impl Bus {
        pub fn open(i2c_path: &str, address: u16, pwm_freq_hz: f64) -> Result<Self, BusError> {
            tracing::warn!(i2c_path, address, "using mock motor bus (not on Linux)");
            Ok(Self { cache: HashMap::new(), freq_hz: pwm_freq_hz })
        }

        pub fn reset(&mut self, pwm_freq_hz: f64) -> Result<(), BusError> {
            self.cache.clear();
            self.freq_hz = pwm_freq_hz;
            Ok(())
        }

        pub fn set_channel(&mut self, channel: u8, duty_percent: f64, on: bool) -> Result<(), BusError> {
            let _ = channel_base(channel)?;
            let mut off = duty_to_12bit(duty_percent);
            if !on {
                off |= FULL_OFF_BIT as u16;
            }
            let regs = ChannelRegs { on: 0, off };
            debug!(channel, duty_percent, on, freq_hz = self.freq_hz, "mock bus channel write");
            self.cache.insert(channel, regs);
            Ok(())
        }
    }
}

pub use platform::Bus;
