//! Angle / duty-cycle conversion and the per-channel calibration cache.
//!
//! A servo channel is calibrated by the two duty-cycle values that produce 0°
//! and 180°; angles in between map linearly. Duty cycles are raw timer compare
//! values, so converting a pulse width in microseconds needs the PWM frequency
//! and timer resolution ([`PwmTiming`]).

use crate::constants::{
    CHANNEL_CONFIG_SIZE, DEFAULT_PWM_FREQUENCY_HZ, MAX_ANGLE_DEGREES, PWM_RESOLUTION_BITS,
    SERVO_CONFIG_HEADER_SIZE,
};
use crate::error::{ClientError, Result};
use crate::frame::Opcode;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

/// Duty-cycle bounds of one servo channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelCalibration {
    pub channel: u8,
    pub min_duty_cycle: u16,
    pub max_duty_cycle: u16,
}

impl ChannelCalibration {
    pub fn new(channel: u8, min_duty_cycle: u16, max_duty_cycle: u16) -> Result<Self> {
        if min_duty_cycle >= max_duty_cycle {
            return Err(ClientError::invalid(format!(
                "channel {channel}: min duty cycle {min_duty_cycle} must be below max duty cycle {max_duty_cycle}"
            )));
        }
        Ok(Self {
            channel,
            min_duty_cycle,
            max_duty_cycle,
        })
    }

    pub fn span(&self) -> u16 {
        self.max_duty_cycle - self.min_duty_cycle
    }

    /// Duty cycle for `angle` degrees
    pub fn to_duty_cycle(&self, angle: u8) -> Result<u16> {
        if angle > MAX_ANGLE_DEGREES {
            return Err(ClientError::invalid(format!(
                "angle {angle}° outside 0-{MAX_ANGLE_DEGREES}°"
            )));
        }
        let duty = f64::from(angle) / f64::from(MAX_ANGLE_DEGREES) * f64::from(self.span())
            + f64::from(self.min_duty_cycle);
        Ok(duty.round() as u16)
    }

    /// Angle for a duty cycle, clamped to the calibrated range
    pub fn to_angle(&self, duty_cycle: u16) -> u8 {
        let duty = duty_cycle.clamp(self.min_duty_cycle, self.max_duty_cycle);
        let angle = f64::from(duty - self.min_duty_cycle) / f64::from(self.span())
            * f64::from(MAX_ANGLE_DEGREES);
        angle.round() as u8
    }
}

impl fmt::Display for ChannelCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CH{}: {}..{} duty",
            self.channel, self.min_duty_cycle, self.max_duty_cycle
        )
    }
}

/// PWM period and timer resolution of the board
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PwmTiming {
    pub frequency_hz: u32,
    pub resolution_bits: u8,
}

impl Default for PwmTiming {
    fn default() -> Self {
        Self {
            frequency_hz: DEFAULT_PWM_FREQUENCY_HZ,
            resolution_bits: PWM_RESOLUTION_BITS,
        }
    }
}

impl PwmTiming {
    pub fn new(frequency_hz: u32) -> Self {
        Self {
            frequency_hz,
            ..Default::default()
        }
    }

    pub fn period_us(&self) -> f64 {
        1_000_000.0 / f64::from(self.frequency_hz.max(1))
    }

    /// Timer counts per period
    pub fn full_scale(&self) -> f64 {
        2f64.powi(i32::from(self.resolution_bits))
    }

    /// Pulse width in microseconds to raw duty-cycle units, saturating at `u16::MAX`.
    pub fn us_to_duty_cycle(&self, us: u32) -> u16 {
        let duty = f64::from(us) / self.period_us() * self.full_scale();
        duty.round().min(f64::from(u16::MAX)) as u16
    }

    /// Raw duty-cycle units back to a pulse width in microseconds
    pub fn duty_cycle_to_us(&self, duty_cycle: u16) -> u32 {
        (f64::from(duty_cycle) / self.full_scale() * self.period_us()).round() as u32
    }
}

/// [`PwmTiming::us_to_duty_cycle`] at the board's boot frequency (50 Hz, 16-bit)
pub fn us_to_duty_cycle(us: u32) -> u16 {
    PwmTiming::default().us_to_duty_cycle(us)
}

/// One channel as reported by GetConfig
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub channel: u8,
    pub min_duty_cycle: u16,
    pub max_duty_cycle: u16,
    pub current_duty_cycle: u16,
    pub enabled: bool,
}

impl ChannelConfig {
    /// Bounds usable for conversions; `None` while the channel is uncalibrated
    pub fn calibration(&self) -> Option<ChannelCalibration> {
        ChannelCalibration::new(self.channel, self.min_duty_cycle, self.max_duty_cycle).ok()
    }
}

/// Board-wide servo configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ServoConfig {
    pub frequency_hz: u32,
    pub max_duty_cycle: u16,
    pub channels: Vec<ChannelConfig>,
}

impl ServoConfig {
    /// Parse a GetConfig payload
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < SERVO_CONFIG_HEADER_SIZE {
            return Err(ClientError::malformed(
                Opcode::GetConfig,
                format!(
                    "expected at least {SERVO_CONFIG_HEADER_SIZE} bytes, got {}",
                    bytes.len()
                ),
            ));
        }

        let mut buf = bytes;
        let frequency_hz = buf.get_u32_le();
        let max_duty_cycle = buf.get_u16_le();
        let count = buf.get_u8() as usize;

        if buf.remaining() != count * CHANNEL_CONFIG_SIZE {
            return Err(ClientError::malformed(
                Opcode::GetConfig,
                format!(
                    "{count} channel(s) need {} bytes, got {}",
                    count * CHANNEL_CONFIG_SIZE,
                    buf.remaining()
                ),
            ));
        }
        if frequency_hz == 0 {
            return Err(ClientError::malformed(Opcode::GetConfig, "PWM frequency is zero"));
        }

        let mut channels = Vec::with_capacity(count);
        for _ in 0..count {
            let channel = ChannelConfig {
                channel: buf.get_u8(),
                min_duty_cycle: buf.get_u16_le(),
                max_duty_cycle: buf.get_u16_le(),
                current_duty_cycle: buf.get_u16_le(),
                enabled: match buf.get_u8() {
                    0 => false,
                    1 => true,
                    other => {
                        return Err(ClientError::malformed(
                            Opcode::GetConfig,
                            format!("enabled flag must be 0 or 1, got {other}"),
                        ));
                    }
                },
            };
            channels.push(channel);
        }

        Ok(Self {
            frequency_hz,
            max_duty_cycle,
            channels,
        })
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(
            SERVO_CONFIG_HEADER_SIZE + self.channels.len() * CHANNEL_CONFIG_SIZE,
        );
        out.put_u32_le(self.frequency_hz);
        out.put_u16_le(self.max_duty_cycle);
        out.put_u8(self.channels.len() as u8);
        for channel in &self.channels {
            out.put_u8(channel.channel);
            out.put_u16_le(channel.min_duty_cycle);
            out.put_u16_le(channel.max_duty_cycle);
            out.put_u16_le(channel.current_duty_cycle);
            out.put_u8(channel.enabled as u8);
        }
        out.freeze()
    }

    pub fn channel(&self, channel: u8) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.channel == channel)
    }
}

/// Client-side cache of channel calibrations, keyed by channel index.
#[derive(Debug, Clone, Default)]
pub struct CalibrationStore {
    entries: BTreeMap<u8, ChannelCalibration>,
    timing: PwmTiming,
}

impl CalibrationStore {
    pub fn new(timing: PwmTiming) -> Self {
        Self {
            entries: BTreeMap::new(),
            timing,
        }
    }

    pub fn get(&self, channel: u8) -> Result<&ChannelCalibration> {
        self.entries
            .get(&channel)
            .ok_or(ClientError::UnconfiguredChannel(channel))
    }

    pub fn insert(&mut self, calibration: ChannelCalibration) {
        debug!(%calibration, "Caching channel calibration");
        self.entries.insert(calibration.channel, calibration);
    }

    /// Replace the whole cache with what the device reported
    pub fn replace(&mut self, config: &ServoConfig) {
        self.entries = config
            .channels
            .iter()
            .filter_map(ChannelConfig::calibration)
            .map(|c| (c.channel, c))
            .collect();
        // the device reports a frequency only; the timer resolution is ours
        self.timing = PwmTiming {
            frequency_hz: config.frequency_hz,
            ..self.timing
        };
        debug!(
            channels = self.entries.len(),
            frequency_hz = self.timing.frequency_hz,
            "Calibration cache replaced from device config"
        );
    }

    pub fn invalidate(&mut self) {
        self.entries.clear();
    }

    pub fn to_duty_cycle(&self, channel: u8, angle: u8) -> Result<u16> {
        self.get(channel)?.to_duty_cycle(angle)
    }

    pub fn to_angle(&self, channel: u8, duty_cycle: u16) -> Result<u8> {
        Ok(self.get(channel)?.to_angle(duty_cycle))
    }

    pub fn us_to_duty_cycle(&self, us: u32) -> u16 {
        self.timing.us_to_duty_cycle(us)
    }

    pub fn timing(&self) -> PwmTiming {
        self.timing
    }

    /// The only cached channel, if exactly one is cached
    pub fn sole_channel(&self) -> Option<u8> {
        let mut channels = self.entries.keys();
        match (channels.next(), channels.next()) {
            (Some(&channel), None) => Some(channel),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
