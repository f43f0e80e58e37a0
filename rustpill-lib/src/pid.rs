use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use zerocopy::byteorder::little_endian::F32;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Closed-loop control is running
pub const PID_FLAG_ENABLED: u8 = 0x01;
/// Constants were written but `RecalcPi` has not committed them yet
pub const PID_FLAG_STAGED: u8 = 0x02;

/// GetPidVals payload as laid out on the wire (25 bytes)
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
pub struct PidValuesRaw {
    pub kp: F32,
    pub ki: F32,
    pub kd: F32,
    pub setpoint: F32,
    pub measured_value: F32, // latest heater sensor reading
    pub output: F32,         // controller output, per-mille duty
    pub flags: u8,
}

/// Snapshot of the heater controller
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidValues {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    pub setpoint: f32,
    pub measured_value: f32,
    pub output: f32,
    pub is_enabled: bool,
    /// The device holds constants that a `recalc_pi` has not committed yet
    pub constants_staged: bool,
}

impl From<PidValuesRaw> for PidValues {
    fn from(raw: PidValuesRaw) -> Self {
        Self {
            kp: raw.kp.get(),
            ki: raw.ki.get(),
            kd: raw.kd.get(),
            setpoint: raw.setpoint.get(),
            measured_value: raw.measured_value.get(),
            output: raw.output.get(),
            is_enabled: raw.flags & PID_FLAG_ENABLED != 0,
            constants_staged: raw.flags & PID_FLAG_STAGED != 0,
        }
    }
}

impl From<PidValues> for PidValuesRaw {
    fn from(values: PidValues) -> Self {
        let mut flags = 0;
        if values.is_enabled {
            flags |= PID_FLAG_ENABLED;
        }
        if values.constants_staged {
            flags |= PID_FLAG_STAGED;
        }
        PidValuesRaw {
            kp: F32::new(values.kp),
            ki: F32::new(values.ki),
            kd: F32::new(values.kd),
            setpoint: F32::new(values.setpoint),
            measured_value: F32::new(values.measured_value),
            output: F32::new(values.output),
            flags,
        }
    }
}

impl PidValues {
    /// The constants currently driving the controller
    pub fn constants(&self) -> PidConstants {
        PidConstants {
            kp: self.kp,
            ki: self.ki,
            kd: self.kd,
        }
    }

    /// Distance from the target, positive when the heater is below it
    pub fn error(&self) -> f32 {
        self.setpoint - self.measured_value
    }
}

impl fmt::Display for PidValues {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "kp: {:.4}, ki: {:.4}, kd: {:.4}, setpoint: {:.1}, measured: {:.1}, output: {:.1}, enabled: {}",
            self.kp, self.ki, self.kd, self.setpoint, self.measured_value, self.output, self.is_enabled
        )?;
        if self.constants_staged {
            write!(f, " (staged constants pending)")?;
        }
        Ok(())
    }
}

/// Controller gains. All three must be finite and non-negative.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PidConstants {
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
}

impl PidConstants {
    pub fn new(kp: f32, ki: f32, kd: f32) -> Result<Self> {
        let constants = Self { kp, ki, kd };
        constants.validate()?;
        Ok(constants)
    }

    /// PI-only gains, which is all the current firmware runs
    pub fn pi(kp: f32, ki: f32) -> Result<Self> {
        Self::new(kp, ki, 0.0)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, value) in [("kp", self.kp), ("ki", self.ki), ("kd", self.kd)] {
            if !value.is_finite() || value < 0.0 {
                return Err(ClientError::invalid(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        Ok(())
    }

    pub fn has_derivative(&self) -> bool {
        self.kd != 0.0
    }
}

/// Host-side view of the two-phase constant update.
///
/// `set_pid_consts` moves to `Staged`; only an acknowledged `recalc_pi` moves
/// back to `Idle` and reports what was committed.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum PidUpdate {
    #[default]
    Idle,
    Staged(PidConstants),
}

impl PidUpdate {
    pub fn stage(&mut self, constants: PidConstants) {
        *self = PidUpdate::Staged(constants);
    }

    /// Consume the staged constants, if any
    pub fn commit(&mut self) -> Option<PidConstants> {
        match std::mem::take(self) {
            PidUpdate::Staged(constants) => Some(constants),
            PidUpdate::Idle => None,
        }
    }

    pub fn staged(&self) -> Option<PidConstants> {
        match self {
            PidUpdate::Staged(constants) => Some(*constants),
            PidUpdate::Idle => None,
        }
    }

    pub fn is_staged(&self) -> bool {
        matches!(self, PidUpdate::Staged(_))
    }
}
