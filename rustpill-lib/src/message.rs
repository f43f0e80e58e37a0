//! Command/Response registry: the typed payloads carried inside frames.
//!
//! Everything here is pure. Requests are validated while they are encoded, so an
//! out-of-range argument never reaches the wire; responses are checked against
//! the shape their opcode promises.

use crate::calibration::ServoConfig;
use crate::constants::{HEATER_DUTY_MAX, MAX_ANGLE_DEGREES, MAX_ID_LEN, PID_VALUES_SIZE};
use crate::error::{ClientError, Result};
use crate::frame::Opcode;
use crate::pid::{PID_FLAG_ENABLED, PID_FLAG_STAGED, PidConstants, PidUpdate, PidValues, PidValuesRaw};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use std::fmt;
use strum_macros::Display;
use zerocopy::{FromBytes, IntoBytes};

/// Reason code carried by a NACK frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum RejectReason {
    InvalidChannel = 1,
    InvalidArgument = 2,
    PidActive = 3,
    Unsupported = 4,
    NotConfigured = 5,
    #[num_enum(catch_all)]
    Unknown(u8),
}

/// What repeating a command does to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum Idempotence {
    /// No device state changes
    ReadOnly,
    /// Sets absolute state; a second delivery leaves the device where the first did
    Idempotent,
    /// A second delivery changes the outcome
    NonIdempotent,
}

/// Every request the host can send.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Command {
    Ping { token: u16 },
    GetId,
    GetConfig,
    ConfigureChannel { channel: u8, min_duty_cycle: u16, max_duty_cycle: u16 },
    SetAngle { channel: u8, angle: u8, duty_cycle: u16 },
    GetAngle { channel: u8 },
    SetFrequency { frequency_hz: u32 },
    EnableHeater,
    DisableHeater,
    SetHeaterDuty { duty: u16 },
    SetPidConsts(PidConstants),
    RecalcPi,
    GetPidVals,
    SetSetpoint { value: f32 },
    ResetPid,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Ping { .. } => Opcode::Ping,
            Command::GetId => Opcode::GetId,
            Command::GetConfig => Opcode::GetConfig,
            Command::ConfigureChannel { .. } => Opcode::ConfigureChannel,
            Command::SetAngle { .. } => Opcode::SetAngle,
            Command::GetAngle { .. } => Opcode::GetAngle,
            Command::SetFrequency { .. } => Opcode::SetFrequency,
            Command::EnableHeater => Opcode::EnableHeater,
            Command::DisableHeater => Opcode::DisableHeater,
            Command::SetHeaterDuty { .. } => Opcode::SetHeaterDuty,
            Command::SetPidConsts(_) => Opcode::SetPidConsts,
            Command::RecalcPi => Opcode::RecalcPi,
            Command::GetPidVals => Opcode::GetPidVals,
            Command::SetSetpoint { .. } => Opcode::SetSetpoint,
            Command::ResetPid => Opcode::ResetPid,
        }
    }

    pub fn idempotence(&self) -> Idempotence {
        match self {
            Command::Ping { .. }
            | Command::GetId
            | Command::GetConfig
            | Command::GetAngle { .. }
            | Command::GetPidVals => Idempotence::ReadOnly,
            // Each recalculation advances the controller's integrator
            Command::RecalcPi => Idempotence::NonIdempotent,
            _ => Idempotence::Idempotent,
        }
    }

    /// Serialise the request payload, validating every argument first.
    ///
    /// `channel_count` bounds the channel index (channels are 1-based).
    pub fn encode(&self, channel_count: u8) -> Result<Bytes> {
        let mut out = BytesMut::new();
        match *self {
            Command::Ping { token } => out.put_u16_le(token),
            Command::GetId
            | Command::GetConfig
            | Command::EnableHeater
            | Command::DisableHeater
            | Command::RecalcPi
            | Command::GetPidVals
            | Command::ResetPid => {}
            Command::ConfigureChannel {
                channel,
                min_duty_cycle,
                max_duty_cycle,
            } => {
                check_channel(channel, channel_count)?;
                if min_duty_cycle >= max_duty_cycle {
                    return Err(ClientError::invalid(format!(
                        "min duty cycle {min_duty_cycle} must be below max duty cycle {max_duty_cycle}"
                    )));
                }
                out.put_u8(channel);
                out.put_u16_le(min_duty_cycle);
                out.put_u16_le(max_duty_cycle);
            }
            Command::SetAngle {
                channel,
                angle,
                duty_cycle,
            } => {
                check_channel(channel, channel_count)?;
                check_angle(angle)?;
                out.put_u8(channel);
                out.put_u8(angle);
                out.put_u16_le(duty_cycle);
            }
            Command::GetAngle { channel } => {
                check_channel(channel, channel_count)?;
                out.put_u8(channel);
            }
            Command::SetFrequency { frequency_hz } => {
                if frequency_hz == 0 {
                    return Err(ClientError::invalid("PWM frequency must be non-zero"));
                }
                out.put_u32_le(frequency_hz);
            }
            Command::SetHeaterDuty { duty } => {
                if duty > HEATER_DUTY_MAX {
                    return Err(ClientError::invalid(format!(
                        "heater duty {duty} outside 0-{HEATER_DUTY_MAX}"
                    )));
                }
                out.put_u16_le(duty);
            }
            Command::SetPidConsts(constants) => {
                constants.validate()?;
                out.put_f32_le(constants.kp);
                out.put_f32_le(constants.ki);
                if constants.has_derivative() {
                    out.put_f32_le(constants.kd);
                }
            }
            Command::SetSetpoint { value } => {
                if !value.is_finite() {
                    return Err(ClientError::invalid(format!("setpoint must be finite, got {value}")));
                }
                out.put_f32_le(value);
            }
        }
        Ok(out.freeze())
    }

    /// Parse a request payload; the device side of [`Command::encode`].
    pub fn decode(opcode: Opcode, payload: &[u8]) -> Result<Self> {
        let mut buf = payload;
        let expect_len = |len: usize| -> Result<()> {
            if payload.len() == len {
                Ok(())
            } else {
                Err(ClientError::invalid(format!(
                    "{opcode} request needs {len} byte(s), got {}",
                    payload.len()
                )))
            }
        };

        let command = match opcode {
            Opcode::Ping => {
                expect_len(2)?;
                Command::Ping { token: buf.get_u16_le() }
            }
            Opcode::GetId => {
                expect_len(0)?;
                Command::GetId
            }
            Opcode::GetConfig => {
                expect_len(0)?;
                Command::GetConfig
            }
            Opcode::ConfigureChannel => {
                expect_len(5)?;
                Command::ConfigureChannel {
                    channel: buf.get_u8(),
                    min_duty_cycle: buf.get_u16_le(),
                    max_duty_cycle: buf.get_u16_le(),
                }
            }
            Opcode::SetAngle => {
                expect_len(4)?;
                Command::SetAngle {
                    channel: buf.get_u8(),
                    angle: buf.get_u8(),
                    duty_cycle: buf.get_u16_le(),
                }
            }
            Opcode::GetAngle => {
                expect_len(1)?;
                Command::GetAngle { channel: buf.get_u8() }
            }
            Opcode::SetFrequency => {
                expect_len(4)?;
                Command::SetFrequency {
                    frequency_hz: buf.get_u32_le(),
                }
            }
            Opcode::EnableHeater => {
                expect_len(0)?;
                Command::EnableHeater
            }
            Opcode::DisableHeater => {
                expect_len(0)?;
                Command::DisableHeater
            }
            Opcode::SetHeaterDuty => {
                expect_len(2)?;
                Command::SetHeaterDuty { duty: buf.get_u16_le() }
            }
            Opcode::SetPidConsts => {
                if payload.len() != 8 && payload.len() != 12 {
                    return Err(ClientError::invalid(format!(
                        "SetPidConsts request needs 8 or 12 bytes, got {}",
                        payload.len()
                    )));
                }
                let kp = buf.get_f32_le();
                let ki = buf.get_f32_le();
                let kd = if buf.has_remaining() { buf.get_f32_le() } else { 0.0 };
                Command::SetPidConsts(PidConstants { kp, ki, kd })
            }
            Opcode::RecalcPi => {
                expect_len(0)?;
                Command::RecalcPi
            }
            Opcode::GetPidVals => {
                expect_len(0)?;
                Command::GetPidVals
            }
            Opcode::SetSetpoint => {
                expect_len(4)?;
                Command::SetSetpoint { value: buf.get_f32_le() }
            }
            Opcode::ResetPid => {
                expect_len(0)?;
                Command::ResetPid
            }
            Opcode::Unknown(code) => {
                return Err(ClientError::invalid(format!("unknown opcode 0x{code:02X}")));
            }
        };
        Ok(command)
    }

    /// Advance the staged-constants state once the device has acknowledged this command.
    ///
    /// Returns the constants that became live, if this command committed any.
    pub fn advance_pid_update(&self, update: &mut PidUpdate) -> Option<PidConstants> {
        match self {
            Command::SetPidConsts(constants) => {
                update.stage(*constants);
                None
            }
            Command::RecalcPi => update.commit(),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Ping { token } => write!(f, "Ping({token})"),
            Command::ConfigureChannel {
                channel,
                min_duty_cycle,
                max_duty_cycle,
            } => write!(f, "ConfigureChannel(CH{channel}, {min_duty_cycle}..{max_duty_cycle})"),
            Command::SetAngle {
                channel,
                angle,
                duty_cycle,
            } => write!(f, "SetAngle(CH{channel}, {angle}°, duty {duty_cycle})"),
            Command::GetAngle { channel } => write!(f, "GetAngle(CH{channel})"),
            Command::SetFrequency { frequency_hz } => write!(f, "SetFrequency({frequency_hz} Hz)"),
            Command::SetHeaterDuty { duty } => write!(f, "SetHeaterDuty({duty}‰)"),
            Command::SetPidConsts(c) => write!(f, "SetPidConsts(kp {}, ki {}, kd {})", c.kp, c.ki, c.kd),
            Command::SetSetpoint { value } => write!(f, "SetSetpoint({value})"),
            other => write!(f, "{}", other.opcode()),
        }
    }
}

fn check_channel(channel: u8, channel_count: u8) -> Result<()> {
    if channel == 0 || channel > channel_count {
        return Err(ClientError::invalid(format!(
            "channel {channel} outside 1-{channel_count}"
        )));
    }
    Ok(())
}

fn check_angle(angle: u8) -> Result<()> {
    if angle > MAX_ANGLE_DEGREES {
        return Err(ClientError::invalid(format!(
            "angle {angle}° outside 0-{MAX_ANGLE_DEGREES}°"
        )));
    }
    Ok(())
}

/// Opaque device identifier as reported by GetId
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    bytes: Bytes,
}

impl DeviceIdentity {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The identifier as a little-endian integer, for ids of at most 16 bytes
    pub fn as_u128(&self) -> Option<u128> {
        if self.bytes.len() > 16 {
            return None;
        }
        let mut padded = [0u8; 16];
        padded[..self.bytes.len()].copy_from_slice(&self.bytes);
        Some(u128::from_le_bytes(padded))
    }

    /// Upper-case hex rendering, as printed on the board label
    pub fn serial_number(&self) -> String {
        hex::encode_upper(&self.bytes)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.serial_number())
    }
}

/// A decoded, successful response.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Pong { token: u16 },
    Id(DeviceIdentity),
    Config(ServoConfig),
    Angle { angle: u8, duty_cycle: u16 },
    PidValues(PidValues),
    /// Empty acknowledgement of a state-changing command
    Ack(Opcode),
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Pong { .. } => Opcode::Ping,
            Response::Id(_) => Opcode::GetId,
            Response::Config(_) => Opcode::GetConfig,
            Response::Angle { .. } => Opcode::GetAngle,
            Response::PidValues(_) => Opcode::GetPidVals,
            Response::Ack(opcode) => *opcode,
        }
    }

    /// Serialise the response payload
    pub fn encode(&self) -> Bytes {
        match self {
            Response::Pong { token } => Bytes::copy_from_slice(&token.to_le_bytes()),
            Response::Id(identity) => Bytes::copy_from_slice(identity.as_bytes()),
            Response::Config(config) => config.to_bytes(),
            Response::Angle { angle, duty_cycle } => {
                let mut out = BytesMut::with_capacity(3);
                out.put_u8(*angle);
                out.put_u16_le(*duty_cycle);
                out.freeze()
            }
            Response::PidValues(values) => {
                Bytes::copy_from_slice(PidValuesRaw::from(*values).as_bytes())
            }
            Response::Ack(_) => Bytes::new(),
        }
    }
}

/// Decode a successful response payload according to its opcode.
pub fn decode_response(opcode: Opcode, payload: &[u8]) -> Result<Response> {
    let expect_len = |len: usize| -> Result<()> {
        if payload.len() == len {
            Ok(())
        } else {
            Err(ClientError::malformed(
                opcode,
                format!("expected {len} byte(s), got {}", payload.len()),
            ))
        }
    };

    match opcode {
        Opcode::Ping => {
            expect_len(2)?;
            Ok(Response::Pong {
                token: u16::from_le_bytes([payload[0], payload[1]]),
            })
        }
        Opcode::GetId => {
            if payload.is_empty() || payload.len() > MAX_ID_LEN {
                return Err(ClientError::malformed(
                    opcode,
                    format!("id must be 1-{MAX_ID_LEN} bytes, got {}", payload.len()),
                ));
            }
            Ok(Response::Id(DeviceIdentity::new(Bytes::copy_from_slice(payload))))
        }
        Opcode::GetConfig => Ok(Response::Config(ServoConfig::from_bytes(payload)?)),
        Opcode::GetAngle => {
            expect_len(3)?;
            let angle = payload[0];
            if angle > MAX_ANGLE_DEGREES {
                return Err(ClientError::malformed(
                    opcode,
                    format!("angle {angle}° outside 0-{MAX_ANGLE_DEGREES}°"),
                ));
            }
            Ok(Response::Angle {
                angle,
                duty_cycle: u16::from_le_bytes([payload[1], payload[2]]),
            })
        }
        Opcode::GetPidVals => {
            expect_len(PID_VALUES_SIZE)?;
            let raw = PidValuesRaw::read_from_bytes(payload)
                .map_err(|_| ClientError::malformed(opcode, "incorrect PID values size"))?;
            if raw.flags & !(PID_FLAG_ENABLED | PID_FLAG_STAGED) != 0 {
                return Err(ClientError::malformed(
                    opcode,
                    format!("reserved flag bits set: 0x{:02X}", raw.flags),
                ));
            }
            Ok(Response::PidValues(PidValues::from(raw)))
        }
        Opcode::Unknown(_) => Err(ClientError::malformed(opcode, "unknown opcode")),
        ack => {
            expect_len(0)?;
            Ok(Response::Ack(ack))
        }
    }
}

/// Split a NACK payload into its reason code and message
pub fn decode_rejection(payload: &[u8]) -> (RejectReason, String) {
    match payload.split_first() {
        Some((&code, message)) => (
            RejectReason::from_primitive(code),
            String::from_utf8_lossy(message).into_owned(),
        ),
        None => (RejectReason::Unknown(0), String::new()),
    }
}
