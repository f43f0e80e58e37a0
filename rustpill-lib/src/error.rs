use crate::frame::Opcode;
use crate::message::RejectReason;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// The primary error type for the `rustpill-lib` library.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Serial port unavailable: {0}")]
    PortUnavailable(#[from] serialport::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] io::Error),

    #[error("Timeout waiting for {opcode} response (seq {seq}) after {waited:?}")]
    Timeout { opcode: Opcode, seq: u16, waited: Duration },

    #[error("Frame corruption: gave up after discarding {dropped} byte(s)")]
    FrameCorruption { dropped: usize },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Channel {0} has no cached calibration; configure it or fetch the config first")]
    UnconfiguredChannel(u8),

    #[error("Malformed {opcode} response: {reason}")]
    MalformedResponse { opcode: Opcode, reason: String },

    #[error("Response mismatch for seq {seq}: expected {expected}, got {actual}")]
    ResponseMismatch { seq: u16, expected: Opcode, actual: Opcode },

    #[error("Device rejected {opcode}: {reason} ({message})")]
    DeviceRejected {
        opcode: Opcode,
        reason: RejectReason,
        message: String,
    },

    #[error("Heater is under closed-loop PID control; disable it before setting the duty directly")]
    HeaterInClosedLoop,

    #[error("Payload of {len} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("Link mutex poisoned by a panicking caller")]
    LinkPoisoned,
}

impl ClientError {
    /// Whether repeating the same request may succeed. Only a missing response qualifies;
    /// everything else is either deterministic or already reported by the device.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::Timeout { .. })
    }

    pub(crate) fn malformed(opcode: Opcode, reason: impl Into<String>) -> Self {
        ClientError::MalformedResponse {
            opcode,
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid(reason: impl Into<String>) -> Self {
        ClientError::InvalidArgument(reason.into())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
