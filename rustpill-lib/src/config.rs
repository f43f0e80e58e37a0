use crate::calibration::PwmTiming;
use crate::constants::{DEFAULT_CHANNEL_COUNT, DEFAULT_MAX_PAYLOAD, DEFAULT_RESYNC_LIMIT};
use crate::error::{ClientError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Tuning knobs of the RPC client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Deadline for one request/response exchange
    pub response_timeout: Duration,
    /// Extra attempts after a timed-out request, where the retry policy allows them
    pub max_retries: u32,
    /// Pause before the first retry; doubled for every further attempt
    pub retry_backoff: Duration,
    pub max_payload: usize,
    /// Bytes the decoder may discard without seeing a valid frame
    pub resync_limit: usize,
    /// Channels are addressed 1..=channel_count
    pub channel_count: u8,
    /// Re-open the transport after a read fault instead of failing the call
    pub auto_reconnect: bool,
    pub pwm: PwmTiming,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            response_timeout: Duration::from_millis(500),
            max_retries: 3,
            retry_backoff: Duration::from_millis(20),
            max_payload: DEFAULT_MAX_PAYLOAD,
            resync_limit: DEFAULT_RESYNC_LIMIT,
            channel_count: DEFAULT_CHANNEL_COUNT,
            auto_reconnect: true,
            pwm: PwmTiming::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn with_max_payload(mut self, max_payload: usize) -> Self {
        self.max_payload = max_payload;
        self
    }

    pub fn with_resync_limit(mut self, limit: usize) -> Self {
        self.resync_limit = limit;
        self
    }

    pub fn with_channel_count(mut self, count: u8) -> Self {
        self.channel_count = count;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    pub fn with_pwm(mut self, pwm: PwmTiming) -> Self {
        self.pwm = pwm;
        self
    }

    /// Backoff before retry number `attempt` (1-based)
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX))
    }

    pub fn validate(&self) -> Result<()> {
        if self.response_timeout.is_zero() {
            return Err(ClientError::invalid("response timeout must be non-zero"));
        }
        if self.max_payload == 0 || self.max_payload > u16::MAX as usize {
            return Err(ClientError::invalid(format!(
                "max payload {} must fit the 16-bit length field",
                self.max_payload
            )));
        }
        if self.channel_count == 0 {
            return Err(ClientError::invalid("channel count must be at least 1"));
        }
        if self.pwm.frequency_hz == 0 {
            return Err(ClientError::invalid("PWM frequency must be non-zero"));
        }
        Ok(())
    }
}
