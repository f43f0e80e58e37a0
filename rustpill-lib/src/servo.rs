use crate::calibration::{CalibrationStore, ChannelCalibration, ServoConfig};
use crate::constants::MAX_ANGLE_DEGREES;
use crate::error::{ClientError, Result};
use crate::frame::Opcode;
use crate::message::{Command, DeviceIdentity, Response};
use crate::rpc::{Link, RetryPolicy, expect_ack, unexpected};
use crate::transport::{SerialTransport, Transport};
use tracing::{info, warn};

/// Servo channels of the board.
///
/// Angle conversions use a client-side calibration cache. The cache is filled by
/// [`ServoClient::get_config`] and [`ServoClient::configure_channel`] and emptied
/// whenever the underlying link is re-established.
pub struct ServoClient<T: Transport = SerialTransport> {
    link: Link<T>,
    calibration: CalibrationStore,
    config: Option<ServoConfig>,
    cache_epoch: u64,
    channel_count: u8,
    retry_policy: RetryPolicy,
}

impl<T: Transport> ServoClient<T> {
    /// Wrap a link without touching the device
    pub fn new(link: Link<T>) -> Result<Self> {
        let client_config = link.config()?;
        let cache_epoch = link.epoch()?;
        Ok(Self {
            link,
            calibration: CalibrationStore::new(client_config.pwm),
            config: None,
            cache_epoch,
            channel_count: client_config.channel_count,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Wrap a link and pull the device's channel configuration
    pub fn connect(link: Link<T>) -> Result<Self> {
        let mut client = Self::new(link)?;
        client.get_config()?;
        Ok(client)
    }

    pub fn link(&self) -> &Link<T> {
        &self.link
    }

    /// Allow idempotent servo commands (absolute angles, calibration) to be retried
    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry_policy = policy;
    }

    pub fn calibration(&self) -> &CalibrationStore {
        &self.calibration
    }

    /// Configuration last fetched from the device, if still valid
    pub fn config(&self) -> Option<&ServoConfig> {
        self.config.as_ref()
    }

    fn invalidate(&mut self, epoch: u64) {
        if !self.calibration.is_empty() {
            info!(
                old_epoch = self.cache_epoch,
                new_epoch = epoch,
                "Link re-established, dropping cached calibration"
            );
        }
        self.calibration.invalidate();
        self.config = None;
        self.cache_epoch = epoch;
    }

    fn sync_epoch(&mut self) -> Result<()> {
        let epoch = self.link.epoch()?;
        if epoch != self.cache_epoch {
            self.invalidate(epoch);
        }
        Ok(())
    }

    fn call(&mut self, command: Command) -> Result<Response> {
        let (response, epoch) = self.link.call_in_epoch(&command, self.retry_policy)?;
        if epoch != self.cache_epoch {
            self.invalidate(epoch);
        }
        Ok(response)
    }

    fn check_channel(&self, channel: u8) -> Result<()> {
        if channel == 0 || channel > self.channel_count {
            return Err(ClientError::invalid(format!(
                "channel {channel} outside 1-{}",
                self.channel_count
            )));
        }
        Ok(())
    }

    pub fn ping(&self, token: u16) -> Result<u16> {
        self.link.ping(token)
    }

    pub fn get_id(&self) -> Result<DeviceIdentity> {
        self.link.get_id()
    }

    pub fn get_serial_number(&self) -> Result<String> {
        Ok(self.get_id()?.serial_number())
    }

    /// Fetch the device configuration and replace the calibration cache with it
    pub fn get_config(&mut self) -> Result<ServoConfig> {
        match self.call(Command::GetConfig)? {
            Response::Config(config) => {
                self.calibration.replace(&config);
                self.config = Some(config.clone());
                Ok(config)
            }
            other => Err(unexpected(Opcode::GetConfig, &other)),
        }
    }

    /// Push new calibration bounds; the cache is updated only once the device acknowledges.
    pub fn configure_channel(&mut self, channel: u8, min_duty_cycle: u16, max_duty_cycle: u16) -> Result<()> {
        self.check_channel(channel)?;
        let calibration = ChannelCalibration::new(channel, min_duty_cycle, max_duty_cycle)?;

        let response = self.call(Command::ConfigureChannel {
            channel,
            min_duty_cycle,
            max_duty_cycle,
        })?;
        expect_ack(Opcode::ConfigureChannel, response)?;

        self.calibration.insert(calibration);
        if let Some(entry) = self
            .config
            .as_mut()
            .and_then(|config| config.channels.iter_mut().find(|c| c.channel == channel))
        {
            entry.min_duty_cycle = min_duty_cycle;
            entry.max_duty_cycle = max_duty_cycle;
        }
        info!(%calibration, "Channel configured");
        Ok(())
    }

    /// Move a channel to `angle` degrees. Returns the duty cycle sent.
    pub fn set_angle(&mut self, channel: u8, angle: u8) -> Result<u16> {
        self.check_channel(channel)?;
        if angle > MAX_ANGLE_DEGREES {
            return Err(ClientError::invalid(format!(
                "angle {angle}° outside 0-{MAX_ANGLE_DEGREES}°"
            )));
        }
        self.sync_epoch()?;
        let duty_cycle = self.calibration.to_duty_cycle(channel, angle)?;

        let response = self.call(Command::SetAngle {
            channel,
            angle,
            duty_cycle,
        })?;
        expect_ack(Opcode::SetAngle, response)?;
        Ok(duty_cycle)
    }

    /// Current angle of a channel, recomputed from the duty cycle the device reports
    pub fn get_angle(&mut self, channel: u8) -> Result<u8> {
        self.check_channel(channel)?;
        self.sync_epoch()?;
        self.calibration.get(channel)?;

        match self.call(Command::GetAngle { channel })? {
            Response::Angle {
                angle: reported,
                duty_cycle,
            } => {
                let angle = self.calibration.to_angle(channel, duty_cycle)?;
                if angle.abs_diff(reported) > 1 {
                    warn!(
                        channel,
                        duty_cycle,
                        reported,
                        computed = angle,
                        "Device angle disagrees with cached calibration"
                    );
                }
                Ok(angle)
            }
            other => Err(unexpected(Opcode::GetAngle, &other)),
        }
    }

    /// Pulse width to raw duty-cycle units at the board's current PWM frequency
    pub fn us_to_duty_cycle(&self, us: u32) -> u16 {
        self.calibration.us_to_duty_cycle(us)
    }

    /// Change the PWM frequency. The board disables every channel when this
    /// happens, so the configuration is fetched again and returned.
    pub fn set_frequency(&mut self, frequency_hz: u32) -> Result<ServoConfig> {
        let response = self.call(Command::SetFrequency { frequency_hz })?;
        expect_ack(Opcode::SetFrequency, response)?;
        info!(frequency_hz, "PWM frequency changed");

        self.calibration.invalidate();
        self.config = None;
        self.get_config()
    }

    /// The only calibrated channel, for single-servo setups
    pub fn default_channel(&self) -> Option<u8> {
        self.calibration.sole_channel()
    }

    fn require_default_channel(&self) -> Result<u8> {
        self.default_channel().ok_or_else(|| {
            ClientError::invalid(format!(
                "no default channel: {} channel(s) calibrated, need exactly one",
                self.calibration.len()
            ))
        })
    }

    pub fn set_angle_default(&mut self, angle: u8) -> Result<u16> {
        self.sync_epoch()?;
        let channel = self.require_default_channel()?;
        self.set_angle(channel, angle)
    }

    pub fn get_angle_default(&mut self) -> Result<u8> {
        self.sync_epoch()?;
        let channel = self.require_default_channel()?;
        self.get_angle(channel)
    }
}
