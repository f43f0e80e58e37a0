use crate::error::{ClientError, Result};
use crate::frame::Opcode;
use crate::message::{Command, DeviceIdentity, RejectReason, Response};
use crate::pid::{PidConstants, PidUpdate, PidValues};
use crate::rpc::{Link, RetryPolicy, expect_ack, unexpected};
use crate::transport::{SerialTransport, Transport};
use tracing::{debug, info, warn};

/// Heater output and its PI controller.
///
/// Direct duty and closed-loop control are mutually exclusive: while the
/// controller is known to be running, [`HeaterClient::set_heater_duty`] fails
/// with [`ClientError::HeaterInClosedLoop`] without touching the link.
pub struct HeaterClient<T: Transport = SerialTransport> {
    link: Link<T>,
    update: PidUpdate,
    /// Last known controller state; `None` until observed on the current connection
    closed_loop: Option<bool>,
    state_epoch: u64,
    retry_policy: RetryPolicy,
}

impl<T: Transport> HeaterClient<T> {
    pub fn new(link: Link<T>) -> Result<Self> {
        let state_epoch = link.epoch()?;
        Ok(Self {
            link,
            update: PidUpdate::default(),
            closed_loop: None,
            state_epoch,
            retry_policy: RetryPolicy::default(),
        })
    }

    pub fn link(&self) -> &Link<T> {
        &self.link
    }

    pub fn set_retry_policy(&mut self, policy: RetryPolicy) {
        self.retry_policy = policy;
    }

    /// Constants written with `set_pid_consts` and not yet committed
    pub fn staged_constants(&self) -> Option<PidConstants> {
        self.update.staged()
    }

    /// Whether closed-loop control is running, if known
    pub fn is_closed_loop(&self) -> Option<bool> {
        self.closed_loop
    }

    fn sync_epoch(&mut self, epoch: u64) {
        if epoch != self.state_epoch {
            debug!(epoch, "Link re-established, heater state unknown");
            self.closed_loop = None;
            self.state_epoch = epoch;
        }
    }

    fn call(&mut self, command: Command) -> Result<Response> {
        let (response, epoch) = self.link.call_in_epoch(&command, self.retry_policy)?;
        self.sync_epoch(epoch);
        Ok(response)
    }

    fn command(&mut self, command: Command) -> Result<()> {
        let response = self.call(command)?;
        expect_ack(command.opcode(), response)
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

    /// Hand the heater to the PI controller. Constants are left untouched.
    pub fn enable_heater(&mut self) -> Result<()> {
        self.command(Command::EnableHeater)?;
        self.closed_loop = Some(true);
        info!("Heater enabled");
        Ok(())
    }

    pub fn disable_heater(&mut self) -> Result<()> {
        self.command(Command::DisableHeater)?;
        self.closed_loop = Some(false);
        info!("Heater disabled");
        Ok(())
    }

    /// Open-loop duty in per-mille (0-1000)
    pub fn set_heater_duty(&mut self, duty: u16) -> Result<()> {
        self.sync_epoch(self.link.epoch()?);
        if self.closed_loop == Some(true) {
            return Err(ClientError::HeaterInClosedLoop);
        }
        match self.command(Command::SetHeaterDuty { duty }) {
            Err(
                e @ ClientError::DeviceRejected {
                    reason: RejectReason::PidActive,
                    ..
                },
            ) => {
                self.closed_loop = Some(true);
                Err(e)
            }
            result => result,
        }
    }

    /// Stage new gains. They take effect on the next [`HeaterClient::recalc_pi`].
    pub fn set_pid_consts(&mut self, kp: f32, ki: f32, kd: f32) -> Result<()> {
        let command = Command::SetPidConsts(PidConstants::new(kp, ki, kd)?);
        self.command(command)?;
        command.advance_pid_update(&mut self.update);
        debug!(kp, ki, kd, "PID constants staged");
        Ok(())
    }

    /// Commit staged gains and run one controller step.
    ///
    /// Returns the constants this call committed, if any were staged.
    pub fn recalc_pi(&mut self) -> Result<Option<PidConstants>> {
        let command = Command::RecalcPi;
        self.command(command)?;
        let committed = command.advance_pid_update(&mut self.update);
        if let Some(constants) = committed {
            info!(kp = constants.kp, ki = constants.ki, kd = constants.kd, "PID constants committed");
        }
        Ok(committed)
    }

    pub fn get_pid_vals(&mut self) -> Result<PidValues> {
        match self.call(Command::GetPidVals)? {
            Response::PidValues(values) => {
                self.closed_loop = Some(values.is_enabled);
                if self.update.is_staged() && !values.constants_staged {
                    warn!("Device reports no staged constants; local staged state discarded");
                    self.update = PidUpdate::Idle;
                }
                Ok(values)
            }
            other => Err(unexpected(Opcode::GetPidVals, &other)),
        }
    }

    pub fn set_setpoint(&mut self, value: f32) -> Result<()> {
        self.command(Command::SetSetpoint { value })
    }

    /// Clear the controller's integrator and timing reference
    pub fn reset_pid(&mut self) -> Result<()> {
        self.command(Command::ResetPid)
    }
}
