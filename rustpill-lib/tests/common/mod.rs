//! Common test utilities: an in-memory board speaking the wire protocol

// Shared across several test files; not every item is used in every file
#![allow(dead_code, unused_imports)]

pub use bytes::Bytes;
pub use hex;
pub use rustpill_lib::calibration::{ChannelConfig, ServoConfig, us_to_duty_cycle};
pub use rustpill_lib::config::ClientConfig;
pub use rustpill_lib::error::ClientError;
pub use rustpill_lib::frame::{Frame, FrameDecoder, Opcode};
pub use rustpill_lib::heater::HeaterClient;
pub use rustpill_lib::message::{Command, DeviceIdentity, RejectReason, Response};
pub use rustpill_lib::pid::{PidConstants, PidValues};
pub use rustpill_lib::rpc::{Link, RetryPolicy, RpcClient};
pub use rustpill_lib::servo::ServoClient;
pub use rustpill_lib::transport::Transport;

use bytes::BytesMut;
use rustpill_lib::constants::{DEFAULT_MAX_PAYLOAD, HEATER_DUTY_MAX, MAX_ANGLE_DEGREES};
use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

/// Identity the simulated board reports (12 bytes, like the STM32 UID)
pub const BOARD_ID: [u8; 12] = [0x34, 0x12, 0x00, 0x00, 0x0D, 0x51, 0x36, 0x34, 0x38, 0x37, 0x32, 0x30];

/// Heater sensor reading the model starts from
pub const AMBIENT: f32 = 20.0;

const INTEGRAL_LIMIT: f32 = 1000.0;

/// Misbehaviour applied to the next response the board sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Execute the request but send nothing back
    Swallow,
    /// Reply with a sequence tag that matches nothing
    WrongSeq,
    /// Reply with the right tag but another opcode
    WrongOpcode,
    /// Send the first half of the reply, then the whole reply
    Truncated,
    /// Send non-frame bytes ahead of the reply
    GarbagePrefix,
    /// Send the reply with one checksum bit flipped and nothing else
    Corrupt,
    /// Send a copy tagged with the previous sequence number ahead of the reply
    StaleFirst,
}

#[derive(Debug)]
pub struct BoardState {
    pub identity: Vec<u8>,
    pub frequency_hz: u32,
    pub channels: Vec<ChannelConfig>,
    pub heater_duty: u16,
    pub pid: PidValues,
    pub staged: Option<PidConstants>,
    pub integral: f32,
    pub faults: VecDeque<Fault>,
    /// Number of upcoming reads that fail with an I/O error
    pub failing_reads: usize,
    /// Largest chunk a single read hands out
    pub chunk_size: usize,
    pub reconnects: usize,
    pub open: bool,
    pub requests: Vec<Command>,
    rx: FrameDecoder,
    tx: VecDeque<u8>,
}

impl Default for BoardState {
    fn default() -> Self {
        Self {
            identity: BOARD_ID.to_vec(),
            frequency_hz: 50,
            channels: (1..=4)
                .map(|channel| ChannelConfig {
                    channel,
                    ..Default::default()
                })
                .collect(),
            heater_duty: 0,
            pid: PidValues {
                measured_value: AMBIENT,
                ..Default::default()
            },
            staged: None,
            integral: 0.0,
            faults: VecDeque::new(),
            failing_reads: 0,
            chunk_size: usize::MAX,
            reconnects: 0,
            open: true,
            requests: Vec::new(),
            rx: FrameDecoder::default(),
            tx: VecDeque::new(),
        }
    }
}

type Reply = std::result::Result<Response, (RejectReason, String)>;

fn reject(reason: RejectReason, message: impl Into<String>) -> Reply {
    Err((reason, message.into()))
}

impl BoardState {
    fn channel_mut(&mut self, channel: u8) -> std::result::Result<&mut ChannelConfig, (RejectReason, String)> {
        self.channels
            .iter_mut()
            .find(|c| c.channel == channel)
            .ok_or((RejectReason::InvalidChannel, format!("no channel {channel}")))
    }

    fn config(&self) -> ServoConfig {
        ServoConfig {
            frequency_hz: self.frequency_hz,
            max_duty_cycle: u16::MAX,
            channels: self.channels.clone(),
        }
    }

    fn recalc(&mut self) {
        if let Some(constants) = self.staged.take() {
            self.pid.kp = constants.kp;
            self.pid.ki = constants.ki;
            self.pid.kd = constants.kd;
        }
        let error = self.pid.setpoint - self.pid.measured_value;
        self.integral = (self.integral + self.pid.ki * error).clamp(-INTEGRAL_LIMIT, INTEGRAL_LIMIT);
        self.pid.output = (self.pid.kp * error + self.integral).clamp(0.0, f32::from(HEATER_DUTY_MAX));
    }

    fn execute(&mut self, command: Command) -> Reply {
        let response = match command {
            Command::Ping { token } => Response::Pong { token },
            Command::GetId => Response::Id(DeviceIdentity::new(self.identity.clone())),
            Command::GetConfig => Response::Config(self.config()),
            Command::ConfigureChannel {
                channel,
                min_duty_cycle,
                max_duty_cycle,
            } => {
                if min_duty_cycle >= max_duty_cycle {
                    return reject(RejectReason::InvalidArgument, "min must be below max");
                }
                let entry = self.channel_mut(channel)?;
                entry.min_duty_cycle = min_duty_cycle;
                entry.max_duty_cycle = max_duty_cycle;
                Response::Ack(Opcode::ConfigureChannel)
            }
            Command::SetAngle {
                channel, duty_cycle, ..
            } => {
                let entry = self.channel_mut(channel)?;
                if entry.min_duty_cycle >= entry.max_duty_cycle {
                    return reject(RejectReason::NotConfigured, "channel not configured");
                }
                entry.current_duty_cycle = duty_cycle;
                entry.enabled = true;
                Response::Ack(Opcode::SetAngle)
            }
            Command::GetAngle { channel } => {
                let entry = *self.channel_mut(channel)?;
                let Some(calibration) = entry.calibration() else {
                    return reject(RejectReason::NotConfigured, "channel not configured");
                };
                Response::Angle {
                    angle: calibration.to_angle(entry.current_duty_cycle).min(MAX_ANGLE_DEGREES),
                    duty_cycle: entry.current_duty_cycle,
                }
            }
            Command::SetFrequency { frequency_hz } => {
                self.frequency_hz = frequency_hz;
                for channel in &mut self.channels {
                    channel.enabled = false;
                    channel.current_duty_cycle = 0;
                }
                Response::Ack(Opcode::SetFrequency)
            }
            Command::EnableHeater => {
                self.pid.is_enabled = true;
                Response::Ack(Opcode::EnableHeater)
            }
            Command::DisableHeater => {
                self.pid.is_enabled = false;
                Response::Ack(Opcode::DisableHeater)
            }
            Command::SetHeaterDuty { duty } => {
                if self.pid.is_enabled {
                    return reject(RejectReason::PidActive, "closed loop active");
                }
                self.heater_duty = duty;
                Response::Ack(Opcode::SetHeaterDuty)
            }
            Command::SetPidConsts(constants) => {
                self.staged = Some(constants);
                Response::Ack(Opcode::SetPidConsts)
            }
            Command::RecalcPi => {
                self.recalc();
                Response::Ack(Opcode::RecalcPi)
            }
            Command::GetPidVals => Response::PidValues(PidValues {
                constants_staged: self.staged.is_some(),
                ..self.pid
            }),
            Command::SetSetpoint { value } => {
                self.pid.setpoint = value;
                Response::Ack(Opcode::SetSetpoint)
            }
            Command::ResetPid => {
                self.integral = 0.0;
                Response::Ack(Opcode::ResetPid)
            }
        };
        Ok(response)
    }

    fn handle(&mut self, request: Frame) {
        let reply = match Command::decode(request.opcode, &request.payload) {
            Ok(command) => {
                self.requests.push(command);
                self.execute(command)
            }
            Err(e) => reject(RejectReason::InvalidArgument, e.to_string()),
        };

        let frame = match reply {
            Ok(response) => Frame::response(request.opcode, request.seq, response.encode()),
            Err((reason, message)) => Frame::nack(request.opcode, request.seq, reason.into(), &message),
        };
        self.send(frame);
    }

    fn send(&mut self, frame: Frame) {
        let Ok(bytes) = frame.encode(DEFAULT_MAX_PAYLOAD) else {
            return;
        };
        match self.faults.pop_front() {
            None => self.tx.extend(bytes.iter()),
            Some(Fault::Swallow) => {}
            Some(Fault::WrongSeq) => {
                let wrong = Frame {
                    seq: frame.seq.wrapping_add(100),
                    ..frame
                };
                self.send_clean(wrong);
            }
            Some(Fault::WrongOpcode) => {
                let opcode = if frame.opcode == Opcode::Ping {
                    Opcode::GetId
                } else {
                    Opcode::Ping
                };
                self.send_clean(Frame { opcode, ..frame });
            }
            Some(Fault::Truncated) => {
                self.tx.extend(bytes[..bytes.len() / 2].iter());
                self.tx.extend(bytes.iter());
            }
            Some(Fault::GarbagePrefix) => {
                self.tx.extend([0x00, 0xFF, 0x13, 0x37, 0x42]);
                self.tx.extend(bytes.iter());
            }
            Some(Fault::Corrupt) => {
                let mut corrupt = BytesMut::from(&bytes[..]);
                let last = corrupt.len() - 1;
                corrupt[last] ^= 0x01;
                self.tx.extend(corrupt.iter());
            }
            Some(Fault::StaleFirst) => {
                let stale = Frame {
                    seq: frame.seq.wrapping_sub(1),
                    ..frame.clone()
                };
                self.send_clean(stale);
                self.tx.extend(bytes.iter());
            }
        }
    }

    fn send_clean(&mut self, frame: Frame) {
        if let Ok(bytes) = frame.encode(DEFAULT_MAX_PAYLOAD) {
            self.tx.extend(bytes.iter());
        }
    }
}

/// In-memory [`Transport`] backed by a behavioural model of the firmware.
///
/// Clones share the same board, so a test can keep a handle for inspection and
/// fault injection after moving the transport into a client.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimulatedBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().expect("board state poisoned")
    }

    pub fn inject(&self, fault: Fault) {
        self.state().faults.push_back(fault);
    }

    pub fn fail_reads(&self, count: usize) {
        self.state().failing_reads = count;
    }

    pub fn set_chunk_size(&self, chunk_size: usize) {
        self.state().chunk_size = chunk_size.max(1);
    }

    pub fn requests(&self) -> Vec<Command> {
        self.state().requests.clone()
    }

    pub fn count_requests(&self, opcode: Opcode) -> usize {
        self.state().requests.iter().filter(|c| c.opcode() == opcode).count()
    }

    pub fn reconnects(&self) -> usize {
        self.state().reconnects
    }

    /// Put bytes on the wire towards the host, outside any request
    pub fn push_raw(&self, bytes: &[u8]) {
        self.state().tx.extend(bytes.iter());
    }
}

fn not_connected() -> ClientError {
    ClientError::Transport(io::Error::new(io::ErrorKind::NotConnected, "board unplugged"))
}

impl Transport for SimulatedBoard {
    fn read(&mut self, buf: &mut [u8], timeout: Duration) -> rustpill_lib::Result<usize> {
        {
            let mut state = self.state();
            if !state.open {
                return Err(not_connected());
            }
            if state.failing_reads > 0 {
                state.failing_reads -= 1;
                return Err(ClientError::Transport(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "simulated read fault",
                )));
            }
            if !state.tx.is_empty() {
                let n = buf.len().min(state.chunk_size).min(state.tx.len());
                for (slot, byte) in buf.iter_mut().zip(state.tx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
        }
        thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(0)
    }

    fn write_all(&mut self, data: &[u8]) -> rustpill_lib::Result<()> {
        let mut state = self.state();
        if !state.open {
            return Err(not_connected());
        }
        state.rx.extend(data);
        while let Some(frame) = state.rx.next_frame()? {
            state.handle(frame);
        }
        Ok(())
    }

    fn flush(&mut self) -> rustpill_lib::Result<()> {
        Ok(())
    }

    fn reconnect(&mut self) -> rustpill_lib::Result<()> {
        let mut state = self.state();
        state.reconnects += 1;
        state.open = true;
        state.tx.clear();
        state.rx.reset();
        Ok(())
    }

    fn close(&mut self) {
        self.state().open = false;
    }

    fn is_open(&self) -> bool {
        self.state.lock().map(|state| state.open).unwrap_or(false)
    }
}

/// Client settings that keep timeout-driven tests quick
pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_response_timeout(Duration::from_millis(50))
        .with_retry_backoff(Duration::from_millis(1))
        .with_max_retries(2)
}

/// A link to a fresh simulated board, plus a handle to the board
pub fn board_link() -> (Link<SimulatedBoard>, SimulatedBoard) {
    board_link_with(test_config())
}

pub fn board_link_with(config: ClientConfig) -> (Link<SimulatedBoard>, SimulatedBoard) {
    let board = SimulatedBoard::new();
    let link = Link::new(board.clone(), config).expect("Failed to create link");
    (link, board)
}

/// Route library logs to the test harness; set RUST_LOG to see them
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
