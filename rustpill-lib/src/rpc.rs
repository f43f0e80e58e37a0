//! Blocking request/response client.
//!
//! One request is in flight at a time: the client writes a frame, then reads and
//! buffers bytes until a response carrying the same sequence tag arrives or the
//! deadline passes. [`Link`] wraps the client in a mutex so several façades can
//! share one serial port.

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::frame::{self, Frame, FrameDecoder, FrameFlags, Opcode};
use crate::message::{Command, DeviceIdentity, Idempotence, Response, decode_rejection, decode_response};
use crate::transport::{SerialConfig, SerialTransport, Transport};
use bytes::Bytes;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;
use tracing::{debug, info, warn};

const READ_CHUNK: usize = 256;

/// Which commands may be repeated after a timeout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    /// Read-only commands only
    #[default]
    Auto,
    /// Read-only and idempotent commands
    IdempotentOptIn,
    Never,
}

impl RetryPolicy {
    pub fn allows(&self, idempotence: Idempotence) -> bool {
        match (self, idempotence) {
            (RetryPolicy::Never, _) => false,
            (_, Idempotence::ReadOnly) => true,
            (RetryPolicy::IdempotentOptIn, Idempotence::Idempotent) => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connected,
    /// Lost after an I/O fault; may be re-opened automatically
    Faulted,
    /// Closed on request; stays closed until an explicit reconnect
    Closed,
}

pub struct RpcClient<T: Transport> {
    transport: T,
    decoder: FrameDecoder,
    config: ClientConfig,
    next_seq: u16,
    epoch: u64,
    state: LinkState,
}

impl<T: Transport> RpcClient<T> {
    pub fn new(transport: T, config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let state = if transport.is_open() {
            LinkState::Connected
        } else {
            LinkState::Closed
        };
        Ok(Self {
            transport,
            decoder: FrameDecoder::new(config.max_payload, config.resync_limit),
            config,
            next_seq: 0,
            epoch: 0,
            state,
        })
    }

    fn next_seq(&mut self) -> u16 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connection generation; changes whenever the link is lost, closed or re-opened
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    pub fn call(&mut self, command: &Command) -> Result<Response> {
        self.call_with(command, RetryPolicy::Auto)
    }

    /// Send `command` and wait for its response, retrying timeouts where `policy` allows.
    pub fn call_with(&mut self, command: &Command, policy: RetryPolicy) -> Result<Response> {
        let opcode = command.opcode();
        let payload = command.encode(self.config.channel_count)?;
        if payload.len() > self.config.max_payload {
            return Err(ClientError::PayloadTooLarge {
                len: payload.len(),
                max: self.config.max_payload,
            });
        }

        let retries = if policy.allows(command.idempotence()) {
            self.config.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            match self.exchange(opcode, payload.clone()) {
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    let backoff = self.config.backoff_for(attempt);
                    warn!(%opcode, attempt, retries, ?backoff, error = %e, "Retrying request");
                    thread::sleep(backoff);
                }
                result => return result,
            }
        }
    }

    fn exchange(&mut self, opcode: Opcode, payload: Bytes) -> Result<Response> {
        self.ensure_connected()?;

        let seq = self.next_seq();
        let frame = frame::encode(opcode, seq, FrameFlags::new(), payload, self.config.max_payload)?;
        debug!(%opcode, seq, bytes = hex::encode(&frame), "Serial Write");
        if let Err(e) = self.write_frame(&frame) {
            self.fault();
            return Err(e);
        }

        let started = Instant::now();
        let deadline = started + self.config.response_timeout;
        let mut buf = [0u8; READ_CHUNK];
        loop {
            while let Some(frame) = self.decoder.next_frame()? {
                if let Some(result) = self.match_response(opcode, seq, frame) {
                    return result;
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout {
                    opcode,
                    seq,
                    waited: now - started,
                });
            }

            match self.transport.read(&mut buf, deadline - now) {
                Ok(0) => {}
                Ok(n) => {
                    debug!(bytes = hex::encode(&buf[..n]), "Serial Read");
                    self.decoder.extend(&buf[..n]);
                }
                Err(e) => {
                    self.fault();
                    if !self.config.auto_reconnect {
                        return Err(e);
                    }
                    // The request is lost with the old connection; keep waiting so the
                    // caller sees a timeout.
                    warn!(error = %e, %opcode, seq, "Read fault, reconnecting");
                    self.reopen()?;
                }
            }
        }
    }

    fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        self.transport.write_all(frame)?;
        self.transport.flush()
    }

    /// Decide what a decoded frame means for the outstanding request.
    /// `None` means the frame is not ours and waiting continues.
    fn match_response(&self, opcode: Opcode, seq: u16, frame: Frame) -> Option<Result<Response>> {
        if !frame.is_response() {
            warn!(opcode = %frame.opcode, seq = frame.seq, "Ignoring request frame from device");
            return None;
        }
        if frame.seq != seq {
            warn!(
                expected = seq,
                actual = frame.seq,
                opcode = %frame.opcode,
                "Discarding response with stale sequence tag"
            );
            return None;
        }
        if frame.opcode != opcode {
            return Some(Err(ClientError::ResponseMismatch {
                seq,
                expected: opcode,
                actual: frame.opcode,
            }));
        }
        if frame.is_nack() {
            let (reason, message) = decode_rejection(&frame.payload);
            warn!(%opcode, %reason, detail = %message, "Device rejected request");
            return Some(Err(ClientError::DeviceRejected {
                opcode,
                reason,
                message,
            }));
        }
        Some(decode_response(opcode, &frame.payload))
    }

    fn ensure_connected(&mut self) -> Result<()> {
        match self.state {
            LinkState::Connected => Ok(()),
            LinkState::Faulted if self.config.auto_reconnect => self.reopen(),
            LinkState::Faulted | LinkState::Closed => Err(ClientError::Transport(io::Error::new(
                io::ErrorKind::NotConnected,
                "link is not connected",
            ))),
        }
    }

    fn fault(&mut self) {
        self.state = LinkState::Faulted;
        self.epoch += 1;
        self.decoder.reset();
    }

    fn reopen(&mut self) -> Result<()> {
        self.transport.reconnect()?;
        self.decoder.reset();
        self.state = LinkState::Connected;
        self.epoch += 1;
        info!(epoch = self.epoch, "Link re-established");
        Ok(())
    }

    /// Drop the current connection and open a fresh one
    pub fn reconnect(&mut self) -> Result<()> {
        self.transport.close();
        self.state = LinkState::Faulted;
        self.epoch += 1;
        self.reopen()
    }

    pub fn close(&mut self) {
        if self.state != LinkState::Closed {
            self.transport.close();
            self.state = LinkState::Closed;
            self.epoch += 1;
            self.decoder.reset();
            info!(epoch = self.epoch, "Link closed");
        }
    }
}

/// An [`RpcClient`] shared between façades.
pub struct Link<T: Transport = SerialTransport> {
    inner: Arc<Mutex<RpcClient<T>>>,
}

impl<T: Transport> Clone for Link<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl Link<SerialTransport> {
    /// Open a serial port and wrap it in a shared link
    pub fn open(serial: SerialConfig, config: ClientConfig) -> Result<Self> {
        Self::new(SerialTransport::open(serial)?, config)
    }

    /// Locate the board by USB serial number (or product string) and connect
    pub fn discover(serial_number: Option<&str>, serial: SerialConfig, config: ClientConfig) -> Result<Self> {
        Self::new(SerialTransport::find(serial_number, serial)?, config)
    }
}

impl<T: Transport> Link<T> {
    pub fn new(transport: T, config: ClientConfig) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RpcClient::new(transport, config)?)),
        })
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, RpcClient<T>>> {
        self.inner.lock().map_err(|_| ClientError::LinkPoisoned)
    }

    pub fn call(&self, command: &Command) -> Result<Response> {
        self.lock()?.call(command)
    }

    pub fn call_with(&self, command: &Command, policy: RetryPolicy) -> Result<Response> {
        self.lock()?.call_with(command, policy)
    }

    /// Like [`Link::call_with`], also reporting the epoch the response arrived in
    pub fn call_in_epoch(&self, command: &Command, policy: RetryPolicy) -> Result<(Response, u64)> {
        let mut client = self.lock()?;
        let response = client.call_with(command, policy)?;
        Ok((response, client.epoch()))
    }

    pub fn epoch(&self) -> Result<u64> {
        Ok(self.lock()?.epoch())
    }

    pub fn config(&self) -> Result<ClientConfig> {
        Ok(self.lock()?.config().clone())
    }

    pub fn is_connected(&self) -> bool {
        self.lock().map(|client| client.is_connected()).unwrap_or(false)
    }

    pub fn reconnect(&self) -> Result<()> {
        self.lock()?.reconnect()
    }

    pub fn close(&self) -> Result<()> {
        self.lock()?.close();
        Ok(())
    }

    /// Round-trip `token` through the device; the echo must match
    pub fn ping(&self, token: u16) -> Result<u16> {
        match self.call(&Command::Ping { token })? {
            Response::Pong { token: echoed } if echoed == token => Ok(echoed),
            Response::Pong { token: echoed } => Err(ClientError::malformed(
                Opcode::Ping,
                format!("sent token {token}, device echoed {echoed}"),
            )),
            other => Err(unexpected(Opcode::Ping, &other)),
        }
    }

    pub fn get_id(&self) -> Result<DeviceIdentity> {
        match self.call(&Command::GetId)? {
            Response::Id(identity) => {
                debug!(id = %identity, "Device identity");
                Ok(identity)
            }
            other => Err(unexpected(Opcode::GetId, &other)),
        }
    }
}

pub(crate) fn unexpected(opcode: Opcode, response: &Response) -> ClientError {
    ClientError::malformed(opcode, format!("unexpected {} response", response.opcode()))
}

pub(crate) fn expect_ack(opcode: Opcode, response: Response) -> Result<()> {
    match response {
        Response::Ack(acked) if acked == opcode => Ok(()),
        other => Err(unexpected(opcode, &other)),
    }
}
