//! # Framing codec
//!
//! Every request and response travels in one frame:
//!
//! ```text
//!  0      1        2       3..4          5..6          7..7+N    7+N..9+N
//! +------+--------+-------+-------------+-------------+---------+----------+
//! | 0xA5 | opcode | flags | seq (u16LE) | len (u16LE) | payload | crc16 LE |
//! +------+--------+-------+-------------+-------------+---------+----------+
//! ```
//!
//! The CRC (CRC-16/CCITT-FALSE) covers everything between the marker and the
//! trailer. Decoding is streaming: bytes are appended to a [`FrameDecoder`] as
//! they arrive and complete frames are pulled out one at a time. Garbage, a
//! failed checksum or an implausible length field makes the decoder drop a single
//! byte and search for the next marker. A partial frame is abandoned as soon as
//! a complete, valid frame shows up behind it.

use crate::constants::{
    DEFAULT_MAX_PAYLOAD, DEFAULT_RESYNC_LIMIT, FRAME_HEADER_SIZE, FRAME_MARKER, FRAME_OVERHEAD,
    FRAME_TRAILER_SIZE,
};
use crate::error::{ClientError, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{CRC_16_IBM_3740, Crc};
use modular_bitfield::prelude::*;
use num_enum::{FromPrimitive, IntoPrimitive};
use strum_macros::Display;
use tracing::{debug, warn};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Command identifiers shared by requests and their responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoPrimitive, FromPrimitive)]
#[repr(u8)]
pub enum Opcode {
    // identity / liveness
    Ping = 0x01,
    GetId = 0x02,
    GetConfig = 0x03,

    // servo channels
    ConfigureChannel = 0x10,
    SetAngle = 0x11,
    GetAngle = 0x12,
    SetFrequency = 0x13,

    // heater
    EnableHeater = 0x20,
    DisableHeater = 0x21,
    SetHeaterDuty = 0x22,
    SetPidConsts = 0x23,
    RecalcPi = 0x24,
    GetPidVals = 0x25,
    SetSetpoint = 0x26,
    ResetPid = 0x27,

    #[num_enum(catch_all)]
    Unknown(u8),
}

#[bitfield(bytes = 1)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameFlags {
    pub response: bool,
    pub nack: bool,
    #[skip]
    unused: B6,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub opcode: Opcode,
    pub flags: FrameFlags,
    pub seq: u16,
    pub payload: Bytes,
}

impl Frame {
    pub fn request(opcode: Opcode, seq: u16, payload: Bytes) -> Self {
        Self {
            opcode,
            flags: FrameFlags::new(),
            seq,
            payload,
        }
    }

    pub fn response(opcode: Opcode, seq: u16, payload: Bytes) -> Self {
        Self {
            opcode,
            flags: FrameFlags::new().with_response(true),
            seq,
            payload,
        }
    }

    /// A negative acknowledgement carrying the device's reason code and message
    pub fn nack(opcode: Opcode, seq: u16, reason: u8, message: &str) -> Self {
        let mut payload = BytesMut::with_capacity(1 + message.len());
        payload.put_u8(reason);
        payload.put_slice(message.as_bytes());
        Self {
            opcode,
            flags: FrameFlags::new().with_response(true).with_nack(true),
            seq,
            payload: payload.freeze(),
        }
    }

    pub fn is_response(&self) -> bool {
        self.flags.response()
    }

    pub fn is_nack(&self) -> bool {
        self.flags.nack()
    }

    /// Size of this frame on the wire
    pub fn wire_len(&self) -> usize {
        FRAME_OVERHEAD + self.payload.len()
    }

    /// Serialise the frame, refusing payloads larger than `max_payload`.
    pub fn encode(&self, max_payload: usize) -> Result<Bytes> {
        let max = max_payload.min(u16::MAX as usize);
        if self.payload.len() > max {
            return Err(ClientError::PayloadTooLarge {
                len: self.payload.len(),
                max,
            });
        }

        let mut out = BytesMut::with_capacity(self.wire_len());
        out.put_u8(FRAME_MARKER);
        out.put_u8(self.opcode.into());
        out.put_slice(&self.flags.into_bytes());
        out.put_u16_le(self.seq);
        out.put_u16_le(self.payload.len() as u16);
        out.put_slice(&self.payload);
        let crc = checksum(&out[1..]);
        out.put_u16_le(crc);
        Ok(out.freeze())
    }
}

/// Build the wire bytes for a frame in one go.
pub fn encode(opcode: Opcode, seq: u16, flags: FrameFlags, payload: Bytes, max_payload: usize) -> Result<Bytes> {
    Frame {
        opcode,
        flags,
        seq,
        payload,
    }
    .encode(max_payload)
}

/// CRC-16/CCITT-FALSE as used by the frame trailer
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}

/// Result of scanning a receive buffer.
#[derive(Debug, Clone, PartialEq)]
struct Scan {
    /// Leading bytes that cannot start a valid frame
    skipped: usize,
    /// A complete frame directly after the skipped bytes, with its wire length
    frame: Option<(Frame, usize)>,
}

/// Outcome of parsing the bytes that start at a marker
#[derive(Debug, Clone, PartialEq)]
enum Parse {
    /// More bytes are needed to decide
    Incomplete,
    LengthExceeded { payload_len: usize },
    BadChecksum { expected: u16, actual: u16 },
    Complete(Frame, usize),
}

fn parse_at(raw: &[u8], max_payload: usize) -> Parse {
    if raw.len() < FRAME_HEADER_SIZE {
        return Parse::Incomplete;
    }

    let payload_len = u16::from_le_bytes([raw[5], raw[6]]) as usize;
    if payload_len > max_payload {
        return Parse::LengthExceeded { payload_len };
    }

    let total = FRAME_HEADER_SIZE + payload_len + FRAME_TRAILER_SIZE;
    if raw.len() < total {
        return Parse::Incomplete;
    }

    let crc_at = total - FRAME_TRAILER_SIZE;
    let expected = u16::from_le_bytes([raw[crc_at], raw[crc_at + 1]]);
    let actual = checksum(&raw[1..crc_at]);
    if expected != actual {
        return Parse::BadChecksum { expected, actual };
    }

    let frame = Frame {
        opcode: Opcode::from_primitive(raw[1]),
        flags: FrameFlags::from_bytes([raw[2]]),
        seq: u16::from_le_bytes([raw[3], raw[4]]),
        payload: Bytes::copy_from_slice(&raw[FRAME_HEADER_SIZE..crc_at]),
    };
    Parse::Complete(frame, total)
}

/// Offset of the first marker in `buf` that starts a complete, valid frame
fn next_complete(buf: &[u8], max_payload: usize) -> Option<usize> {
    buf.iter()
        .enumerate()
        .filter(|&(_, &b)| b == FRAME_MARKER)
        .map(|(offset, _)| offset)
        .find(|&offset| matches!(parse_at(&buf[offset..], max_payload), Parse::Complete(..)))
}

fn scan(buf: &[u8], max_payload: usize) -> Scan {
    let mut skipped = 0;

    loop {
        let Some(start) = buf[skipped..].iter().position(|&b| b == FRAME_MARKER) else {
            return Scan {
                skipped: buf.len(),
                frame: None,
            };
        };
        skipped += start;

        match parse_at(&buf[skipped..], max_payload) {
            Parse::Complete(frame, len) => {
                return Scan {
                    skipped,
                    frame: Some((frame, len)),
                };
            }
            Parse::LengthExceeded { payload_len } => {
                warn!(
                    payload_len,
                    max_payload, "Frame length field exceeds limit, resynchronising"
                );
                skipped += 1;
            }
            Parse::BadChecksum { expected, actual } => {
                warn!(
                    expected = format_args!("0x{expected:04X}"),
                    actual = format_args!("0x{actual:04X}"),
                    "Frame checksum mismatch, resynchronising"
                );
                skipped += 1;
            }
            Parse::Incomplete => {
                // A cut-off frame never completes; a valid frame behind it wins
                let rest = &buf[skipped + 1..];
                match next_complete(rest, max_payload) {
                    Some(offset) => {
                        warn!(
                            dropped = offset + 1,
                            "Incomplete frame superseded by a complete one, resynchronising"
                        );
                        skipped += 1 + offset;
                    }
                    None => return Scan { skipped, frame: None },
                }
            }
        }
    }
}

/// Try to pull one frame off the front of `buf`.
///
/// Returns the frame, if one is complete, and the number of bytes the caller
/// should discard from the front of the buffer. Garbage in front of the next
/// plausible frame counts as consumed; an incomplete frame does not.
pub fn try_decode(buf: &[u8], max_payload: usize) -> (Option<Frame>, usize) {
    let Scan { skipped, frame } = scan(buf, max_payload);
    match frame {
        Some((frame, len)) => (Some(frame), skipped + len),
        None => (None, skipped),
    }
}

/// Streaming decoder that buffers partial input between reads.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_payload: usize,
    resync_limit: usize,
    dropped: usize,
}

impl FrameDecoder {
    pub fn new(max_payload: usize, resync_limit: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(FRAME_OVERHEAD + max_payload),
            max_payload,
            resync_limit,
            dropped: 0,
        }
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Extract the next complete frame, if any.
    ///
    /// Fails with [`ClientError::FrameCorruption`] once more than `resync_limit`
    /// bytes have been discarded without a valid frame in between; the buffer is
    /// cleared so a later call starts from a clean state.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let Scan { skipped, frame } = scan(&self.buffer, self.max_payload);

        if skipped > 0 {
            debug!(
                skipped,
                bytes = hex::encode(&self.buffer[..skipped]),
                "Discarding unframed bytes"
            );
            self.buffer.advance(skipped);
            self.dropped += skipped;
        }

        if let Some((frame, len)) = frame {
            self.buffer.advance(len);
            self.dropped = 0;
            return Ok(Some(frame));
        }

        if self.dropped > self.resync_limit {
            let dropped = self.dropped;
            self.reset();
            return Err(ClientError::FrameCorruption { dropped });
        }

        Ok(None)
    }

    /// Forget buffered bytes and the resync counter, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.dropped = 0;
    }

    /// Bytes waiting for the rest of their frame
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Bytes discarded since the last good frame
    pub fn dropped(&self) -> usize {
        self.dropped
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAYLOAD, DEFAULT_RESYNC_LIMIT)
    }
}
