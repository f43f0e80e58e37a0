// Protocol constants for the rustpill board

/// Start-of-frame marker, the anchor used when resynchronising a stream
pub const FRAME_MARKER: u8 = 0xA5;

/// Marker, opcode, flags, sequence tag (2 bytes) and payload length (2 bytes)
pub const FRAME_HEADER_SIZE: usize = 7;

/// CRC-16 trailer
pub const FRAME_TRAILER_SIZE: usize = 2;

/// Bytes a frame carries on top of its payload
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE;

/// Default upper bound on a single payload
pub const DEFAULT_MAX_PAYLOAD: usize = 256;

/// Default number of bytes the decoder may discard before giving up on the stream
pub const DEFAULT_RESYNC_LIMIT: usize = 512;

/// Servo angle domain is [0, MAX_ANGLE_DEGREES]
pub const MAX_ANGLE_DEGREES: u8 = 180;

/// Open-loop heater duty is expressed in per-mille
pub const HEATER_DUTY_MAX: u16 = 1000;

/// PWM frequency the board boots with
pub const DEFAULT_PWM_FREQUENCY_HZ: u32 = 50;

/// Timer resolution of the board's PWM peripheral
pub const PWM_RESOLUTION_BITS: u8 = 16;

/// Pulse width of a typical hobby servo at 0°
pub const SERVO_MIN_PULSE_US: u32 = 500;

/// Pulse width of a typical hobby servo at 180°
pub const SERVO_MAX_PULSE_US: u32 = 2500;

/// PWM channels broken out on the board (PB6-PB9)
pub const DEFAULT_CHANNEL_COUNT: u8 = 4;

/// Longest identity the device may report
pub const MAX_ID_LEN: usize = 32;

/// Size of the GetPidVals response payload
pub const PID_VALUES_SIZE: usize = 25;

/// Size of the fixed part of the GetConfig response payload
pub const SERVO_CONFIG_HEADER_SIZE: usize = 7;

/// Size of one per-channel entry in the GetConfig response payload
pub const CHANNEL_CONFIG_SIZE: usize = 8;

/// Serial line speed used when none is configured
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// USB product string the board enumerates with
pub const BOARD_PRODUCT: &str = "bluepill-servo";
