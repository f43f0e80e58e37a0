pub mod calibration;
pub mod config;
pub mod constants;
pub mod error;
pub mod frame;
pub mod heater;
pub mod message;
pub mod pid;
pub mod rpc;
pub mod servo;
pub mod transport;

// Re-export the façades and the types most callers need
pub use calibration::{ChannelCalibration, ChannelConfig, PwmTiming, ServoConfig, us_to_duty_cycle};
pub use config::ClientConfig;
pub use error::{ClientError, Result};
pub use heater::HeaterClient;
pub use message::{Command, DeviceIdentity, Response};
pub use pid::{PidConstants, PidValues};
pub use rpc::{Link, RetryPolicy, RpcClient};
pub use servo::ServoClient;
pub use transport::{SerialConfig, SerialTransport, Transport};
