//! Session and broadcast engine
//!
//! Keeps the registry of connected pads, routes peer commands to them and
//! fans their events out to subscribed peers.

pub mod calibration;
pub mod engine;
pub mod messages;
pub mod throttle;
pub mod transport;

use crate::driver::{DeviceId, DriverError};

pub use engine::{EngineMessage, SessionEngine, SessionHandle};
pub use messages::{CalibrationStatus, ClientCommand, DeviceDescription, ServerMessage};
pub use transport::{ChannelTransport, PeerId, Transport};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Unknown device: {0}")]
    UnknownDevice(DeviceId),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Session engine stopped")]
    EngineStopped,

    #[error(transparent)]
    Driver(#[from] DriverError),
}
