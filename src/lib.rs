//! Host side of Teensy 2 pressure pads: report codec, sensor linearization,
//! HID device driver and the session engine that fans pad events out to
//! connected peers.

pub mod config;
pub mod driver;
pub mod protocol;
pub mod session;
pub mod signal;
