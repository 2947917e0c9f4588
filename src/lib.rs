//! Flash firmware images onto ESP8266 and ESP32 devices
//!
//! `wledflasher` drives a complete flashing session over a serial port:
//! resetting the device into its ROM bootloader, identifying the chip,
//! uploading the RAM stub loader, negotiating a faster baud rate, erasing and
//! writing flash, and finally streaming the device's log output.
//!
//! The session is sequenced by [session::FlashSession], which talks to the
//! device only through the [flasher::Connector] and [flasher::ChipClient]
//! traits. [flasher::SerialConnector] and [flasher::Flasher] implement those
//! traits over a real serial port; front ends report progress by implementing
//! [session::Observer].
//!
//! ## Cargo features
//!
//! - `cli`: the `wledflasher` binary, its configuration file and terminal
//!   output (enabled by default)

pub use self::error::Error;

pub mod connection;
pub mod error;
pub mod flash_data;
pub mod flasher;
pub mod image_format;
pub mod monitor;
pub mod release;
pub mod serial;
pub mod session;
pub mod targets;
pub mod writer;

#[cfg(feature = "cli")]
pub mod cli;
#[cfg(feature = "cli")]
pub mod logging;
