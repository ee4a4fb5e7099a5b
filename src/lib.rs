#![cfg_attr(not(test), no_std)]

//! Driver turning a byte-oriented serial link to a SIMCom AT-command
//! cellular modem into a single reliable TCP data pipe for bare-metal
//! firmware.
//!
//! The session is advanced by periodic [`Device::run`] calls from the
//! application's main loop and never blocks: every command is either queued
//! whole into the serial transmit buffer or retried on a later tick.
//! Payload moves through two internal byte rings, so [`Device::write`] and
//! [`Device::read`] are cheap and safe to call at any time.

// This mod MUST go first, so that the others see its macros.
mod fmt;

mod client;
mod line;
pub mod modules;
mod nal;
mod response;
mod ring_buffer;
mod serial;

#[cfg(test)]
mod test_helpers;

pub use client::{ConnectionStatus, Device, IdKind, IDSTRING_MAX_LENGTH};
pub use line::LINE_MAX_LENGTH;
pub use modules::{ModuleParams, SetupStep, Sim7000, Sim800};
pub use nal::{SocketError, TcpSocket};
pub use response::IP_MAX_LENGTH;
pub use ring_buffer::RingBuffer;
pub use serial::BufferedSerial;

// Re-export the network abstraction in use.
pub use embedded_nal;
