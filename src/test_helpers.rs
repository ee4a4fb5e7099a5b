//! Scripted serial port double for driving the session in hosted tests.

use std::collections::VecDeque;
use std::vec::Vec;

use crate::serial::BufferedSerial;

/// Serial port with a scripted receive side and a captured transmit side.
///
/// `space_available` reports a fixed value rather than tracking writes, so
/// tests can dial in back-pressure conditions without modelling a drain.
pub struct MockSerial {
    rx: VecDeque<u8>,
    pub tx: Vec<u8>,
    space: u16,
    read_buffer_size: u16,
}

impl MockSerial {
    pub fn new() -> Self {
        MockSerial {
            rx: VecDeque::new(),
            tx: Vec::new(),
            space: 256,
            read_buffer_size: 256,
        }
    }

    /// Script bytes arriving from the modem.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Drain everything the driver wrote since the last call.
    pub fn take_tx(&mut self) -> Vec<u8> {
        core::mem::take(&mut self.tx)
    }

    /// Pretend the transmit buffer has exactly `space` bytes free.
    pub fn set_space(&mut self, space: u16) {
        self.space = space;
    }
}

impl BufferedSerial for MockSerial {
    fn bytes_available(&self) -> u16 {
        self.rx.len() as u16
    }

    fn space_available(&self) -> u16 {
        self.space
    }

    fn read_byte(&mut self) -> u8 {
        self.rx.pop_front().unwrap_or(0)
    }

    fn write(&mut self, data: &[u8]) -> u16 {
        self.tx.extend_from_slice(data);
        data.len() as u16
    }

    fn flush_receive_buffers(&mut self) {
        self.rx.clear();
    }

    fn read_buffer_size(&self) -> u16 {
        self.read_buffer_size
    }
}
