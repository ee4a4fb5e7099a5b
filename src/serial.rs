/// Byte transport between the driver and the modem UART.
///
/// Implementations are expected to be buffered in both directions: `write`
/// queues into a transmit buffer drained by the hardware, and incoming bytes
/// accumulate in a receive buffer until `read` is called. The driver never
/// writes more than `space_available` bytes in one tick and never reads more
/// than `bytes_available`, so a conforming implementation never blocks.
pub trait BufferedSerial {
    /// Number of bytes waiting in the receive buffer.
    fn bytes_available(&self) -> u16;

    /// Free space in the transmit buffer.
    fn space_available(&self) -> u16;

    /// Take one byte from the receive buffer. Only valid when
    /// `bytes_available() > 0`.
    fn read_byte(&mut self) -> u8;

    /// Take up to `buffer.len()` bytes from the receive buffer, returning
    /// the number of bytes copied.
    fn read(&mut self, buffer: &mut [u8]) -> u16 {
        let count = core::cmp::min(buffer.len(), self.bytes_available() as usize);
        for slot in &mut buffer[..count] {
            *slot = self.read_byte();
        }
        count as u16
    }

    /// Queue up to `data.len()` bytes for transmission, returning the number
    /// of bytes accepted.
    fn write(&mut self, data: &[u8]) -> u16;

    /// Discard everything currently in the receive buffer.
    fn flush_receive_buffers(&mut self);

    /// Total capacity of the receive buffer.
    fn read_buffer_size(&self) -> u16;
}

impl<T: BufferedSerial> BufferedSerial for &mut T {
    fn bytes_available(&self) -> u16 {
        T::bytes_available(self)
    }

    fn space_available(&self) -> u16 {
        T::space_available(self)
    }

    fn read_byte(&mut self) -> u8 {
        T::read_byte(self)
    }

    fn read(&mut self, buffer: &mut [u8]) -> u16 {
        T::read(self, buffer)
    }

    fn write(&mut self, data: &[u8]) -> u16 {
        T::write(self, data)
    }

    fn flush_receive_buffers(&mut self) {
        T::flush_receive_buffers(self)
    }

    fn read_buffer_size(&self) -> u16 {
        T::read_buffer_size(self)
    }
}
