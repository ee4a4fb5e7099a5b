use core::fmt::Write;

use embedded_nal::{SocketAddr, TcpClientStack};
use heapless::String;

use crate::client::{ConnectionStatus, Device};
use crate::modules::ModuleParams;
use crate::response::IP_MAX_LENGTH;
use crate::serial::BufferedSerial;

/// Handle for the modem's single TCP socket.
#[derive(Debug)]
pub struct TcpSocket {
    _private: (),
}

/// Errors surfaced through the `embedded-nal` adapter. The native facade on
/// [`Device`] is non-failing; these only exist to satisfy the stack trait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum SocketError {
    /// The modem carries exactly one socket and it is already taken.
    SocketInUse,
    /// No APN configured; call [`Device::set_apn`] first.
    NoApn,
    /// IPv6 targets cannot be opened through this modem.
    Unsupported,
    /// The session ended in an error state; reconnect to clear.
    ConnectionFailed,
    /// The operation needs an established connection.
    NotConnected,
}

/// Single-socket TCP stack over the data pipe.
///
/// `connect` takes a resolved address, writes it straight into the session
/// and skips the modem-side DNS states. The application still owns the
/// polling loop: every `nb::WouldBlock` means "call [`Device::run`] and try
/// again".
impl<'a, S, M, const RX: usize, const TX: usize> TcpClientStack for Device<'a, S, M, RX, TX>
where
    S: BufferedSerial,
    M: ModuleParams,
{
    type TcpSocket = TcpSocket;
    type Error = SocketError;

    fn socket(&mut self) -> Result<Self::TcpSocket, Self::Error> {
        if self.take_socket() {
            Ok(TcpSocket { _private: () })
        } else {
            Err(SocketError::SocketInUse)
        }
    }

    fn is_connected(&mut self, _socket: &Self::TcpSocket) -> Result<bool, Self::Error> {
        Ok(Device::is_connected(self))
    }

    fn connect(
        &mut self,
        _socket: &mut Self::TcpSocket,
        remote: SocketAddr,
    ) -> nb::Result<(), Self::Error> {
        match self.connection_status() {
            ConnectionStatus::Connected => Ok(()),
            ConnectionStatus::Connecting => Err(nb::Error::WouldBlock),
            ConnectionStatus::ConnectionError
            | ConnectionStatus::DnsError
            | ConnectionStatus::GenericError => {
                Err(nb::Error::Other(SocketError::ConnectionFailed))
            }
            ConnectionStatus::NotConnected => {
                if !self.apn_configured() {
                    return Err(nb::Error::Other(SocketError::NoApn));
                }
                let ip = match remote {
                    SocketAddr::V4(addr) => {
                        let mut ip: String<IP_MAX_LENGTH> = String::new();
                        write!(ip, "{}", addr.ip())
                            .map_err(|_| nb::Error::Other(SocketError::Unsupported))?;
                        ip
                    }
                    SocketAddr::V6(_) => {
                        return Err(nb::Error::Other(SocketError::Unsupported))
                    }
                };
                self.stage_address(ip, remote.port());
                self.connect();
                Err(nb::Error::WouldBlock)
            }
        }
    }

    fn send(
        &mut self,
        _socket: &mut Self::TcpSocket,
        buffer: &[u8],
    ) -> nb::Result<usize, Self::Error> {
        if !Device::is_connected(self) {
            return Err(nb::Error::Other(SocketError::NotConnected));
        }
        if buffer.is_empty() {
            return Ok(0);
        }
        match self.write(buffer) {
            0 => Err(nb::Error::WouldBlock),
            accepted => Ok(accepted),
        }
    }

    fn receive(
        &mut self,
        _socket: &mut Self::TcpSocket,
        buffer: &mut [u8],
    ) -> nb::Result<usize, Self::Error> {
        match self.read(buffer) {
            0 if Device::is_connected(self) => Err(nb::Error::WouldBlock),
            0 => Err(nb::Error::Other(SocketError::NotConnected)),
            copied => Ok(copied),
        }
    }

    fn close(&mut self, _socket: Self::TcpSocket) -> Result<(), Self::Error> {
        self.disconnect();
        self.release_socket();
        Ok(())
    }
}
