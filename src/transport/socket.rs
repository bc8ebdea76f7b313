//! Minimal UDP socket wrapper for Mi IO exchanges.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use tracing::{instrument, trace};

/// Error type for socket operations.
#[derive(Debug)]
pub enum SocketError {
    /// Underlying I/O error
    Io(io::Error),
}

impl SocketError {
    /// Whether the error is a receive timeout.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        match self {
            Self::Io(err) => matches!(
                err.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
            ),
        }
    }
}

impl core::fmt::Display for SocketError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "socket error: {err}"),
        }
    }
}

impl std::error::Error for SocketError {}

impl From<io::Error> for SocketError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<SocketError> for crate::Error {
    fn from(err: SocketError) -> Self {
        match err {
            SocketError::Io(err) => Self::Io(err),
        }
    }
}

/// Binding for a UDP socket.
#[derive(Debug, Clone)]
pub struct SocketBinding {
    socket: Arc<UdpSocket>,
}

impl SocketBinding {
    /// Bind to the provided address.
    pub fn bind(addr: SocketAddr) -> Result<Self, SocketError> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(false)?;
        Ok(Self {
            socket: Arc::new(socket),
        })
    }

    /// Bind an ephemeral port able to reach `remote`, with broadcast enabled.
    pub fn ephemeral_for(remote: SocketAddr) -> Result<Self, SocketError> {
        let local = match remote.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let binding = Self::bind(local)?;
        if remote.is_ipv4() {
            binding.socket.set_broadcast(true)?;
        }
        Ok(binding)
    }

    /// Set socket read timeout.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<(), SocketError> {
        self.socket.set_read_timeout(timeout)?;
        Ok(())
    }

    /// Adjust the non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        self.socket.set_nonblocking(nonblocking)?;
        Ok(())
    }

    /// Send bytes to a remote address.
    #[instrument(level = "trace", skip(self, buf), fields(len = buf.len()))]
    pub fn send_to(&self, buf: &[u8], addr: SocketAddr) -> Result<usize, SocketError> {
        Ok(self.socket.send_to(buf, addr)?)
    }

    /// Receive bytes into the provided buffer.
    pub fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), SocketError> {
        Ok(self.socket.recv_from(buf)?)
    }

    /// Discard datagrams already waiting on the socket. Returns how many were dropped.
    pub fn drain(&self, buf: &mut [u8]) -> Result<usize, SocketError> {
        self.set_nonblocking(true)?;
        let mut dropped = 0;
        let outcome = loop {
            match self.socket.recv_from(buf) {
                Ok((len, from)) => {
                    trace!(len, %from, "dropping stale datagram");
                    dropped += 1;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break Ok(dropped),
                Err(err) => break Err(SocketError::from(err)),
            }
        };
        self.set_nonblocking(false)?;
        outcome
    }

    /// Access the local address for this binding.
    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        Ok(self.socket.local_addr()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    #[test]
    fn test_timeout_is_reported() {
        let socket = SocketBinding::bind(loopback()).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_drain_discards_pending_datagrams() {
        let receiver = SocketBinding::bind(loopback()).unwrap();
        let sender = SocketBinding::bind(loopback()).unwrap();
        let target = receiver.local_addr().unwrap();
        sender.send_to(b"one", target).unwrap();
        sender.send_to(b"two", target).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        let mut buf = [0u8; 16];
        assert_eq!(receiver.drain(&mut buf).unwrap(), 2);

        receiver
            .set_read_timeout(Some(Duration::from_millis(20)))
            .unwrap();
        assert!(receiver.recv_from(&mut buf).unwrap_err().is_timeout());
    }
}
