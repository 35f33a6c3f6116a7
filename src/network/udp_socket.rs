//! A non-blocking UDP socket for use with sessions.

use std::{
    io::{self, ErrorKind},
    net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket},
};

use crate::report_violation;
use crate::telemetry::{ViolationKind, ViolationSeverity};
use crate::DatagramSocket;

/// Payloads above this size risk IP fragmentation on some paths.
const IDEAL_MAX_UDP_PACKET_SIZE: usize = 508;

/// A non-blocking UDP socket usable as the host transport of a session.
///
/// ```no_run
/// use rollback_netplay::UdpNonBlockingSocket;
///
/// let socket = UdpNonBlockingSocket::bind_to_port(7000)?;
/// # Ok::<(), std::io::Error>(())
/// ```
#[derive(Debug)]
pub struct UdpNonBlockingSocket {
    socket: UdpSocket,
}

impl UdpNonBlockingSocket {
    /// Binds to `0.0.0.0:port` in non-blocking mode. Port 0 lets the OS pick.
    pub fn bind_to_port(port: u16) -> Result<Self, io::Error> {
        Self::bind_to_addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port))
    }

    /// Binds to `addr` in non-blocking mode.
    pub fn bind_to_addr(addr: SocketAddr) -> Result<Self, io::Error> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        Ok(Self { socket })
    }

    /// The address the socket is bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, io::Error> {
        self.socket.local_addr()
    }
}

impl DatagramSocket<SocketAddr> for UdpNonBlockingSocket {
    fn send_datagram(&mut self, bytes: &[u8], dest: &SocketAddr) -> io::Result<()> {
        // Large packets are usually the result of large input types or a long
        // unacknowledged run; they still go out.
        if bytes.len() > IDEAL_MAX_UDP_PACKET_SIZE {
            report_violation!(
                ViolationSeverity::Warning,
                ViolationKind::Transport,
                "Sending UDP packet of size {} bytes, which is larger than ideal ({})",
                bytes.len(),
                IDEAL_MAX_UDP_PACKET_SIZE
            );
        }
        self.socket.send_to(bytes, dest).map(|_| ())
    }

    fn poll_datagram(&mut self, buf: &mut [u8]) -> io::Result<Option<(usize, SocketAddr)>> {
        loop {
            match self.socket.recv_from(buf) {
                Ok((len, from)) => return Ok(Some((len, from))),
                Err(ref err) if err.kind() == ErrorKind::WouldBlock => return Ok(None),
                // Windows reports ICMP port unreachable from an earlier send this way.
                Err(ref err) if err.kind() == ErrorKind::ConnectionReset => continue,
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[cfg(not(miri))]
    #[track_caller]
    fn wait_for_datagrams(
        socket: &mut UdpNonBlockingSocket,
        expected: usize,
        max_retries: u32,
    ) -> Vec<(Vec<u8>, SocketAddr)> {
        let mut buf = [0u8; 4096];
        let mut received = Vec::new();
        for _ in 0..max_retries {
            while let Some((len, from)) = socket.poll_datagram(&mut buf).unwrap() {
                received.push((buf[..len].to_vec(), from));
            }
            if received.len() >= expected {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(50));
        }
        received
    }

    // Sockets bound to 0.0.0.0 must be addressed through loopback on Windows.
    #[cfg(not(miri))]
    fn loopback(socket: &UdpNonBlockingSocket) -> SocketAddr {
        let port = socket.local_addr().unwrap().port();
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    #[serial]
    #[cfg(not(miri))]
    fn poll_without_traffic_returns_none() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.poll_datagram(&mut buf).unwrap().is_none());
        assert!(socket.poll_datagram(&mut buf).unwrap().is_none());
    }

    #[test]
    #[serial]
    #[cfg(not(miri))]
    fn datagrams_arrive_with_sender() {
        let mut a = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let mut b = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let addr_a = loopback(&a);
        let addr_b = loopback(&b);

        a.send_datagram(&[1, 2, 3], &addr_b).unwrap();
        a.send_datagram(&[4, 5], &addr_b).unwrap();

        let received = wait_for_datagrams(&mut b, 2, 20);
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].0, vec![1, 2, 3]);
        assert_eq!(received[0].1.port(), addr_a.port());
    }

    #[test]
    #[serial]
    #[cfg(not(miri))]
    fn oversized_datagrams_are_still_sent() {
        let mut socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let own = loopback(&socket);
        let payload = vec![7u8; IDEAL_MAX_UDP_PACKET_SIZE + 100];
        socket.send_datagram(&payload, &own).unwrap();
        let received = wait_for_datagrams(&mut socket, 1, 20);
        assert_eq!(received[0].0.len(), payload.len());
    }

    #[test]
    #[serial]
    #[cfg(not(miri))]
    fn bound_port_is_assigned() {
        let socket = UdpNonBlockingSocket::bind_to_port(0).unwrap();
        let local = socket.local_addr().unwrap();
        assert_ne!(local.port(), 0);
        assert!(local.ip().is_unspecified());
    }
}
