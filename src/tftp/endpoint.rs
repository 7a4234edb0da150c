//! Datagram transports a session can run over.
//!
//! Sessions only ever see [`Endpoint`]: send bytes to a peer, or wait for the
//! next datagram with an optional timeout. A timeout is an ordinary outcome
//! ([`Received::TimedOut`]), not an I/O error.

use std::fmt::Debug;
use std::io::{self, ErrorKind};
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::tftp::shared::MAX_DATAGRAM_LEN;

/// Outcome of a receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<A> {
    Datagram { bytes: Vec<u8>, peer: A },
    TimedOut,
}

pub trait Endpoint {
    type Addr: Clone + PartialEq + Debug;

    fn send(&mut self, peer: &Self::Addr, bytes: &[u8]) -> io::Result<()>;

    /// Waits for the next datagram. `None` waits forever.
    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<Received<Self::Addr>>;
}

impl<E: Endpoint + ?Sized> Endpoint for &mut E {
    type Addr = E::Addr;

    fn send(&mut self, peer: &Self::Addr, bytes: &[u8]) -> io::Result<()> {
        (**self).send(peer, bytes)
    }

    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<Received<Self::Addr>> {
        (**self).receive(timeout)
    }
}

impl Endpoint for UdpSocket {
    type Addr = SocketAddr;

    fn send(&mut self, peer: &SocketAddr, bytes: &[u8]) -> io::Result<()> {
        self.send_to(bytes, peer)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<Received<SocketAddr>> {
        if timeout.map_or(false, |t| t.is_zero()) {
            return Ok(Received::TimedOut);
        }
        self.set_read_timeout(timeout)?;

        let mut buf = vec![0; MAX_DATAGRAM_LEN];
        match self.recv_from(&mut buf) {
            Ok((n, peer)) => {
                buf.truncate(n);
                Ok(Received::Datagram { bytes: buf, peer })
            }
            Err(e) if is_timeout(&e) => Ok(Received::TimedOut),
            Err(e) => Err(e),
        }
    }
}

/// Unix datagram sockets address peers by path. A datagram from an unnamed
/// socket cannot be answered; it is dropped and the wait goes on.
impl Endpoint for UnixDatagram {
    type Addr = PathBuf;

    fn send(&mut self, peer: &PathBuf, bytes: &[u8]) -> io::Result<()> {
        self.send_to(bytes, peer)?;
        Ok(())
    }

    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<Received<PathBuf>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut buf = vec![0; MAX_DATAGRAM_LEN];

        loop {
            let remaining = match time_left(deadline) {
                Some(remaining) => remaining,
                None => return Ok(Received::TimedOut),
            };
            self.set_read_timeout(remaining)?;

            match self.recv_from(&mut buf) {
                Ok((n, addr)) => match addr.as_pathname() {
                    Some(path) => {
                        let peer = path.to_path_buf();
                        buf.truncate(n);
                        return Ok(Received::Datagram { bytes: buf, peer });
                    }
                    None => warn!(len = n, "ignoring datagram from an unnamed socket"),
                },
                Err(e) if is_timeout(&e) => return Ok(Received::TimedOut),
                Err(e) => return Err(e),
            }
        }
    }
}

/// Time left before `deadline`, `Some(None)` when there is none to wait for.
/// Returns `None` once it has passed.
fn time_left(deadline: Option<Instant>) -> Option<Option<Duration>> {
    match deadline {
        Some(deadline) => {
            let now = Instant::now();
            if now >= deadline {
                None
            } else {
                Some(Some(deadline - now))
            }
        }
        None => Some(None),
    }
}

/// Platforms report an expired read timeout as either kind.
fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

/// Receives the next datagram from `peer`, dropping anything sent by other
/// addresses. The timeout bounds the whole wait, ignored datagrams included.
///
/// With `peer == None` every sender is accepted.
pub fn receive_from<E: Endpoint>(
    endpoint: &mut E,
    peer: Option<&E::Addr>,
    timeout: Option<Duration>,
) -> io::Result<Received<E::Addr>> {
    let deadline = timeout.map(|t| Instant::now() + t);

    loop {
        let remaining = match time_left(deadline) {
            Some(remaining) => remaining,
            None => return Ok(Received::TimedOut),
        };

        let received = endpoint.receive(remaining)?;
        if let (Received::Datagram { peer: from, .. }, Some(expected)) = (&received, peer) {
            if from != expected {
                warn!(?from, ?expected, "ignoring datagram from unexpected peer");
                continue;
            }
        }
        return Ok(received);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").unwrap()
    }

    #[test]
    fn udp_send_and_receive() {
        let mut a = loopback();
        let mut b = loopback();
        let b_addr = b.local_addr().unwrap();

        Endpoint::send(&mut a, &b_addr, b"ping").unwrap();
        match b.receive(Some(Duration::from_secs(2))).unwrap() {
            Received::Datagram { bytes, peer } => {
                assert_eq!(bytes, b"ping");
                assert_eq!(peer, a.local_addr().unwrap());
            }
            Received::TimedOut => panic!("datagram lost on loopback"),
        }
    }

    #[test]
    fn udp_receive_times_out() {
        let mut a = loopback();
        let received = a.receive(Some(Duration::from_millis(50))).unwrap();
        assert_eq!(received, Received::TimedOut);
    }

    #[test]
    fn zero_timeout_returns_immediately() {
        let mut a = loopback();
        assert_eq!(a.receive(Some(Duration::ZERO)).unwrap(), Received::TimedOut);
    }

    #[test]
    fn receive_from_skips_other_peers() {
        let mut target = loopback();
        let mut stranger = loopback();
        let mut expected = loopback();
        let target_addr = target.local_addr().unwrap();
        let expected_addr = expected.local_addr().unwrap();

        Endpoint::send(&mut stranger, &target_addr, b"noise").unwrap();
        Endpoint::send(&mut expected, &target_addr, b"signal").unwrap();

        let timeout = Some(Duration::from_secs(2));
        let received = receive_from(&mut target, Some(&expected_addr), timeout);
        match received.unwrap() {
            Received::Datagram { bytes, peer } => {
                assert_eq!(bytes, b"signal");
                assert_eq!(peer, expected_addr);
            }
            Received::TimedOut => panic!("expected datagram was not delivered"),
        }
    }

    #[test]
    fn receive_from_deadline_covers_ignored_datagrams() {
        let mut target = loopback();
        let mut stranger = loopback();
        let target_addr = target.local_addr().unwrap();
        let stranger_addr = stranger.local_addr().unwrap();
        let nobody: SocketAddr = "127.0.0.1:9".parse().unwrap();
        assert_ne!(stranger_addr, nobody);

        Endpoint::send(&mut stranger, &target_addr, b"noise").unwrap();
        let received =
            receive_from(&mut target, Some(&nobody), Some(Duration::from_millis(100))).unwrap();
        assert_eq!(received, Received::TimedOut);
    }

    #[test]
    fn unix_datagram_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let a_path = dir.path().join("a.sock");
        let b_path = dir.path().join("b.sock");
        let mut a = UnixDatagram::bind(&a_path).unwrap();
        let mut b = UnixDatagram::bind(&b_path).unwrap();

        Endpoint::send(&mut a, &b_path, b"hello").unwrap();
        match b.receive(Some(Duration::from_secs(2))).unwrap() {
            Received::Datagram { bytes, peer } => {
                assert_eq!(bytes, b"hello");
                assert_eq!(peer, a_path);
            }
            Received::TimedOut => panic!("datagram lost"),
        }
        assert_eq!(b.receive(Some(Duration::from_millis(20))).unwrap(), Received::TimedOut);
    }

    #[test]
    fn unix_datagram_skips_unnamed_senders() {
        let dir = tempfile::tempdir().unwrap();
        let target_path = dir.path().join("target.sock");
        let named_path = dir.path().join("named.sock");
        let mut target = UnixDatagram::bind(&target_path).unwrap();
        let mut named = UnixDatagram::bind(&named_path).unwrap();
        let unnamed = UnixDatagram::unbound().unwrap();

        unnamed.send_to(b"noise", &target_path).unwrap();
        assert_eq!(
            target.receive(Some(Duration::from_millis(50))).unwrap(),
            Received::TimedOut
        );

        unnamed.send_to(b"noise", &target_path).unwrap();
        Endpoint::send(&mut named, &target_path, b"signal").unwrap();
        assert_eq!(
            target.receive(Some(Duration::from_secs(2))).unwrap(),
            Received::Datagram {
                bytes: b"signal".to_vec(),
                peer: named_path,
            }
        );
    }
}
