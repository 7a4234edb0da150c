//! In-process endpoints joined by channels.
//!
//! [`MemoryEndpoint::pair`] returns two connected endpoints, typically run on
//! two threads. Outgoing datagrams can be dropped on purpose to exercise loss.

use std::collections::BTreeSet;
use std::io::{self, ErrorKind};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::tftp::endpoint::{Endpoint, Received};

type Datagram = (Vec<u8>, String);

pub struct MemoryEndpoint {
    name: String,
    peer: String,
    tx: Sender<Datagram>,
    rx: Receiver<Datagram>,
    sent: usize,
    drop_sends: BTreeSet<usize>,
    log: Vec<Vec<u8>>,
}

impl MemoryEndpoint {
    /// Two endpoints addressed as `a` and `b`, each able to reach the other.
    pub fn pair(a: &str, b: &str) -> (MemoryEndpoint, MemoryEndpoint) {
        let (a_tx, b_rx) = unbounded();
        let (b_tx, a_rx) = unbounded();
        (MemoryEndpoint::new(a, b, a_tx, a_rx), MemoryEndpoint::new(b, a, b_tx, b_rx))
    }

    fn new(name: &str, peer: &str, tx: Sender<Datagram>, rx: Receiver<Datagram>) -> Self {
        MemoryEndpoint {
            name: name.to_string(),
            peer: peer.to_string(),
            tx,
            rx,
            sent: 0,
            drop_sends: BTreeSet::new(),
            log: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// A third endpoint named `name` that reaches this endpoint's peer.
    /// Nothing is connected to its own receiving side, so it only sends.
    pub fn stranger(&self, name: &str) -> MemoryEndpoint {
        let (_, rx) = unbounded();
        MemoryEndpoint::new(name, &self.peer, self.tx.clone(), rx)
    }

    /// Silently loses the sends with these 0-based indices.
    pub fn drop_sends(&mut self, indices: impl IntoIterator<Item = usize>) {
        self.drop_sends.extend(indices);
    }

    /// Every datagram handed to `send`, lost ones included, in order.
    pub fn sent(&self) -> &[Vec<u8>] {
        &self.log
    }
}

impl Endpoint for MemoryEndpoint {
    type Addr = String;

    fn send(&mut self, peer: &String, bytes: &[u8]) -> io::Result<()> {
        if *peer != self.peer {
            return Err(io::Error::new(
                ErrorKind::NotFound,
                format!("no endpoint named '{}'", peer),
            ));
        }

        let index = self.sent;
        self.sent += 1;
        self.log.push(bytes.to_vec());
        if self.drop_sends.contains(&index) {
            return Ok(());
        }

        self.tx
            .send((bytes.to_vec(), self.name.clone()))
            .map_err(|_| io::Error::new(ErrorKind::BrokenPipe, "peer endpoint closed"))
    }

    fn receive(&mut self, timeout: Option<Duration>) -> io::Result<Received<String>> {
        let closed = || io::Error::new(ErrorKind::ConnectionAborted, "peer endpoint closed");
        match timeout {
            Some(timeout) => match self.rx.recv_timeout(timeout) {
                Ok((bytes, peer)) => Ok(Received::Datagram { bytes, peer }),
                Err(RecvTimeoutError::Timeout) => Ok(Received::TimedOut),
                Err(RecvTimeoutError::Disconnected) => Err(closed()),
            },
            None => self
                .rx
                .recv()
                .map(|(bytes, peer)| Received::Datagram { bytes, peer })
                .map_err(|_| closed()),
        }
    }
}
