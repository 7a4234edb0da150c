use std::fmt::{self, Display, Formatter};
use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::tftp::shared::{Opcode, PacketError};

/// What a session was waiting for when it gave up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Awaiting {
    Request,
    Ack(u16),
    Data(u16),
}

impl Display for Awaiting {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Awaiting::Request => f.write_str("a request"),
            Awaiting::Ack(blk) => write!(f, "ACK [{}]", blk),
            Awaiting::Data(blk) => write!(f, "DATA [{}]", blk),
        }
    }
}

/// Every way a transfer can end without completing.
///
/// Peers are rendered with their `Debug` form so the error stays independent
/// of the transport's address type.
#[derive(Debug, Error)]
pub enum TransferError {
    /// A packet this side built violates the wire format.
    #[error(transparent)]
    Packet(#[from] PacketError),

    #[error("malformed packet from {peer}{}", at_block(.block))]
    Malformed {
        peer: String,
        block: Option<u16>,
        #[source]
        source: PacketError,
    },

    #[error("expected {expected} from {peer}{}, got opcode {found}", at_block(.block))]
    UnexpectedOpcode {
        peer: String,
        block: Option<u16>,
        expected: Opcode,
        found: u16,
    },

    #[error("{peer} did not acknowledge block {expected}: got opcode {opcode}, block {block:?}")]
    AckMismatch {
        peer: String,
        expected: u16,
        opcode: u16,
        block: Option<u16>,
    },

    #[error("{peer} sent block {found}, expected block {expected}")]
    UnexpectedBlock {
        peer: String,
        expected: u16,
        found: u16,
    },

    #[error(
        "timed out after {after:?} waiting for {awaiting} from {}",
        .peer.as_deref().unwrap_or("any peer")
    )]
    Timeout {
        peer: Option<String>,
        awaiting: Awaiting,
        after: Duration,
    },

    /// The endpoint failed to send or receive.
    #[error(
        "transport error with {}{}",
        .peer.as_deref().unwrap_or("any peer"),
        at_block(.block)
    )]
    Transport {
        peer: Option<String>,
        block: Option<u16>,
        #[source]
        source: io::Error,
    },

    #[error("failed to write block {block} from {peer}")]
    Sink {
        peer: String,
        block: u16,
        #[source]
        source: io::Error,
    },

    #[error("cannot {operation} while {state}")]
    InvalidState {
        state: String,
        operation: &'static str,
    },
}

impl TransferError {
    /// True if this was a timeout rather than a protocol or I/O failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransferError::Timeout { .. })
    }

    /// Wraps an endpoint failure with the peer and block it happened on.
    pub(crate) fn transport<A: fmt::Debug>(
        peer: Option<&A>,
        block: Option<u16>,
    ) -> impl FnOnce(io::Error) -> TransferError {
        let peer = peer.map(|peer| peer_name(peer));
        move |source| TransferError::Transport {
            peer,
            block,
            source,
        }
    }
}

pub(crate) fn peer_name<A: fmt::Debug>(peer: &A) -> String {
    format!("{:?}", peer)
}

fn at_block(block: &Option<u16>) -> String {
    match block {
        Some(block) => format!(" at block {}", block),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_peer_and_block() {
        let err = TransferError::AckMismatch {
            peer: "\"ground\"".to_string(),
            expected: 3,
            opcode: 4,
            block: Some(2),
        };
        assert_eq!(
            err.to_string(),
            "\"ground\" did not acknowledge block 3: got opcode 4, block Some(2)"
        );

        let err = TransferError::Timeout {
            peer: None,
            awaiting: Awaiting::Request,
            after: Duration::from_millis(10),
        };
        assert_eq!(err.to_string(), "timed out after 10ms waiting for a request from any peer");
        assert!(err.is_timeout());
    }

    #[test]
    fn io_failures_name_peer_and_block() {
        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        let err = TransferError::transport(Some(&"sat"), Some(7))(refused);
        assert_eq!(err.to_string(), "transport error with \"sat\" at block 7");
        assert!(matches!(
            err,
            TransferError::Transport {
                block: Some(7),
                ..
            }
        ));

        let closed = io::Error::new(io::ErrorKind::BrokenPipe, "closed");
        let err = TransferError::transport::<String>(None, None)(closed);
        assert_eq!(err.to_string(), "transport error with any peer");

        let err = TransferError::Sink {
            peer: "\"sat\"".to_string(),
            block: 2,
            source: io::Error::new(io::ErrorKind::Other, "disk full"),
        };
        assert_eq!(err.to_string(), "failed to write block 2 from \"sat\"");

        let err = TransferError::Malformed {
            peer: "\"ground\"".to_string(),
            block: Some(3),
            source: PacketError::Truncated {
                missing: "block number",
            },
        };
        assert_eq!(err.to_string(), "malformed packet from \"ground\" at block 3");
    }

    #[test]
    fn packet_errors_convert() {
        let err: TransferError = PacketError::PayloadTooLarge { len: 600 }.into();
        assert_eq!(err.to_string(), "payload of 600 bytes exceeds the 512 byte limit");
        assert!(!err.is_timeout());
    }
}
