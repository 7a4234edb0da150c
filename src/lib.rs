//! A stop-and-wait file transfer over datagrams, in the style of TFTP.
//!
//! A [`SenderSession`] serves one file to whoever sends it a read request; a
//! [`RetrieverSession`] requests a file and writes it block by block. Both run
//! over any [`Endpoint`]: UDP, Unix datagram sockets, or the in-process
//! [`MemoryEndpoint`] used by the tests.

pub mod tftp;

pub use crate::tftp::shared::{self as packet, Packet, PacketError};
pub use crate::tftp::{
    Endpoint, MemoryEndpoint, Received, RetrieverSession, SenderSession, SessionConfig,
    TransferError, TransferSummary,
};
