//! Requests a file and writes it out block by block.
//!
//! ```text
//! SendingRequest -> ReceivingBlock -> WritingBlock -> SendingAck -> ReceivingBlock | Done
//!                                 \-> Failed
//! ```
//!
//! The request itself is never acknowledged. Each DATA block is written to
//! the sink before its ACK goes out, and the first block shorter than
//! [`STRIDE_SIZE`] completes the transfer.

use std::io::{self, Write};

use tracing::{debug, info, info_span, warn, Span};

use crate::tftp::config::SessionConfig;
use crate::tftp::endpoint::{receive_from, Endpoint, Received};
use crate::tftp::error::{peer_name, Awaiting, TransferError};
use crate::tftp::shared::data_packet::is_final_len;
use crate::tftp::shared::{
    decode_data, decode_error, encode_ack, encode_request, peek_opcode, DataPacket, Opcode,
    HEADER_LEN, STRIDE_SIZE,
};
use crate::tftp::TransferSummary;

/// Destination of the retrieved bytes, appended once per block in order.
pub trait ByteSink {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()>;
}

impl<W: Write> ByteSink for W {
    fn append(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.write_all(bytes)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetrieverState {
    SendingRequest,
    ReceivingBlock { expected: u16 },
    WritingBlock { block: u16, len: usize },
    /// `last` marks the ACK of the final, short block.
    SendingAck { block: u16, last: bool },
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetrieverEvent {
    RequestSent,
    BlockReceived { block: u16, len: usize },
    BlockWritten,
    AckSent,
}

impl RetrieverState {
    /// Pure transition function; a block other than the expected one, or any
    /// event out of place, leads to `Failed`.
    pub fn advance(self, event: RetrieverEvent) -> RetrieverState {
        match (self, event) {
            (RetrieverState::SendingRequest, RetrieverEvent::RequestSent) => {
                RetrieverState::ReceivingBlock { expected: 1 }
            }
            (
                RetrieverState::ReceivingBlock { expected },
                RetrieverEvent::BlockReceived { block, len },
            ) if block == expected && len <= STRIDE_SIZE => {
                RetrieverState::WritingBlock { block, len }
            }
            (RetrieverState::WritingBlock { block, len }, RetrieverEvent::BlockWritten) => {
                RetrieverState::SendingAck {
                    block,
                    last: is_final_len(len),
                }
            }
            (RetrieverState::SendingAck { block, last }, RetrieverEvent::AckSent) => {
                if last {
                    RetrieverState::Done
                } else {
                    RetrieverState::ReceivingBlock {
                        expected: block.wrapping_add(1),
                    }
                }
            }
            _ => RetrieverState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RetrieverState::Done | RetrieverState::Failed)
    }
}

pub struct RetrieverSession<E: Endpoint, S> {
    endpoint: E,
    peer: E::Addr,
    sink: S,
    config: SessionConfig,
    state: RetrieverState,
    /// Address DATA arrives from, fixed by the first block.
    correspondent: Option<E::Addr>,
    /// Last packet sent, re-sent on timeout when retries are enabled.
    last_sent: Vec<u8>,
    last_acked: Option<u16>,
    blocks: u32,
    bytes: usize,
    span: Span,
}

impl<E: Endpoint, S: ByteSink> RetrieverSession<E, S> {
    /// A session that will request from `peer` and append to `sink`.
    pub fn new(endpoint: E, peer: E::Addr, sink: S, config: SessionConfig) -> Self {
        let span = info_span!("retriever", peer = ?peer);
        RetrieverSession {
            endpoint,
            peer,
            sink,
            config,
            state: RetrieverState::SendingRequest,
            correspondent: None,
            last_sent: Vec::new(),
            last_acked: None,
            blocks: 0,
            bytes: 0,
            span,
        }
    }

    pub fn state(&self) -> RetrieverState {
        self.state
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    /// Sends the read request. Nothing acknowledges it; the first DATA block
    /// is the reply.
    pub fn send_request(&mut self, filename: &str, mode: &str) -> Result<(), TransferError> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state != RetrieverState::SendingRequest {
            return Err(self.invalid_state("send a request"));
        }
        let sent = encode_request(filename, mode)
            .map_err(TransferError::from)
            .and_then(|request| {
                self.endpoint
                    .send(&self.peer, &request)
                    .map_err(TransferError::transport(Some(&self.peer), None))?;
                Ok(request)
            });

        match sent {
            Ok(request) => {
                info!(filename, mode, "read request sent");
                self.last_sent = request;
                self.set_state(self.state.advance(RetrieverEvent::RequestSent));
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Receives blocks until the final one is written and acknowledged.
    pub fn run(&mut self) -> Result<TransferSummary<E::Addr>, TransferError> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state == RetrieverState::SendingRequest || self.state.is_terminal() {
            return Err(self.invalid_state("run"));
        }
        match self.receive_blocks() {
            Ok(summary) => Ok(summary),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Sends the request and runs the transfer.
    pub fn retrieve(
        &mut self,
        filename: &str,
        mode: &str,
    ) -> Result<TransferSummary<E::Addr>, TransferError> {
        self.send_request(filename, mode)?;
        self.run()
    }

    fn receive_blocks(&mut self) -> Result<TransferSummary<E::Addr>, TransferError> {
        let mut pending: Option<DataPacket> = None;

        loop {
            match self.state {
                RetrieverState::ReceivingBlock { expected } => {
                    let packet = match self.receive_data(expected)? {
                        Some(packet) => packet,
                        None => continue,
                    };
                    let len = packet.data().len();
                    self.set_state(self.state.advance(RetrieverEvent::BlockReceived {
                        block: packet.blk(),
                        len,
                    }));
                    pending = Some(packet);
                }
                RetrieverState::WritingBlock { block, len } => {
                    let packet = match pending.take() {
                        Some(packet) => packet,
                        None => return Err(self.invalid_state("write a block that never arrived")),
                    };
                    let peer = peer_name(self.correspondent());
                    self.sink
                        .append(packet.data())
                        .map_err(|source| TransferError::Sink {
                            peer,
                            block,
                            source,
                        })?;
                    self.bytes += len;
                    debug!(block, len, "wrote DATA");
                    self.set_state(self.state.advance(RetrieverEvent::BlockWritten));
                }
                RetrieverState::SendingAck { block, .. } => {
                    let ack = encode_ack(block);
                    let to = self.correspondent().clone();
                    self.endpoint
                        .send(&to, &ack)
                        .map_err(TransferError::transport(Some(&to), Some(block)))?;
                    debug!(block, "sent ACK");
                    self.last_sent = ack;
                    self.last_acked = Some(block);
                    self.blocks += 1;
                    self.set_state(self.state.advance(RetrieverEvent::AckSent));
                }
                RetrieverState::Done => {
                    info!(blocks = self.blocks, bytes = self.bytes, "transfer complete");
                    let peer = self.correspondent().clone();
                    return Ok(TransferSummary {
                        peer,
                        blocks: self.blocks,
                        bytes: self.bytes,
                    });
                }
                RetrieverState::SendingRequest | RetrieverState::Failed => {
                    return Err(self.invalid_state("receive blocks"));
                }
            }
        }
    }

    /// Waits for DATA `expected`.
    ///
    /// Returns `None` when a duplicate of the previous block was answered
    /// with its ACK again, which only happens with retries enabled.
    fn receive_data(&mut self, expected: u16) -> Result<Option<DataPacket>, TransferError> {
        let (bytes, from) = self.await_datagram(expected)?;
        let peer = peer_name(&from);

        let malformed = |source| TransferError::Malformed {
            peer: peer.clone(),
            block: Some(expected),
            source,
        };
        let opcode = peek_opcode(&bytes).map_err(malformed)?;
        if opcode != Opcode::Data.as_u16() {
            if opcode == Opcode::Error.as_u16() {
                if let Ok(err) = decode_error(&bytes) {
                    warn!(code = err.code(), message = err.err(), "peer sent ERROR");
                }
            }
            return Err(TransferError::UnexpectedOpcode {
                peer,
                block: Some(expected),
                expected: Opcode::Data,
                found: opcode,
            });
        }

        let payload_len = bytes.len().saturating_sub(HEADER_LEN);
        let packet = decode_data(&bytes, payload_len).map_err(malformed)?;
        debug!(block = packet.blk(), len = payload_len, "received DATA");

        if self.correspondent.is_none() {
            self.correspondent = Some(from);
        }

        if packet.blk() != expected {
            if self.config.retries > 0 && Some(packet.blk()) == self.last_acked {
                warn!(block = packet.blk(), "duplicate DATA, re-sending ACK");
                let to = self.correspondent().clone();
                self.endpoint
                    .send(&to, &self.last_sent)
                    .map_err(TransferError::transport(Some(&to), Some(packet.blk())))?;
                return Ok(None);
            }
            return Err(TransferError::UnexpectedBlock {
                peer,
                expected,
                found: packet.blk(),
            });
        }
        Ok(Some(packet))
    }

    /// Receives the next datagram from the correspondent, re-sending the last
    /// packet on timeout while retries remain.
    fn await_datagram(&mut self, expected: u16) -> Result<(Vec<u8>, E::Addr), TransferError> {
        let mut attempts = 0;
        loop {
            let received =
                receive_from(&mut self.endpoint, self.correspondent.as_ref(), self.config.timeout)
                    .map_err(TransferError::transport(Some(self.correspondent()), Some(expected)))?;
            match received {
                Received::Datagram { bytes, peer } => return Ok((bytes, peer)),
                Received::TimedOut if attempts < self.config.retries => {
                    attempts += 1;
                    warn!(block = expected, attempt = attempts, "no DATA, re-sending last packet");
                    let to = self.correspondent().clone();
                    self.endpoint
                        .send(&to, &self.last_sent)
                        .map_err(TransferError::transport(Some(&to), Some(expected)))?;
                }
                Received::TimedOut => {
                    return Err(TransferError::Timeout {
                        peer: Some(peer_name(self.correspondent())),
                        awaiting: Awaiting::Data(expected),
                        after: self.config.timeout.unwrap_or_default(),
                    });
                }
            }
        }
    }

    /// Where DATA comes from: the first sender of DATA, or the requested peer
    /// until one arrived.
    fn correspondent(&self) -> &E::Addr {
        self.correspondent.as_ref().unwrap_or(&self.peer)
    }

    fn set_state(&mut self, state: RetrieverState) {
        debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!(state = ?self.state, error = %err, "transfer failed");
        self.state = RetrieverState::Failed;
        err
    }

    fn invalid_state(&self, operation: &'static str) -> TransferError {
        TransferError::InvalidState {
            state: format!("{:?}", self.state),
            operation,
        }
    }
}
