//! Serves one file to one retriever.
//!
//! ```text
//! AwaitingRequest -> SendingBlock -> AwaitingAck -> SendingBlock | Done
//!                                                \-> Failed
//! ```
//!
//! One DATA packet is outstanding at a time. The next block is only sent once
//! the current one is acknowledged, and the transfer ends with the first
//! block shorter than [`STRIDE_SIZE`], an empty one if the file length is a
//! multiple of it.

use std::cmp::min;

use tracing::{debug, field, info, info_span, warn, Span};

use crate::tftp::config::SessionConfig;
use crate::tftp::endpoint::{receive_from, Endpoint, Received};
use crate::tftp::error::{peer_name, Awaiting, TransferError};
use crate::tftp::shared::data_packet::is_final_len;
use crate::tftp::shared::{
    decode_ack, decode_error, decode_request, encode_data, peek_opcode, Opcode, RequestPacket,
    STRIDE_SIZE,
};
use crate::tftp::TransferSummary;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SenderState {
    AwaitingRequest,
    /// `block` covers the content starting at `offset`.
    SendingBlock { block: u16, offset: usize },
    /// `len` bytes were sent as `block` and wait for their ACK.
    AwaitingAck { block: u16, offset: usize, len: usize },
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SenderEvent {
    RequestAccepted,
    BlockSent { len: usize },
    AckReceived { block: u16 },
}

impl SenderState {
    /// Pure transition function. Anything the current state does not expect,
    /// including an ACK for the wrong block, leads to `Failed`.
    pub fn advance(self, event: SenderEvent) -> SenderState {
        match (self, event) {
            (SenderState::AwaitingRequest, SenderEvent::RequestAccepted) => {
                SenderState::SendingBlock { block: 1, offset: 0 }
            }
            (SenderState::SendingBlock { block, offset }, SenderEvent::BlockSent { len })
                if len <= STRIDE_SIZE =>
            {
                SenderState::AwaitingAck { block, offset, len }
            }
            (
                SenderState::AwaitingAck { block, offset, len },
                SenderEvent::AckReceived { block: acked },
            ) if acked == block => {
                if is_final_len(len) {
                    SenderState::Done
                } else {
                    SenderState::SendingBlock {
                        block: block.wrapping_add(1),
                        offset: offset + len,
                    }
                }
            }
            _ => SenderState::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SenderState::Done | SenderState::Failed)
    }
}

/// The slice of `content` that makes up the block starting at `offset`.
fn chunk(content: &[u8], offset: usize) -> &[u8] {
    let start = min(offset, content.len());
    let end = min(start + STRIDE_SIZE, content.len());
    &content[start..end]
}

pub struct SenderSession<'a, E: Endpoint> {
    endpoint: E,
    content: &'a [u8],
    config: SessionConfig,
    state: SenderState,
    peer: Option<E::Addr>,
    request: Option<RequestPacket>,
    blocks: u32,
    span: Span,
}

impl<'a, E: Endpoint> SenderSession<'a, E> {
    /// `content` is the whole file, read before the session starts.
    pub fn new(endpoint: E, content: &'a [u8], config: SessionConfig) -> Self {
        SenderSession {
            endpoint,
            content,
            config,
            state: SenderState::AwaitingRequest,
            peer: None,
            request: None,
            blocks: 0,
            span: info_span!("sender", peer = field::Empty),
        }
    }

    pub fn state(&self) -> SenderState {
        self.state
    }

    /// The retriever this session is bound to, once its request arrived.
    pub fn peer(&self) -> Option<&E::Addr> {
        self.peer.as_ref()
    }

    pub fn request(&self) -> Option<&RequestPacket> {
        self.request.as_ref()
    }

    pub fn into_endpoint(self) -> E {
        self.endpoint
    }

    /// Blocks until a read request arrives and binds the session to its
    /// sender. Anything other than an RRQ aborts the session.
    pub fn await_request(&mut self) -> Result<&RequestPacket, TransferError> {
        let span = self.span.clone();
        let _enter = span.enter();

        if self.state != SenderState::AwaitingRequest {
            return Err(self.invalid_state("await a request"));
        }
        match self.receive_request() {
            Ok(()) => self
                .request
                .as_ref()
                .ok_or_else(|| TransferError::InvalidState {
                    state: "without a request".to_string(),
                    operation: "accept a request",
                }),
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Runs the transfer to completion, waiting for the request first if it
    /// has not arrived yet.
    pub fn run(&mut self) -> Result<TransferSummary<E::Addr>, TransferError> {
        if self.state == SenderState::AwaitingRequest {
            self.await_request()?;
        }

        let span = self.span.clone();
        let _enter = span.enter();

        if self.state.is_terminal() {
            return Err(self.invalid_state("run"));
        }
        match self.send_blocks() {
            Ok(summary) => Ok(summary),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn receive_request(&mut self) -> Result<(), TransferError> {
        debug!(timeout = ?self.config.request_timeout, "waiting for request");
        let received = self
            .endpoint
            .receive(self.config.request_timeout)
            .map_err(TransferError::transport::<E::Addr>(None, None))?;
        let (bytes, peer) = match received {
            Received::Datagram { bytes, peer } => (bytes, peer),
            Received::TimedOut => {
                return Err(TransferError::Timeout {
                    peer: None,
                    awaiting: Awaiting::Request,
                    after: self.config.request_timeout.unwrap_or_default(),
                })
            }
        };

        let malformed = |source| TransferError::Malformed {
            peer: peer_name(&peer),
            block: None,
            source,
        };
        let found = peek_opcode(&bytes).map_err(malformed)?;
        if found != Opcode::Rrq.as_u16() {
            return Err(TransferError::UnexpectedOpcode {
                peer: peer_name(&peer),
                block: None,
                expected: Opcode::Rrq,
                found,
            });
        }
        let request = decode_request(&bytes).map_err(malformed)?;

        self.span.record("peer", &field::debug(&peer));
        if request.transfer_mode().is_none() {
            warn!(mode = request.mode(), "unknown transfer mode, sending octets");
        }
        info!(
            filename = request.filename(),
            mode = request.mode(),
            size = self.content.len(),
            "read request accepted"
        );

        self.peer = Some(peer);
        self.request = Some(request);
        self.set_state(self.state.advance(SenderEvent::RequestAccepted));
        Ok(())
    }

    fn send_blocks(&mut self) -> Result<TransferSummary<E::Addr>, TransferError> {
        let peer = match self.peer.clone() {
            Some(peer) => peer,
            None => return Err(self.invalid_state("send without a peer")),
        };
        let mut outstanding = Vec::new();

        loop {
            match self.state {
                SenderState::SendingBlock { block, offset } => {
                    let data = chunk(self.content, offset);
                    outstanding = encode_data(block, data)?;
                    self.endpoint
                        .send(&peer, &outstanding)
                        .map_err(TransferError::transport(Some(&peer), Some(block)))?;
                    debug!(block, len = data.len(), "sent DATA");
                    let sent = SenderEvent::BlockSent { len: data.len() };
                    self.set_state(self.state.advance(sent));
                }
                SenderState::AwaitingAck { block, .. } => {
                    let acked = self.await_ack(&peer, block, &outstanding)?;
                    let received = SenderEvent::AckReceived { block: acked };
                    self.set_state(self.state.advance(received));
                    if self.state == SenderState::Failed {
                        return Err(TransferError::AckMismatch {
                            peer: peer_name(&peer),
                            expected: block,
                            opcode: Opcode::Ack.as_u16(),
                            block: Some(acked),
                        });
                    }
                    self.blocks += 1;
                }
                SenderState::Done => {
                    info!(blocks = self.blocks, bytes = self.content.len(), "transfer complete");
                    return Ok(TransferSummary {
                        peer,
                        blocks: self.blocks,
                        bytes: self.content.len(),
                    });
                }
                SenderState::AwaitingRequest | SenderState::Failed => {
                    return Err(self.invalid_state("send blocks"));
                }
            }
        }
    }

    /// Waits for the ACK of `block`, re-sending `outstanding` on timeout while
    /// retries remain. Returns the block number the peer acknowledged.
    ///
    /// With retries enabled a repeated ACK of the previous block is skipped;
    /// it answers a DATA packet that was sent twice.
    fn await_ack(
        &mut self,
        peer: &E::Addr,
        block: u16,
        outstanding: &[u8],
    ) -> Result<u16, TransferError> {
        let previous = if self.blocks > 0 {
            Some(block.wrapping_sub(1))
        } else {
            None
        };
        let mut attempts = 0;
        loop {
            let received = receive_from(&mut self.endpoint, Some(peer), self.config.timeout)
                .map_err(TransferError::transport(Some(peer), Some(block)))?;
            match received {
                Received::Datagram { bytes, .. } => {
                    let acked = self.read_ack(peer, block, &bytes)?;
                    if acked != block && self.config.retries > 0 && Some(acked) == previous {
                        debug!(block = acked, "ignoring duplicate ACK");
                        continue;
                    }
                    return Ok(acked);
                }
                Received::TimedOut if attempts < self.config.retries => {
                    attempts += 1;
                    warn!(block, attempt = attempts, "no ACK, re-sending DATA");
                    self.endpoint
                        .send(peer, outstanding)
                        .map_err(TransferError::transport(Some(peer), Some(block)))?;
                }
                Received::TimedOut => {
                    return Err(TransferError::Timeout {
                        peer: Some(peer_name(peer)),
                        awaiting: Awaiting::Ack(block),
                        after: self.config.timeout.unwrap_or_default(),
                    })
                }
            }
        }
    }

    fn read_ack(&self, peer: &E::Addr, block: u16, bytes: &[u8]) -> Result<u16, TransferError> {
        let malformed = |source| TransferError::Malformed {
            peer: peer_name(peer),
            block: Some(block),
            source,
        };
        let opcode = peek_opcode(bytes).map_err(malformed)?;

        if opcode != Opcode::Ack.as_u16() {
            if opcode == Opcode::Error.as_u16() {
                if let Ok(err) = decode_error(bytes) {
                    warn!(code = err.code(), message = err.err(), "peer sent ERROR");
                }
            }
            return Err(TransferError::AckMismatch {
                peer: peer_name(peer),
                expected: block,
                opcode,
                block: None,
            });
        }
        let ack = decode_ack(bytes).map_err(malformed)?;
        debug!(block = ack.blk(), "received ACK");
        Ok(ack.blk())
    }

    fn set_state(&mut self, state: SenderState) {
        debug!(from = ?self.state, to = ?state, "state transition");
        self.state = state;
    }

    fn fail(&mut self, err: TransferError) -> TransferError {
        warn!(state = ?self.state, error = %err, "transfer failed");
        self.state = SenderState::Failed;
        err
    }

    fn invalid_state(&self, operation: &'static str) -> TransferError {
        TransferError::InvalidState {
            state: format!("{:?}", self.state),
            operation,
        }
    }
}
