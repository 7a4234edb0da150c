//! Wire packets exchanged by the two ends of a transfer.
//!
//! Every packet starts with a 2-byte opcode. All multi-byte integers are in
//! network byte order (big-endian), on encode and on decode alike.
//!
//! ```text
//! Request   opcode(2) | filename | 0x00 | mode | 0x00
//! Data      opcode(2) | block(2) | payload (0..512)
//! Ack       opcode(2) | block(2)
//! Error     opcode(2) | code(2)  | message | 0x00
//! ```
//!
//! Nothing in here performs I/O.

use std::fmt::{self, Display, Formatter};

use byteorder::{ByteOrder, NetworkEndian};
use thiserror::Error;

pub use self::ack_packet::AckPacket;
pub use self::data_packet::DataPacket;
pub use self::err_packet::{ErrorCode, ErrorPacket};
pub use self::request_packet::{Mode, RequestPacket, MODES};

pub mod ack_packet;
pub mod data_packet;
pub mod err_packet;
pub mod request_packet;

/// Length of the opcode field in bytes.
pub const OP_LEN: usize = 2;
/// Length of the opcode + block header carried by DATA and ACK packets.
pub const HEADER_LEN: usize = 4;
/// Stride size for reading / writing files; a shorter DATA payload ends the transfer.
pub const STRIDE_SIZE: usize = 512;
/// Longest filename accepted in a request.
pub const MAX_FILENAME_LEN: usize = 127;
/// Longest mode string accepted in a request.
pub const MAX_MODE_LEN: usize = 19;
/// Size of the buffer datagrams are received into.
pub const MAX_DATAGRAM_LEN: usize = 8192;

/// Packet kind tag, the first two bytes of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    /// Read request.
    Rrq = 1,
    /// Write request. Decoded, never served.
    Wrq = 2,
    Data = 3,
    Ack = 4,
    Error = 5,
}

impl Opcode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl TryFrom<u16> for Opcode {
    type Error = PacketError;

    fn try_from(value: u16) -> Result<Self, PacketError> {
        match value {
            1 => Ok(Opcode::Rrq),
            2 => Ok(Opcode::Wrq),
            3 => Ok(Opcode::Data),
            4 => Ok(Opcode::Ack),
            5 => Ok(Opcode::Error),
            other => Err(PacketError::UnknownOpcode(other)),
        }
    }
}

impl Display for Opcode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Rrq => "RRQ",
            Opcode::Wrq => "WRQ",
            Opcode::Data => "DATA",
            Opcode::Ack => "ACK",
            Opcode::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// Reasons a packet could not be encoded or decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("{field} is {len} bytes long, at most {max} allowed")]
    FieldTooLong {
        field: &'static str,
        len: usize,
        max: usize,
    },

    #[error("{field} contains a NUL byte")]
    InvalidField { field: &'static str },

    #[error("payload of {len} bytes exceeds the {max} byte limit", max = STRIDE_SIZE)]
    PayloadTooLarge { len: usize },

    #[error("packet truncated, missing {missing}")]
    Truncated { missing: &'static str },

    #[error("unknown opcode {0}")]
    UnknownOpcode(u16),

    #[error("expected a {expected} packet, found opcode {found}")]
    UnexpectedOpcode { expected: Opcode, found: u16 },
}

/// Any packet that can appear on the wire.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Packet {
    Request(RequestPacket),
    Data(DataPacket),
    Ack(AckPacket),
    Error(ErrorPacket),
}

impl Packet {
    pub fn opcode(&self) -> Opcode {
        match self {
            Packet::Request(p) => p.op(),
            Packet::Data(_) => Opcode::Data,
            Packet::Ack(_) => Opcode::Ack,
            Packet::Error(_) => Opcode::Error,
        }
    }
}

impl Display for Packet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Packet::Request(p) => write!(f, "{} [{}] [{}]", p.op(), p.filename(), p.mode()),
            Packet::Data(p) => write!(f, "DATA [{}] ({} bytes)", p.blk(), p.data().len()),
            Packet::Ack(p) => write!(f, "ACK [{}]", p.blk()),
            Packet::Error(p) => write!(f, "ERR [{}]: {}", p.code(), p.err()),
        }
    }
}

pub trait Serializable {
    fn serialize(&self) -> Vec<u8>;
}

impl Serializable for Packet {
    fn serialize(&self) -> Vec<u8> {
        match self {
            Packet::Request(p) => p.serialize(),
            Packet::Data(p) => p.serialize(),
            Packet::Ack(p) => p.serialize(),
            Packet::Error(p) => p.serialize(),
        }
    }
}

/// Reads the raw opcode of a datagram without validating it.
pub fn peek_opcode(buf: &[u8]) -> Result<u16, PacketError> {
    if buf.len() < OP_LEN {
        return Err(PacketError::Truncated { missing: "opcode" });
    }
    Ok(NetworkEndian::read_u16(&buf[..OP_LEN]))
}

/// Decodes a whole datagram into whichever packet its opcode names.
///
/// DATA carries no length field, so its payload is everything after the
/// 4-byte header.
pub fn parse_packet(buf: &[u8]) -> Result<Packet, PacketError> {
    match Opcode::try_from(peek_opcode(buf)?)? {
        Opcode::Rrq | Opcode::Wrq => RequestPacket::deserialize(buf).map(Packet::Request),
        Opcode::Data => {
            let payload_len = buf.len().saturating_sub(HEADER_LEN);
            DataPacket::deserialize(buf, payload_len).map(Packet::Data)
        }
        Opcode::Ack => AckPacket::deserialize(buf).map(Packet::Ack),
        Opcode::Error => ErrorPacket::deserialize(buf).map(Packet::Error),
    }
}

/// Encodes a read request for `filename` in `mode`.
pub fn encode_request(filename: &str, mode: &str) -> Result<Vec<u8>, PacketError> {
    Ok(RequestPacket::read(filename, mode)?.serialize())
}

pub fn decode_request(buf: &[u8]) -> Result<RequestPacket, PacketError> {
    RequestPacket::deserialize(buf)
}

pub fn encode_data(block: u16, payload: &[u8]) -> Result<Vec<u8>, PacketError> {
    Ok(DataPacket::new(block, payload.to_vec())?.serialize())
}

/// Decodes a DATA packet whose payload is `payload_len` bytes long.
pub fn decode_data(buf: &[u8], payload_len: usize) -> Result<DataPacket, PacketError> {
    DataPacket::deserialize(buf, payload_len)
}

pub fn encode_ack(block: u16) -> Vec<u8> {
    AckPacket::new(block).serialize()
}

pub fn decode_ack(buf: &[u8]) -> Result<AckPacket, PacketError> {
    AckPacket::deserialize(buf)
}

pub fn encode_error(code: u16, message: &str) -> Result<Vec<u8>, PacketError> {
    Ok(ErrorPacket::with_message(code, message)?.serialize())
}

pub fn decode_error(buf: &[u8]) -> Result<ErrorPacket, PacketError> {
    ErrorPacket::deserialize(buf)
}

/// Checks the opcode of `buf` against the one a decoder expects.
fn expect_opcode(buf: &[u8], expected: Opcode) -> Result<(), PacketError> {
    let found = peek_opcode(buf)?;
    if found != expected.as_u16() {
        return Err(PacketError::UnexpectedOpcode { expected, found });
    }
    Ok(())
}

/// Rejects text that would not survive NUL-terminated framing.
fn check_str(field: &'static str, value: &str, max: usize) -> Result<(), PacketError> {
    if value.len() > max {
        return Err(PacketError::FieldTooLong {
            field,
            len: value.len(),
            max,
        });
    }
    if value.as_bytes().contains(&0) {
        return Err(PacketError::InvalidField { field });
    }
    Ok(())
}

/// Reads a NUL-terminated string from the front of `buf`.
///
/// The result is at most `max` bytes long; characters past that, or split by
/// it, are dropped. Returns the string and the number of bytes consumed,
/// terminator included.
fn unpack_str(
    buf: &[u8],
    max: usize,
    missing: &'static str,
) -> Result<(String, usize), PacketError> {
    let end = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(PacketError::Truncated { missing })?;
    let mut value = String::from_utf8_lossy(&buf[..end.min(max)]).into_owned();
    // Invalid bytes decode to the 3-byte replacement character.
    while value.len() > max {
        value.pop();
    }
    Ok((value, end + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_values_match_the_wire() {
        assert_eq!(Opcode::Rrq.as_u16(), 1);
        assert_eq!(Opcode::Wrq.as_u16(), 2);
        assert_eq!(Opcode::Data.as_u16(), 3);
        assert_eq!(Opcode::Ack.as_u16(), 4);
        assert_eq!(Opcode::Error.as_u16(), 5);
        assert_eq!(Opcode::try_from(9), Err(PacketError::UnknownOpcode(9)));
    }

    #[test]
    fn parse_dispatches_on_opcode() {
        let rrq = encode_request("image.bmp", "octet").unwrap();
        match parse_packet(&rrq).unwrap() {
            Packet::Request(p) => assert_eq!(p.filename(), "image.bmp"),
            other => panic!("Wrong packet type {}", other),
        }

        let data = encode_data(7, b"abc").unwrap();
        match parse_packet(&data).unwrap() {
            Packet::Data(p) => {
                assert_eq!(p.blk(), 7);
                assert_eq!(p.data(), b"abc");
            }
            other => panic!("Wrong packet type {}", other),
        }

        assert_eq!(parse_packet(&encode_ack(3)).unwrap(), Packet::Ack(AckPacket::new(3)));

        let err = encode_error(1, "File not found.").unwrap();
        assert_eq!(parse_packet(&err).unwrap().opcode(), Opcode::Error);
    }

    #[test]
    fn parse_rejects_short_and_unknown() {
        assert_eq!(parse_packet(&[]), Err(PacketError::Truncated { missing: "opcode" }));
        assert_eq!(parse_packet(&[0x00]), Err(PacketError::Truncated { missing: "opcode" }));
        assert_eq!(
            parse_packet(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(PacketError::UnknownOpcode(0xFFFF))
        );
    }

    #[test]
    fn unpack_str_truncates_to_width() {
        let (s, used) = unpack_str(b"hello\0rest", 2, "x").unwrap();
        assert_eq!(s, "he");
        assert_eq!(used, 6);

        let (s, used) = unpack_str(b"\0", 10, "x").unwrap();
        assert_eq!(s, "");
        assert_eq!(used, 1);

        assert_eq!(unpack_str(b"abc", 10, "x"), Err(PacketError::Truncated { missing: "x" }));
    }

    #[test]
    fn unpack_str_never_exceeds_width() {
        // 'é' is two bytes; the cut at 127 falls between them.
        let mut rrq = vec![0x00, 0x01];
        rrq.extend(std::iter::repeat(b'a').take(126));
        rrq.extend("é".as_bytes());
        rrq.push(0);
        rrq.extend(b"octet\0");

        let request = decode_request(&rrq).unwrap();
        assert_eq!(request.filename(), "a".repeat(126));
        assert_eq!(request.mode(), "octet");

        let (s, used) = unpack_str(&[0xFF, 0xFF, 0xFF, 0], 4, "x").unwrap();
        assert!(s.len() <= 4);
        assert_eq!(s, "\u{FFFD}");
        assert_eq!(used, 4);
    }

    #[test]
    fn packet_display() {
        let p = parse_packet(&encode_ack(42)).unwrap();
        assert_eq!(p.to_string(), "ACK [42]");
    }
}
