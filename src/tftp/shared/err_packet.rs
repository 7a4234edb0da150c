//! ERROR packet can be the acknowledgment of any other type of packet.
//! The error code is an integer indicating the nature of the error.
//! The error message is intended for human consumption. Like all other
//! strings, it is terminated with a zero byte.

use byteorder::{ByteOrder, NetworkEndian};

use super::{check_str, expect_opcode, Opcode, PacketError, Serializable, HEADER_LEN, OP_LEN};

/// Longest message accepted on encode; decode cuts anything longer.
const MAX_ERR_LEN: usize = 512;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorCode {
    UndefinedError,
    FileNotFound,
    AccessViolation,
    DiskFull,
    IllegalOperation,
    UnknownTID,
    FileExists,
    NoSuchUser,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            ErrorCode::UndefinedError => 0,
            ErrorCode::FileNotFound => 1,
            ErrorCode::AccessViolation => 2,
            ErrorCode::DiskFull => 3,
            ErrorCode::IllegalOperation => 4,
            ErrorCode::UnknownTID => 5,
            ErrorCode::FileExists => 6,
            ErrorCode::NoSuchUser => 7,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(ErrorCode::UndefinedError),
            1 => Some(ErrorCode::FileNotFound),
            2 => Some(ErrorCode::AccessViolation),
            3 => Some(ErrorCode::DiskFull),
            4 => Some(ErrorCode::IllegalOperation),
            5 => Some(ErrorCode::UnknownTID),
            6 => Some(ErrorCode::FileExists),
            7 => Some(ErrorCode::NoSuchUser),
            _ => None,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            ErrorCode::UndefinedError => "Not defined, see error message (if any).",
            ErrorCode::FileNotFound => "File not found.",
            ErrorCode::AccessViolation => "Access violation.",
            ErrorCode::DiskFull => "Disk full or allocation exceeded.",
            ErrorCode::IllegalOperation => "Illegal TFTP operation.",
            ErrorCode::UnknownTID => "Unknown transfer ID.",
            ErrorCode::FileExists => "File already exists.",
            ErrorCode::NoSuchUser => "No such user.",
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ErrorPacket {
    code: u16,
    err: String,
}

impl ErrorPacket {
    /// An error carrying the standard message for `err`.
    pub fn new(err: ErrorCode) -> Self {
        ErrorPacket {
            code: err.code(),
            err: err.message().to_string(),
        }
    }

    pub fn with_message(code: u16, msg: &str) -> Result<Self, PacketError> {
        check_str("error message", msg, MAX_ERR_LEN)?;
        Ok(ErrorPacket {
            code,
            err: msg.to_string(),
        })
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn kind(&self) -> Option<ErrorCode> {
        ErrorCode::from_code(self.code)
    }

    pub fn err(&self) -> &str {
        &self.err
    }

    /// A missing terminator is tolerated; the message then runs to the end
    /// of the datagram.
    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        expect_opcode(buf, Opcode::Error)?;
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated {
                missing: "error code",
            });
        }

        let code = NetworkEndian::read_u16(&buf[OP_LEN..HEADER_LEN]);
        let msg = &buf[HEADER_LEN..];
        let end = msg.iter().position(|&b| b == 0).unwrap_or(msg.len());
        let err = String::from_utf8_lossy(&msg[..end.min(MAX_ERR_LEN)]).into_owned();

        Ok(ErrorPacket { code, err })
    }
}

impl Serializable for ErrorPacket {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0; HEADER_LEN];
        NetworkEndian::write_u16(&mut buf[..OP_LEN], Opcode::Error.as_u16());
        NetworkEndian::write_u16(&mut buf[OP_LEN..], self.code);
        buf.extend_from_slice(self.err.as_bytes());
        buf.push(0);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_err_packet() {
        let p = ErrorPacket::new(ErrorCode::IllegalOperation);
        let mut serialized = vec![0, 5, 0, 4];
        serialized.extend_from_slice(b"Illegal TFTP operation.");
        serialized.push(0);

        assert_eq!(p.serialize(), serialized);
    }

    #[test]
    fn deserialize_err_packet() {
        let mut buf = vec![0, 5, 0, 1];
        buf.extend_from_slice(b"File not found.\0");

        let p = ErrorPacket::deserialize(&buf).unwrap();
        assert_eq!(p.code(), 1);
        assert_eq!(p.kind(), Some(ErrorCode::FileNotFound));
        assert_eq!(p.err(), "File not found.");
    }

    #[test]
    fn deserialize_without_terminator() {
        let mut buf = vec![0, 5, 0, 9];
        buf.extend_from_slice(b"custom");

        let p = ErrorPacket::deserialize(&buf).unwrap();
        assert_eq!(p.code(), 9);
        assert_eq!(p.kind(), None);
        assert_eq!(p.err(), "custom");
    }

    #[test]
    fn deserialize_error() {
        let buf = vec![0, 6, 0, 1, 0];
        assert_eq!(
            ErrorPacket::deserialize(&buf),
            Err(PacketError::UnexpectedOpcode {
                expected: Opcode::Error,
                found: 6
            })
        );
        assert_eq!(
            ErrorPacket::deserialize(&[0, 5, 0]),
            Err(PacketError::Truncated {
                missing: "error code"
            })
        );
    }

    #[test]
    fn message_with_nul_is_rejected() {
        assert_eq!(
            ErrorPacket::with_message(0, "bad\0msg"),
            Err(PacketError::InvalidField {
                field: "error message"
            })
        );
    }

    #[test]
    fn code_table_is_consistent() {
        for code in 0..8 {
            let kind = ErrorCode::from_code(code).unwrap();
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ErrorCode::from_code(8), None);
    }
}
