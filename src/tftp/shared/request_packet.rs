use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use byteorder::{ByteOrder, NetworkEndian};

use super::{
    check_str, peek_opcode, unpack_str, Opcode, PacketError, Serializable, MAX_FILENAME_LEN,
    MAX_MODE_LEN, OP_LEN,
};

/// Transfer modes a request may name.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum Mode {
    NetAscii,
    Octet,
    /// Deprecated, never served.
    Mail,
}

/// Wire spelling of every [`Mode`].
pub static MODES: [(&str, Mode); 3] = [
    ("netascii", Mode::NetAscii),
    ("octet", Mode::Octet),
    ("mail", Mode::Mail),
];

impl Mode {
    pub fn as_str(self) -> &'static str {
        MODES
            .iter()
            .find(|(_, mode)| *mode == self)
            .map(|(name, _)| *name)
            .unwrap_or("octet")
    }
}

impl FromStr for Mode {
    type Err = String;

    /// Mode names are matched without regard to ASCII case.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MODES
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(s))
            .map(|(_, mode)| *mode)
            .ok_or_else(|| format!("unknown transfer mode '{}'", s))
    }
}

impl Display for Mode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A read (or write) request: opcode, filename and mode.
///
/// Construction enforces the wire limits, so a built packet always
/// serializes.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct RequestPacket {
    op: Opcode,
    filename: String,
    mode: String,
}

impl RequestPacket {
    /// Builds a read request.
    ///
    /// Fails with `FieldTooLong` past 127 filename bytes or 19 mode bytes, and
    /// with `InvalidField` if either contains a NUL.
    pub fn read(filename: &str, mode: &str) -> Result<Self, PacketError> {
        check_str("filename", filename, MAX_FILENAME_LEN)?;
        check_str("mode", mode, MAX_MODE_LEN)?;
        Ok(RequestPacket {
            op: Opcode::Rrq,
            filename: filename.to_string(),
            mode: mode.to_string(),
        })
    }

    pub fn op(&self) -> Opcode {
        self.op
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn mode(&self) -> &str {
        &self.mode
    }

    /// The requested mode, if it is one of [`MODES`].
    pub fn transfer_mode(&self) -> Option<Mode> {
        self.mode.parse().ok()
    }

    /// Reads opcode, filename and mode.
    ///
    /// Over-long strings are cut to their field width rather than rejected.
    /// Anything after the mode terminator is ignored.
    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        let op = match peek_opcode(buf)? {
            1 => Opcode::Rrq,
            2 => Opcode::Wrq,
            found => {
                return Err(PacketError::UnexpectedOpcode {
                    expected: Opcode::Rrq,
                    found,
                })
            }
        };

        let rest = &buf[OP_LEN..];
        let (filename, used) = unpack_str(rest, MAX_FILENAME_LEN, "filename terminator")?;
        let (mode, _) = unpack_str(&rest[used..], MAX_MODE_LEN, "mode terminator")?;

        Ok(RequestPacket { op, filename, mode })
    }
}

impl Serializable for RequestPacket {
    fn serialize(&self) -> Vec<u8> {
        let length = OP_LEN + self.filename.len() + 1 + self.mode.len() + 1;
        let mut buf = vec![0; OP_LEN];
        buf.reserve(length - OP_LEN);

        NetworkEndian::write_u16(&mut buf[..OP_LEN], self.op.as_u16());
        buf.extend_from_slice(self.filename.as_bytes());
        buf.push(0);
        buf.extend_from_slice(self.mode.as_bytes());
        buf.push(0);
        buf
    }
}
