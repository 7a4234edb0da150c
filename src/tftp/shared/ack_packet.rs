//! ACK packets acknowledge DATA packets.
//! the opcode is 4.
//!
//! The block number in an ACK echoes
//! the block number of the DATA packet being acknowledged.

use byteorder::{ByteOrder, NetworkEndian};

use super::{expect_opcode, Opcode, PacketError, Serializable, HEADER_LEN, OP_LEN};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct AckPacket {
    blk: u16,
}

impl AckPacket {
    pub fn new(blk: u16) -> Self {
        AckPacket { blk }
    }

    pub fn blk(&self) -> u16 {
        self.blk
    }

    pub fn deserialize(buf: &[u8]) -> Result<Self, PacketError> {
        expect_opcode(buf, Opcode::Ack)?;
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated {
                missing: "block number",
            });
        }

        let blk = NetworkEndian::read_u16(&buf[OP_LEN..HEADER_LEN]);
        Ok(AckPacket::new(blk))
    }
}

impl Serializable for AckPacket {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0; HEADER_LEN];
        NetworkEndian::write_u16(&mut buf[..OP_LEN], Opcode::Ack.as_u16());
        NetworkEndian::write_u16(&mut buf[OP_LEN..], self.blk);
        buf
    }
}
