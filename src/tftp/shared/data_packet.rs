use byteorder::{ByteOrder, NetworkEndian};

use super::{expect_opcode, Opcode, PacketError, Serializable, HEADER_LEN, OP_LEN, STRIDE_SIZE};

/// One block of file content.
///
/// The payload holds at most [`STRIDE_SIZE`] bytes; a shorter payload marks
/// the last block of a transfer.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataPacket {
    blk: u16,
    data: Vec<u8>,
}

impl DataPacket {
    pub fn new(blk: u16, data: Vec<u8>) -> Result<Self, PacketError> {
        if data.len() > STRIDE_SIZE {
            return Err(PacketError::PayloadTooLarge { len: data.len() });
        }
        Ok(DataPacket { blk, data })
    }

    pub fn blk(&self) -> u16 {
        self.blk
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    /// True for the short block that ends a transfer.
    pub fn is_final(&self) -> bool {
        is_final_len(self.data.len())
    }

    /// Splits off the header and copies exactly `payload_len` bytes of payload.
    ///
    /// The header has no length field; callers derive `payload_len` from the
    /// datagram size.
    pub fn deserialize(buf: &[u8], payload_len: usize) -> Result<Self, PacketError> {
        expect_opcode(buf, Opcode::Data)?;
        if payload_len > STRIDE_SIZE {
            return Err(PacketError::PayloadTooLarge { len: payload_len });
        }
        if buf.len() < HEADER_LEN {
            return Err(PacketError::Truncated {
                missing: "block number",
            });
        }
        if buf.len() < HEADER_LEN + payload_len {
            return Err(PacketError::Truncated { missing: "payload" });
        }

        let blk = NetworkEndian::read_u16(&buf[OP_LEN..HEADER_LEN]);
        let data = buf[HEADER_LEN..HEADER_LEN + payload_len].to_vec();
        Ok(DataPacket { blk, data })
    }
}

/// Whether a payload of `len` bytes ends the transfer.
pub fn is_final_len(len: usize) -> bool {
    len < STRIDE_SIZE
}

impl Serializable for DataPacket {
    fn serialize(&self) -> Vec<u8> {
        let mut buf = vec![0; HEADER_LEN + self.data.len()];
        NetworkEndian::write_u16(&mut buf[..OP_LEN], Opcode::Data.as_u16());
        NetworkEndian::write_u16(&mut buf[OP_LEN..HEADER_LEN], self.blk);
        buf[HEADER_LEN..].copy_from_slice(&self.data);
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialize_data_packet() {
        let p = DataPacket::new(0x0102, b"hi".to_vec()).unwrap();
        assert_eq!(p.serialize(), vec![0x0, 0x3, 0x01, 0x02, b'h', b'i']);
    }

    #[test]
    fn deserialize_data_packet() {
        let bytes = vec![0x0, 0x3, 0x04, 0xD2, b't', b'e', b's', b't'];
        let p = DataPacket::deserialize(&bytes, 4).unwrap();
        assert_eq!(p.blk(), 1234);
        assert_eq!(p.data(), b"test");
    }

    #[test]
    fn deserialize_copies_only_payload_len() {
        let bytes = vec![0x0, 0x3, 0x0, 0x1, 1, 2, 3, 4];
        let p = DataPacket::deserialize(&bytes, 2).unwrap();
        assert_eq!(p.into_data(), vec![1, 2]);
    }

    #[test]
    fn deserialize_error() {
        let bytes = vec![0x0, 0x4, 0x0, 0x1];
        assert_eq!(
            DataPacket::deserialize(&bytes, 0),
            Err(PacketError::UnexpectedOpcode {
                expected: Opcode::Data,
                found: 4
            })
        );
        assert_eq!(
            DataPacket::deserialize(&[0x0, 0x3, 0x0], 0),
            Err(PacketError::Truncated {
                missing: "block number"
            })
        );
        assert_eq!(
            DataPacket::deserialize(&[0x0, 0x3, 0x0, 0x1, 9], 2),
            Err(PacketError::Truncated { missing: "payload" })
        );
    }

    #[test]
    fn payload_limit() {
        assert!(DataPacket::new(1, vec![0; STRIDE_SIZE]).is_ok());
        assert_eq!(
            DataPacket::new(1, vec![0; STRIDE_SIZE + 1]),
            Err(PacketError::PayloadTooLarge { len: 513 })
        );
        let oversized = vec![0; HEADER_LEN + STRIDE_SIZE + 1];
        let mut oversized = oversized;
        oversized[1] = 0x3;
        assert_eq!(
            DataPacket::deserialize(&oversized, STRIDE_SIZE + 1),
            Err(PacketError::PayloadTooLarge { len: 513 })
        );
    }

    #[test]
    fn final_block_detection() {
        assert!(!DataPacket::new(1, vec![0; STRIDE_SIZE]).unwrap().is_final());
        assert!(DataPacket::new(1, vec![0; STRIDE_SIZE - 1]).unwrap().is_final());
        assert!(DataPacket::new(1, Vec::new()).unwrap().is_final());
    }

    #[test]
    fn roundtrip_block_and_payload_edges() {
        for &blk in &[0u16, 1, 255, 256, 0x7FFF, 0xFFFF] {
            for &len in &[0usize, 1, 511, 512] {
                let payload: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
                let bytes = DataPacket::new(blk, payload.clone()).unwrap().serialize();
                let p = DataPacket::deserialize(&bytes, len).unwrap();
                assert_eq!(p.blk(), blk);
                assert_eq!(p.data(), payload.as_slice());
            }
        }
    }
}
