use std::fmt::{Debug, Formatter};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::error::RdtError;

pub const CHECKSUM_LEN: usize = 8;
/// file id length (u32) + sequence number (i32), i.e. the frame header without the file id
pub const FIXED_HEADER_LEN: usize = 8;

pub const TERMINATOR_SEQ: i32 = -1;
pub const ACK_PAYLOAD: &str = "ACK";
pub const FIN_PAYLOAD: &str = "FIN";

/// the zlib / IEEE 802.3 CRC-32
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 of a datagram body, carried on the wire as an 8-byte signed big-endian integer.
///
/// The CRC is zero-extended, so the upper four bytes on the wire are always zero.
#[derive(Clone, Copy, Eq, PartialEq)]
pub struct Checksum(pub i64);
impl Debug for Checksum {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x?}", self.0)
    }
}
impl Checksum {
    pub fn of(body: &[u8]) -> Checksum {
        Checksum(i64::from(CRC32.checksum(body)))
    }

    pub fn to_be_bytes(self) -> [u8; CHECKSUM_LEN] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; CHECKSUM_LEN]) -> Checksum {
        Checksum(i64::from_be_bytes(bytes))
    }
}

/// exact comparison - there is no notion of 'almost matching'
pub fn verify(checksum: Checksum, body: &[u8]) -> bool {
    Checksum::of(body) == checksum
}

/// Split a raw datagram into its checksum prefix and the body the checksum covers.
pub fn split_datagram(datagram: &[u8]) -> Result<(Checksum, &[u8]), RdtError> {
    if datagram.len() < CHECKSUM_LEN {
        return Err(RdtError::format(format!("datagram of {} bytes is shorter than the checksum", datagram.len())));
    }
    let (prefix, body) = datagram.split_at(CHECKSUM_LEN);
    let mut raw = [0u8; CHECKSUM_LEN];
    raw.copy_from_slice(prefix);
    Ok((Checksum::from_be_bytes(raw), body))
}

/// Prefix a body with its checksum, producing a complete datagram
pub fn seal(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(CHECKSUM_LEN + body.len());
    buf.put_slice(&Checksum::of(body).to_be_bytes());
    buf.put_slice(body);
    buf.freeze()
}

/// The unit of transfer for file data and its acknowledgements:
///
/// ```ascii
/// 0:   checksum (i64) over everything that follows
/// 8:   length N of the file id (u32)
/// 12:  file id, N bytes of UTF-8
/// *:   sequence number (i32), -1 for the terminator and its ACK
/// *:   payload: UTF-8 text up to the end of the datagram
/// ```
///
/// All numbers are in network byte order.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Frame {
    pub file_id: String,
    pub seq: i32,
    pub payload: String,
}

impl Frame {
    pub fn data(file_id: &str, seq: i32, payload: &str) -> Frame {
        Frame {
            file_id: file_id.to_string(),
            seq,
            payload: payload.to_string(),
        }
    }

    pub fn ack(file_id: &str, seq: i32) -> Frame {
        Frame::data(file_id, seq, ACK_PAYLOAD)
    }

    pub fn fin(file_id: &str) -> Frame {
        Frame::data(file_id, TERMINATOR_SEQ, FIN_PAYLOAD)
    }

    pub fn is_ack(&self) -> bool {
        self.payload.trim() == ACK_PAYLOAD
    }

    pub fn is_fin(&self) -> bool {
        self.payload.trim() == FIN_PAYLOAD
    }

    pub fn is_terminator(&self) -> bool {
        self.seq == TERMINATOR_SEQ
    }

    pub fn ser_body(&self, buf: &mut BytesMut) {
        buf.put_u32(self.file_id.len() as u32);
        buf.put_slice(self.file_id.as_bytes());
        buf.put_i32(self.seq);
        buf.put_slice(self.payload.as_bytes());
    }

    /// the complete datagram, checksum included
    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(FIXED_HEADER_LEN + self.file_id.len() + self.payload.len());
        self.ser_body(&mut body);
        seal(&body)
    }

    /// parse a datagram body, i.e. everything after the checksum
    pub fn deser_body(mut buf: &[u8]) -> Result<Frame, RdtError> {
        if buf.remaining() < 4 {
            return Err(RdtError::format("truncated file id length"));
        }
        let id_len = buf.get_u32() as usize;
        if id_len > buf.remaining() {
            return Err(RdtError::format(format!("file id length {} exceeds the remaining {} bytes", id_len, buf.remaining())));
        }
        let file_id = std::str::from_utf8(&buf[..id_len])
            .map_err(|e| RdtError::format(format!("file id is not valid UTF-8: {}", e)))?
            .to_string();
        buf.advance(id_len);

        if buf.remaining() < 4 {
            return Err(RdtError::format("truncated sequence number"));
        }
        let seq = buf.get_i32();

        let payload = std::str::from_utf8(buf)
            .map_err(|e| RdtError::format(format!("payload is not valid UTF-8: {}", e)))?
            .to_string();

        Ok(Frame { file_id, seq, payload })
    }

    /// split, verify and parse a complete datagram
    pub fn decode(datagram: &[u8]) -> Result<Frame, RdtError> {
        let (checksum, body) = split_datagram(datagram)?;
        if !verify(checksum, body) {
            return Err(RdtError::Integrity);
        }
        Frame::deser_body(body)
    }
}

pub fn encode_frame(file_id: &str, seq: i32, payload: &str) -> Bytes {
    Frame::data(file_id, seq, payload).encode()
}

pub fn decode_frame(body: &[u8]) -> Result<Frame, RdtError> {
    Frame::deser_body(body)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[test]
    fn test_checksum_is_zlib_crc32() {
        let checksum = Checksum::of(b"123456789");
        assert_eq!(checksum, Checksum(0xcbf4_3926));
        assert_eq!(checksum.to_be_bytes(), [0,0,0,0, 0xcb,0xf4,0x39,0x26]);
    }

    #[rstest]
    #[case::data(Frame::data("001", 1, "AAAA"), b"\0\0\0\x03001\0\0\0\x01AAAA".to_vec())]
    #[case::ack(Frame::ack("7", 258), b"\0\0\0\x017\0\0\x01\x02ACK".to_vec())]
    #[case::fin(Frame::fin("ab"), b"\0\0\0\x02ab\xff\xff\xff\xffFIN".to_vec())]
    #[case::empty_payload(Frame::data("", 0, ""), vec![0,0,0,0, 0,0,0,0])]
    fn test_wire_layout(#[case] frame: Frame, #[case] expected_body: Vec<u8>) {
        let datagram = frame.encode();
        assert_eq!(&datagram[..CHECKSUM_LEN], &Checksum::of(&expected_body).to_be_bytes());
        assert_eq!(&datagram[CHECKSUM_LEN..], expected_body.as_slice());

        assert_eq!(Frame::decode(&datagram).unwrap(), frame);
        assert_eq!(decode_frame(&expected_body).unwrap(), frame);
    }

    #[rstest]
    #[case::ascii("001", 1, "Lorem ipsum dolor sit am")]
    #[case::multibyte("äöü", 17, "grüße, 世界")]
    #[case::negative_seq("x", i32::MIN, "")]
    #[case::max_seq("long file id with spaces", i32::MAX, "\n\t")]
    fn test_encode_decode(#[case] file_id: &str, #[case] seq: i32, #[case] payload: &str) {
        let decoded = Frame::decode(&encode_frame(file_id, seq, payload)).unwrap();
        assert_eq!(decoded, Frame::data(file_id, seq, payload));
    }

    #[test]
    fn test_every_single_byte_mutation_is_detected() {
        let datagram = encode_frame("001", 42, "some chunk of text").to_vec();
        let (checksum, body) = split_datagram(&datagram).unwrap();
        assert!(verify(checksum, body));

        for i in 0..datagram.len() {
            for bit in 0..8 {
                let mut mutated = datagram.clone();
                mutated[i] ^= 1 << bit;
                let (checksum, body) = split_datagram(&mutated).unwrap();
                assert!(!verify(checksum, body), "flipping bit {} of byte {} went undetected", bit, i);
                assert!(matches!(Frame::decode(&mutated), Err(RdtError::Integrity)));
            }
        }
    }

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::short_length(vec![0,0,0])]
    #[case::id_too_long(b"\0\0\0\x09abc\0\0\0\x01".to_vec())]
    #[case::missing_seq(b"\0\0\0\x03abc\0\0".to_vec())]
    #[case::payload_not_utf8(b"\0\0\0\x01a\0\0\0\x01\xff\xfe".to_vec())]
    #[case::id_not_utf8(b"\0\0\0\x01\xc3\0\0\0\x01abc".to_vec())]
    fn test_deser_body_rejects(#[case] body: Vec<u8>) {
        assert!(matches!(decode_frame(&body), Err(RdtError::Format(_))));
        // sealing does not help: the checksum is fine, the structure is not
        assert!(matches!(Frame::decode(&seal(&body)), Err(RdtError::Format(_))));
    }

    #[test]
    fn test_split_datagram_too_short() {
        assert!(matches!(split_datagram(&[1,2,3,4,5,6,7]), Err(RdtError::Format(_))));
        let (checksum, body) = split_datagram(&[0,0,0,0,0,0,0,9]).unwrap();
        assert_eq!(checksum, Checksum(9));
        assert!(body.is_empty());
    }

    #[rstest]
    #[case::ack(Frame::ack("a", 3), true, false, false)]
    #[case::ack_with_whitespace(Frame::data("a", 3, "ACK\n"), true, false, false)]
    #[case::fin(Frame::fin("a"), false, true, true)]
    #[case::data(Frame::data("a", 3, "ACKNOWLEDGED"), false, false, false)]
    #[case::terminator_ack(Frame::ack("a", TERMINATOR_SEQ), true, false, true)]
    fn test_frame_kind(#[case] frame: Frame, #[case] is_ack: bool, #[case] is_fin: bool, #[case] is_terminator: bool) {
        assert_eq!(frame.is_ack(), is_ack);
        assert_eq!(frame.is_fin(), is_fin);
        assert_eq!(frame.is_terminator(), is_terminator);
    }
}
