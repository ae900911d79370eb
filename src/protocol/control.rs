use std::net::SocketAddr;
use bytes::Bytes;

use crate::error::RdtError;
use crate::protocol::frame::seal;

const EXCHANGE_REQUEST_PREFIX: &str = "EXCH_REQ";
const INDEX_REQUEST: &str = "INDEX_REQ";

/// Control messages travel as plain text directly under the checksum envelope, without the
///  file id / sequence number structure of a [crate::protocol::frame::Frame]:
///
/// ```ascii
/// EXCH_REQ:<file_id>,<requester_ip>:<requester_port>
/// INDEX_REQ
/// ```
///
/// NB: A frame body starts with the length of its file id. For a body starting with an ASCII
///      control prefix, that length would be in the order of 10^9, so a control message can
///      never be mistaken for a valid frame and vice versa.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ControlMessage {
    /// Ask the receiving peer to send a file. The address is what the requester believes its
    ///  own address to be - it is informational only, replies go to the address the datagram
    ///  actually came from.
    ExchangeRequest {
        file_id: String,
        claimed_addr: String,
    },
    IndexRequest,
}

impl ControlMessage {
    pub fn exchange_request(file_id: &str, requester: SocketAddr) -> ControlMessage {
        ControlMessage::ExchangeRequest {
            file_id: file_id.to_string(),
            claimed_addr: requester.to_string(),
        }
    }

    pub fn to_text(&self) -> String {
        match self {
            ControlMessage::ExchangeRequest { file_id, claimed_addr } => format!("{}:{},{}", EXCHANGE_REQUEST_PREFIX, file_id, claimed_addr),
            ControlMessage::IndexRequest => INDEX_REQUEST.to_string(),
        }
    }

    /// the complete datagram, checksum included
    pub fn encode(&self) -> Bytes {
        seal(self.to_text().as_bytes())
    }

    /// Returns `None` if the (integrity checked) body is not a control message at all, i.e.
    ///  should be treated as a data frame.
    pub fn classify(body: &[u8]) -> Option<Result<ControlMessage, RdtError>> {
        if body.starts_with(EXCHANGE_REQUEST_PREFIX.as_bytes()) {
            Some(Self::parse_exchange_request(body))
        }
        else if body.starts_with(INDEX_REQUEST.as_bytes()) {
            if body.len() == INDEX_REQUEST.len() {
                Some(Ok(ControlMessage::IndexRequest))
            }
            else {
                Some(Err(RdtError::format("trailing data after INDEX_REQ")))
            }
        }
        else {
            None
        }
    }

    fn parse_exchange_request(body: &[u8]) -> Result<ControlMessage, RdtError> {
        let text = std::str::from_utf8(body)
            .map_err(|e| RdtError::format(format!("exchange request is not valid UTF-8: {}", e)))?;

        let args = text.strip_prefix(EXCHANGE_REQUEST_PREFIX)
            .and_then(|s| s.strip_prefix(':'))
            .ok_or_else(|| RdtError::format(format!("missing ':' after {}", EXCHANGE_REQUEST_PREFIX)))?;

        let (file_id, claimed_addr) = args.split_once(',')
            .ok_or_else(|| RdtError::format(format!("exchange request without requester address: {:?}", text)))?;

        let file_id = file_id.trim();
        if file_id.is_empty() {
            return Err(RdtError::format("exchange request with empty file id"));
        }

        Ok(ControlMessage::ExchangeRequest {
            file_id: file_id.to_string(),
            claimed_addr: claimed_addr.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use crate::protocol::frame::{encode_frame, split_datagram, verify, CHECKSUM_LEN};
    use super::*;

    #[rstest]
    #[case::exchange(b"EXCH_REQ:001,127.0.0.1:9000", Some(ControlMessage::ExchangeRequest { file_id: "001".to_string(), claimed_addr: "127.0.0.1:9000".to_string() }))]
    #[case::exchange_v6(b"EXCH_REQ:abc,[::1]:9000", Some(ControlMessage::ExchangeRequest { file_id: "abc".to_string(), claimed_addr: "[::1]:9000".to_string() }))]
    #[case::exchange_garbage_addr(b"EXCH_REQ:001,not an address", Some(ControlMessage::ExchangeRequest { file_id: "001".to_string(), claimed_addr: "not an address".to_string() }))]
    #[case::exchange_empty_addr(b"EXCH_REQ:001,", Some(ControlMessage::ExchangeRequest { file_id: "001".to_string(), claimed_addr: "".to_string() }))]
    #[case::index(b"INDEX_REQ", Some(ControlMessage::IndexRequest))]
    fn test_classify_valid(#[case] body: &[u8], #[case] expected: Option<ControlMessage>) {
        let actual = ControlMessage::classify(body).map(|r| r.unwrap());
        assert_eq!(actual, expected);
    }

    #[rstest]
    #[case::no_colon(b"EXCH_REQ001,127.0.0.1:9000")]
    #[case::no_comma(b"EXCH_REQ:001")]
    #[case::empty_id(b"EXCH_REQ: ,127.0.0.1:9000")]
    #[case::not_utf8(b"EXCH_REQ:\xff,127.0.0.1:9000")]
    #[case::index_trailing(b"INDEX_REQ please")]
    fn test_classify_malformed(#[case] body: &[u8]) {
        assert!(matches!(ControlMessage::classify(body), Some(Err(RdtError::Format(_)))));
    }

    #[test]
    fn test_data_frames_are_not_control_messages() {
        let datagram = encode_frame("EXCH_REQ", 1, "INDEX_REQ");
        assert!(ControlMessage::classify(&datagram[CHECKSUM_LEN..]).is_none());
    }

    #[rstest]
    #[case::exchange(ControlMessage::exchange_request("001", SocketAddr::from(([10,0,0,1], 4711))), b"EXCH_REQ:001,10.0.0.1:4711".as_slice())]
    #[case::index(ControlMessage::IndexRequest, b"INDEX_REQ".as_slice())]
    fn test_encode(#[case] msg: ControlMessage, #[case] expected_body: &[u8]) {
        let datagram = msg.encode();
        let (checksum, body) = split_datagram(&datagram).unwrap();
        assert!(verify(checksum, body));
        assert_eq!(body, expected_body);
        assert_eq!(ControlMessage::classify(body).unwrap().unwrap(), msg);
    }
}
