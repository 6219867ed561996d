//! Radio frame codec: fixed 32-byte payload budget shared by requests and
//! responses.
//!
//! Request: `version | transaction_id | unit_id | function_id | data[0..28]`.
//! Response: `version | transaction_id | code | data[0..29]`; the data
//! length is whatever the received frame carries beyond the header.

use crate::error::{Error, Result};
use crate::transceiver::{format_address, Address};

pub const PACKET_LENGTH: usize = 32;
pub const REQUEST_HEADER_SIZE: usize = 4;
pub const RESPONSE_HEADER_SIZE: usize = 3;
pub const MAX_DATA_LENGTH_RQ: usize = PACKET_LENGTH - REQUEST_HEADER_SIZE;
pub const MAX_DATA_LENGTH_RS: usize = PACKET_LENGTH - RESPONSE_HEADER_SIZE;

pub const PROTOCOL_VERSION: u8 = 0;

/// Slave function return codes. The high-byte encodings are protocol
/// facts; anything nonzero fails the call.
pub type ResponseCode = u8;

pub const RC_OK: ResponseCode = 0x00;
pub const RC_NOT_IMPLEMENTED: ResponseCode = 0x7F;
pub const RC_BAD_VERSION: ResponseCode = 0x90;
pub const RC_BAD_UNIT_ID: ResponseCode = 0xA0;
pub const RC_NON_CONSECUTIVE_TX_ID: ResponseCode = 0xB0;
pub const RC_BAD_FUNCTION_ID: ResponseCode = 0xC0;
pub const RC_RESPONSE_TOO_BIG: ResponseCode = 0xD0;
pub const RC_BAD_REQUEST_DATA: ResponseCode = 0xE0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub version: u8,
    pub transaction_id: u8,
    pub unit_id: u8,
    pub function_id: u8,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: u8,
    pub transaction_id: u8,
    pub code: ResponseCode,
    pub data: Vec<u8>,
}

pub fn serialize_request(request: &Request) -> Result<Vec<u8>> {
    if request.data.len() > MAX_DATA_LENGTH_RQ {
        return Err(Error::BadParameter(format!(
            "too big data length {}",
            request.data.len()
        )));
    }
    let mut packet = Vec::with_capacity(REQUEST_HEADER_SIZE + request.data.len());
    packet.push(request.version);
    packet.push(request.transaction_id);
    packet.push(request.unit_id);
    packet.push(request.function_id);
    packet.extend_from_slice(&request.data);
    Ok(packet)
}

pub fn parse_response(packet: &[u8]) -> Result<Response> {
    if packet.len() > PACKET_LENGTH {
        return Err(Error::PacketValidation(format!(
            "too big packet of length {}",
            packet.len()
        )));
    }
    if packet.len() < RESPONSE_HEADER_SIZE {
        return Err(Error::PacketValidation(format!(
            "truncated response of length {}",
            packet.len()
        )));
    }
    Ok(Response {
        version: packet[0],
        transaction_id: packet[1],
        code: packet[2],
        data: packet[RESPONSE_HEADER_SIZE..].to_vec(),
    })
}

/// A response frame counts only if it matches the request it answers:
/// protocol version 0, the echoed transaction id, and the address the
/// request was sent to.
pub fn validate_response(
    request: &Request,
    response: &Response,
    from: &Address,
    target: &Address,
) -> Result<()> {
    if response.version != PROTOCOL_VERSION {
        return Err(Error::PacketValidation(format!(
            "unsupported protocol version {}",
            response.version
        )));
    }
    if response.transaction_id != request.transaction_id {
        return Err(Error::PacketValidation(format!(
            "transaction id {} does not match request {}",
            response.transaction_id, request.transaction_id
        )));
    }
    if from != target {
        return Err(Error::PacketValidation(format!(
            "response from {} while waiting for {}",
            format_address(from),
            format_address(target)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(data: &[u8]) -> Request {
        Request {
            version: 1,
            transaction_id: 2,
            unit_id: 3,
            function_id: 4,
            data: data.to_vec(),
        }
    }

    #[test]
    fn serialize_header_only() {
        let packet = serialize_request(&request(&[])).unwrap();
        assert_eq!(packet, vec![1, 2, 3, 4]);
    }

    #[test]
    fn serialize_with_data() {
        let mut data = vec![0u8; 14];
        data[0] = 12;
        data[13] = 11;
        let packet = serialize_request(&request(&data)).unwrap();
        assert_eq!(packet.len(), REQUEST_HEADER_SIZE + 14);
        assert_eq!(packet[REQUEST_HEADER_SIZE], 12);
        assert_eq!(packet[REQUEST_HEADER_SIZE + 13], 11);
    }

    #[test]
    fn serialize_rejects_oversized_data() {
        let data = vec![0u8; MAX_DATA_LENGTH_RQ + 1];
        assert!(matches!(
            serialize_request(&request(&data)),
            Err(Error::BadParameter(_))
        ));
    }

    #[test]
    fn parse_header_only() {
        let response = parse_response(&[1, 2, 3]).unwrap();
        assert_eq!(response.version, 1);
        assert_eq!(response.transaction_id, 2);
        assert_eq!(response.code, 3);
        assert!(response.data.is_empty());
    }

    #[test]
    fn parse_with_data() {
        let response = parse_response(&[1, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(response.data, vec![4, 5, 6]);
    }

    #[test]
    fn parse_bounds() {
        assert!(matches!(
            parse_response(&[0, 1]),
            Err(Error::PacketValidation(_))
        ));
        assert!(matches!(
            parse_response(&[0u8; PACKET_LENGTH + 1]),
            Err(Error::PacketValidation(_))
        ));
        // the longest legal frame parses
        assert!(parse_response(&[0u8; PACKET_LENGTH]).is_ok());
    }

    #[test]
    fn serialize_parse_identity() {
        let rq = Request {
            version: 0,
            transaction_id: 0x42,
            unit_id: 1,
            function_id: 0x18,
            data: vec![0xDE, 0xAD, 0xBE, 0xEF],
        };
        let packet = serialize_request(&rq).unwrap();
        // a response frame shares the request's first two header bytes
        let rs = parse_response(&packet).unwrap();
        assert_eq!(rs.version, rq.version);
        assert_eq!(rs.transaction_id, rq.transaction_id);
        assert_eq!(rs.code, rq.unit_id);
        assert_eq!(rs.data[0], rq.function_id);
        assert_eq!(rs.data[1..], rq.data[..]);
    }

    #[test]
    fn every_legal_data_length_survives_the_wire() {
        for length in 0..=MAX_DATA_LENGTH_RQ {
            let data: Vec<u8> = (0..length as u8).collect();
            let rq = Request {
                version: 0,
                transaction_id: 9,
                unit_id: 1,
                function_id: 2,
                data: data.clone(),
            };
            let packet = serialize_request(&rq).unwrap();
            assert_eq!(packet.len(), REQUEST_HEADER_SIZE + length);
            assert_eq!(&packet[REQUEST_HEADER_SIZE..], &data[..]);
        }
    }

    #[test]
    fn validation_matrix() {
        let rq = Request {
            version: 0,
            transaction_id: 7,
            unit_id: 1,
            function_id: 2,
            data: vec![],
        };
        let a: Address = [1, 2, 3, 4, 5];
        let b: Address = [1, 2, 3, 4, 6];
        let ok = Response {
            version: 0,
            transaction_id: 7,
            code: RC_OK,
            data: vec![],
        };
        assert!(validate_response(&rq, &ok, &a, &a).is_ok());
        let bad_version = Response { version: 1, ..ok.clone() };
        assert!(validate_response(&rq, &bad_version, &a, &a).is_err());
        let bad_txid = Response { transaction_id: 8, ..ok.clone() };
        assert!(validate_response(&rq, &bad_txid, &a, &a).is_err());
        assert!(validate_response(&rq, &ok, &b, &a).is_err());
    }
}
