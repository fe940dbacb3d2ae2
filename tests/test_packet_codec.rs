use isolar_bridge::error::DecodeError;
use isolar_bridge::isolar::packet::{
    DeviceFunction, Packet, Parser, ReadRequest, ReadResponse, TcpFrameFactory, MAX_READ_COUNT,
};

/// Hand-assemble a frame from header fields and an RTU body, with a
/// valid checksum unless the test corrupts it afterwards.
fn raw_frame(transaction_id: u16, body: &[u8]) -> Vec<u8> {
    let length = (2 + body.len() + 2) as u16;
    let mut frame = Vec::new();
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&1u16.to_be_bytes());
    frame.extend_from_slice(&length.to_be_bytes());
    frame.extend_from_slice(&[0xff, 0x04]);
    frame.extend_from_slice(body);
    frame.extend_from_slice(&Parser::checksum(body));
    frame
}

#[test]
fn request_round_trips() {
    for (register, count) in [(0u16, 1u16), (277, 5), (65535, 1), (600, MAX_READ_COUNT)] {
        let request = ReadRequest::new(0x0777, 1, DeviceFunction::ReadHold, register, count).unwrap();
        let bytes = TcpFrameFactory::build(&Packet::ReadRequest(request.clone()));
        let parsed = Parser::parse_request(&bytes).unwrap();
        assert_eq!(parsed, request);
    }
}

#[test]
fn response_round_trips() {
    let response = ReadResponse {
        transaction_id: 0x0778,
        device_id: 1,
        function: DeviceFunction::ReadHold,
        values: vec![0x04, 0xd3, 0x00, 0x4e],
    };
    let bytes = TcpFrameFactory::build(&Packet::ReadResponse(response.clone()));
    let parsed = Parser::parse_response(&bytes).unwrap();
    assert_eq!(parsed, response);
    assert_eq!(parsed.words(), vec![1235, 78]);
    assert_eq!(parsed.pairs(277), vec![(277, 1235), (278, 78)]);
}

#[test]
fn truncated_header_is_truncated() {
    let request = ReadRequest::new(1, 1, DeviceFunction::ReadHold, 0, 1).unwrap();
    let bytes = TcpFrameFactory::build(&Packet::ReadRequest(request));

    for cut in 0..6 {
        match Parser::parse_request(&bytes[..cut]) {
            Err(DecodeError::Truncated { .. }) => {}
            other => panic!("expected Truncated for {} bytes, got {:?}", cut, other),
        }
    }
}

#[test]
fn truncated_body_is_truncated() {
    let response = ReadResponse {
        transaction_id: 1,
        device_id: 1,
        function: DeviceFunction::ReadHold,
        values: vec![0x00, 0x2a],
    };
    let bytes = TcpFrameFactory::build(&Packet::ReadResponse(response));

    for cut in 6..bytes.len() {
        match Parser::parse_response(&bytes[..cut]) {
            Err(DecodeError::Truncated { .. }) => {}
            other => panic!("expected Truncated for {} bytes, got {:?}", cut, other),
        }
    }
}

#[test]
fn declared_payload_longer_than_actual_is_truncated() {
    // byte count claims two words but only one follows; checksum is
    // valid so only the length lie can trip the parser
    let body = [0x01, 0x03, 0x04, 0x00, 0x2a];
    let frame = raw_frame(1, &body);

    match Parser::parse_response(&frame) {
        Err(DecodeError::Truncated { .. }) => {}
        other => panic!("expected Truncated, got {:?}", other),
    }
}

#[test]
fn flipped_trailer_bit_is_checksum_mismatch() {
    let response = ReadResponse {
        transaction_id: 1,
        device_id: 1,
        function: DeviceFunction::ReadHold,
        values: vec![0x04, 0xd3],
    };
    let mut bytes = TcpFrameFactory::build(&Packet::ReadResponse(response));
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;

    match Parser::parse_response(&bytes) {
        Err(DecodeError::ChecksumMismatch { .. }) => {}
        other => panic!("expected ChecksumMismatch, got {:?}", other),
    }
}

#[test]
fn bad_vendor_prefix_is_malformed() {
    let request = ReadRequest::new(1, 1, DeviceFunction::ReadHold, 0, 1).unwrap();
    let mut bytes = TcpFrameFactory::build(&Packet::ReadRequest(request));
    bytes[6] = 0xaa;

    match Parser::parse_request(&bytes) {
        Err(DecodeError::Malformed(_)) => {}
        other => panic!("expected Malformed, got {:?}", other),
    }
}

#[test]
fn unknown_function_code_is_malformed() {
    let body = [0x01, 0x09, 0x00, 0x00, 0x00, 0x01];
    let frame = raw_frame(1, &body);

    match Parser::parse_request(&frame) {
        Err(DecodeError::Malformed(_)) => {}
        other => panic!("expected Malformed, got {:?}", other),
    }
}

#[test]
fn trailing_bytes_are_malformed() {
    let request = ReadRequest::new(1, 1, DeviceFunction::ReadHold, 0, 1).unwrap();
    let mut bytes = TcpFrameFactory::build(&Packet::ReadRequest(request));
    bytes.push(0x00);

    match Parser::parse_request(&bytes) {
        Err(DecodeError::Malformed(_)) => {}
        other => panic!("expected Malformed, got {:?}", other),
    }
}

#[test]
fn odd_payload_byte_count_is_malformed() {
    let body = [0x01, 0x03, 0x03, 0x00, 0x2a, 0x01];
    let frame = raw_frame(1, &body);

    match Parser::parse_response(&frame) {
        Err(DecodeError::Malformed(_)) => {}
        other => panic!("expected Malformed, got {:?}", other),
    }
}

#[test]
fn request_count_bounds_are_enforced() {
    assert!(ReadRequest::new(1, 1, DeviceFunction::ReadHold, 0, 0).is_err());
    assert!(ReadRequest::new(1, 1, DeviceFunction::ReadHold, 0, MAX_READ_COUNT + 1).is_err());
    assert!(ReadRequest::new(1, 1, DeviceFunction::ReadHold, 0, MAX_READ_COUNT).is_ok());
}

#[test]
fn oversized_count_on_the_wire_is_malformed() {
    let count = (MAX_READ_COUNT + 1).to_be_bytes();
    let body = [0x01, 0x03, 0x00, 0x00, count[0], count[1]];
    let frame = raw_frame(1, &body);

    match Parser::parse_request(&frame) {
        Err(DecodeError::Malformed(_)) => {}
        other => panic!("expected Malformed, got {:?}", other),
    }
}
