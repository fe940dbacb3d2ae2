use crate::prelude::*;

use enum_dispatch::*;
use nom::bytes::streaming::take;
use nom::number::streaming::{be_u16, be_u8};
use nom_derive::{Nom, Parse};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::convert::TryFrom;

/// Vendor prefix carried between the TCP-style header and the RTU body.
/// Observed on every captured frame, requests and responses alike.
pub const MAGIC: [u8; 2] = [0xff, 0x04];

pub const PROTOCOL_ID: u16 = 1;

/// Largest register burst a single read command may request. The same
/// bound the diagnostic scan surface exposes.
pub const MAX_READ_COUNT: u16 = 1000;

/// TCP-style header: transaction id, protocol id, then the byte count of
/// everything that follows the length field itself.
pub const HEADER_LEN: usize = 6;

/// Transaction ids are echoed by the device, which lets the session
/// reject stale frames left over from a timed-out probe. The start value
/// matches what the vendor's own software sends.
static TRANSACTION_ID: std::sync::atomic::AtomicU16 = std::sync::atomic::AtomicU16::new(0x0777);

pub fn next_transaction_id() -> u16 {
    TRANSACTION_ID.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
}

// {{{ DeviceFunction
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum DeviceFunction {
    ReadHold = 3,
    ReadInput = 4,
    // WriteSingle = 6 and WriteMulti = 16 exist on the wire but this
    // bridge is read-only.
}
// }}}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Nom)]
#[nom(BigEndian)]
pub struct FrameHeader {
    pub transaction_id: u16,
    pub protocol_id: u16,
    pub length: u16,
}

#[enum_dispatch]
pub trait PacketCommon {
    fn transaction_id(&self) -> u16;
    fn device_id(&self) -> u8;
    fn function(&self) -> DeviceFunction;

    /// The RTU body: device id through payload, without the vendor
    /// prefix or checksum trailer.
    fn bytes(&self) -> Vec<u8>;
}

#[enum_dispatch(PacketCommon)]
#[derive(Eq, PartialEq, Debug, Clone)]
pub enum Packet {
    ReadRequest(ReadRequest),
    ReadResponse(ReadResponse),
}

/////////////
//
// READ REQUEST
//
/////////////

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ReadRequest {
    pub transaction_id: u16,
    pub device_id: u8,
    pub function: DeviceFunction,
    pub register: u16,
    pub count: u16,
}

impl ReadRequest {
    pub fn new(
        transaction_id: u16,
        device_id: u8,
        function: DeviceFunction,
        register: u16,
        count: u16,
    ) -> Result<Self> {
        if count == 0 || count > MAX_READ_COUNT {
            bail!("register count {} outside 1..={}", count, MAX_READ_COUNT);
        }

        Ok(Self {
            transaction_id,
            device_id,
            function,
            register,
            count,
        })
    }
}

impl PacketCommon for ReadRequest {
    fn transaction_id(&self) -> u16 {
        self.transaction_id
    }
    fn device_id(&self) -> u8 {
        self.device_id
    }
    fn function(&self) -> DeviceFunction {
        self.function
    }

    fn bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(6);
        data.push(self.device_id);
        data.push(self.function.into());
        data.extend_from_slice(&self.register.to_be_bytes());
        data.extend_from_slice(&self.count.to_be_bytes());
        data
    }
}

/////////////
//
// READ RESPONSE
//
/////////////

#[derive(Eq, PartialEq, Clone, Debug)]
pub struct ReadResponse {
    pub transaction_id: u16,
    pub device_id: u8,
    pub function: DeviceFunction,
    pub values: Vec<u8>, // undecoded payload; words are u16, pairs may form u32
}

impl ReadResponse {
    /// Payload as big-endian register words.
    pub fn words(&self) -> Vec<u16> {
        Utils::words(&self.values)
    }

    /// (register, word) pairs given the first register of the request
    /// this response answers. The wire carries no register field; the
    /// depth-one exchange discipline makes the pairing unambiguous.
    pub fn pairs(&self, start_register: u16) -> Vec<(u16, u16)> {
        self.words()
            .into_iter()
            .enumerate()
            .map(|(pos, value)| (start_register.wrapping_add(pos as u16), value))
            .collect()
    }
}

impl PacketCommon for ReadResponse {
    fn transaction_id(&self) -> u16 {
        self.transaction_id
    }
    fn device_id(&self) -> u8 {
        self.device_id
    }
    fn function(&self) -> DeviceFunction {
        self.function
    }

    fn bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(3 + self.values.len());
        data.push(self.device_id);
        data.push(self.function.into());
        data.push(self.values.len() as u8);
        data.extend_from_slice(&self.values);
        data
    }
}

pub struct TcpFrameFactory;
impl TcpFrameFactory {
    pub fn build(packet: &Packet) -> Vec<u8> {
        let body = packet.bytes();

        // length counts the magic prefix, body and checksum trailer
        let length = (MAGIC.len() + body.len() + 2) as u16;

        let mut r = Vec::with_capacity(HEADER_LEN + length as usize);
        r.extend_from_slice(&packet.transaction_id().to_be_bytes());
        r.extend_from_slice(&PROTOCOL_ID.to_be_bytes());
        r.extend_from_slice(&length.to_be_bytes());
        r.extend_from_slice(&MAGIC);
        r.extend_from_slice(&body);
        r.extend_from_slice(&Parser::checksum(&body));

        r
    }
}

pub struct Parser;
impl Parser {
    /// CRC16-MODBUS over the RTU body, appended little-endian.
    pub fn checksum(data: &[u8]) -> [u8; 2] {
        crc16::State::<crc16::MODBUS>::calculate(data).to_le_bytes()
    }

    /// Header + length + prefix + checksum validation common to both
    /// directions. Returns the header and the RTU body (checksum
    /// stripped).
    fn split_frame(input: &[u8]) -> Result<(FrameHeader, &[u8]), DecodeError> {
        if input.len() < HEADER_LEN {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN,
                actual: input.len(),
            });
        }

        let (rest, header) = FrameHeader::parse(input)
            .map_err(|_| DecodeError::Malformed("unparseable frame header".to_string()))?;

        let declared = header.length as usize;
        if declared < MAGIC.len() + 2 {
            return Err(DecodeError::Malformed(format!(
                "declared length {} too small for any frame",
                declared
            )));
        }
        if rest.len() < declared {
            return Err(DecodeError::Truncated {
                expected: HEADER_LEN + declared,
                actual: input.len(),
            });
        }
        if rest.len() > declared {
            return Err(DecodeError::Malformed(format!(
                "{} trailing bytes after declared frame end",
                rest.len() - declared
            )));
        }

        if rest[0..2] != MAGIC {
            return Err(DecodeError::Malformed(format!(
                "bad vendor prefix {:02x} {:02x}",
                rest[0], rest[1]
            )));
        }

        let body = &rest[2..declared - 2];
        let trailer = &rest[declared - 2..];
        let expected = Self::checksum(body);
        if trailer != expected {
            return Err(DecodeError::ChecksumMismatch {
                expected: u16::from_le_bytes(expected),
                actual: u16::from_le_bytes([trailer[0], trailer[1]]),
            });
        }

        Ok((header, body))
    }

    /// Parse a request frame (as an inverter, or a mock of one, would).
    pub fn parse_request(input: &[u8]) -> Result<ReadRequest, DecodeError> {
        let (header, body) = Self::split_frame(input)?;

        let (body, device_id) = be_u8::<_, nom::error::Error<&[u8]>>(body)
            .map_err(|_| Self::short_body(input.len()))?;
        let (body, function) =
            be_u8::<_, nom::error::Error<&[u8]>>(body).map_err(|_| Self::short_body(input.len()))?;
        let (body, register) =
            be_u16::<_, nom::error::Error<&[u8]>>(body).map_err(|_| Self::short_body(input.len()))?;
        let (body, count) =
            be_u16::<_, nom::error::Error<&[u8]>>(body).map_err(|_| Self::short_body(input.len()))?;

        if !body.is_empty() {
            return Err(DecodeError::Malformed(format!(
                "{} unexpected bytes after request body",
                body.len()
            )));
        }

        let function = DeviceFunction::try_from(function)
            .map_err(|_| DecodeError::Malformed(format!("unknown function code {}", function)))?;

        if count == 0 || count > MAX_READ_COUNT {
            return Err(DecodeError::Malformed(format!(
                "register count {} outside 1..={}",
                count, MAX_READ_COUNT
            )));
        }

        Ok(ReadRequest {
            transaction_id: header.transaction_id,
            device_id,
            function,
            register,
            count,
        })
    }

    /// Parse a response frame (the only direction the engine receives).
    pub fn parse_response(input: &[u8]) -> Result<ReadResponse, DecodeError> {
        let (header, body) = Self::split_frame(input)?;

        let (body, device_id) = be_u8::<_, nom::error::Error<&[u8]>>(body)
            .map_err(|_| Self::short_body(input.len()))?;
        let (body, function) =
            be_u8::<_, nom::error::Error<&[u8]>>(body).map_err(|_| Self::short_body(input.len()))?;
        let (body, byte_count) =
            be_u8::<_, nom::error::Error<&[u8]>>(body).map_err(|_| Self::short_body(input.len()))?;

        let declared = byte_count as usize;
        let (body, values) = take::<_, _, nom::error::Error<&[u8]>>(declared)(body).map_err(
            |_| DecodeError::Truncated {
                expected: declared,
                actual: body.len(),
            },
        )?;

        if !body.is_empty() {
            return Err(DecodeError::Malformed(format!(
                "{} unexpected bytes after {} declared payload bytes",
                body.len(),
                declared
            )));
        }
        if declared % 2 != 0 {
            return Err(DecodeError::Malformed(format!(
                "odd payload byte count {}",
                declared
            )));
        }

        let function = DeviceFunction::try_from(function)
            .map_err(|_| DecodeError::Malformed(format!("unknown function code {}", function)))?;

        Ok(ReadResponse {
            transaction_id: header.transaction_id,
            device_id,
            function,
            values: values.to_vec(),
        })
    }

    fn short_body(frame_len: usize) -> DecodeError {
        DecodeError::Truncated {
            expected: frame_len + 1,
            actual: frame_len,
        }
    }
}
