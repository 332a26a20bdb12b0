//! Modbus TCP frame codec: request encoding, stream reassembly, and
//! response decoding.
//!
//! Everything in this module is pure and stateless apart from the
//! [`FrameBuffer`] accumulator. A frame is the MBAP header (transaction
//! id, protocol id, length, unit id) followed by the PDU, all multi-byte
//! fields big-endian:
//!
//! ```text
//! [TID(2)][Proto(2)][Length(2)][Unit(1)][Function(1)][Body...]
//! ```
//!
//! The length field counts the unit id plus the PDU, so a complete frame
//! occupies `6 + length` bytes. Responses arrive as arbitrary chunks over
//! a byte stream; [`FrameBuffer::push`] and [`FrameBuffer::take_frame`]
//! handle reassembly without ever assuming one transport delivery equals
//! one frame.

use bytes::{Bytes, BytesMut};

use crate::error::{LinkError, LinkResult};
use crate::protocol::{data, FunctionCode, Request};
use crate::{MBAP_HEADER_LEN, MAX_FRAME_SIZE, MAX_MBAP_LENGTH};

/// One complete Modbus TCP frame. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Wrap raw bytes as a frame, checking only the minimum structure
    /// (full MBAP header + function code byte).
    pub fn from_bytes(bytes: Bytes) -> LinkResult<Self> {
        if bytes.len() < MBAP_HEADER_LEN + 1 {
            return Err(LinkError::frame(format!(
                "frame too short: {} bytes",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    pub fn transaction_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn protocol_id(&self) -> u16 {
        u16::from_be_bytes([self.bytes[2], self.bytes[3]])
    }

    /// The MBAP length field: unit id + PDU byte count.
    pub fn declared_length(&self) -> u16 {
        u16::from_be_bytes([self.bytes[4], self.bytes[5]])
    }

    pub fn unit_id(&self) -> u8 {
        self.bytes[6]
    }

    /// The raw function-code byte, exception bit included.
    pub fn function_byte(&self) -> u8 {
        self.bytes[7]
    }

    /// PDU body after the function code byte.
    pub fn body(&self) -> &[u8] {
        &self.bytes[MBAP_HEADER_LEN + 1..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether this is a protocol exception frame (bit 0x80 set in the
    /// function-code byte).
    pub fn is_exception(&self) -> bool {
        self.function_byte() & 0x80 != 0
    }

    /// For an exception frame, the original function code (low 7 bits)
    /// and the exception code byte.
    pub fn exception(&self) -> Option<(u8, u8)> {
        if self.is_exception() && !self.body().is_empty() {
            Some((self.function_byte() & 0x7F, self.body()[0]))
        } else {
            None
        }
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

/// Encode a request into a wire frame with a random transaction id.
pub fn encode_request(request: &Request) -> LinkResult<Frame> {
    encode_request_with_id(request, rand::random::<u16>())
}

/// Encode a request with an explicit transaction id.
pub fn encode_request_with_id(request: &Request, transaction_id: u16) -> LinkResult<Frame> {
    request.validate()?;

    let body_len = match request.function {
        // address (2) + quantity (2)
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => 4,
        // address (2) + value (2)
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => 4,
        // address (2) + count (2) + byte count (1) + payload
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            5 + request.payload.len()
        }
    };

    // Length field: unit id + function code + body.
    let declared_length = (2 + body_len) as u16;

    let mut frame = BytesMut::with_capacity(MBAP_HEADER_LEN + 1 + body_len);
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes()); // protocol id, always 0
    frame.extend_from_slice(&declared_length.to_be_bytes());
    frame.extend_from_slice(&[request.unit_id, request.function.to_u8()]);
    frame.extend_from_slice(&request.address.to_be_bytes());

    match request.function {
        FunctionCode::ReadCoils
        | FunctionCode::ReadDiscreteInputs
        | FunctionCode::ReadHoldingRegisters
        | FunctionCode::ReadInputRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            frame.extend_from_slice(&request.payload);
        }
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            frame.extend_from_slice(&request.quantity.to_be_bytes());
            frame.extend_from_slice(&[request.payload.len() as u8]);
            frame.extend_from_slice(&request.payload);
        }
    }

    Frame::from_bytes(frame.freeze())
}

/// Accumulator for reassembling response frames out of a byte stream.
///
/// Owned exclusively by one connection and abandoned whenever that
/// connection's socket is destroyed; partial frames never survive across
/// connection generations.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// Append a received chunk.
    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Drop any partial frame.
    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Extract the next complete frame, if one is buffered.
    ///
    /// A frame is complete once at least the 6-byte header prefix is
    /// buffered AND the buffered length reaches `6 + declared length`.
    /// Returns `Ok(None)` while more data is needed; a nonsensical length
    /// field is an error, since the stream can no longer be trusted.
    pub fn take_frame(&mut self) -> LinkResult<Option<Frame>> {
        if self.buf.len() < 6 {
            return Ok(None);
        }

        let declared = u16::from_be_bytes([self.buf[4], self.buf[5]]) as usize;
        if declared < 2 || declared > MAX_MBAP_LENGTH {
            return Err(LinkError::frame(format!(
                "invalid MBAP length field: {declared}"
            )));
        }

        let total = 6 + declared;
        if self.buf.len() < total {
            return Ok(None);
        }

        let frame = self.buf.split_to(total).freeze();
        Frame::from_bytes(frame).map(Some)
    }
}

/// Typed payload extracted from a success response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePayload {
    /// Coil / discrete-input bits, trimmed to the requested quantity.
    Bits(Vec<bool>),
    /// Holding / input register values.
    Registers(Vec<u16>),
    /// Echo of a single-write request (address, raw 16-bit value).
    WriteEcho { address: u16, value: u16 },
    /// Acknowledgement of a multi-write (address, quantity written).
    WriteAck { address: u16, quantity: u16 },
}

/// Decode a response frame against the request that produced it.
///
/// The expected reply shape cannot be derived from the response alone, so
/// the original request supplies the function code and quantity. An
/// exception frame fails with [`LinkError::Exception`]; a frame whose
/// function code does not match the request fails as malformed.
pub fn decode_response(frame: &Frame, request: &Request) -> LinkResult<ResponsePayload> {
    if let Some((function, code)) = frame.exception() {
        return Err(LinkError::exception(function, code));
    }

    if frame.function_byte() != request.function.to_u8() {
        return Err(LinkError::frame(format!(
            "response function 0x{:02X} does not match request {}",
            frame.function_byte(),
            request.function
        )));
    }

    let body = frame.body();
    match request.function {
        FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
            let data = read_counted(body)?;
            let bits = data::unpack_bits(data, request.quantity as usize);
            Ok(ResponsePayload::Bits(bits))
        }
        FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
            let data = read_counted(body)?;
            let registers = data::bytes_to_registers(data)
                .map_err(|_| LinkError::frame("odd register payload length"))?;
            if registers.len() != request.quantity as usize {
                return Err(LinkError::frame(format!(
                    "expected {} registers, got {}",
                    request.quantity,
                    registers.len()
                )));
            }
            Ok(ResponsePayload::Registers(registers))
        }
        FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
            if body.len() < 4 {
                return Err(LinkError::frame("short single-write echo"));
            }
            Ok(ResponsePayload::WriteEcho {
                address: u16::from_be_bytes([body[0], body[1]]),
                value: u16::from_be_bytes([body[2], body[3]]),
            })
        }
        FunctionCode::WriteMultipleCoils | FunctionCode::WriteMultipleRegisters => {
            if body.len() < 4 {
                return Err(LinkError::frame("short multi-write acknowledgement"));
            }
            Ok(ResponsePayload::WriteAck {
                address: u16::from_be_bytes([body[0], body[1]]),
                quantity: u16::from_be_bytes([body[2], body[3]]),
            })
        }
    }
}

/// Read a byte-count-prefixed data block (the reply shape of all read
/// functions).
fn read_counted(body: &[u8]) -> LinkResult<&[u8]> {
    let count = *body
        .first()
        .ok_or_else(|| LinkError::frame("empty response body"))? as usize;
    let data = body
        .get(1..1 + count)
        .ok_or_else(|| LinkError::frame("response shorter than its byte count"))?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::UnitId;

    fn frame_of(bytes: &[u8]) -> Frame {
        Frame::from_bytes(Bytes::copy_from_slice(bytes)).unwrap()
    }

    /// Build a success response frame for a request.
    fn response_for(request: &Request, tid: u16, pdu_body: &[u8]) -> Vec<u8> {
        let mut frame = Vec::new();
        frame.extend_from_slice(&tid.to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(&((2 + pdu_body.len()) as u16).to_be_bytes());
        frame.push(request.unit_id);
        frame.push(request.function.to_u8());
        frame.extend_from_slice(pdu_body);
        frame
    }

    #[test]
    fn test_encode_read_holding_registers() {
        let request = Request::read(1, FunctionCode::ReadHoldingRegisters, 0x0010, 2);
        let frame = encode_request_with_id(&request, 0x1234).unwrap();

        assert_eq!(
            frame.as_bytes(),
            &[0x12, 0x34, 0x00, 0x00, 0x00, 0x06, 0x01, 0x03, 0x00, 0x10, 0x00, 0x02]
        );
        assert_eq!(frame.transaction_id(), 0x1234);
        assert_eq!(frame.protocol_id(), 0);
        assert_eq!(frame.declared_length(), 6);
        assert_eq!(frame.unit_id(), 1);
    }

    #[test]
    fn test_encode_write_single_coil_scenario() {
        // Write-single-coil, value true, address 8: body must be
        // 05 00 08 FF 00.
        let request = Request::write_coil(1, 8, true);
        let frame = encode_request_with_id(&request, 0xABCD).unwrap();

        assert_eq!(&frame.as_bytes()[7..], &[0x05, 0x00, 0x08, 0xFF, 0x00]);

        let off = Request::write_coil(1, 8, false);
        let frame = encode_request_with_id(&off, 0xABCD).unwrap();
        assert_eq!(&frame.as_bytes()[7..], &[0x05, 0x00, 0x08, 0x00, 0x00]);
    }

    #[test]
    fn test_encode_write_multiple_registers() {
        let request = Request::write_registers(3, 0x0001, &[0x000A, 0x0102]);
        let frame = encode_request_with_id(&request, 1).unwrap();

        // length = unit(1) + fc(1) + addr(2) + count(2) + bytecount(1) + 4
        assert_eq!(frame.declared_length(), 11);
        assert_eq!(
            &frame.as_bytes()[6..],
            &[0x03, 0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );
    }

    #[test]
    fn test_encode_write_multiple_coils_counts_coils() {
        let request = Request::write_coils(1, 0, &[true, false, true, true, false]);
        let frame = encode_request_with_id(&request, 1).unwrap();

        // count field is the coil count (5), byte count is 1
        assert_eq!(
            &frame.as_bytes()[8..],
            &[0x00, 0x00, 0x00, 0x05, 0x01, 0b0000_1101]
        );
    }

    #[test]
    fn test_random_transaction_ids_fill_header() {
        let request = Request::read(1, FunctionCode::ReadCoils, 0, 1);
        let a = encode_request(&request).unwrap();
        let b = encode_request(&request).unwrap();
        // Same request, ids independent; frames differ only in the id.
        assert_eq!(a.as_bytes()[2..], b.as_bytes()[2..]);
    }

    #[test]
    fn test_round_trip_reads() {
        let request = Request::read(1, FunctionCode::ReadHoldingRegisters, 0, 2);
        let raw = response_for(&request, 7, &[0x04, 0x00, 0x0A, 0x00, 0x0B]);
        let payload = decode_response(&frame_of(&raw), &request).unwrap();
        assert_eq!(payload, ResponsePayload::Registers(vec![0x000A, 0x000B]));

        let request = Request::read(1, FunctionCode::ReadCoils, 0, 4);
        let raw = response_for(&request, 8, &[0x01, 0b0000_0110]);
        let payload = decode_response(&frame_of(&raw), &request).unwrap();
        assert_eq!(
            payload,
            ResponsePayload::Bits(vec![false, true, true, false])
        );
    }

    #[test]
    fn test_round_trip_writes() {
        let request = Request::write_register(1, 0x0001, 0x0003);
        let raw = response_for(&request, 9, &[0x00, 0x01, 0x00, 0x03]);
        let payload = decode_response(&frame_of(&raw), &request).unwrap();
        assert_eq!(
            payload,
            ResponsePayload::WriteEcho {
                address: 1,
                value: 3
            }
        );

        let request = Request::write_registers(1, 0x0001, &[0x000A, 0x0102]);
        let raw = response_for(&request, 10, &[0x00, 0x01, 0x00, 0x02]);
        let payload = decode_response(&frame_of(&raw), &request).unwrap();
        assert_eq!(
            payload,
            ResponsePayload::WriteAck {
                address: 1,
                quantity: 2
            }
        );
    }

    #[test]
    fn test_exception_detection() {
        let request = Request::read(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        // 0x83 = 0x03 | 0x80, exception code 0x02
        let raw = [0x00, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x83, 0x02];
        let frame = frame_of(&raw);

        assert!(frame.is_exception());
        assert_eq!(frame.exception(), Some((0x03, 0x02)));

        let err = decode_response(&frame, &request).unwrap_err();
        assert_eq!(
            err,
            LinkError::Exception {
                function: 0x03,
                code: 0x02,
                message: "Illegal Data Address".to_string()
            }
        );
    }

    #[test]
    fn test_mismatched_function_is_malformed() {
        let request = Request::read(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        let wrong = Request::read(1, FunctionCode::ReadInputRegisters, 0, 1);
        let raw = response_for(&wrong, 11, &[0x02, 0x00, 0x01]);
        assert!(matches!(
            decode_response(&frame_of(&raw), &request),
            Err(LinkError::Frame { .. })
        ));
    }

    #[test]
    fn test_reassembly_one_byte_at_a_time() {
        let request = Request::read(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        let raw = response_for(&request, 42, &[0x02, 0x12, 0x34]);

        let mut buffer = FrameBuffer::new();
        for (i, byte) in raw.iter().enumerate() {
            buffer.push(std::slice::from_ref(byte));
            let taken = buffer.take_frame().unwrap();
            if i + 1 < raw.len() {
                assert!(taken.is_none(), "frame completed early at byte {i}");
            } else {
                let frame = taken.expect("complete frame");
                assert_eq!(frame.as_bytes(), &raw[..]);
            }
        }
        // Exactly one frame, never a duplicate.
        assert!(buffer.take_frame().unwrap().is_none());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_reassembly_two_frames_in_one_chunk() {
        let request = Request::read(1, FunctionCode::ReadHoldingRegisters, 0, 1);
        let first = response_for(&request, 1, &[0x02, 0x00, 0x01]);
        let second = response_for(&request, 2, &[0x02, 0x00, 0x02]);

        let mut chunk = first.clone();
        chunk.extend_from_slice(&second);

        let mut buffer = FrameBuffer::new();
        buffer.push(&chunk);

        let a = buffer.take_frame().unwrap().unwrap();
        let b = buffer.take_frame().unwrap().unwrap();
        assert_eq!(a.transaction_id(), 1);
        assert_eq!(b.transaction_id(), 2);
        assert!(buffer.take_frame().unwrap().is_none());
    }

    #[test]
    fn test_reassembly_rejects_insane_length() {
        let mut buffer = FrameBuffer::new();
        buffer.push(&[0x00, 0x01, 0x00, 0x00, 0x7F, 0xFF]);
        assert!(matches!(
            buffer.take_frame(),
            Err(LinkError::Frame { .. })
        ));
    }

    #[test]
    fn test_exception_detection_survives_chunking() {
        let raw = [0x00u8, 0x01, 0x00, 0x00, 0x00, 0x03, 0x01, 0x85, 0x04];
        for split in 1..raw.len() {
            let mut buffer = FrameBuffer::new();
            buffer.push(&raw[..split]);
            assert!(buffer.take_frame().unwrap().is_none() || split == raw.len());
            buffer.push(&raw[split..]);
            let frame = buffer.take_frame().unwrap().expect("complete frame");
            assert_eq!(frame.exception(), Some((0x05, 0x04)));
        }
    }

    #[test]
    fn test_unit_id_round_trip() {
        for unit in [1 as UnitId, 17, 247] {
            let request = Request::read(unit, FunctionCode::ReadInputRegisters, 5, 1);
            let frame = encode_request_with_id(&request, 99).unwrap();
            assert_eq!(frame.unit_id(), unit);
        }
    }
}
