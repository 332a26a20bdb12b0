//! Modbus protocol definitions: function codes, exception codes, request
//! descriptions, and register/value conversions.
//!
//! Everything here is transport-agnostic; the wire framing lives in
//! [`crate::codec`].

use crate::error::{LinkError, LinkResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Modbus register or coil address (0-65535).
pub type Address = u16;

/// Modbus unit identifier (the MBAP header's unit id byte).
pub type UnitId = u8;

/// The function codes supported by the panel's field controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FunctionCode {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl FunctionCode {
    /// Convert from a raw function-code byte.
    ///
    /// Unsupported codes fail loudly rather than silently producing a
    /// malformed frame later.
    pub fn from_u8(value: u8) -> LinkResult<Self> {
        match value {
            0x01 => Ok(FunctionCode::ReadCoils),
            0x02 => Ok(FunctionCode::ReadDiscreteInputs),
            0x03 => Ok(FunctionCode::ReadHoldingRegisters),
            0x04 => Ok(FunctionCode::ReadInputRegisters),
            0x05 => Ok(FunctionCode::WriteSingleCoil),
            0x06 => Ok(FunctionCode::WriteSingleRegister),
            0x0F => Ok(FunctionCode::WriteMultipleCoils),
            0x10 => Ok(FunctionCode::WriteMultipleRegisters),
            _ => Err(LinkError::invalid_function(value)),
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }

    pub fn is_read(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::ReadHoldingRegisters
                | FunctionCode::ReadInputRegisters
        )
    }

    pub fn is_write(self) -> bool {
        !self.is_read()
    }

    /// Whether responses to this function carry a bit payload rather than
    /// 16-bit registers.
    pub fn is_bit_function(self) -> bool {
        matches!(
            self,
            FunctionCode::ReadCoils
                | FunctionCode::ReadDiscreteInputs
                | FunctionCode::WriteSingleCoil
                | FunctionCode::WriteMultipleCoils
        )
    }
}

impl fmt::Display for FunctionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FunctionCode::ReadCoils => "Read Coils",
            FunctionCode::ReadDiscreteInputs => "Read Discrete Inputs",
            FunctionCode::ReadHoldingRegisters => "Read Holding Registers",
            FunctionCode::ReadInputRegisters => "Read Input Registers",
            FunctionCode::WriteSingleCoil => "Write Single Coil",
            FunctionCode::WriteSingleRegister => "Write Single Register",
            FunctionCode::WriteMultipleCoils => "Write Multiple Coils",
            FunctionCode::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes carried by exception responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ExceptionCode {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ExceptionCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ExceptionCode::IllegalFunction),
            0x02 => Some(ExceptionCode::IllegalDataAddress),
            0x03 => Some(ExceptionCode::IllegalDataValue),
            0x04 => Some(ExceptionCode::ServerDeviceFailure),
            0x05 => Some(ExceptionCode::Acknowledge),
            0x06 => Some(ExceptionCode::ServerDeviceBusy),
            0x08 => Some(ExceptionCode::MemoryParityError),
            0x0A => Some(ExceptionCode::GatewayPathUnavailable),
            0x0B => Some(ExceptionCode::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// A request to a field controller, described in protocol terms.
///
/// The codec turns this into a wire frame; see [`crate::codec::encode_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub unit_id: UnitId,
    pub function: FunctionCode,
    pub address: Address,
    /// Quantity of coils/registers addressed. For single writes this is 1;
    /// for multi-coil writes it is the caller-supplied coil count, for
    /// multi-register writes the register count.
    pub quantity: u16,
    /// Write payload bytes. Empty for reads; the 16-bit value for single
    /// writes; the packed data block for multi writes.
    pub payload: Vec<u8>,
}

impl Request {
    /// Read coils/discrete inputs/registers.
    pub fn read(unit_id: UnitId, function: FunctionCode, address: Address, quantity: u16) -> Self {
        Self {
            unit_id,
            function,
            address,
            quantity,
            payload: Vec::new(),
        }
    }

    /// Write a single coil (function code 0x05).
    pub fn write_coil(unit_id: UnitId, address: Address, value: bool) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteSingleCoil,
            address,
            quantity: 1,
            payload: if value {
                vec![0xFF, 0x00]
            } else {
                vec![0x00, 0x00]
            },
        }
    }

    /// Write a single holding register (function code 0x06).
    pub fn write_register(unit_id: UnitId, address: Address, value: u16) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteSingleRegister,
            address,
            quantity: 1,
            payload: value.to_be_bytes().to_vec(),
        }
    }

    /// Write multiple coils (function code 0x0F). Quantity is the coil
    /// count, not the packed byte count.
    pub fn write_coils(unit_id: UnitId, address: Address, values: &[bool]) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteMultipleCoils,
            address,
            quantity: values.len() as u16,
            payload: data::pack_bits(values),
        }
    }

    /// Write multiple holding registers (function code 0x10).
    pub fn write_registers(unit_id: UnitId, address: Address, values: &[u16]) -> Self {
        Self {
            unit_id,
            function: FunctionCode::WriteMultipleRegisters,
            address,
            quantity: values.len() as u16,
            payload: data::registers_to_bytes(values),
        }
    }

    /// Validate the request before encoding.
    pub fn validate(&self) -> LinkResult<()> {
        if self.quantity == 0 {
            return Err(LinkError::invalid_data("quantity cannot be zero"));
        }

        match self.function {
            FunctionCode::ReadCoils | FunctionCode::ReadDiscreteInputs => {
                if self.quantity > crate::MAX_COILS_PER_REQUEST {
                    return Err(LinkError::invalid_data(format!(
                        "too many coils requested: {}",
                        self.quantity
                    )));
                }
            }
            FunctionCode::ReadHoldingRegisters | FunctionCode::ReadInputRegisters => {
                if self.quantity > crate::MAX_REGISTERS_PER_REQUEST {
                    return Err(LinkError::invalid_data(format!(
                        "too many registers requested: {}",
                        self.quantity
                    )));
                }
            }
            FunctionCode::WriteSingleCoil | FunctionCode::WriteSingleRegister => {
                if self.payload.len() != 2 {
                    return Err(LinkError::invalid_data(
                        "single write payload must be exactly 2 bytes",
                    ));
                }
            }
            FunctionCode::WriteMultipleCoils => {
                let expected = (self.quantity as usize + 7) / 8;
                if self.payload.len() != expected {
                    return Err(LinkError::invalid_data(format!(
                        "coil payload is {} bytes, expected {} for {} coils",
                        self.payload.len(),
                        expected,
                        self.quantity
                    )));
                }
            }
            FunctionCode::WriteMultipleRegisters => {
                if self.payload.len() != self.quantity as usize * 2
                    || self.quantity > crate::MAX_REGISTERS_PER_REQUEST
                {
                    return Err(LinkError::invalid_data(format!(
                        "register payload is {} bytes for quantity {}",
                        self.payload.len(),
                        self.quantity
                    )));
                }
            }
        }

        Ok(())
    }
}

/// Register/value conversion helpers.
///
/// All multi-byte quantities on the wire are big-endian; 32-bit floats
/// occupy two consecutive registers, high word first (IEEE-754 binary32).
pub mod data {
    use crate::error::{LinkError, LinkResult};

    /// Convert register values to bytes (big-endian).
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert bytes to register values (big-endian).
    pub fn bytes_to_registers(bytes: &[u8]) -> LinkResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(LinkError::invalid_data("byte array length must be even"));
        }

        Ok(bytes
            .chunks(2)
            .map(|chunk| u16::from_be_bytes([chunk[0], chunk[1]]))
            .collect())
    }

    /// Pack boolean values into bytes, LSB first within each byte.
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let mut bytes = vec![0u8; (bits.len() + 7) / 8];
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }
        bytes
    }

    /// Unpack bytes into boolean values.
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map_or(false, |byte| byte & (1 << (i % 8)) != 0)
            })
            .collect()
    }

    /// Convert a u32 to two registers, high word first.
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }

    /// Convert two registers (high word first) to a u32.
    pub fn registers_to_u32(registers: &[u16]) -> LinkResult<u32> {
        if registers.len() < 2 {
            return Err(LinkError::invalid_data("need 2 registers for a u32"));
        }
        Ok(((registers[0] as u32) << 16) | (registers[1] as u32))
    }

    /// Convert an f32 to two registers (IEEE-754, big-endian).
    pub fn f32_to_registers(value: f32) -> [u16; 2] {
        u32_to_registers(value.to_bits())
    }

    /// Convert two registers to an f32 (IEEE-754, big-endian).
    pub fn registers_to_f32(registers: &[u16]) -> LinkResult<f32> {
        Ok(f32::from_bits(registers_to_u32(registers)?))
    }
}
