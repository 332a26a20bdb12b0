//! UV-panel register map and typed operations.
//!
//! The disinfection panel exposes its process values at fixed addresses:
//! float quantities as two consecutive big-endian holding registers,
//! per-lamp counters as single registers strided by lamp, power as a
//! coil, and the safety interlocks as discrete inputs. [`PanelClient`]
//! wraps the raw send path with typed accessors for that map.

use std::sync::Arc;

use crate::codec::ResponsePayload;
use crate::error::{LinkError, LinkResult};
use crate::manager::{EndpointId, LinkManager};
use crate::protocol::{data, Address, FunctionCode, Request, UnitId};

/// Fixed address map of the panel controller.
pub mod map {
    use crate::protocol::Address;

    /// Lamp-life setpoint in hours, float32.
    pub const LAMP_LIFE_SETPOINT: Address = 10;
    /// Cleaning-interval setpoint in hours, float32.
    pub const CLEANING_SETPOINT: Address = 12;
    /// Hours run since the last cleaning, float32.
    pub const CLEANING_RUN_HOURS: Address = 14;
    /// Number of lamps currently lit, float32.
    pub const LAMPS_ONLINE: Address = 16;
    /// Lamp current draw in amperes, float32.
    pub const CURRENT_AMPS: Address = 18;

    /// Per-lamp run-hours counter, uint16, strided by lamp.
    pub const LAMP_RUN_HOURS_BASE: Address = 20;
    /// Per-lamp maximum-hours limit, uint16, strided by lamp.
    pub const LAMP_MAX_HOURS_BASE: Address = 22;
    /// Address stride between consecutive lamps.
    pub const LAMP_STRIDE: Address = 4;
    /// Lamps are numbered 1 through this count.
    pub const LAMP_COUNT: u8 = 4;

    /// System power coil.
    pub const POWER_COIL: Address = 8;
    /// Door-closed interlock, discrete input.
    pub const DOOR_CLOSED: Address = 0;
    /// Water-pressure-ok interlock, discrete input.
    pub const PRESSURE_OK: Address = 1;
}

/// Register address of a per-lamp quantity. Lamps are 1-indexed.
fn lamp_register(base: Address, lamp: u8) -> LinkResult<Address> {
    if lamp == 0 || lamp > map::LAMP_COUNT {
        return Err(LinkError::invalid_data(format!(
            "lamp number {lamp} out of range 1..={}",
            map::LAMP_COUNT
        )));
    }
    Ok(base + (lamp as Address - 1) * map::LAMP_STRIDE)
}

/// Typed client for one panel controller.
#[derive(Clone)]
pub struct PanelClient {
    manager: Arc<LinkManager>,
    endpoint: EndpointId,
    unit_id: UnitId,
}

impl PanelClient {
    pub fn new(manager: Arc<LinkManager>, endpoint: EndpointId, unit_id: UnitId) -> Self {
        Self {
            manager,
            endpoint,
            unit_id,
        }
    }

    pub fn endpoint(&self) -> &EndpointId {
        &self.endpoint
    }

    pub async fn read_lamp_life_setpoint(&self) -> LinkResult<f32> {
        self.read_f32(map::LAMP_LIFE_SETPOINT).await
    }

    pub async fn write_lamp_life_setpoint(&self, hours: f32) -> LinkResult<()> {
        self.write_f32(map::LAMP_LIFE_SETPOINT, hours).await
    }

    pub async fn read_cleaning_setpoint(&self) -> LinkResult<f32> {
        self.read_f32(map::CLEANING_SETPOINT).await
    }

    pub async fn write_cleaning_setpoint(&self, hours: f32) -> LinkResult<()> {
        self.write_f32(map::CLEANING_SETPOINT, hours).await
    }

    pub async fn read_cleaning_run_hours(&self) -> LinkResult<f32> {
        self.read_f32(map::CLEANING_RUN_HOURS).await
    }

    pub async fn read_lamps_online(&self) -> LinkResult<f32> {
        self.read_f32(map::LAMPS_ONLINE).await
    }

    pub async fn read_current_amps(&self) -> LinkResult<f32> {
        self.read_f32(map::CURRENT_AMPS).await
    }

    pub async fn read_lamp_hours(&self, lamp: u8) -> LinkResult<u16> {
        self.read_u16(lamp_register(map::LAMP_RUN_HOURS_BASE, lamp)?)
            .await
    }

    pub async fn read_lamp_max_hours(&self, lamp: u8) -> LinkResult<u16> {
        self.read_u16(lamp_register(map::LAMP_MAX_HOURS_BASE, lamp)?)
            .await
    }

    pub async fn write_lamp_max_hours(&self, lamp: u8, hours: u16) -> LinkResult<()> {
        self.write_u16(lamp_register(map::LAMP_MAX_HOURS_BASE, lamp)?, hours)
            .await
    }

    /// Switch the system power coil. The controller echoes the write; a
    /// non-matching echo fails as a transport error.
    pub async fn set_power(&self, on: bool) -> LinkResult<()> {
        let request = Request::write_coil(self.unit_id, map::POWER_COIL, on);
        let expected = if on { 0xFF00 } else { 0x0000 };
        match self.manager.send(&self.endpoint, request).await? {
            ResponsePayload::WriteEcho { address, value }
                if address == map::POWER_COIL && value == expected =>
            {
                Ok(())
            }
            ResponsePayload::WriteEcho { address, value } => Err(LinkError::transport(format!(
                "coil write echo mismatch: address {address}, value 0x{value:04X}"
            ))),
            other => Err(unexpected_payload(&other)),
        }
    }

    pub async fn read_power(&self) -> LinkResult<bool> {
        self.read_bit(FunctionCode::ReadCoils, map::POWER_COIL).await
    }

    pub async fn read_door_closed(&self) -> LinkResult<bool> {
        self.read_bit(FunctionCode::ReadDiscreteInputs, map::DOOR_CLOSED)
            .await
    }

    pub async fn read_pressure_ok(&self) -> LinkResult<bool> {
        self.read_bit(FunctionCode::ReadDiscreteInputs, map::PRESSURE_OK)
            .await
    }

    async fn read_f32(&self, address: Address) -> LinkResult<f32> {
        let request = Request::read(self.unit_id, FunctionCode::ReadHoldingRegisters, address, 2);
        match self.manager.send(&self.endpoint, request).await? {
            ResponsePayload::Registers(registers) => data::registers_to_f32(&registers),
            other => Err(unexpected_payload(&other)),
        }
    }

    async fn write_f32(&self, address: Address, value: f32) -> LinkResult<()> {
        let registers = data::f32_to_registers(value);
        let request = Request::write_registers(self.unit_id, address, &registers);
        match self.manager.send(&self.endpoint, request).await? {
            ResponsePayload::WriteAck {
                address: echoed,
                quantity: 2,
            } if echoed == address => Ok(()),
            ResponsePayload::WriteAck { address, quantity } => {
                Err(LinkError::transport(format!(
                    "register write acknowledged wrong span: address {address}, quantity {quantity}"
                )))
            }
            other => Err(unexpected_payload(&other)),
        }
    }

    async fn read_u16(&self, address: Address) -> LinkResult<u16> {
        let request = Request::read(self.unit_id, FunctionCode::ReadHoldingRegisters, address, 1);
        match self.manager.send(&self.endpoint, request).await? {
            ResponsePayload::Registers(registers) if registers.len() == 1 => Ok(registers[0]),
            other => Err(unexpected_payload(&other)),
        }
    }

    async fn write_u16(&self, address: Address, value: u16) -> LinkResult<()> {
        let request = Request::write_register(self.unit_id, address, value);
        match self.manager.send(&self.endpoint, request).await? {
            ResponsePayload::WriteEcho {
                address: echoed,
                value: echoed_value,
            } if echoed == address && echoed_value == value => Ok(()),
            ResponsePayload::WriteEcho { address, value } => Err(LinkError::transport(format!(
                "register write echo mismatch: address {address}, value {value}"
            ))),
            other => Err(unexpected_payload(&other)),
        }
    }

    async fn read_bit(&self, function: FunctionCode, address: Address) -> LinkResult<bool> {
        let request = Request::read(self.unit_id, function, address, 1);
        match self.manager.send(&self.endpoint, request).await? {
            ResponsePayload::Bits(bits) if !bits.is_empty() => Ok(bits[0]),
            other => Err(unexpected_payload(&other)),
        }
    }
}

fn unexpected_payload(payload: &ResponsePayload) -> LinkError {
    LinkError::frame(format!("unexpected response payload: {payload:?}"))
}
