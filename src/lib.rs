//! Modbus TCP client core for UV-disinfection panel controllers.
//!
//! Two layers:
//!
//! - **Codec** ([`protocol`], [`codec`]): builds MBAP-framed request
//!   frames for function codes 1 through 6, 15 and 16, reassembles
//!   response frames out of arbitrary stream chunks, and decodes typed
//!   payloads including protocol exceptions.
//! - **Connection manager** ([`manager`]): one persistent
//!   TCP connection per endpoint with strict FIFO request serialization,
//!   at most one request in flight, per-request timeouts, a liveness
//!   watchdog, exponential-backoff reconnection, and suspension after
//!   repeated failure.
//!
//! [`panel`] adds the panel controller's fixed register map and typed
//! read/write operations on top.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use uvlink::{EndpointId, LinkManager, PanelClient};
//!
//! # async fn run() -> uvlink::LinkResult<()> {
//! let manager = Arc::new(LinkManager::new());
//! manager.on_error(|endpoint, error| {
//!     eprintln!("{endpoint}: {error}");
//! });
//!
//! let panel = PanelClient::new(manager, EndpointId::new("192.168.1.50", 502), 1);
//! panel.set_power(true).await?;
//! let hours = panel.read_cleaning_run_hours().await?;
//! println!("hours since cleaning: {hours:.1}");
//! # Ok(())
//! # }
//! ```

pub mod codec;
mod connection;
pub mod error;
pub mod listener;
pub mod manager;
pub mod panel;
pub mod protocol;
pub mod util;

pub use codec::{Frame, FrameBuffer, ResponsePayload};
pub use error::{LinkError, LinkResult};
pub use manager::{EndpointId, LinkConfig, LinkManager};
pub use panel::PanelClient;
pub use protocol::{Address, ExceptionCode, FunctionCode, Request, UnitId};

/// Standard Modbus TCP port.
pub const DEFAULT_TCP_PORT: u16 = 502;

/// MBAP header length: transaction id, protocol id, length, unit id.
pub const MBAP_HEADER_LEN: usize = 7;

/// Largest legal value of the MBAP length field (unit id + PDU).
pub const MAX_MBAP_LENGTH: usize = 254;

/// Largest complete frame: 6-byte header prefix plus the length field.
pub const MAX_FRAME_SIZE: usize = 260;

/// Coil limit for a single read or multi-write request.
pub const MAX_COILS_PER_REQUEST: u16 = 2000;

/// Register limit for a single read or multi-write request.
pub const MAX_REGISTERS_PER_REQUEST: u16 = 125;
