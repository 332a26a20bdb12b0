//! Error types for the uvlink Modbus core.
//!
//! A single error enum covers everything a caller of
//! [`LinkManager::send`](crate::manager::LinkManager::send) can observe:
//! transport failures, request timeouts, Modbus exception responses, and
//! deliberate closure/suspension of an endpoint, plus the codec-level
//! errors raised while building or parsing frames.
//!
//! Errors are `Clone` because a single triggering error (a socket error,
//! say) rejects every request queued on the affected connection.

use thiserror::Error;

/// Result type alias for uvlink operations.
pub type LinkResult<T> = Result<T, LinkError>;

/// Errors surfaced by the codec and the connection manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Socket-level connect/write/read failure, or a malformed response
    /// that desynced the stream.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// No complete reply arrived within the request timeout.
    #[error("timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The device answered with a Modbus exception frame.
    #[error("modbus exception: function={function:02X}, code={code:02X} ({message})")]
    Exception {
        function: u8,
        code: u8,
        message: String,
    },

    /// The connection was explicitly closed, or the endpoint is suspended.
    #[error("closed: {message}")]
    Closed { message: String },

    /// Frame-structure violation while decoding a response.
    #[error("frame error: {message}")]
    Frame { message: String },

    /// Unsupported or malformed function code.
    #[error("invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Request arguments that cannot be encoded into a legal frame.
    #[error("invalid data: {message}")]
    InvalidData { message: String },
}

impl LinkError {
    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Build an exception error, mapping standard codes to their
    /// human-readable names.
    pub fn exception(function: u8, code: u8) -> Self {
        let message = match code {
            0x01 => "Illegal Function",
            0x02 => "Illegal Data Address",
            0x03 => "Illegal Data Value",
            0x04 => "Server Device Failure",
            0x05 => "Acknowledge",
            0x06 => "Server Device Busy",
            0x08 => "Memory Parity Error",
            0x0A => "Gateway Path Unavailable",
            0x0B => "Gateway Target Device Failed to Respond",
            _ => "Unknown Exception",
        }
        .to_string();

        Self::Exception {
            function,
            code,
            message,
        }
    }

    pub fn closed<S: Into<String>>(message: S) -> Self {
        Self::Closed {
            message: message.into(),
        }
    }

    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame {
            message: message.into(),
        }
    }

    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Whether the failed operation could plausibly succeed on retry.
    ///
    /// The manager never retries requests itself; this informs the
    /// polling layer's own retry decisions.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Closed { .. } => true,
            // Acknowledge / busy exceptions clear on their own.
            Self::Exception { code, .. } => matches!(code, 0x05 | 0x06),
            _ => false,
        }
    }

    /// Whether the error originates below the protocol layer.
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Transport { .. } | Self::Timeout { .. } | Self::Closed { .. }
        )
    }

    /// Whether the error is a Modbus protocol violation or exception.
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::Exception { .. }
                | Self::Frame { .. }
                | Self::InvalidFunction { .. }
                | Self::InvalidData { .. }
        )
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}
