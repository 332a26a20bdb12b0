//! Small shared helpers.

use tracing::debug;

/// Format a raw packet as spaced uppercase hex, e.g. `00 01 00 00 00 06`.
pub fn format_hex_packet(data: &[u8]) -> String {
    data.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Compact lowercase hex without separators, for log fields.
pub fn bytes_to_hex(data: &[u8]) -> String {
    hex::encode(data)
}

/// Log a packet at debug level with direction marker.
pub fn log_packet(direction: &str, endpoint: &str, data: &[u8]) {
    debug!(
        endpoint = endpoint,
        len = data.len(),
        "{} {}",
        direction,
        format_hex_packet(data)
    );
}
