use crate::error::{BandError, Result};

/// Render bytes as lowercase hex
#[must_use]
pub fn bytes_to_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Parse a hex string into bytes
///
/// # Errors
///
/// Returns [`BandError::Parse`] if the input is not valid hex.
pub fn hex_to_bytes(input: &str) -> Result<Vec<u8>> {
    hex::decode(input).map_err(|e| BandError::Parse(format!("invalid hex string: {e}")))
}

/// Read a little-endian u16 at `offset`, or 0 if the slice is too short
#[must_use]
pub fn read_u16_le(bytes: &[u8], offset: usize) -> u16 {
    match bytes.get(offset..offset + 2) {
        Some(b) => u16::from_le_bytes([b[0], b[1]]),
        None => 0,
    }
}

/// Read a little-endian u24 at `offset`, or 0 if the slice is too short
#[must_use]
pub fn read_u24_le(bytes: &[u8], offset: usize) -> u32 {
    match bytes.get(offset..offset + 3) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], 0]),
        None => 0,
    }
}

/// Read a little-endian u32 at `offset`, or 0 if the slice is too short
#[must_use]
pub fn read_u32_le(bytes: &[u8], offset: usize) -> u32 {
    match bytes.get(offset..offset + 4) {
        Some(b) => u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
        None => 0,
    }
}

/// Encode a u16 as little-endian bytes
#[must_use]
pub const fn u16_to_le_bytes(value: u16) -> [u8; 2] {
    value.to_le_bytes()
}

/// Encode a u32 as little-endian bytes
#[must_use]
pub const fn u32_to_le_bytes(value: u32) -> [u8; 4] {
    value.to_le_bytes()
}

/// Parse a standard Heart Rate Measurement characteristic value
///
/// Bit 0 of the flags byte selects the u8 or u16 rate layout. Returns 0 for
/// empty or truncated values.
#[must_use]
pub fn parse_heart_rate_measurement(value: &[u8]) -> u16 {
    let Some(&flags) = value.first() else {
        return 0;
    };

    if flags & 0x01 != 0 {
        read_u16_le(value, 1)
    } else {
        value.get(1).copied().map_or(0, u16::from)
    }
}
