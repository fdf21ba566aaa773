//! Adapter identity
//!
//! Both device APIs report a locally-unique identifier (LUID) for each
//! physical adapter. Two APIs are talking about the same piece of hardware
//! only when their LUIDs match.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Locally-unique adapter identifier, split into two 32-bit words.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AdapterLuid {
    pub high: u32,
    pub low: u32,
}

impl AdapterLuid {
    pub const fn new(high: u32, low: u32) -> Self {
        Self { high, low }
    }

    /// Decode the 8-byte in-memory LUID layout (`LowPart` first, then
    /// `HighPart`, both little-endian) as reported by Vulkan's
    /// `VkPhysicalDeviceIDProperties::deviceLUID`.
    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        let low = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let high = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        Self { high, low }
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let mut out = [0u8; 8];
        out[..4].copy_from_slice(&self.low.to_le_bytes());
        out[4..].copy_from_slice(&self.high.to_le_bytes());
        out
    }

    /// The identifier as a single 64-bit value (`high << 32 | low`).
    pub fn as_u64(self) -> u64 {
        (u64::from(self.high) << 32) | u64::from(self.low)
    }
}

impl From<u64> for AdapterLuid {
    fn from(value: u64) -> Self {
        Self {
            high: (value >> 32) as u32,
            low: value as u32,
        }
    }
}

impl fmt::Display for AdapterLuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}:{:08x}", self.high, self.low)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_layout_is_low_part_first() {
        let luid = AdapterLuid::from_bytes([0x78, 0x56, 0x34, 0x12, 0x01, 0x00, 0x00, 0x00]);
        assert_eq!(luid.low, 0x1234_5678);
        assert_eq!(luid.high, 1);
        assert_eq!(luid.to_bytes(), [0x78, 0x56, 0x34, 0x12, 0x01, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_u64_conversion() {
        let luid = AdapterLuid::from(0x0000_0001_0000_a2f3);
        assert_eq!(luid, AdapterLuid::new(1, 0xa2f3));
        assert_eq!(luid.as_u64(), 0x0000_0001_0000_a2f3);
    }

    #[test]
    fn test_equality_compares_both_halves() {
        let a = AdapterLuid::new(0, 42);
        assert_ne!(a, AdapterLuid::new(1, 42));
        assert_ne!(a, AdapterLuid::new(0, 43));
        assert_eq!(a, AdapterLuid::new(0, 42));
    }

    #[test]
    fn test_display() {
        assert_eq!(AdapterLuid::new(1, 0xbeef).to_string(), "00000001:0000beef");
    }
}
