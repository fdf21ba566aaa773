//! Queue capability requests and resolved queue bindings

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign};

/// Capability bitmask of a hardware queue family.
///
/// Bit values match `VkQueueFlagBits` so masks can be passed through from
/// the Vulkan backend unchanged.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct QueueCapabilities(u32);

impl QueueCapabilities {
    pub const GRAPHICS: Self = Self(0x1);
    pub const COMPUTE: Self = Self(0x2);
    pub const TRANSFER: Self = Self(0x4);
    pub const SPARSE_BINDING: Self = Self(0x8);

    const NAMED: [(Self, &'static str); 4] = [
        (Self::GRAPHICS, "graphics"),
        (Self::COMPUTE, "compute"),
        (Self::TRANSFER, "transfer"),
        (Self::SPARSE_BINDING, "sparse-binding"),
    ];

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is also set in `self`.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Whether a queue family (or device) exposing `available` can serve a
/// request for `requested`.
pub const fn satisfies(available: QueueCapabilities, requested: QueueCapabilities) -> bool {
    available.contains(requested)
}

impl BitOr for QueueCapabilities {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for QueueCapabilities {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for QueueCapabilities {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl FromIterator<QueueCapabilities> for QueueCapabilities {
    fn from_iter<I: IntoIterator<Item = QueueCapabilities>>(iter: I) -> Self {
        iter.into_iter().fold(Self::empty(), Self::union)
    }
}

impl fmt::Debug for QueueCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "QueueCapabilities({self})")
    }
}

impl fmt::Display for QueueCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("none");
        }
        let mut rest = self.0;
        let mut first = true;
        for (flag, name) in Self::NAMED {
            if self.contains(flag) {
                if !first {
                    f.write_str("|")?;
                }
                f.write_str(name)?;
                rest &= !flag.0;
                first = false;
            }
        }
        if rest != 0 {
            if !first {
                f.write_str("|")?;
            }
            write!(f, "{rest:#x}")?;
        }
        Ok(())
    }
}

impl std::str::FromStr for QueueCapabilities {
    type Err = anyhow::Error;

    /// Parse `"transfer"`, `"graphics|compute"` or `"compute,transfer"`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut caps = Self::empty();
        for part in s.split(['|', ',']).map(str::trim).filter(|p| !p.is_empty()) {
            let lower = part.to_lowercase();
            let flag = Self::NAMED
                .iter()
                .find(|(_, name)| *name == lower)
                .map(|(flag, _)| *flag);
            match flag {
                Some(flag) => caps |= flag,
                None => anyhow::bail!("Invalid queue capability: {}", part),
            }
        }
        Ok(caps)
    }
}

/// A caller's request for queues with a given set of capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRequest {
    pub capabilities: QueueCapabilities,

    /// Number of queues wanted. `None` takes every queue the assigned family exposes.
    pub count: Option<u32>,
}

impl QueueRequest {
    pub fn new(capabilities: QueueCapabilities) -> Self {
        Self {
            capabilities,
            count: None,
        }
    }

    pub fn with_count(mut self, count: u32) -> Self {
        self.count = Some(count);
        self
    }
}

/// One hardware queue family as enumerated by a device API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueFamilyInfo {
    pub capabilities: QueueCapabilities,
    pub queue_count: u32,
}

impl QueueFamilyInfo {
    pub fn new(capabilities: QueueCapabilities, queue_count: u32) -> Self {
        Self {
            capabilities,
            queue_count,
        }
    }
}

/// A physical device as seen by the secondary API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalDeviceInfo {
    pub name: String,

    /// `None` when the driver does not report a valid LUID.
    pub luid: Option<super::adapter::AdapterLuid>,

    pub queue_families: Vec<QueueFamilyInfo>,
}

impl PhysicalDeviceInfo {
    /// Union of the capabilities of every queue family on this device.
    pub fn family_union(&self) -> QueueCapabilities {
        self.queue_families.iter().map(|f| f.capabilities).collect()
    }
}

/// A capability set resolved to a concrete queue family and an acquired queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyBinding<Q> {
    pub capabilities: QueueCapabilities,
    pub family_index: u32,
    pub queue_count: u32,
    pub queue: Q,
}
