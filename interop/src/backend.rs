//! Device API seams
//!
//! The interop core never calls a graphics API directly. The primary API
//! (owner of the shared allocation and of the DMA-engine queue) and the
//! secondary API (importer with its own transfer queues) are reached through
//! the traits below, implemented by the loopback, Vulkan and D3D12 backends.

use conduit_shared::{AdapterLuid, PhysicalDeviceInfo};
use serde::Serialize;
use std::fmt;
use std::ops::BitOr;
use std::path::Path;

use crate::diagnostics::DiagnosticSink;
use crate::error::InteropResult;

/// OS handle types that can carry memory from one API to the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExternalHandleKind {
    /// NT handle to a D3D12 committed resource.
    D3D12Resource,
    /// Generic NT handle to exportable memory.
    OpaqueWin32,
    /// POSIX file descriptor to exportable memory.
    OpaqueFd,
}

impl fmt::Display for ExternalHandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::D3D12Resource => "D3D12 resource",
            Self::OpaqueWin32 => "opaque Win32",
            Self::OpaqueFd => "opaque fd",
        })
    }
}

/// Buffer usage bits (values match `VkBufferUsageFlagBits`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const TRANSFER_SRC: Self = Self(0x1);
    pub const TRANSFER_DST: Self = Self(0x2);
    pub const STORAGE: Self = Self(0x20);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for BufferUsage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = [
            (Self::TRANSFER_SRC, "transfer-src"),
            (Self::TRANSFER_DST, "transfer-dst"),
            (Self::STORAGE, "storage"),
        ]
        .into_iter()
        .filter(|(flag, _)| self.contains(*flag))
        .map(|(_, name)| name)
        .collect();
        if names.is_empty() {
            f.write_str("no-usage")
        } else {
            f.write_str(&names.join("|"))
        }
    }
}

/// Where a secondary-API allocation lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    DeviceLocal,
    HostVisible,
}

/// An OS-level handle exported by the primary API.
///
/// Plain data: closing it is the exporter's job, never the importer's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShareHandle {
    raw: isize,
    kind: ExternalHandleKind,
}

impl ShareHandle {
    pub fn new(raw: isize, kind: ExternalHandleKind) -> Self {
        Self { raw, kind }
    }

    pub fn raw(&self) -> isize {
        self.raw
    }

    pub fn kind(&self) -> ExternalHandleKind {
        self.kind
    }
}

/// One distinct queue family to create on a secondary device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueCreateRequest {
    pub family_index: u32,
    pub queue_count: u32,
}

impl QueueCreateRequest {
    /// All queues in a family are created with the same priority.
    pub fn priorities(&self) -> Vec<f32> {
        vec![1.0; self.queue_count as usize]
    }
}

/// Error record retrieved from a DMA-engine queue after a fence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaErrorRecord {
    pub failure_count: u32,
    pub first_failure_code: i32,
}

/// Entry point of the primary (exporting) API.
pub trait PrimaryApi {
    type Device: PrimaryDevice;

    /// Create a logical device on the adapter at `adapter_index` in the
    /// API's own enumeration order.
    fn open_adapter(&self, adapter_index: u32) -> InteropResult<Self::Device>;
}

/// A logical device of the primary API.
pub trait PrimaryDevice {
    type Allocation;
    type DmaQueue: DmaQueue;

    fn adapter_identity(&self) -> AdapterLuid;

    fn adapter_name(&self) -> String;

    /// Allocate a device-local, shareable buffer of `len` bytes with no initial data.
    fn create_shared_allocation(&self, len: u64) -> InteropResult<Self::Allocation>;

    /// Export `allocation` as an OS handle with read/write access for this process.
    fn export_handle(&self, allocation: &Self::Allocation) -> InteropResult<ShareHandle>;

    fn close_handle(&self, handle: ShareHandle) -> InteropResult<()>;

    fn release_allocation(&self, allocation: Self::Allocation);

    /// Open a DMA-engine queue whose requests land in `allocation`.
    fn create_dma_queue(
        &self,
        allocation: &Self::Allocation,
        capacity: u16,
    ) -> InteropResult<Self::DmaQueue>;

    /// Move any pending driver messages into `sink`.
    fn drain_diagnostics(&self, sink: &DiagnosticSink);
}

/// Entry point of the secondary (importing) API.
pub trait SecondaryApi {
    type Device: SecondaryDevice;

    fn physical_devices(&self) -> InteropResult<Vec<PhysicalDeviceInfo>>;

    /// Create a logical device on the physical device at `physical_index`.
    /// `queues` holds one entry per distinct family.
    fn create_device(
        &self,
        physical_index: usize,
        queues: &[QueueCreateRequest],
    ) -> InteropResult<Self::Device>;
}

/// A logical device of the secondary API.
///
/// Handles are plain copyable values; destroying them is explicit.
pub trait SecondaryDevice {
    type Queue: Copy + fmt::Debug;
    type Buffer: Copy + fmt::Debug;
    type Memory: Copy + fmt::Debug;
    type CommandPool: Copy + fmt::Debug;
    type CommandBuffer: Copy + fmt::Debug;

    fn queue(&self, family_index: u32, queue_index: u32) -> Self::Queue;

    fn import_supported(&self, kind: ExternalHandleKind, usage: BufferUsage) -> InteropResult<bool>;

    fn create_buffer(
        &self,
        len: u64,
        usage: BufferUsage,
        external: Option<ExternalHandleKind>,
    ) -> InteropResult<Self::Buffer>;

    /// Allocate memory for `buffer`. With `import`, the memory is the
    /// exported allocation behind the handle rather than a fresh one.
    fn allocate_memory(
        &self,
        buffer: Self::Buffer,
        location: MemoryLocation,
        import: Option<ShareHandle>,
    ) -> InteropResult<Self::Memory>;

    fn bind_buffer_memory(
        &self,
        buffer: Self::Buffer,
        memory: Self::Memory,
        offset: u64,
    ) -> InteropResult<()>;

    /// Map the first `len` bytes of host-visible `memory`, hand them to `f`,
    /// and unmap again whatever `f` returns.
    fn with_mapped(
        &self,
        memory: Self::Memory,
        len: u64,
        f: &mut dyn FnMut(&mut [u8]) -> InteropResult<()>,
    ) -> InteropResult<()>;

    fn create_command_pool(&self, family_index: u32, transient: bool)
        -> InteropResult<Self::CommandPool>;

    fn allocate_command_buffer(&self, pool: Self::CommandPool) -> InteropResult<Self::CommandBuffer>;

    /// Record a `len`-byte copy from `src` to `dst` (both at offset 0).
    /// A `one_shot` recording may be submitted once only.
    fn record_copy(
        &self,
        command_buffer: Self::CommandBuffer,
        src: Self::Buffer,
        dst: Self::Buffer,
        len: u64,
        one_shot: bool,
    ) -> InteropResult<()>;

    fn submit(&self, queue: Self::Queue, command_buffer: Self::CommandBuffer) -> InteropResult<()>;

    fn queue_wait_idle(&self, queue: Self::Queue) -> InteropResult<()>;

    fn free_command_buffer(&self, pool: Self::CommandPool, command_buffer: Self::CommandBuffer);

    fn destroy_command_pool(&self, pool: Self::CommandPool);

    fn destroy_buffer(&self, buffer: Self::Buffer);

    fn free_memory(&self, memory: Self::Memory);
}

/// A DMA-engine queue moving file bytes straight into GPU memory.
pub trait DmaQueue {
    type File;

    fn open_file(&mut self, path: &Path) -> InteropResult<Self::File>;

    /// Enqueue a `len`-byte read from the start of `file` into the queue's
    /// destination allocation at `dest_offset`.
    fn enqueue_file_to_buffer(
        &mut self,
        file: &Self::File,
        len: u64,
        dest_offset: u64,
    ) -> InteropResult<()>;

    /// Enqueue a signal of the queue's completion fence to `value`.
    fn enqueue_signal(&mut self, value: u64) -> InteropResult<()>;

    fn submit(&mut self) -> InteropResult<()>;

    /// Block until the completion fence reaches `value`.
    fn wait_for_fence(&mut self, value: u64) -> InteropResult<()>;

    /// Retrieve the queue's error record, if any request has failed.
    fn take_error_record(&mut self) -> InteropResult<Option<DmaErrorRecord>>;

    fn close_file(&mut self, file: Self::File);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_usage_display() {
        let usage = BufferUsage::STORAGE | BufferUsage::TRANSFER_DST;
        assert_eq!(usage.to_string(), "transfer-dst|storage");
        assert!(usage.contains(BufferUsage::STORAGE));
        assert!(!usage.contains(BufferUsage::TRANSFER_SRC));
        assert_eq!(BufferUsage::default().to_string(), "no-usage");
    }

    #[test]
    fn test_equal_priorities() {
        let request = QueueCreateRequest {
            family_index: 2,
            queue_count: 3,
        };
        assert_eq!(request.priorities(), vec![1.0, 1.0, 1.0]);
    }
}
