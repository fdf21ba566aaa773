//! In-process loopback backend
//!
//! Simulates both APIs over host memory so the whole interop path runs
//! without a GPU. Exported handles resolve to the exporter's bytes, so a
//! write through the secondary device is visible to the DMA queue and vice
//! versa. The platform counts live allocations, open handles and live
//! imports for leak checks.

mod dma;
mod primary;
mod secondary;

pub use dma::{LoopbackDmaQueue, LoopbackFile};
pub use primary::{LoopbackAllocation, LoopbackPrimary, LoopbackPrimaryDevice};
pub use secondary::{
    LoopbackBuffer, LoopbackCommandBuffer, LoopbackCommandPool, LoopbackMemory, LoopbackQueue,
    LoopbackSecondary, LoopbackSecondaryDevice,
};

use conduit_shared::{AdapterLuid, PhysicalDeviceInfo, QueueCapabilities, QueueFamilyInfo};
use std::collections::HashMap;
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub(crate) type SharedBytes = Arc<RwLock<Vec<u8>>>;

// HRESULTs reported by the simulated primary API.
pub(crate) const E_INVALIDARG: i32 = 0x8007_0057u32 as i32;
pub(crate) const E_HANDLE: i32 = 0x8007_0006u32 as i32;
pub(crate) const E_FILE_NOT_FOUND: i32 = 0x8007_0002u32 as i32;
pub(crate) const E_HANDLE_EOF: i32 = 0x8007_0026u32 as i32;

/// One simulated GPU.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackAdapter {
    pub name: String,
    pub luid: Option<AdapterLuid>,
    pub queue_families: Vec<QueueFamilyInfo>,
    /// Whether the secondary API accepts imported handles on this adapter.
    pub import_supported: bool,
}

impl LoopbackAdapter {
    /// A discrete-GPU-like adapter: a universal family, an async compute
    /// family and a dedicated transfer family.
    pub fn discrete(name: &str, luid: AdapterLuid) -> Self {
        Self {
            name: name.to_string(),
            luid: Some(luid),
            queue_families: vec![
                QueueFamilyInfo::new(
                    QueueCapabilities::GRAPHICS
                        | QueueCapabilities::COMPUTE
                        | QueueCapabilities::TRANSFER
                        | QueueCapabilities::SPARSE_BINDING,
                    16,
                ),
                QueueFamilyInfo::new(QueueCapabilities::COMPUTE | QueueCapabilities::TRANSFER, 8),
                QueueFamilyInfo::new(QueueCapabilities::TRANSFER, 2),
            ],
            import_supported: true,
        }
    }

    pub fn with_families(mut self, families: Vec<QueueFamilyInfo>) -> Self {
        self.queue_families = families;
        self
    }

    pub fn without_import_support(mut self) -> Self {
        self.import_supported = false;
        self
    }

    pub(crate) fn info(&self) -> PhysicalDeviceInfo {
        PhysicalDeviceInfo {
            name: self.name.clone(),
            luid: self.luid,
            queue_families: self.queue_families.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicUsize,
    open_handles: AtomicUsize,
    imports: AtomicUsize,
    devices_created: AtomicUsize,
}

#[derive(Debug)]
pub(crate) struct PlatformState {
    adapters: Vec<LoopbackAdapter>,
    primary_order: Vec<usize>,
    secondary_order: Vec<usize>,
    handles: Mutex<HashMap<isize, SharedBytes>>,
    next_handle: AtomicIsize,
    counters: Counters,
}

impl PlatformState {
    pub(crate) fn primary_adapter(&self, index: u32) -> Option<&LoopbackAdapter> {
        self.primary_order
            .get(index as usize)
            .map(|&i| &self.adapters[i])
    }

    pub(crate) fn secondary_adapter(&self, index: usize) -> Option<&LoopbackAdapter> {
        self.secondary_order.get(index).map(|&i| &self.adapters[i])
    }

    pub(crate) fn secondary_adapters(&self) -> impl Iterator<Item = &LoopbackAdapter> {
        self.secondary_order.iter().map(|&i| &self.adapters[i])
    }

    pub(crate) fn register_handle(&self, bytes: SharedBytes) -> isize {
        let raw = self.next_handle.fetch_add(4, Ordering::Relaxed);
        lock(&self.handles).insert(raw, bytes);
        self.counters.open_handles.fetch_add(1, Ordering::AcqRel);
        raw
    }

    pub(crate) fn close_handle(&self, raw: isize) -> bool {
        let closed = lock(&self.handles).remove(&raw).is_some();
        if closed {
            self.counters.open_handles.fetch_sub(1, Ordering::AcqRel);
        }
        closed
    }

    pub(crate) fn resolve_handle(&self, raw: isize) -> Option<SharedBytes> {
        lock(&self.handles).get(&raw).cloned()
    }

    pub(crate) fn allocation_created(&self) {
        self.counters.allocations.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn allocation_released(&self) {
        self.counters.allocations.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn import_created(&self) {
        self.counters.imports.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn import_released(&self) {
        self.counters.imports.fetch_sub(1, Ordering::AcqRel);
    }

    pub(crate) fn device_created(&self) {
        self.counters.devices_created.fetch_add(1, Ordering::AcqRel);
    }
}

/// Both simulated APIs over one set of adapters.
#[derive(Debug, Clone)]
pub struct LoopbackPlatform {
    state: Arc<PlatformState>,
}

impl LoopbackPlatform {
    /// Both APIs enumerate `adapters` in the given order.
    pub fn new(adapters: Vec<LoopbackAdapter>) -> Self {
        let order: Vec<usize> = (0..adapters.len()).collect();
        Self::with_orders(adapters, order.clone(), order)
    }

    /// Each API enumerates the adapters in its own order, given as indices
    /// into `adapters`.
    pub fn with_orders(
        adapters: Vec<LoopbackAdapter>,
        primary_order: Vec<usize>,
        secondary_order: Vec<usize>,
    ) -> Self {
        let in_range = |order: &Vec<usize>| order.iter().all(|&i| i < adapters.len());
        let primary_order = if in_range(&primary_order) { primary_order } else { Vec::new() };
        let secondary_order = if in_range(&secondary_order) { secondary_order } else { Vec::new() };
        Self {
            state: Arc::new(PlatformState {
                adapters,
                primary_order,
                secondary_order,
                handles: Mutex::new(HashMap::new()),
                next_handle: AtomicIsize::new(0x100),
                counters: Counters::default(),
            }),
        }
    }

    /// A single discrete adapter shared by both APIs.
    pub fn single_adapter() -> Self {
        Self::new(vec![LoopbackAdapter::discrete(
            "Loopback Adapter",
            AdapterLuid::new(0, 0x0000_c0de),
        )])
    }

    pub fn primary(&self) -> LoopbackPrimary {
        LoopbackPrimary::new(self.state.clone())
    }

    pub fn secondary(&self) -> LoopbackSecondary {
        LoopbackSecondary::new(self.state.clone())
    }

    /// Shared allocations created and not yet released.
    pub fn live_allocations(&self) -> usize {
        self.state.counters.allocations.load(Ordering::Acquire)
    }

    /// Exported handles not yet closed.
    pub fn open_handles(&self) -> usize {
        self.state.counters.open_handles.load(Ordering::Acquire)
    }

    /// Imported memory objects not yet freed.
    pub fn live_imports(&self) -> usize {
        self.state.counters.imports.load(Ordering::Acquire)
    }

    /// Secondary devices created so far.
    pub fn devices_created(&self) -> usize {
        self.state.counters.devices_created.load(Ordering::Acquire)
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_enumeration_orders() {
        let a = LoopbackAdapter::discrete("A", AdapterLuid::new(0, 1));
        let b = LoopbackAdapter::discrete("B", AdapterLuid::new(0, 2));
        let platform = LoopbackPlatform::with_orders(vec![a, b], vec![0, 1], vec![1, 0]);

        assert_eq!(platform.state.primary_adapter(0).unwrap().name, "A");
        assert_eq!(platform.state.secondary_adapter(0).unwrap().name, "B");
        assert!(platform.state.secondary_adapter(2).is_none());
    }

    #[test]
    fn test_handle_registry() {
        let platform = LoopbackPlatform::single_adapter();
        let bytes: SharedBytes = Arc::new(RwLock::new(vec![7u8; 4]));
        let raw = platform.state.register_handle(bytes.clone());
        assert_eq!(platform.open_handles(), 1);
        assert!(Arc::ptr_eq(&platform.state.resolve_handle(raw).unwrap(), &bytes));

        assert!(platform.state.close_handle(raw));
        assert!(!platform.state.close_handle(raw));
        assert_eq!(platform.open_handles(), 0);
        assert!(platform.state.resolve_handle(raw).is_none());
    }
}
