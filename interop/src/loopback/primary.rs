use conduit_shared::AdapterLuid;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use super::{lock, LoopbackAdapter, LoopbackDmaQueue, PlatformState, SharedBytes, E_HANDLE, E_INVALIDARG};
use crate::backend::{ExternalHandleKind, PrimaryApi, PrimaryDevice, ShareHandle};
use crate::diagnostics::{DiagnosticRecord, DiagnosticSink, Severity};
use crate::error::{InteropError, InteropResult};

const DXGI_ERROR_NOT_FOUND: i32 = 0x887A_0002u32 as i32;

/// Simulated primary API.
#[derive(Debug, Clone)]
pub struct LoopbackPrimary {
    state: Arc<PlatformState>,
}

impl LoopbackPrimary {
    pub(crate) fn new(state: Arc<PlatformState>) -> Self {
        Self { state }
    }
}

impl PrimaryApi for LoopbackPrimary {
    type Device = LoopbackPrimaryDevice;

    fn open_adapter(&self, adapter_index: u32) -> InteropResult<LoopbackPrimaryDevice> {
        let adapter = self
            .state
            .primary_adapter(adapter_index)
            .ok_or_else(|| InteropError::native("IDXGIFactory1::EnumAdapters1", DXGI_ERROR_NOT_FOUND))?
            .clone();
        let luid = adapter
            .luid
            .ok_or_else(|| InteropError::native("D3D12CreateDevice", E_INVALIDARG))?;

        let device = LoopbackPrimaryDevice {
            state: self.state.clone(),
            adapter,
            luid,
            pending: Mutex::new(Vec::new()),
        };
        device.note(Severity::Message, "Initialization", "device created");
        Ok(device)
    }
}

/// Simulated primary device. Queues driver messages until drained.
#[derive(Debug)]
pub struct LoopbackPrimaryDevice {
    state: Arc<PlatformState>,
    adapter: LoopbackAdapter,
    luid: AdapterLuid,
    pending: Mutex<Vec<DiagnosticRecord>>,
}

impl LoopbackPrimaryDevice {
    fn note(&self, severity: Severity, category: &str, message: impl Into<String>) {
        lock(&self.pending).push(DiagnosticRecord::new(severity, category, "Loopback", message));
    }
}

/// Shared allocation of the loopback primary device.
#[derive(Debug)]
pub struct LoopbackAllocation {
    bytes: SharedBytes,
    exported: AtomicBool,
}

impl LoopbackAllocation {
    pub(crate) fn bytes(&self) -> &SharedBytes {
        &self.bytes
    }
}

impl PrimaryDevice for LoopbackPrimaryDevice {
    type Allocation = LoopbackAllocation;
    type DmaQueue = LoopbackDmaQueue;

    fn adapter_identity(&self) -> AdapterLuid {
        self.luid
    }

    fn adapter_name(&self) -> String {
        self.adapter.name.clone()
    }

    fn create_shared_allocation(&self, len: u64) -> InteropResult<LoopbackAllocation> {
        if len == 0 {
            return Err(InteropError::native(
                "ID3D12Device::CreateCommittedResource",
                E_INVALIDARG,
            ));
        }
        let len = usize::try_from(len)
            .map_err(|_| InteropError::native("ID3D12Device::CreateCommittedResource", E_INVALIDARG))?;
        self.state.allocation_created();
        self.note(Severity::Info, "Resource", format!("{} byte shared buffer created", len));
        Ok(LoopbackAllocation {
            bytes: Arc::new(RwLock::new(vec![0u8; len])),
            exported: AtomicBool::new(false),
        })
    }

    fn export_handle(&self, allocation: &LoopbackAllocation) -> InteropResult<ShareHandle> {
        allocation.exported.store(true, Ordering::Release);
        let raw = self.state.register_handle(allocation.bytes.clone());
        Ok(ShareHandle::new(raw, ExternalHandleKind::D3D12Resource))
    }

    fn close_handle(&self, handle: ShareHandle) -> InteropResult<()> {
        if self.state.close_handle(handle.raw()) {
            Ok(())
        } else {
            Err(InteropError::native("CloseHandle", E_HANDLE))
        }
    }

    fn release_allocation(&self, allocation: LoopbackAllocation) {
        self.state.allocation_released();
        if allocation.exported.load(Ordering::Acquire) {
            self.note(Severity::Info, "Resource", "shared buffer released");
        }
    }

    fn create_dma_queue(
        &self,
        allocation: &LoopbackAllocation,
        capacity: u16,
    ) -> InteropResult<LoopbackDmaQueue> {
        if capacity == 0 {
            return Err(InteropError::native("IDStorageFactory::CreateQueue", E_INVALIDARG));
        }
        LoopbackDmaQueue::spawn(allocation.bytes().clone(), capacity)
    }

    fn drain_diagnostics(&self, sink: &DiagnosticSink) {
        for record in lock(&self.pending).drain(..) {
            sink.emit(record);
        }
    }
}
