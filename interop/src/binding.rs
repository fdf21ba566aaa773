//! Primary-API adapter binding
//!
//! Opens the primary API on adapter 0, allocates the shared destination
//! buffer and exports it. The binding is the sole owner of the allocation;
//! importers hold an [`ImportLease`] and must give it back before the
//! binding is torn down.

use conduit_shared::AdapterLuid;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{error, info};

use crate::backend::{PrimaryApi, PrimaryDevice, ShareHandle};
use crate::diagnostics::DiagnosticSink;
use crate::error::{InteropError, InteropResult};

/// The adapter the benchmark binds to. No selection heuristics: the first
/// adapter the primary API enumerates.
pub const PRIMARY_ADAPTER_INDEX: u32 = 0;

/// Non-owning claim on a shared allocation held by an importer.
#[derive(Debug)]
pub struct ImportLease {
    live: Arc<AtomicUsize>,
}

impl Drop for ImportLease {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Primary device plus the exported device-local allocation.
pub struct AdapterBinding<D: PrimaryDevice> {
    device: D,
    identity: AdapterLuid,
    len: u64,
    allocation: Option<D::Allocation>,
    handle: Option<ShareHandle>,
    leases: Arc<AtomicUsize>,
    diagnostics: DiagnosticSink,
}

impl<D: PrimaryDevice> AdapterBinding<D> {
    /// Open adapter 0 of `api`, allocate `len` bytes of shareable
    /// device-local memory and export it.
    pub fn open<A>(api: &A, len: u64, diagnostics: DiagnosticSink) -> InteropResult<Self>
    where
        A: PrimaryApi<Device = D>,
    {
        let device = api.open_adapter(PRIMARY_ADAPTER_INDEX)?;
        let identity = device.adapter_identity();
        info!(
            "Primary adapter {}: {} (LUID {})",
            PRIMARY_ADAPTER_INDEX,
            device.adapter_name(),
            identity
        );

        let allocation = device.create_shared_allocation(len)?;
        let handle = match device.export_handle(&allocation) {
            Ok(handle) => handle,
            Err(e) => {
                device.release_allocation(allocation);
                return Err(e);
            }
        };
        device.drain_diagnostics(&diagnostics);
        info!("Exported {} byte shared allocation as {} handle", len, handle.kind());

        Ok(Self {
            device,
            identity,
            len,
            allocation: Some(allocation),
            handle: Some(handle),
            leases: Arc::new(AtomicUsize::new(0)),
            diagnostics,
        })
    }

    pub fn identity(&self) -> AdapterLuid {
        self.identity
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// The exported handle, until teardown closes it.
    pub fn share_handle(&self) -> Option<ShareHandle> {
        self.handle
    }

    /// Take out a lease for an importer of the shared allocation.
    pub fn lease(&self) -> ImportLease {
        self.leases.fetch_add(1, Ordering::AcqRel);
        ImportLease {
            live: self.leases.clone(),
        }
    }

    pub fn live_leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Open a DMA-engine queue that writes into the shared allocation.
    pub fn create_dma_queue(&self, capacity: u16) -> InteropResult<D::DmaQueue> {
        let allocation = self
            .allocation
            .as_ref()
            .ok_or_else(|| InteropError::Backend("shared allocation already released".into()))?;
        self.device.create_dma_queue(allocation, capacity)
    }

    /// Forward pending driver messages to the diagnostic pump.
    pub fn drain_diagnostics(&self) {
        self.device.drain_diagnostics(&self.diagnostics);
    }

    /// Close the export handle and release the allocation.
    ///
    /// The handle is always closed. With importers still holding leases the
    /// allocation is leaked rather than freed under them, and `LiveImports`
    /// is returned. Idempotent.
    pub fn teardown(&mut self) -> InteropResult<()> {
        let closed = match self.handle.take() {
            Some(handle) => self.device.close_handle(handle),
            None => Ok(()),
        };

        let live = self.live_leases();
        if let Some(allocation) = self.allocation.take() {
            if live > 0 {
                error!(
                    "Shared allocation still imported {} time(s); leaking it",
                    live
                );
                std::mem::forget(allocation);
            } else {
                self.device.release_allocation(allocation);
            }
        }
        self.drain_diagnostics();

        if live > 0 {
            return Err(InteropError::LiveImports(live));
        }
        closed
    }
}

impl<D: PrimaryDevice> Drop for AdapterBinding<D> {
    fn drop(&mut self) {
        if let Err(e) = self.teardown() {
            error!("Adapter binding teardown failed: {}", e);
        }
    }
}
