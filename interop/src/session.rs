//! End-to-end interop session
//!
//! Drives the control flow from adapter binding to teardown:
//!
//! 1. Bind the primary API to adapter 0 and export a shared allocation.
//! 2. Plan queues on the secondary API and gate the chosen device on the
//!    adapter LUID before creating it.
//! 3. Import the allocation into the secondary device.
//! 4. Run transfer strategies into it, read it back.
//! 5. Release the import, then the export.

use std::time::Instant;
use tracing::{debug, info};

use conduit_shared::{
    AdapterLuid, PayloadError, PhysicalDeviceInfo, QueueCapabilities, QueueFamilyBinding,
    QueueRequest, TransferPayload,
};

use crate::backend::{PrimaryApi, PrimaryDevice, SecondaryApi, SecondaryDevice};
use crate::binding::AdapterBinding;
use crate::diagnostics::DiagnosticSink;
use crate::error::{InteropError, InteropResult};
use crate::import::{check_same_adapter, ImportedBuffer, MemoryImporter};
use crate::resolver::{resolve_queues, ResolvedDevice, ResolvedQueues};
use crate::transfer::{
    read_back, single_staged_copy, DmaTransfer, ReusedStagedCopy, StrategyKind, TransferReport,
};

/// Default number of in-flight requests on the DMA queue.
pub const DEFAULT_DMA_QUEUE_CAPACITY: u16 = 128;

/// Upper bound the DMA queue API accepts for its capacity.
pub const MAX_DMA_QUEUE_CAPACITY: u16 = 2048;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Size of the shared buffer, equal to the payload unit length.
    pub len: u64,

    /// Queues to create on the secondary device.
    pub queue_requests: Vec<QueueRequest>,

    pub dma_queue_capacity: u16,
}

impl SessionConfig {
    /// One transfer queue and the default DMA queue capacity.
    pub fn new(len: u64) -> Self {
        Self {
            len,
            queue_requests: vec![QueueRequest::new(QueueCapabilities::TRANSFER).with_count(1)],
            dma_queue_capacity: DEFAULT_DMA_QUEUE_CAPACITY,
        }
    }

    pub fn with_queue_requests(mut self, requests: Vec<QueueRequest>) -> Self {
        self.queue_requests = requests;
        self
    }

    pub fn with_dma_queue_capacity(mut self, capacity: u16) -> Self {
        self.dma_queue_capacity = capacity;
        self
    }
}

/// A primary device and a secondary device sharing one allocation.
pub struct InteropSession<P: PrimaryDevice, S: SecondaryDevice> {
    // Fields drop in declaration order: importer-side objects go first.
    dma: Option<DmaTransfer<P::DmaQueue>>,
    imported: Option<ImportedBuffer<S>>,
    secondary: ResolvedDevice<S>,
    transfer: QueueFamilyBinding<S::Queue>,
    binding: AdapterBinding<P>,
    dma_queue_capacity: u16,
}

impl<P: PrimaryDevice, S: SecondaryDevice> std::fmt::Debug for InteropSession<P, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteropSession")
            .field("dma_queue_capacity", &self.dma_queue_capacity)
            .finish_non_exhaustive()
    }
}

impl<P: PrimaryDevice, S: SecondaryDevice> InteropSession<P, S> {
    /// Bind, resolve, gate and import. Nothing is left behind on failure.
    pub fn establish<PA, SA>(
        primary_api: &PA,
        secondary_api: &SA,
        config: &SessionConfig,
        diagnostics: DiagnosticSink,
    ) -> InteropResult<Self>
    where
        PA: PrimaryApi<Device = P>,
        SA: SecondaryApi<Device = S>,
    {
        if config.dma_queue_capacity == 0 || config.dma_queue_capacity > MAX_DMA_QUEUE_CAPACITY {
            return Err(InteropError::Backend(format!(
                "DMA queue capacity must be between 1 and {}",
                MAX_DMA_QUEUE_CAPACITY
            )));
        }

        let binding = AdapterBinding::open(primary_api, config.len, diagnostics)?;
        let identity = binding.identity();
        let secondary = resolve_queues(secondary_api, &config.queue_requests, |physical| {
            check_same_adapter(identity, physical.luid)
        })?;

        let transfer = *transfer_binding(&secondary.queues)?;
        let imported = MemoryImporter::import(&binding, secondary.physical.luid, &secondary.device)?;
        info!(
            "Session established on {} (transfer family {})",
            identity, transfer.family_index
        );

        Ok(Self {
            dma: None,
            imported: Some(imported),
            secondary,
            transfer,
            binding,
            dma_queue_capacity: config.dma_queue_capacity,
        })
    }

    pub fn len(&self) -> u64 {
        self.binding.len()
    }

    pub fn primary_identity(&self) -> AdapterLuid {
        self.binding.identity()
    }

    pub fn binding(&self) -> &AdapterBinding<P> {
        &self.binding
    }

    pub fn physical_device(&self) -> &PhysicalDeviceInfo {
        &self.secondary.physical
    }

    pub fn secondary_device(&self) -> &S {
        &self.secondary.device
    }

    pub fn queues(&self) -> &ResolvedQueues<S::Queue> {
        &self.secondary.queues
    }

    /// The queue staged strategies submit to.
    pub fn transfer_queue(&self) -> &QueueFamilyBinding<S::Queue> {
        &self.transfer
    }

    fn imported(&self) -> InteropResult<&ImportedBuffer<S>> {
        self.imported
            .as_ref()
            .ok_or_else(|| InteropError::Backend("session already torn down".into()))
    }

    /// Run one pass of `strategy` over `payload`.
    ///
    /// The single staged copy moves the first file only; the other
    /// strategies move every file in order.
    pub fn run(
        &mut self,
        strategy: StrategyKind,
        payload: &TransferPayload,
    ) -> InteropResult<TransferReport> {
        let Some(first) = payload.first_file() else {
            return Err(PayloadError::NoFiles.into());
        };
        if payload.unit_len() != self.len() {
            return Err(InteropError::UnitLengthMismatch {
                unit: payload.unit_len(),
                buffer: self.len(),
            });
        }
        debug!("Running {} over {} unit(s)", strategy, payload.file_count());

        let start = Instant::now();
        let units = match strategy {
            StrategyKind::SingleStaged => {
                let dest = self.imported()?;
                single_staged_copy(&self.secondary.device, &self.transfer, dest, first)?;
                1
            }
            StrategyKind::ReusedStaged => {
                let dest = self.imported()?;
                ReusedStagedCopy::new(&self.secondary.device, &self.transfer, dest)?
                    .run(payload.files())?
            }
            StrategyKind::DmaQueue => {
                self.imported()?;
                let result = self.dma_transfer()?.run(payload.files());
                self.binding.drain_diagnostics();
                result?
            }
        };
        let elapsed = start.elapsed();

        Ok(TransferReport {
            strategy,
            units,
            bytes: units as u64 * self.len(),
            elapsed,
        })
    }

    fn dma_transfer(&mut self) -> InteropResult<&mut DmaTransfer<P::DmaQueue>> {
        if self.dma.is_none() {
            let queue = self.binding.create_dma_queue(self.dma_queue_capacity)?;
            info!(
                "Opened DMA queue with capacity {}",
                self.dma_queue_capacity
            );
            self.dma = Some(DmaTransfer::new(queue, self.len()));
        }
        self.dma
            .as_mut()
            .ok_or_else(|| InteropError::Backend("DMA queue unavailable".into()))
    }

    /// Current contents of the shared buffer, copied out through
    /// host-visible staging.
    pub fn read_back(&self) -> InteropResult<Vec<u8>> {
        let imported = self.imported()?;
        read_back(
            &self.secondary.device,
            &self.transfer,
            imported.buffer(),
            imported.len(),
        )
    }

    /// Release the import, then close the export handle and release the
    /// allocation. Idempotent.
    pub fn teardown(&mut self) -> InteropResult<()> {
        self.dma = None;
        if let Some(imported) = self.imported.take() {
            imported.release(&self.secondary.device);
        }
        self.binding.teardown()
    }
}

impl<P: PrimaryDevice, S: SecondaryDevice> Drop for InteropSession<P, S> {
    fn drop(&mut self) {
        self.dma = None;
        if let Some(imported) = self.imported.take() {
            imported.release(&self.secondary.device);
        }
    }
}

fn transfer_binding<Q: Copy>(queues: &ResolvedQueues<Q>) -> InteropResult<&QueueFamilyBinding<Q>> {
    // every queue family can execute copies, so fall back to the first request
    queues
        .find(QueueCapabilities::TRANSFER)
        .or_else(|| queues.for_request(0))
        .ok_or(InteropError::NoQueueRequests)
}
