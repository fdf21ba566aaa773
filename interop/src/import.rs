//! Importing the shared allocation into the secondary API

use conduit_shared::AdapterLuid;
use tracing::info;

use crate::backend::{BufferUsage, MemoryLocation, PrimaryDevice, SecondaryDevice};
use crate::binding::{AdapterBinding, ImportLease};
use crate::error::{InteropError, InteropResult};

/// Usage of the imported destination buffer: written by copies, read back
/// for verification, bindable as storage.
pub const IMPORTED_BUFFER_USAGE: BufferUsage = BufferUsage::STORAGE
    .union(BufferUsage::TRANSFER_DST)
    .union(BufferUsage::TRANSFER_SRC);

/// Secondary-API buffer bound to the primary API's shared allocation.
///
/// Holds a lease on the allocation; [`ImportedBuffer::release`] frees only
/// the secondary-side wrappers and returns the lease.
#[derive(Debug)]
pub struct ImportedBuffer<D: SecondaryDevice> {
    buffer: D::Buffer,
    memory: D::Memory,
    len: u64,
    _lease: ImportLease,
}

impl<D: SecondaryDevice> ImportedBuffer<D> {
    pub fn buffer(&self) -> D::Buffer {
        self.buffer
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Destroy the buffer object and the imported memory object, then drop
    /// the lease. The underlying bytes stay with the exporter.
    pub fn release(self, device: &D) {
        device.destroy_buffer(self.buffer);
        device.free_memory(self.memory);
    }
}

/// Fail unless both APIs picked the same adapter.
pub fn check_same_adapter(
    primary: AdapterLuid,
    secondary: Option<AdapterLuid>,
) -> InteropResult<()> {
    match secondary {
        Some(luid) if luid.high == primary.high && luid.low == primary.low => Ok(()),
        _ => Err(InteropError::AdapterMismatch { primary, secondary }),
    }
}

pub struct MemoryImporter;

impl MemoryImporter {
    /// Import `binding`'s exported allocation into `device`.
    ///
    /// `device_identity` is the LUID of the physical device `device` was
    /// created on. A mismatch fails before anything is created.
    pub fn import<P, D>(
        binding: &AdapterBinding<P>,
        device_identity: Option<AdapterLuid>,
        device: &D,
    ) -> InteropResult<ImportedBuffer<D>>
    where
        P: PrimaryDevice,
        D: SecondaryDevice,
    {
        check_same_adapter(binding.identity(), device_identity)?;

        let handle = binding
            .share_handle()
            .ok_or_else(|| InteropError::Backend("export handle already closed".into()))?;
        let kind = handle.kind();
        if !device.import_supported(kind, IMPORTED_BUFFER_USAGE)? {
            return Err(InteropError::ImportUnsupported {
                kind,
                usage: IMPORTED_BUFFER_USAGE,
            });
        }

        let len = binding.len();
        let buffer = device.create_buffer(len, IMPORTED_BUFFER_USAGE, Some(kind))?;
        let memory = match device.allocate_memory(buffer, MemoryLocation::DeviceLocal, Some(handle)) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };
        if let Err(e) = device.bind_buffer_memory(buffer, memory, 0) {
            device.destroy_buffer(buffer);
            device.free_memory(memory);
            return Err(e);
        }

        info!("Imported {} byte {} allocation", len, kind);
        Ok(ImportedBuffer {
            buffer,
            memory,
            len,
            _lease: binding.lease(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_adapter_check() {
        let luid = AdapterLuid::new(0, 0x1234);
        assert!(check_same_adapter(luid, Some(luid)).is_ok());

        let err = check_same_adapter(luid, Some(AdapterLuid::new(1, 0x1234))).unwrap_err();
        assert!(matches!(err, InteropError::AdapterMismatch { .. }));
        assert!(err.is_configuration());
        assert!(check_same_adapter(luid, Some(AdapterLuid::new(0, 0x1235))).is_err());
        assert!(check_same_adapter(luid, None).is_err());
    }

    #[test]
    fn test_imported_usage() {
        assert!(IMPORTED_BUFFER_USAGE.contains(BufferUsage::STORAGE));
        assert!(IMPORTED_BUFFER_USAGE.contains(BufferUsage::TRANSFER_DST));
        assert!(IMPORTED_BUFFER_USAGE.contains(BufferUsage::TRANSFER_SRC));
    }
}
