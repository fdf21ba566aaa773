//! D3D12 primary API with a DirectStorage DMA queue (`d3d12` feature,
//! Windows only)

mod dstorage;

pub use dstorage::{DStorageFactory, DStorageFile, DStorageQueue};

use conduit_shared::AdapterLuid;
use once_cell::sync::OnceCell;
use tracing::{info, warn};

use windows::core::{Interface, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, GENERIC_ALL, HANDLE};
use windows::Win32::Graphics::Direct3D::D3D_FEATURE_LEVEL_12_0;
use windows::Win32::Graphics::Direct3D12::*;
use windows::Win32::Graphics::Dxgi::Common::{DXGI_FORMAT_UNKNOWN, DXGI_SAMPLE_DESC};
use windows::Win32::Graphics::Dxgi::{CreateDXGIFactory1, IDXGIAdapter1, IDXGIFactory1};

use crate::backend::{ExternalHandleKind, PrimaryApi, PrimaryDevice, ShareHandle};
use crate::diagnostics::{DiagnosticRecord, DiagnosticSink, Severity};
use crate::error::{InteropError, InteropResult};

pub(crate) fn hresult(call: &'static str) -> impl Fn(windows::core::Error) -> InteropError {
    move |e| InteropError::native(call, e.code().0)
}

/// D3D12 over DXGI, optionally with the debug layer.
#[derive(Debug, Clone, Copy, Default)]
pub struct D3D12Api {
    debug_layer: bool,
}

impl D3D12Api {
    pub fn new(debug_layer: bool) -> Self {
        Self { debug_layer }
    }

    fn enable_debug_layer(&self) {
        let mut debug: Option<ID3D12Debug> = None;
        unsafe {
            match D3D12GetDebugInterface(&mut debug) {
                Ok(()) => {
                    if let Some(debug) = debug {
                        debug.EnableDebugLayer();
                        info!("D3D12 debug layer enabled");
                    }
                }
                Err(e) => warn!("D3D12 debug layer unavailable: {}", e),
            }
        }
    }
}

impl PrimaryApi for D3D12Api {
    type Device = D3D12Device;

    fn open_adapter(&self, adapter_index: u32) -> InteropResult<D3D12Device> {
        if self.debug_layer {
            self.enable_debug_layer();
        }

        unsafe {
            let factory: IDXGIFactory1 =
                CreateDXGIFactory1().map_err(hresult("CreateDXGIFactory1"))?;
            let adapter: IDXGIAdapter1 = factory
                .EnumAdapters1(adapter_index)
                .map_err(hresult("IDXGIFactory1::EnumAdapters1"))?;
            let desc = adapter
                .GetDesc1()
                .map_err(hresult("IDXGIAdapter1::GetDesc1"))?;

            let mut device: Option<ID3D12Device> = None;
            D3D12CreateDevice(&adapter, D3D_FEATURE_LEVEL_12_0, &mut device)
                .map_err(hresult("D3D12CreateDevice"))?;
            let device = device.ok_or_else(|| {
                InteropError::Backend("D3D12CreateDevice returned no device".into())
            })?;

            let info_queue = if self.debug_layer {
                device.cast::<ID3D12InfoQueue>().ok()
            } else {
                None
            };

            let name_len = desc
                .Description
                .iter()
                .position(|&c| c == 0)
                .unwrap_or(desc.Description.len());
            let name = String::from_utf16_lossy(&desc.Description[..name_len]);
            let luid = AdapterLuid::new(desc.AdapterLuid.HighPart as u32, desc.AdapterLuid.LowPart);

            Ok(D3D12Device {
                device,
                name,
                luid,
                info_queue,
                storage: OnceCell::new(),
            })
        }
    }
}

pub struct D3D12Device {
    device: ID3D12Device,
    name: String,
    luid: AdapterLuid,
    info_queue: Option<ID3D12InfoQueue>,
    storage: OnceCell<DStorageFactory>,
}

impl D3D12Device {
    fn storage_factory(&self) -> InteropResult<&DStorageFactory> {
        self.storage.get_or_try_init(DStorageFactory::load)
    }
}

fn buffer_desc(len: u64) -> D3D12_RESOURCE_DESC {
    D3D12_RESOURCE_DESC {
        Dimension: D3D12_RESOURCE_DIMENSION_BUFFER,
        Alignment: 0,
        Width: len,
        Height: 1,
        DepthOrArraySize: 1,
        MipLevels: 1,
        Format: DXGI_FORMAT_UNKNOWN,
        SampleDesc: DXGI_SAMPLE_DESC {
            Count: 1,
            Quality: 0,
        },
        Layout: D3D12_TEXTURE_LAYOUT_ROW_MAJOR,
        Flags: D3D12_RESOURCE_FLAG_NONE,
    }
}

fn severity(severity: D3D12_MESSAGE_SEVERITY) -> Severity {
    match severity {
        D3D12_MESSAGE_SEVERITY_CORRUPTION => Severity::Corruption,
        D3D12_MESSAGE_SEVERITY_ERROR => Severity::Error,
        D3D12_MESSAGE_SEVERITY_WARNING => Severity::Warning,
        D3D12_MESSAGE_SEVERITY_INFO => Severity::Info,
        _ => Severity::Message,
    }
}

impl PrimaryDevice for D3D12Device {
    type Allocation = ID3D12Resource;
    type DmaQueue = DStorageQueue;

    fn adapter_identity(&self) -> AdapterLuid {
        self.luid
    }

    fn adapter_name(&self) -> String {
        self.name.clone()
    }

    fn create_shared_allocation(&self, len: u64) -> InteropResult<ID3D12Resource> {
        let heap = D3D12_HEAP_PROPERTIES {
            Type: D3D12_HEAP_TYPE_DEFAULT,
            ..Default::default()
        };
        let desc = buffer_desc(len);
        let mut resource: Option<ID3D12Resource> = None;
        unsafe {
            self.device
                .CreateCommittedResource(
                    &heap,
                    D3D12_HEAP_FLAG_SHARED,
                    &desc,
                    D3D12_RESOURCE_STATE_COMMON,
                    None,
                    &mut resource,
                )
                .map_err(hresult("ID3D12Device::CreateCommittedResource"))?;
        }
        resource.ok_or_else(|| InteropError::Backend("CreateCommittedResource returned no resource".into()))
    }

    fn export_handle(&self, allocation: &ID3D12Resource) -> InteropResult<ShareHandle> {
        let handle = unsafe {
            self.device
                .CreateSharedHandle(allocation, None, GENERIC_ALL.0, PCWSTR::null())
                .map_err(hresult("ID3D12Device::CreateSharedHandle"))?
        };
        Ok(ShareHandle::new(handle.0 as isize, ExternalHandleKind::D3D12Resource))
    }

    fn close_handle(&self, handle: ShareHandle) -> InteropResult<()> {
        unsafe { CloseHandle(HANDLE(handle.raw() as *mut _)) }.map_err(hresult("CloseHandle"))
    }

    fn release_allocation(&self, allocation: ID3D12Resource) {
        drop(allocation);
    }

    fn create_dma_queue(
        &self,
        allocation: &ID3D12Resource,
        capacity: u16,
    ) -> InteropResult<DStorageQueue> {
        self.storage_factory()?
            .create_queue(&self.device, allocation.clone(), capacity)
    }

    fn drain_diagnostics(&self, sink: &DiagnosticSink) {
        let Some(info_queue) = &self.info_queue else {
            return;
        };
        unsafe {
            let count = info_queue.GetNumStoredMessages();
            for index in 0..count {
                let mut len = 0usize;
                if info_queue.GetMessage(index, None, &mut len).is_err() || len == 0 {
                    continue;
                }
                // D3D12_MESSAGE followed by its description, 8-byte aligned
                let mut storage = vec![0u64; len.div_ceil(8)];
                let message = storage.as_mut_ptr().cast::<D3D12_MESSAGE>();
                if info_queue.GetMessage(index, Some(message), &mut len).is_err() {
                    continue;
                }
                let message = &*message;
                let description = if message.pDescription.is_null() {
                    String::new()
                } else {
                    let bytes = std::slice::from_raw_parts(
                        message.pDescription,
                        message.DescriptionByteLength.saturating_sub(1),
                    );
                    String::from_utf8_lossy(bytes).into_owned()
                };
                sink.emit(DiagnosticRecord::new(
                    severity(message.Severity),
                    format!("{:?}", message.Category),
                    "D3D12",
                    description,
                ));
            }
            info_queue.ClearStoredMessages();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore = "needs a D3D12 adapter and dstorage.dll"]
    fn test_storage_factory_is_loaded_once() {
        let device = D3D12Api::new(false).open_adapter(0).unwrap();
        let first = device.storage_factory().unwrap() as *const DStorageFactory;
        let second = device.storage_factory().unwrap() as *const DStorageFactory;
        assert_eq!(first, second);
    }
}
