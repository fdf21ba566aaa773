//! DirectStorage queue writing files into a D3D12 buffer
//!
//! The runtime ships no Rust bindings, so the three interfaces used here are
//! declared by hand from `dstorage.h` and the factory is resolved from
//! `dstorage.dll` at runtime.

#![allow(non_snake_case)]

use std::ffi::c_void;
use std::os::windows::ffi::OsStrExt;
use std::path::Path;
use std::ptr;

use windows::core::{interface, Interface, IUnknown, IUnknown_Vtbl, GUID, HRESULT, PCSTR, PCWSTR};
use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_OBJECT_0};
use windows::Win32::Graphics::Direct3D12::{ID3D12Device, ID3D12Fence, ID3D12Resource, D3D12_FENCE_FLAG_NONE};
use windows::Win32::System::LibraryLoader::{GetProcAddress, LoadLibraryW};
use windows::Win32::System::Threading::{CreateEventW, WaitForSingleObject, INFINITE};
use windows::core::{s, w};

use crate::backend::{DmaErrorRecord, DmaQueue};
use crate::error::{InteropError, InteropResult};

use super::hresult;

const DSTORAGE_REQUEST_SOURCE_FILE: u64 = 0;
const DSTORAGE_REQUEST_DESTINATION_BUFFER: u64 = 1;
const DSTORAGE_PRIORITY_NORMAL: i8 = 0;

#[repr(C)]
struct DStorageQueueDesc {
    source_type: u32,
    capacity: u16,
    priority: i8,
    name: PCSTR,
    device: *mut c_void,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DStorageRequestOptions {
    compression_format: u8,
    reserved1: [u8; 7],
    // SourceType:1, DestinationType:7, Reserved:56
    kinds: u64,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DStorageSourceFile {
    source: *mut c_void,
    offset: u64,
    size: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct DStorageDestinationBuffer {
    resource: *mut c_void,
    offset: u64,
    size: u32,
}

/// Sized for the largest destination variant (tiles).
#[repr(C)]
union DStorageDestination {
    buffer: DStorageDestinationBuffer,
    _largest: [u64; 5],
}

#[repr(C)]
struct DStorageRequest {
    options: DStorageRequestOptions,
    source: DStorageSourceFile,
    destination: DStorageDestination,
    uncompressed_size: u32,
    cancellation_tag: u64,
    name: PCSTR,
}

/// Leading fields of `DSTORAGE_ERROR_RECORD`, padded past the full size.
#[repr(C)]
struct DStorageErrorRecord {
    failure_count: u32,
    first_failure_hresult: i32,
    _rest: [u64; 128],
}

#[interface("6924ea0c-c3cd-4826-b10a-f64f4ed927c1")]
unsafe trait IDStorageFactory: IUnknown {
    unsafe fn CreateQueue(&self, desc: *const DStorageQueueDesc, riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT;
    unsafe fn OpenFile(&self, path: PCWSTR, riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT;
    unsafe fn CreateStatusArray(&self, capacity: u32, name: PCSTR, riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT;
    unsafe fn SetDebugFlags(&self, flags: u32);
    unsafe fn SetStagingBufferSize(&self, size: u32) -> HRESULT;
}

#[interface("5de95e7b-955a-4868-a73c-243b29f4b8da")]
unsafe trait IDStorageFile: IUnknown {
    unsafe fn Close(&self);
    unsafe fn GetFileInformation(&self, info: *mut c_void) -> HRESULT;
}

#[interface("cfdbd83f-9e06-4fda-8ea5-69042137f49b")]
unsafe trait IDStorageQueue: IUnknown {
    unsafe fn EnqueueRequest(&self, request: *const DStorageRequest);
    unsafe fn EnqueueStatus(&self, status_array: *mut c_void, index: u32);
    unsafe fn EnqueueSignal(&self, fence: *mut c_void, value: u64);
    unsafe fn Submit(&self);
    unsafe fn CancelRequestsWithTag(&self, mask: u64, value: u64);
    unsafe fn Close(&self);
    unsafe fn GetErrorEvent(&self) -> HANDLE;
    unsafe fn RetrieveErrorRecord(&self, record: *mut DStorageErrorRecord);
    unsafe fn Query(&self, info: *mut c_void);
}

type DStorageGetFactoryFn = unsafe extern "system" fn(riid: *const GUID, ppv: *mut *mut c_void) -> HRESULT;

/// The process-wide DirectStorage factory.
pub struct DStorageFactory {
    factory: IDStorageFactory,
}

impl DStorageFactory {
    /// Load `dstorage.dll` and fetch its factory.
    pub fn load() -> InteropResult<Self> {
        unsafe {
            let module = LoadLibraryW(w!("dstorage.dll")).map_err(hresult("LoadLibraryW(dstorage.dll)"))?;
            let proc = GetProcAddress(module, s!("DStorageGetFactory")).ok_or_else(|| {
                InteropError::Backend("dstorage.dll does not export DStorageGetFactory".into())
            })?;
            let get_factory: DStorageGetFactoryFn = std::mem::transmute(proc);

            let mut raw = ptr::null_mut();
            get_factory(&IDStorageFactory::IID, &mut raw)
                .ok()
                .map_err(hresult("DStorageGetFactory"))?;
            Ok(Self {
                factory: IDStorageFactory::from_raw(raw),
            })
        }
    }

    /// One file-source queue on `device` writing into `destination`.
    pub fn create_queue(
        &self,
        device: &ID3D12Device,
        destination: ID3D12Resource,
        capacity: u16,
    ) -> InteropResult<DStorageQueue> {
        let desc = DStorageQueueDesc {
            source_type: DSTORAGE_REQUEST_SOURCE_FILE as u32,
            capacity,
            priority: DSTORAGE_PRIORITY_NORMAL,
            name: s!("conduit"),
            device: device.as_raw(),
        };
        unsafe {
            let mut raw = ptr::null_mut();
            self.factory
                .CreateQueue(&desc, &IDStorageQueue::IID, &mut raw)
                .ok()
                .map_err(hresult("IDStorageFactory::CreateQueue"))?;
            let queue = IDStorageQueue::from_raw(raw);

            let fence: ID3D12Fence = device
                .CreateFence(0, D3D12_FENCE_FLAG_NONE)
                .map_err(hresult("ID3D12Device::CreateFence"))?;
            let event = CreateEventW(None, false, false, None).map_err(hresult("CreateEventW"))?;

            Ok(DStorageQueue {
                factory: self.factory.clone(),
                queue,
                destination,
                fence,
                event,
            })
        }
    }
}

/// A DirectStorage queue with its completion fence and wait event.
pub struct DStorageQueue {
    factory: IDStorageFactory,
    queue: IDStorageQueue,
    destination: ID3D12Resource,
    fence: ID3D12Fence,
    event: HANDLE,
}

pub struct DStorageFile(IDStorageFile);

impl DmaQueue for DStorageQueue {
    type File = DStorageFile;

    fn open_file(&mut self, path: &Path) -> InteropResult<DStorageFile> {
        let wide: Vec<u16> = path.as_os_str().encode_wide().chain(Some(0)).collect();
        unsafe {
            let mut raw = ptr::null_mut();
            self.factory
                .OpenFile(PCWSTR(wide.as_ptr()), &IDStorageFile::IID, &mut raw)
                .ok()
                .map_err(hresult("IDStorageFactory::OpenFile"))?;
            Ok(DStorageFile(IDStorageFile::from_raw(raw)))
        }
    }

    fn enqueue_file_to_buffer(
        &mut self,
        file: &DStorageFile,
        len: u64,
        dest_offset: u64,
    ) -> InteropResult<()> {
        let size = u32::try_from(len)
            .map_err(|_| InteropError::Backend(format!("{} bytes exceed one DirectStorage request", len)))?;
        let request = DStorageRequest {
            options: DStorageRequestOptions {
                compression_format: 0,
                reserved1: [0; 7],
                kinds: DSTORAGE_REQUEST_SOURCE_FILE | (DSTORAGE_REQUEST_DESTINATION_BUFFER << 1),
            },
            source: DStorageSourceFile {
                source: file.0.as_raw(),
                offset: 0,
                size,
            },
            destination: DStorageDestination {
                buffer: DStorageDestinationBuffer {
                    resource: self.destination.as_raw(),
                    offset: dest_offset,
                    size,
                },
            },
            uncompressed_size: size,
            cancellation_tag: 0,
            name: PCSTR::null(),
        };
        unsafe { self.queue.EnqueueRequest(&request) };
        Ok(())
    }

    fn enqueue_signal(&mut self, value: u64) -> InteropResult<()> {
        unsafe { self.queue.EnqueueSignal(self.fence.as_raw(), value) };
        Ok(())
    }

    fn submit(&mut self) -> InteropResult<()> {
        unsafe { self.queue.Submit() };
        Ok(())
    }

    fn wait_for_fence(&mut self, value: u64) -> InteropResult<()> {
        unsafe {
            if self.fence.GetCompletedValue() >= value {
                return Ok(());
            }
            self.fence
                .SetEventOnCompletion(value, self.event)
                .map_err(hresult("ID3D12Fence::SetEventOnCompletion"))?;
            if WaitForSingleObject(self.event, INFINITE) != WAIT_OBJECT_0 {
                return Err(InteropError::native(
                    "WaitForSingleObject",
                    windows::core::Error::from_win32().code().0,
                ));
            }
        }
        Ok(())
    }

    fn take_error_record(&mut self) -> InteropResult<Option<DmaErrorRecord>> {
        let mut record = DStorageErrorRecord {
            failure_count: 0,
            first_failure_hresult: 0,
            _rest: [0; 128],
        };
        unsafe { self.queue.RetrieveErrorRecord(&mut record) };
        Ok((record.failure_count > 0).then_some(DmaErrorRecord {
            failure_count: record.failure_count,
            first_failure_code: record.first_failure_hresult,
        }))
    }

    fn close_file(&mut self, file: DStorageFile) {
        unsafe { file.0.Close() };
    }
}

impl Drop for DStorageQueue {
    fn drop(&mut self) {
        unsafe {
            self.queue.Close();
            let _ = CloseHandle(self.event);
        }
    }
}
