//! Vulkan secondary API (`vulkan` feature)
//!
//! Instance at API 1.1, where external memory, dedicated allocations and
//! `VkPhysicalDeviceIDProperties` are core. Imports D3D12 resource handles
//! through `VK_KHR_external_memory_win32` on Windows and opaque fds through
//! `VK_KHR_external_memory_fd` elsewhere.

use ash::vk;
use conduit_shared::{AdapterLuid, PhysicalDeviceInfo, QueueCapabilities, QueueFamilyInfo};
use std::ffi::CStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::backend::{
    BufferUsage, ExternalHandleKind, MemoryLocation, QueueCreateRequest, SecondaryApi,
    SecondaryDevice, ShareHandle,
};
use crate::error::{InteropError, InteropResult};
use crate::memory::select_memory_type;

const APPLICATION_NAME: &CStr = c"conduit";

fn vk_error(call: &'static str) -> impl Fn(vk::Result) -> InteropError {
    move |result| InteropError::native(call, result.as_raw())
}

#[cfg(windows)]
fn external_memory_extension() -> &'static CStr {
    ash::khr::external_memory_win32::NAME
}

#[cfg(not(windows))]
fn external_memory_extension() -> &'static CStr {
    ash::khr::external_memory_fd::NAME
}

/// Makes a finished copy into `dst` visible to later transfers and to host
/// reads of mapped memory.
fn copy_completion_barrier(dst: vk::Buffer, len: u64) -> vk::BufferMemoryBarrier<'static> {
    vk::BufferMemoryBarrier::default()
        .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
        .dst_access_mask(
            vk::AccessFlags::HOST_READ
                | vk::AccessFlags::TRANSFER_READ
                | vk::AccessFlags::TRANSFER_WRITE,
        )
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .buffer(dst)
        .offset(0)
        .size(len)
}

fn handle_type(kind: ExternalHandleKind) -> vk::ExternalMemoryHandleTypeFlags {
    match kind {
        ExternalHandleKind::D3D12Resource => vk::ExternalMemoryHandleTypeFlags::D3D12_RESOURCE,
        ExternalHandleKind::OpaqueWin32 => vk::ExternalMemoryHandleTypeFlags::OPAQUE_WIN32,
        ExternalHandleKind::OpaqueFd => vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD,
    }
}

/// Instance shared by the API object and every device created from it.
struct VulkanInstance {
    _entry: ash::Entry,
    instance: ash::Instance,
}

impl Drop for VulkanInstance {
    fn drop(&mut self) {
        unsafe { self.instance.destroy_instance(None) };
    }
}

pub struct VulkanApi {
    instance: Arc<VulkanInstance>,
    physical_devices: Vec<vk::PhysicalDevice>,
}

impl VulkanApi {
    /// Load the Vulkan loader and create an instance.
    pub fn new() -> InteropResult<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| InteropError::Backend(format!("failed to load Vulkan: {}", e)))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(APPLICATION_NAME)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_1);
        let create_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(vk_error("vkCreateInstance"))?;
        let instance = Arc::new(VulkanInstance {
            _entry: entry,
            instance,
        });

        let physical_devices = unsafe { instance.instance.enumerate_physical_devices() }
            .map_err(vk_error("vkEnumeratePhysicalDevices"))?;
        info!("Vulkan instance created ({} physical device(s))", physical_devices.len());

        Ok(Self {
            instance,
            physical_devices,
        })
    }

    fn describe(&self, physical: vk::PhysicalDevice) -> PhysicalDeviceInfo {
        let instance = &self.instance.instance;

        let mut id_properties = vk::PhysicalDeviceIDProperties::default();
        let mut properties = vk::PhysicalDeviceProperties2::default().push_next(&mut id_properties);
        unsafe { instance.get_physical_device_properties2(physical, &mut properties) };
        let name = properties
            .properties
            .device_name_as_c_str()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unnamed device".to_string());
        let luid = (id_properties.device_luid_valid == vk::TRUE)
            .then(|| AdapterLuid::from_bytes(id_properties.device_luid));

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(physical) }
            .iter()
            .map(|family| {
                QueueFamilyInfo::new(
                    QueueCapabilities::from_bits(family.queue_flags.as_raw()),
                    family.queue_count,
                )
            })
            .collect();

        PhysicalDeviceInfo {
            name,
            luid,
            queue_families,
        }
    }
}

impl SecondaryApi for VulkanApi {
    type Device = VulkanDevice;

    fn physical_devices(&self) -> InteropResult<Vec<PhysicalDeviceInfo>> {
        Ok(self
            .physical_devices
            .iter()
            .map(|&physical| self.describe(physical))
            .collect())
    }

    fn create_device(
        &self,
        physical_index: usize,
        queues: &[QueueCreateRequest],
    ) -> InteropResult<VulkanDevice> {
        let physical = *self
            .physical_devices
            .get(physical_index)
            .ok_or(InteropError::native(
                "vkCreateDevice",
                vk::Result::ERROR_INITIALIZATION_FAILED.as_raw(),
            ))?;

        let priorities: Vec<Vec<f32>> = queues.iter().map(QueueCreateRequest::priorities).collect();
        let queue_infos: Vec<vk::DeviceQueueCreateInfo> = queues
            .iter()
            .zip(&priorities)
            .map(|(request, priorities)| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(request.family_index)
                    .queue_priorities(priorities)
            })
            .collect();
        let extensions = [external_memory_extension().as_ptr()];
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions);

        let instance = &self.instance.instance;
        let device = unsafe { instance.create_device(physical, &create_info, None) }
            .map_err(vk_error("vkCreateDevice"))?;
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical) };

        Ok(VulkanDevice {
            instance: self.instance.clone(),
            physical,
            device,
            memory_properties,
        })
    }
}

pub struct VulkanDevice {
    device: ash::Device,
    physical: vk::PhysicalDevice,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    // destroyed after the device
    instance: Arc<VulkanInstance>,
}

impl VulkanDevice {
    fn memory_type(&self, allowed: u32, required: vk::MemoryPropertyFlags) -> InteropResult<u32> {
        let flags: Vec<u32> = self
            .memory_properties
            .memory_types_as_slice()
            .iter()
            .map(|t| t.property_flags.as_raw())
            .collect();
        select_memory_type(allowed, &flags, required.as_raw())
            .ok_or_else(|| InteropError::NoMemoryType(format!("{:?} in {:#x}", required, allowed)))
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("vkDeviceWaitIdle failed during teardown: {}", e);
            }
            self.device.destroy_device(None);
        }
    }
}

impl SecondaryDevice for VulkanDevice {
    type Queue = vk::Queue;
    type Buffer = vk::Buffer;
    type Memory = vk::DeviceMemory;
    type CommandPool = vk::CommandPool;
    type CommandBuffer = vk::CommandBuffer;

    fn queue(&self, family_index: u32, queue_index: u32) -> vk::Queue {
        unsafe { self.device.get_device_queue(family_index, queue_index) }
    }

    fn import_supported(&self, kind: ExternalHandleKind, usage: BufferUsage) -> InteropResult<bool> {
        let info = vk::PhysicalDeviceExternalBufferInfo::default()
            .usage(vk::BufferUsageFlags::from_raw(usage.bits()))
            .handle_type(handle_type(kind));
        let mut properties = vk::ExternalBufferProperties::default();
        unsafe {
            self.instance
                .instance
                .get_physical_device_external_buffer_properties(self.physical, &info, &mut properties)
        };
        let features = properties.external_memory_properties.external_memory_features;
        debug!("External memory features for {}: {:?}", kind, features);
        Ok(features.contains(vk::ExternalMemoryFeatureFlags::IMPORTABLE))
    }

    fn create_buffer(
        &self,
        len: u64,
        usage: BufferUsage,
        external: Option<ExternalHandleKind>,
    ) -> InteropResult<vk::Buffer> {
        let mut external_info = external
            .map(|kind| vk::ExternalMemoryBufferCreateInfo::default().handle_types(handle_type(kind)));
        let mut create_info = vk::BufferCreateInfo::default()
            .size(len)
            .usage(vk::BufferUsageFlags::from_raw(usage.bits()))
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        if let Some(external_info) = external_info.as_mut() {
            create_info = create_info.push_next(external_info);
        }
        unsafe { self.device.create_buffer(&create_info, None) }.map_err(vk_error("vkCreateBuffer"))
    }

    fn allocate_memory(
        &self,
        buffer: vk::Buffer,
        location: MemoryLocation,
        import: Option<ShareHandle>,
    ) -> InteropResult<vk::DeviceMemory> {
        let requirements = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let required = match location {
            MemoryLocation::DeviceLocal => vk::MemoryPropertyFlags::DEVICE_LOCAL,
            MemoryLocation::HostVisible => {
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
            }
        };
        let memory_type = self.memory_type(requirements.memory_type_bits, required)?;

        let mut allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type);
        let mut dedicated = vk::MemoryDedicatedAllocateInfo::default().buffer(buffer);

        let Some(handle) = import else {
            return unsafe { self.device.allocate_memory(&allocate_info, None) }
                .map_err(vk_error("vkAllocateMemory"));
        };

        allocate_info = allocate_info.push_next(&mut dedicated);
        import_memory(&self.device, allocate_info, handle)
    }

    fn bind_buffer_memory(
        &self,
        buffer: vk::Buffer,
        memory: vk::DeviceMemory,
        offset: u64,
    ) -> InteropResult<()> {
        unsafe { self.device.bind_buffer_memory(buffer, memory, offset) }
            .map_err(vk_error("vkBindBufferMemory"))
    }

    fn with_mapped(
        &self,
        memory: vk::DeviceMemory,
        len: u64,
        f: &mut dyn FnMut(&mut [u8]) -> InteropResult<()>,
    ) -> InteropResult<()> {
        let ptr = unsafe {
            self.device
                .map_memory(memory, 0, len, vk::MemoryMapFlags::empty())
        }
        .map_err(vk_error("vkMapMemory"))?;
        // host-coherent: no flush or invalidate needed around the access
        let mapped = unsafe { std::slice::from_raw_parts_mut(ptr.cast::<u8>(), len as usize) };
        let result = f(mapped);
        unsafe { self.device.unmap_memory(memory) };
        result
    }

    fn create_command_pool(&self, family_index: u32, transient: bool) -> InteropResult<vk::CommandPool> {
        let flags = if transient {
            vk::CommandPoolCreateFlags::TRANSIENT
        } else {
            vk::CommandPoolCreateFlags::empty()
        };
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(family_index)
            .flags(flags);
        unsafe { self.device.create_command_pool(&create_info, None) }
            .map_err(vk_error("vkCreateCommandPool"))
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> InteropResult<vk::CommandBuffer> {
        let allocate_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe { self.device.allocate_command_buffers(&allocate_info) }
            .map_err(vk_error("vkAllocateCommandBuffers"))?
            .into_iter()
            .next()
            .ok_or_else(|| InteropError::Backend("driver returned no command buffer".into()))
    }

    fn record_copy(
        &self,
        command_buffer: vk::CommandBuffer,
        src: vk::Buffer,
        dst: vk::Buffer,
        len: u64,
        one_shot: bool,
    ) -> InteropResult<()> {
        let flags = if one_shot {
            vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT
        } else {
            vk::CommandBufferUsageFlags::empty()
        };
        let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: 0,
            size: len,
        };
        unsafe {
            self.device
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(vk_error("vkBeginCommandBuffer"))?;
            self.device.cmd_copy_buffer(command_buffer, src, dst, &[region]);
            self.device.cmd_pipeline_barrier(
                command_buffer,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[copy_completion_barrier(dst, len)],
                &[],
            );
            self.device
                .end_command_buffer(command_buffer)
                .map_err(vk_error("vkEndCommandBuffer"))
        }
    }

    fn submit(&self, queue: vk::Queue, command_buffer: vk::CommandBuffer) -> InteropResult<()> {
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        unsafe {
            self.device
                .queue_submit(queue, &[submit_info], vk::Fence::null())
        }
        .map_err(vk_error("vkQueueSubmit"))
    }

    fn queue_wait_idle(&self, queue: vk::Queue) -> InteropResult<()> {
        unsafe { self.device.queue_wait_idle(queue) }.map_err(vk_error("vkQueueWaitIdle"))
    }

    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        unsafe { self.device.free_command_buffers(pool, &[command_buffer]) };
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn destroy_buffer(&self, buffer: vk::Buffer) {
        unsafe { self.device.destroy_buffer(buffer, None) };
    }

    fn free_memory(&self, memory: vk::DeviceMemory) {
        unsafe { self.device.free_memory(memory, None) };
    }
}

/// Allocate memory backed by an NT handle. The handle stays owned by the
/// exporter for D3D12 resource handles.
#[cfg(windows)]
fn import_memory(
    device: &ash::Device,
    allocate_info: vk::MemoryAllocateInfo<'_>,
    handle: ShareHandle,
) -> InteropResult<vk::DeviceMemory> {
    let mut import_info = vk::ImportMemoryWin32HandleInfoKHR::default()
        .handle_type(handle_type(handle.kind()))
        .handle(handle.raw() as vk::HANDLE);
    let allocate_info = allocate_info.push_next(&mut import_info);
    unsafe { device.allocate_memory(&allocate_info, None) }.map_err(vk_error("vkAllocateMemory"))
}

/// Allocate memory backed by an fd. Vulkan takes ownership of the fd it is
/// given, so it receives a duplicate and the exporter keeps the original.
#[cfg(unix)]
fn import_memory(
    device: &ash::Device,
    allocate_info: vk::MemoryAllocateInfo<'_>,
    handle: ShareHandle,
) -> InteropResult<vk::DeviceMemory> {
    use std::os::fd::{BorrowedFd, IntoRawFd};

    let raw = i32::try_from(handle.raw())
        .map_err(|_| InteropError::Backend(format!("invalid fd {}", handle.raw())))?;
    let duplicate = unsafe { BorrowedFd::borrow_raw(raw) }
        .try_clone_to_owned()
        .map_err(|e| InteropError::io(format!("fd {}", raw), e))?
        .into_raw_fd();

    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(handle_type(handle.kind()))
        .fd(duplicate);
    let allocate_info = allocate_info.push_next(&mut import_info);
    unsafe { device.allocate_memory(&allocate_info, None) }.map_err(|e| {
        // not consumed on failure
        drop(unsafe { <std::os::fd::OwnedFd as std::os::fd::FromRawFd>::from_raw_fd(duplicate) });
        InteropError::native("vkAllocateMemory", e.as_raw())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn test_copy_completion_barrier_covers_host_reads() {
        let dst = vk::Buffer::from_raw(0x42);
        let barrier = copy_completion_barrier(dst, 4099);
        assert_eq!(barrier.src_access_mask, vk::AccessFlags::TRANSFER_WRITE);
        assert!(barrier.dst_access_mask.contains(vk::AccessFlags::HOST_READ));
        assert!(barrier.dst_access_mask.contains(vk::AccessFlags::TRANSFER_WRITE));
        assert_eq!(barrier.src_queue_family_index, vk::QUEUE_FAMILY_IGNORED);
        assert_eq!(barrier.buffer, dst);
        assert_eq!((barrier.offset, barrier.size), (0, 4099));
    }
}
