use conduit_shared::PhysicalDeviceInfo;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::debug;

use super::{lock, read, write, LoopbackAdapter, PlatformState, SharedBytes};
use crate::backend::{
    BufferUsage, ExternalHandleKind, MemoryLocation, QueueCreateRequest, SecondaryApi,
    SecondaryDevice, ShareHandle,
};
use crate::error::{InteropError, InteropResult};

// VkResult codes reported by the simulated secondary API.
const VK_ERROR_OUT_OF_DEVICE_MEMORY: i32 = -2;
const VK_ERROR_INITIALIZATION_FAILED: i32 = -3;
const VK_ERROR_MEMORY_MAP_FAILED: i32 = -5;
const VK_ERROR_FEATURE_NOT_PRESENT: i32 = -8;
const VK_ERROR_INVALID_EXTERNAL_HANDLE: i32 = -1_000_072_003;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackQueue {
    pub family_index: u32,
    pub queue_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackBuffer(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackMemory(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackCommandPool(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LoopbackCommandBuffer(u64);

/// Simulated secondary API.
#[derive(Debug, Clone)]
pub struct LoopbackSecondary {
    state: Arc<PlatformState>,
}

impl LoopbackSecondary {
    pub(crate) fn new(state: Arc<PlatformState>) -> Self {
        Self { state }
    }
}

impl SecondaryApi for LoopbackSecondary {
    type Device = LoopbackSecondaryDevice;

    fn physical_devices(&self) -> InteropResult<Vec<PhysicalDeviceInfo>> {
        Ok(self.state.secondary_adapters().map(LoopbackAdapter::info).collect())
    }

    fn create_device(
        &self,
        physical_index: usize,
        queues: &[QueueCreateRequest],
    ) -> InteropResult<LoopbackSecondaryDevice> {
        let adapter = self
            .state
            .secondary_adapter(physical_index)
            .ok_or_else(|| InteropError::native("vkCreateDevice", VK_ERROR_INITIALIZATION_FAILED))?
            .clone();

        let mut families = HashSet::new();
        for request in queues {
            let available = adapter
                .queue_families
                .get(request.family_index as usize)
                .map(|f| f.queue_count)
                .unwrap_or(0);
            if !families.insert(request.family_index)
                || request.queue_count == 0
                || request.queue_count > available
            {
                return Err(InteropError::native(
                    "vkCreateDevice",
                    VK_ERROR_INITIALIZATION_FAILED,
                ));
            }
        }

        self.state.device_created();
        Ok(LoopbackSecondaryDevice {
            state: self.state.clone(),
            adapter,
            queues: queues.to_vec(),
            objects: Mutex::new(Objects::default()),
        })
    }
}

#[derive(Debug)]
struct BufferObject {
    len: u64,
    external: Option<ExternalHandleKind>,
    memory: Option<u64>,
}

#[derive(Debug)]
struct MemoryObject {
    bytes: SharedBytes,
    location: MemoryLocation,
    imported: bool,
}

#[derive(Debug, Clone, Copy)]
struct RecordedCopy {
    src: u64,
    dst: u64,
    len: u64,
}

#[derive(Debug)]
struct CommandBufferObject {
    pool: u64,
    copy: Option<RecordedCopy>,
    one_shot: bool,
    submitted: bool,
}

#[derive(Debug, Default)]
struct Objects {
    next_id: u64,
    buffers: HashMap<u64, BufferObject>,
    memories: HashMap<u64, MemoryObject>,
    pools: HashMap<u64, u32>,
    command_buffers: HashMap<u64, CommandBufferObject>,
    submitted: HashMap<LoopbackQueue, Vec<RecordedCopy>>,
}

impl Objects {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn bound_bytes(&self, buffer: u64) -> Option<SharedBytes> {
        let memory = self.buffers.get(&buffer)?.memory?;
        self.memories.get(&memory).map(|m| m.bytes.clone())
    }
}

/// Simulated secondary device. Copies execute when the queue is waited on.
#[derive(Debug)]
pub struct LoopbackSecondaryDevice {
    state: Arc<PlatformState>,
    adapter: LoopbackAdapter,
    queues: Vec<QueueCreateRequest>,
    objects: Mutex<Objects>,
}

impl LoopbackSecondaryDevice {
    /// Buffers, memory objects, pools and command buffers still alive.
    pub fn live_objects(&self) -> usize {
        let objects = lock(&self.objects);
        objects.buffers.len()
            + objects.memories.len()
            + objects.pools.len()
            + objects.command_buffers.len()
    }

    fn invalid(call: &'static str) -> InteropError {
        InteropError::native(call, VK_ERROR_INITIALIZATION_FAILED)
    }
}

impl SecondaryDevice for LoopbackSecondaryDevice {
    type Queue = LoopbackQueue;
    type Buffer = LoopbackBuffer;
    type Memory = LoopbackMemory;
    type CommandPool = LoopbackCommandPool;
    type CommandBuffer = LoopbackCommandBuffer;

    fn queue(&self, family_index: u32, queue_index: u32) -> LoopbackQueue {
        LoopbackQueue {
            family_index,
            queue_index,
        }
    }

    fn import_supported(&self, kind: ExternalHandleKind, usage: BufferUsage) -> InteropResult<bool> {
        let usable = BufferUsage::STORAGE
            .union(BufferUsage::TRANSFER_SRC)
            .union(BufferUsage::TRANSFER_DST);
        Ok(self.adapter.import_supported
            && kind == ExternalHandleKind::D3D12Resource
            && usable.contains(usage))
    }

    fn create_buffer(
        &self,
        len: u64,
        _usage: BufferUsage,
        external: Option<ExternalHandleKind>,
    ) -> InteropResult<LoopbackBuffer> {
        if len == 0 {
            return Err(Self::invalid("vkCreateBuffer"));
        }
        let mut objects = lock(&self.objects);
        let id = objects.next();
        objects.buffers.insert(
            id,
            BufferObject {
                len,
                external,
                memory: None,
            },
        );
        Ok(LoopbackBuffer(id))
    }

    fn allocate_memory(
        &self,
        buffer: LoopbackBuffer,
        location: MemoryLocation,
        import: Option<ShareHandle>,
    ) -> InteropResult<LoopbackMemory> {
        let mut objects = lock(&self.objects);
        let (len, external) = objects
            .buffers
            .get(&buffer.0)
            .map(|b| (b.len, b.external))
            .ok_or_else(|| Self::invalid("vkAllocateMemory"))?;

        let (bytes, imported) = match import {
            Some(handle) => {
                if external != Some(handle.kind()) || location != MemoryLocation::DeviceLocal {
                    return Err(InteropError::native(
                        "vkAllocateMemory",
                        VK_ERROR_INVALID_EXTERNAL_HANDLE,
                    ));
                }
                let bytes = self
                    .state
                    .resolve_handle(handle.raw())
                    .filter(|bytes| read(bytes).len() as u64 >= len)
                    .ok_or_else(|| {
                        InteropError::native("vkAllocateMemory", VK_ERROR_INVALID_EXTERNAL_HANDLE)
                    })?;
                (bytes, true)
            }
            None => {
                let len = usize::try_from(len).map_err(|_| {
                    InteropError::native("vkAllocateMemory", VK_ERROR_OUT_OF_DEVICE_MEMORY)
                })?;
                (Arc::new(RwLock::new(vec![0u8; len])), false)
            }
        };

        let id = objects.next();
        objects.memories.insert(
            id,
            MemoryObject {
                bytes,
                location,
                imported,
            },
        );
        if imported {
            self.state.import_created();
        }
        Ok(LoopbackMemory(id))
    }

    fn bind_buffer_memory(
        &self,
        buffer: LoopbackBuffer,
        memory: LoopbackMemory,
        offset: u64,
    ) -> InteropResult<()> {
        let mut objects = lock(&self.objects);
        if offset != 0 || !objects.memories.contains_key(&memory.0) {
            return Err(Self::invalid("vkBindBufferMemory"));
        }
        let buffer = objects
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| Self::invalid("vkBindBufferMemory"))?;
        buffer.memory = Some(memory.0);
        Ok(())
    }

    fn with_mapped(
        &self,
        memory: LoopbackMemory,
        len: u64,
        f: &mut dyn FnMut(&mut [u8]) -> InteropResult<()>,
    ) -> InteropResult<()> {
        let bytes = {
            let objects = lock(&self.objects);
            let memory = objects
                .memories
                .get(&memory.0)
                .ok_or_else(|| Self::invalid("vkMapMemory"))?;
            if memory.location != MemoryLocation::HostVisible {
                return Err(InteropError::native("vkMapMemory", VK_ERROR_MEMORY_MAP_FAILED));
            }
            memory.bytes.clone()
        };
        let mut bytes = write(&bytes);
        let mapped = bytes
            .get_mut(..len as usize)
            .ok_or_else(|| InteropError::native("vkMapMemory", VK_ERROR_MEMORY_MAP_FAILED))?;
        f(mapped)
    }

    fn create_command_pool(&self, family_index: u32, _transient: bool) -> InteropResult<LoopbackCommandPool> {
        if !self.queues.iter().any(|q| q.family_index == family_index) {
            return Err(Self::invalid("vkCreateCommandPool"));
        }
        let mut objects = lock(&self.objects);
        let id = objects.next();
        objects.pools.insert(id, family_index);
        Ok(LoopbackCommandPool(id))
    }

    fn allocate_command_buffer(&self, pool: LoopbackCommandPool) -> InteropResult<LoopbackCommandBuffer> {
        let mut objects = lock(&self.objects);
        if !objects.pools.contains_key(&pool.0) {
            return Err(Self::invalid("vkAllocateCommandBuffers"));
        }
        let id = objects.next();
        objects.command_buffers.insert(
            id,
            CommandBufferObject {
                pool: pool.0,
                copy: None,
                one_shot: false,
                submitted: false,
            },
        );
        Ok(LoopbackCommandBuffer(id))
    }

    fn record_copy(
        &self,
        command_buffer: LoopbackCommandBuffer,
        src: LoopbackBuffer,
        dst: LoopbackBuffer,
        len: u64,
        one_shot: bool,
    ) -> InteropResult<()> {
        let mut objects = lock(&self.objects);
        let fits = |id: &LoopbackBuffer| objects.buffers.get(&id.0).map_or(false, |b| b.len >= len);
        if !fits(&src) || !fits(&dst) {
            return Err(Self::invalid("vkCmdCopyBuffer"));
        }
        let command_buffer = objects
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| Self::invalid("vkBeginCommandBuffer"))?;
        command_buffer.copy = Some(RecordedCopy {
            src: src.0,
            dst: dst.0,
            len,
        });
        command_buffer.one_shot = one_shot;
        command_buffer.submitted = false;
        Ok(())
    }

    fn submit(&self, queue: LoopbackQueue, command_buffer: LoopbackCommandBuffer) -> InteropResult<()> {
        let mut objects = lock(&self.objects);
        let command_buffer = objects
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| Self::invalid("vkQueueSubmit"))?;
        let copy = command_buffer
            .copy
            .ok_or_else(|| Self::invalid("vkQueueSubmit"))?;
        if command_buffer.one_shot && command_buffer.submitted {
            return Err(InteropError::Backend(
                "one-time-submit command buffer submitted twice".into(),
            ));
        }
        command_buffer.submitted = true;
        objects.submitted.entry(queue).or_default().push(copy);
        Ok(())
    }

    fn queue_wait_idle(&self, queue: LoopbackQueue) -> InteropResult<()> {
        let mut objects = lock(&self.objects);
        let copies = objects.submitted.remove(&queue).unwrap_or_default();
        for copy in copies {
            let (src, dst) = match (objects.bound_bytes(copy.src), objects.bound_bytes(copy.dst)) {
                (Some(src), Some(dst)) => (src, dst),
                _ => {
                    return Err(InteropError::native(
                        "vkQueueWaitIdle",
                        VK_ERROR_FEATURE_NOT_PRESENT,
                    ))
                }
            };
            let len = copy.len as usize;
            if Arc::ptr_eq(&src, &dst) {
                continue;
            }
            let chunk = read(&src)[..len].to_vec();
            write(&dst)[..len].copy_from_slice(&chunk);
            debug!("Loopback copy of {} bytes on family {}", len, queue.family_index);
        }
        Ok(())
    }

    fn free_command_buffer(&self, pool: LoopbackCommandPool, command_buffer: LoopbackCommandBuffer) {
        let mut objects = lock(&self.objects);
        if objects
            .command_buffers
            .get(&command_buffer.0)
            .map_or(false, |c| c.pool == pool.0)
        {
            objects.command_buffers.remove(&command_buffer.0);
        }
    }

    fn destroy_command_pool(&self, pool: LoopbackCommandPool) {
        let mut objects = lock(&self.objects);
        objects.pools.remove(&pool.0);
        objects.command_buffers.retain(|_, c| c.pool != pool.0);
    }

    fn destroy_buffer(&self, buffer: LoopbackBuffer) {
        lock(&self.objects).buffers.remove(&buffer.0);
    }

    fn free_memory(&self, memory: LoopbackMemory) {
        if let Some(memory) = lock(&self.objects).memories.remove(&memory.0) {
            if memory.imported {
                self.state.import_released();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackPlatform;

    fn device() -> LoopbackSecondaryDevice {
        let platform = LoopbackPlatform::single_adapter();
        platform
            .secondary()
            .create_device(
                0,
                &[QueueCreateRequest {
                    family_index: 2,
                    queue_count: 1,
                }],
            )
            .unwrap()
    }

    fn host_buffer(device: &LoopbackSecondaryDevice, len: u64) -> (LoopbackBuffer, LoopbackMemory) {
        let buffer = device
            .create_buffer(len, BufferUsage::TRANSFER_SRC, None)
            .unwrap();
        let memory = device
            .allocate_memory(buffer, MemoryLocation::HostVisible, None)
            .unwrap();
        device.bind_buffer_memory(buffer, memory, 0).unwrap();
        (buffer, memory)
    }

    #[test]
    fn test_create_device_rejects_bad_queue_requests() {
        let platform = LoopbackPlatform::single_adapter();
        let secondary = platform.secondary();
        let request = |family_index, queue_count| QueueCreateRequest {
            family_index,
            queue_count,
        };

        assert!(secondary.create_device(0, &[request(2, 3)]).is_err());
        assert!(secondary.create_device(0, &[request(1, 1), request(1, 1)]).is_err());
        assert!(secondary.create_device(0, &[request(7, 1)]).is_err());
        assert!(secondary.create_device(1, &[request(0, 1)]).is_err());
        assert_eq!(platform.devices_created(), 0);

        assert!(secondary.create_device(0, &[request(0, 16), request(2, 2)]).is_ok());
        assert_eq!(platform.devices_created(), 1);
    }

    #[test]
    fn test_copy_executes_on_wait_idle() {
        let device = device();
        let queue = device.queue(2, 0);
        let (src, src_memory) = host_buffer(&device, 4);
        let (dst, dst_memory) = host_buffer(&device, 4);
        device
            .with_mapped(src_memory, 4, &mut |m| {
                m.copy_from_slice(b"wxyz");
                Ok(())
            })
            .unwrap();

        let pool = device.create_command_pool(2, true).unwrap();
        let cmd = device.allocate_command_buffer(pool).unwrap();
        device.record_copy(cmd, src, dst, 4, true).unwrap();
        device.submit(queue, cmd).unwrap();

        let mut seen = Vec::new();
        device
            .with_mapped(dst_memory, 4, &mut |m| {
                seen = m.to_vec();
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![0; 4]);

        device.queue_wait_idle(queue).unwrap();
        device
            .with_mapped(dst_memory, 4, &mut |m| {
                seen = m.to_vec();
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, b"wxyz".to_vec());

        assert!(device.submit(queue, cmd).is_err());
        device.destroy_command_pool(pool);
        assert_eq!(device.live_objects(), 4);
    }

    #[test]
    fn test_device_local_memory_is_not_mappable() {
        let device = device();
        let buffer = device.create_buffer(8, BufferUsage::TRANSFER_DST, None).unwrap();
        let memory = device
            .allocate_memory(buffer, MemoryLocation::DeviceLocal, None)
            .unwrap();
        let err = device.with_mapped(memory, 8, &mut |_| Ok(())).unwrap_err();
        assert!(matches!(err, InteropError::Native { call: "vkMapMemory", .. }));
    }

    #[test]
    fn test_unknown_handle_import_fails() {
        let device = device();
        let buffer = device
            .create_buffer(8, BufferUsage::TRANSFER_DST, Some(ExternalHandleKind::D3D12Resource))
            .unwrap();
        let handle = ShareHandle::new(0x7777, ExternalHandleKind::D3D12Resource);
        let err = device
            .allocate_memory(buffer, MemoryLocation::DeviceLocal, Some(handle))
            .unwrap_err();
        assert!(matches!(
            err,
            InteropError::Native { code: VK_ERROR_INVALID_EXTERNAL_HANDLE, .. }
        ));
    }
}
