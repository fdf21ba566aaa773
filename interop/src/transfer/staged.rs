//! Host-staged copies on the secondary API's transfer queue

use std::path::{Path, PathBuf};
use tracing::debug;

use conduit_shared::QueueFamilyBinding;

use crate::backend::{BufferUsage, MemoryLocation, SecondaryDevice};
use crate::error::InteropResult;
use crate::import::ImportedBuffer;
use crate::transfer::fill_from_file;

/// Host-visible buffer plus its memory, destroyed on drop.
pub struct StagingBuffer<'d, D: SecondaryDevice> {
    device: &'d D,
    buffer: D::Buffer,
    memory: D::Memory,
    len: u64,
}

impl<'d, D: SecondaryDevice> StagingBuffer<'d, D> {
    pub fn new(device: &'d D, len: u64, usage: BufferUsage) -> InteropResult<Self> {
        let buffer = device.create_buffer(len, usage, None)?;
        let memory = match device.allocate_memory(buffer, MemoryLocation::HostVisible, None) {
            Ok(memory) => memory,
            Err(e) => {
                device.destroy_buffer(buffer);
                return Err(e);
            }
        };
        let staging = Self {
            device,
            buffer,
            memory,
            len,
        };
        device.bind_buffer_memory(buffer, memory, 0)?;
        Ok(staging)
    }

    pub fn buffer(&self) -> D::Buffer {
        self.buffer
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Map the whole buffer for the duration of `f`.
    pub fn map(&self, f: &mut dyn FnMut(&mut [u8]) -> InteropResult<()>) -> InteropResult<()> {
        self.device.with_mapped(self.memory, self.len, f)
    }

    /// Map, fill from `path`, unmap.
    pub fn fill_from(&self, path: &Path) -> InteropResult<()> {
        self.map(&mut |mapped| fill_from_file(path, mapped))
    }
}

impl<D: SecondaryDevice> Drop for StagingBuffer<'_, D> {
    fn drop(&mut self) {
        self.device.destroy_buffer(self.buffer);
        self.device.free_memory(self.memory);
    }
}

/// Command pool with a single command buffer, freed on drop.
pub struct TransferCommands<'d, D: SecondaryDevice> {
    device: &'d D,
    pool: D::CommandPool,
    command_buffer: D::CommandBuffer,
}

impl<'d, D: SecondaryDevice> TransferCommands<'d, D> {
    pub fn new(device: &'d D, family_index: u32, transient: bool) -> InteropResult<Self> {
        let pool = device.create_command_pool(family_index, transient)?;
        let command_buffer = match device.allocate_command_buffer(pool) {
            Ok(command_buffer) => command_buffer,
            Err(e) => {
                device.destroy_command_pool(pool);
                return Err(e);
            }
        };
        Ok(Self {
            device,
            pool,
            command_buffer,
        })
    }

    pub fn record_copy(
        &self,
        src: D::Buffer,
        dst: D::Buffer,
        len: u64,
        one_shot: bool,
    ) -> InteropResult<()> {
        self.device
            .record_copy(self.command_buffer, src, dst, len, one_shot)
    }

    /// Submit the recorded copy and block until `queue` is idle.
    pub fn submit_and_wait(&self, queue: D::Queue) -> InteropResult<()> {
        self.device.submit(queue, self.command_buffer)?;
        self.device.queue_wait_idle(queue)
    }
}

impl<D: SecondaryDevice> Drop for TransferCommands<'_, D> {
    fn drop(&mut self) {
        self.device.free_command_buffer(self.pool, self.command_buffer);
        self.device.destroy_command_pool(self.pool);
    }
}

/// Move one file into `dest` through a freshly created staging buffer and
/// a one-shot command buffer. Everything is released before returning.
pub fn single_staged_copy<D: SecondaryDevice>(
    device: &D,
    queue: &QueueFamilyBinding<D::Queue>,
    dest: &ImportedBuffer<D>,
    source: &Path,
) -> InteropResult<()> {
    let len = dest.len();
    let staging = StagingBuffer::new(device, len, BufferUsage::TRANSFER_SRC)?;
    staging.fill_from(source)?;

    let commands = TransferCommands::new(device, queue.family_index, true)?;
    commands.record_copy(staging.buffer(), dest.buffer(), len, true)?;
    commands.submit_and_wait(queue.queue)?;
    debug!("Staged {} into shared buffer", source.display());
    Ok(())
}

/// Staging buffer and copy command recorded once, resubmitted per file.
pub struct ReusedStagedCopy<'d, D: SecondaryDevice> {
    // drop order: commands before the staging buffer they reference
    commands: TransferCommands<'d, D>,
    staging: StagingBuffer<'d, D>,
    queue: D::Queue,
}

impl<'d, D: SecondaryDevice> ReusedStagedCopy<'d, D> {
    pub fn new(
        device: &'d D,
        queue: &QueueFamilyBinding<D::Queue>,
        dest: &ImportedBuffer<D>,
    ) -> InteropResult<Self> {
        let len = dest.len();
        let staging = StagingBuffer::new(device, len, BufferUsage::TRANSFER_SRC)?;
        let commands = TransferCommands::new(device, queue.family_index, false)?;
        commands.record_copy(staging.buffer(), dest.buffer(), len, false)?;
        Ok(Self {
            commands,
            staging,
            queue: queue.queue,
        })
    }

    /// Refill the staging buffer from `source` and resubmit the copy. The
    /// queue is idle again when this returns.
    pub fn copy_file(&self, source: &Path) -> InteropResult<()> {
        self.staging.fill_from(source)?;
        self.commands.submit_and_wait(self.queue)
    }

    /// Copy every file in order. Stops at the first failure.
    pub fn run(&self, sources: &[PathBuf]) -> InteropResult<usize> {
        for (i, source) in sources.iter().enumerate() {
            self.copy_file(source)?;
            debug!("Unit {}: {}", i, source.display());
        }
        Ok(sources.len())
    }
}
