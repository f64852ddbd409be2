//! Headless Vulkan implementation of [`Device`] on ash and gpu-allocator.

mod acceleration_structure;
mod buffer;
mod command_pool;
pub mod context;
mod descriptor_set;
mod image;
mod pipeline;
mod record;
mod shader_create_info;

use std::{
    any::Any,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use anyhow::Context as _;
use ash::vk;
use gpu_allocator::{
    vulkan::{Allocator, AllocatorCreateDesc},
    MemoryLocation,
};

use crate::gpu::{
    format_size, Alloc, BlasSize, CommandList, ComputePipelineDesc, DescriptorWrite, Device,
    DropQueue, Extent, GpuError, Heap, ImageDesc, LayoutBinding, RayTracingPipelineDesc,
    SamplerConfig,
};

pub use acceleration_structure::AccelerationStructure;
pub use buffer::Buffer;
pub use descriptor_set::{DescriptorSet, DescriptorSetLayout};
pub use image::{Image, Sampler};
pub use pipeline::{BindingTable, Pipeline};

use buffer::BufferError;
use command_pool::CommandPool;
use context::Context;
use descriptor_set::{DescriptorInfo, DescriptorPool, WriteDescriptorSet};

/// Descriptor sets that can be alive at the same time.
const MAX_DESCRIPTOR_SETS: u32 = 64;

pub struct VulkanSettings {
    pub frames_in_flight: usize,
    pub staging_heap_bytes: u64,
    pub device_heap_bytes: u64,
}

struct FrameSlot {
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

/// Submissions and pool use are serialized by this lock.
struct Queue {
    command_pool: CommandPool,
    frames: Vec<FrameSlot>,
}

pub struct VulkanDevice {
    queue: Mutex<Queue>,
    descriptor_pool: Arc<DescriptorPool>,
    drop_queue: DropQueue,
    frames_begun: AtomicU64,
    frame_count: usize,
    staging: Arc<Heap>,
    device: Arc<Heap>,
    allocator: Arc<Mutex<Allocator>>,
    context: Arc<Context>,
}

fn alloc<T>(result: Result<T, BufferError>, full: Alloc<T>, what: &str) -> Alloc<T> {
    match result {
        Ok(value) => Alloc::Success(value),
        Err(BufferError::OutOfMemory) => full,
        Err(BufferError::Vulkan(error)) => {
            log::warn!("Could not create {}: {}", what, error);
            full
        }
    }
}

impl VulkanDevice {
    pub fn new(settings: &VulkanSettings) -> anyhow::Result<Self> {
        let context = Arc::new(Context::new()?);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: context.instance.clone(),
            device: context.device.clone(),
            physical_device: context.physical_device,
            debug_settings: Default::default(),
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .context("Could not create allocator")?;

        let command_pool =
            CommandPool::new(context.clone()).context("Could not create command pool")?;
        let frame_count = settings.frames_in_flight.max(1);
        let mut frames = Vec::with_capacity(frame_count);
        for _ in 0..frame_count {
            let command_buffer = command_pool
                .allocate()
                .context("Could not allocate frame command buffer")?;
            let fence_info =
                vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);
            let fence = unsafe { context.device.create_fence(&fence_info, None) }
                .context("Could not create frame fence")?;
            frames.push(FrameSlot {
                command_buffer,
                fence,
            });
        }

        let descriptor_pool = DescriptorPool::new(context.clone(), MAX_DESCRIPTOR_SETS)
            .context("Could not create descriptor pool")?;

        Ok(Self {
            queue: Mutex::new(Queue {
                command_pool,
                frames,
            }),
            descriptor_pool,
            drop_queue: DropQueue::new(frame_count),
            frames_begun: AtomicU64::new(0),
            frame_count,
            staging: Heap::new("staging", settings.staging_heap_bytes),
            device: Heap::new("device", settings.device_heap_bytes),
            allocator: Arc::new(Mutex::new(allocator)),
            context,
        })
    }

    pub fn staging_heap(&self) -> &Arc<Heap> {
        &self.staging
    }

    pub fn device_heap(&self) -> &Arc<Heap> {
        &self.device
    }

    fn submit(
        &self,
        command_buffer: vk::CommandBuffer,
        fence: vk::Fence,
        commands: &[crate::gpu::Command<Self>],
        keep: &mut Vec<Buffer>,
    ) -> Result<(), vk::Result> {
        let device = &self.context.device;
        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            device.reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(command_buffer, &begin_info)?;
        }
        record::record(&self.context, command_buffer, commands, keep);
        unsafe {
            device.end_command_buffer(command_buffer)?;
            device.reset_fences(std::slice::from_ref(&fence))?;
            let submit_info =
                vk::SubmitInfo::builder().command_buffers(std::slice::from_ref(&command_buffer));
            device.queue_submit(
                self.context.queue,
                std::slice::from_ref(&submit_info),
                fence,
            )
        }
    }
}

/// Leaves a frame fence signaled after a failed submission, the next wait on it has to return.
fn restore_fence(
    signaled: impl FnOnce() -> Result<bool, vk::Result>,
    signal: impl FnOnce() -> Result<(), vk::Result>,
) -> Result<(), vk::Result> {
    if signaled()? {
        return Ok(());
    }
    signal()
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        self.wait_idle();
        let queue = self.queue.get_mut().unwrap_or_else(|e| e.into_inner());
        for frame in queue.frames.drain(..) {
            queue.command_pool.free(frame.command_buffer);
            unsafe { self.context.device.destroy_fence(frame.fence, None) };
        }
    }
}

impl Device for VulkanDevice {
    type Buffer = Buffer;
    type Image = Image;
    type Sampler = Sampler;
    type AccelerationStructure = AccelerationStructure;
    type Pipeline = Pipeline;
    type BindingTable = BindingTable;
    type DescriptorSetLayout = DescriptorSetLayout;
    type DescriptorSet = DescriptorSet;

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn frame(&self) -> usize {
        let begun = self.frames_begun.load(Ordering::Acquire);
        (begun.saturating_sub(1) % self.frame_count as u64) as usize
    }

    fn create_staging(&self, size: u64) -> Alloc<Buffer> {
        let Some(reservation) = self.staging.try_reserve(size) else {
            return Alloc::StagingFull;
        };
        alloc(
            Buffer::new(
                self.context.clone(),
                &self.allocator,
                "staging",
                size,
                vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::CpuToGpu,
                Some(reservation),
            ),
            Alloc::StagingFull,
            "staging buffer",
        )
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Alloc<Buffer> {
        let Some(reservation) = self.device.try_reserve(size) else {
            return Alloc::DeviceFull;
        };
        alloc(
            Buffer::new(
                self.context.clone(),
                &self.allocator,
                "device",
                size,
                usage | vk::BufferUsageFlags::TRANSFER_DST | vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::GpuOnly,
                Some(reservation),
            ),
            Alloc::DeviceFull,
            "device buffer",
        )
    }

    fn map<R>(&self, buffer: &Buffer, f: impl FnOnce(&mut [u8]) -> R) -> R {
        buffer.map(f)
    }

    fn buffer_address(&self, buffer: &Buffer) -> u64 {
        buffer.device_address()
    }

    fn buffer_size(&self, buffer: &Buffer) -> u64 {
        buffer.size()
    }

    fn create_image(&self, desc: &ImageDesc) -> Alloc<Image> {
        let size = desc.extent.pixels() * format_size(desc.format);
        let Some(reservation) = self.device.try_reserve(size) else {
            return Alloc::DeviceFull;
        };
        alloc(
            Image::new(self.context.clone(), &self.allocator, desc, reservation),
            Alloc::DeviceFull,
            "image",
        )
    }

    fn image_extent(&self, image: &Image) -> Extent {
        image.extent()
    }

    fn create_sampler(&self, config: &SamplerConfig) -> anyhow::Result<Sampler> {
        Ok(Sampler::new(self.context.clone(), config).map_err(GpuError::Vulkan)?)
    }

    fn create_blas(&self, sizes: &[BlasSize]) -> Alloc<AccelerationStructure> {
        alloc(
            AccelerationStructure::blas(self.context.clone(), &self.allocator, &self.device, sizes),
            Alloc::DeviceFull,
            "BLAS",
        )
    }

    fn create_tlas(&self, instance_count: u32) -> Alloc<AccelerationStructure> {
        alloc(
            AccelerationStructure::tlas(
                self.context.clone(),
                &self.allocator,
                &self.device,
                instance_count,
            ),
            Alloc::DeviceFull,
            "TLAS",
        )
    }

    fn acceleration_structure_address(&self, accel: &AccelerationStructure) -> u64 {
        accel.device_address()
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> anyhow::Result<DescriptorSetLayout> {
        Ok(DescriptorSetLayout::new(self.context.clone(), bindings).map_err(GpuError::Vulkan)?)
    }

    fn create_descriptor_set(&self, layout: &DescriptorSetLayout) -> anyhow::Result<DescriptorSet> {
        Ok(DescriptorSet::new(&self.descriptor_pool, layout).map_err(GpuError::Vulkan)?)
    }

    fn update_descriptor_set(&self, set: &DescriptorSet, writes: &[DescriptorWrite<Self>]) {
        for write in writes {
            let write = match write {
                DescriptorWrite::AccelerationStructure { binding, accel } => WriteDescriptorSet {
                    binding: *binding,
                    array_element: 0,
                    ty: vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                    info: DescriptorInfo::AccelerationStructure(accel.inner()),
                },
                DescriptorWrite::StorageBuffer { binding, buffer } => WriteDescriptorSet {
                    binding: *binding,
                    array_element: 0,
                    ty: vk::DescriptorType::STORAGE_BUFFER,
                    info: DescriptorInfo::Buffer(vk::DescriptorBufferInfo {
                        buffer: buffer.inner(),
                        offset: 0,
                        range: vk::WHOLE_SIZE,
                    }),
                },
                DescriptorWrite::StorageImage { binding, image } => WriteDescriptorSet {
                    binding: *binding,
                    array_element: 0,
                    ty: vk::DescriptorType::STORAGE_IMAGE,
                    info: DescriptorInfo::Image(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: image.view(),
                        image_layout: vk::ImageLayout::GENERAL,
                    }),
                },
                DescriptorWrite::SampledImage {
                    binding,
                    array_element,
                    image,
                } => WriteDescriptorSet {
                    binding: *binding,
                    array_element: *array_element,
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    info: DescriptorInfo::Image(vk::DescriptorImageInfo {
                        sampler: vk::Sampler::null(),
                        image_view: image.view(),
                        image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    }),
                },
                DescriptorWrite::Sampler {
                    binding,
                    array_element,
                    sampler,
                } => WriteDescriptorSet {
                    binding: *binding,
                    array_element: *array_element,
                    ty: vk::DescriptorType::SAMPLER,
                    info: DescriptorInfo::Image(vk::DescriptorImageInfo {
                        sampler: sampler.inner(),
                        image_view: vk::ImageView::null(),
                        image_layout: vk::ImageLayout::UNDEFINED,
                    }),
                },
            };
            write.apply(&self.context, set);
        }
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<Self>,
    ) -> anyhow::Result<Pipeline> {
        let set_layouts: Vec<_> = desc.set_layouts.iter().map(|layout| layout.inner()).collect();
        pipeline::create_ray_tracing_pipeline(
            self.context.clone(),
            desc.name,
            desc.raygen,
            desc.miss,
            &desc.hit_groups,
            &set_layouts,
            desc.push_constant_size,
        )
    }

    fn create_compute_pipeline(&self, desc: &ComputePipelineDesc<Self>) -> anyhow::Result<Pipeline> {
        let set_layouts: Vec<_> = desc.set_layouts.iter().map(|layout| layout.inner()).collect();
        pipeline::create_compute_pipeline(
            self.context.clone(),
            desc.name,
            desc.shader,
            &set_layouts,
            desc.push_constant_size,
        )
    }

    fn create_binding_table(
        &self,
        pipeline: &Pipeline,
        hit_groups: &[u32],
    ) -> anyhow::Result<BindingTable> {
        pipeline::create_binding_table(self.context.clone(), &self.allocator, pipeline, hit_groups)
    }

    fn sync<R>(&self, record: impl FnOnce(&mut CommandList<Self>) -> R) -> R {
        let mut commands = CommandList::new();
        let result = record(&mut commands);
        if commands.is_empty() {
            return result;
        }

        let device = &self.context.device;
        let queue = self.queue.lock().unwrap();
        let submitted = (|| -> anyhow::Result<()> {
            let command_buffer = queue.command_pool.allocate()?;
            let fence = unsafe { device.create_fence(&vk::FenceCreateInfo::default(), None) }?;
            let mut keep = Vec::new();
            let submitted = self
                .submit(command_buffer, fence, commands.commands(), &mut keep)
                .and_then(|()| unsafe {
                    device.wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
                });
            unsafe { device.destroy_fence(fence, None) };
            queue.command_pool.free(command_buffer);
            submitted?;
            Ok(())
        })();
        if let Err(error) = submitted {
            log::error!("Synchronous submission failed: {:#}", error);
        }
        result
    }

    fn begin_frame(&self) {
        let begun = self.frames_begun.fetch_add(1, Ordering::AcqRel);
        let slot = (begun % self.frame_count as u64) as usize;
        {
            let queue = self.queue.lock().unwrap();
            let fence = queue.frames[slot].fence;
            let waited = unsafe {
                self.context
                    .device
                    .wait_for_fences(std::slice::from_ref(&fence), true, u64::MAX)
            };
            if let Err(error) = waited {
                log::error!("Waiting for frame {} failed: {}", slot, error);
            }
        }
        self.drop_queue.retire(slot);
    }

    fn submit_frame(&self, commands: CommandList<Self>) {
        let slot = self.frame();
        let queue = self.queue.lock().unwrap();
        let frame = &queue.frames[slot];
        let mut keep = Vec::new();

        let submitted = self.submit(
            frame.command_buffer,
            frame.fence,
            commands.commands(),
            &mut keep,
        );
        if let Err(error) = submitted {
            log::error!("Frame submission failed: {}", error);
            let device = &self.context.device;
            let fence = frame.fence;
            let restored = restore_fence(
                || unsafe { device.get_fence_status(fence) },
                || unsafe { device.queue_submit(self.context.queue, &[], fence) },
            );
            if let Err(error) = restored {
                log::error!("Could not signal fence of frame {}: {}", slot, error);
            }
        }
        drop(queue);

        self.drop_queue.defer(slot, Box::new(commands.into_commands()));
        self.drop_queue.defer(slot, Box::new(keep));
    }

    fn defer_drop(&self, value: Box<dyn Any + Send>) {
        self.drop_queue.defer(self.frame(), value);
    }

    fn wait_idle(&self) {
        {
            let _queue = self.queue.lock().unwrap();
            if let Err(error) = unsafe { self.context.device.device_wait_idle() } {
                log::error!("Waiting for the device failed: {}", error);
            }
        }
        self.drop_queue.retire_all();
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    #[test]
    fn unsignaled_fence_gets_an_empty_submit() {
        let submits = Cell::new(0);
        let signal = || {
            submits.set(submits.get() + 1);
            Ok(())
        };
        assert_eq!(restore_fence(|| Ok(false), signal), Ok(()));
        assert_eq!(submits.get(), 1);
    }

    #[test]
    fn signaled_fence_is_left_alone() {
        let submits = Cell::new(0);
        let signal = || {
            submits.set(submits.get() + 1);
            Ok(())
        };
        assert_eq!(restore_fence(|| Ok(true), signal), Ok(()));
        assert_eq!(submits.get(), 0);
    }

    #[test]
    fn lost_device_is_reported() {
        let result = restore_fence(|| Err(vk::Result::ERROR_DEVICE_LOST), || Ok(()));
        assert_eq!(result, Err(vk::Result::ERROR_DEVICE_LOST));
    }
}
