//! Software implementation of [`Device`].
//!
//! Buffers and images are plain byte vectors, device addresses are handed out by a bump
//! counter and executed commands are recorded so tests can inspect them. Acceleration
//! structure builds and shader dispatches do not compute anything.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use anyhow::bail;
use ash::vk;

use crate::utility::align_up;

use super::{
    format_size, Access, Alloc, BlasRange, BlasSize, Command, CommandList, ComputePipelineDesc,
    DescriptorWrite, Device, DropQueue, Extent, GpuError, Heap, ImageDesc, LayoutBinding,
    RayTracingPipelineDesc, Reservation, SamplerConfig, SPIRV_MAGIC,
};

const ADDRESS_ALIGNMENT: u64 = 256;

#[derive(Clone)]
pub struct HostBuffer(Arc<HostBufferInner>);

struct HostBufferInner {
    data: Mutex<Vec<u8>>,
    address: u64,
    usage: vk::BufferUsageFlags,
    host_visible: bool,
    _reservation: Option<Reservation>,
}

impl HostBuffer {
    pub fn size(&self) -> u64 {
        self.0.data.lock().unwrap().len() as u64
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.0.usage
    }

    /// Contents as they currently are in "device" memory.
    pub fn contents(&self) -> Vec<u8> {
        self.0.data.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct HostImage(Arc<HostImageInner>);

struct HostImageInner {
    desc: ImageDesc,
    data: Mutex<Vec<u8>>,
    layout: Mutex<vk::ImageLayout>,
    _reservation: Option<Reservation>,
}

impl HostImage {
    pub fn desc(&self) -> ImageDesc {
        self.0.desc
    }

    pub fn layout(&self) -> vk::ImageLayout {
        *self.0.layout.lock().unwrap()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.data.lock().unwrap().clone()
    }

    /// Identity of the image, shared by all of its handles.
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }
}

#[derive(Clone)]
pub struct HostSampler(pub Arc<SamplerConfig>);

#[derive(Debug, Clone, PartialEq)]
pub enum HostBuild {
    Blas { ranges: Vec<BlasRange> },
    Tlas { instances: Vec<u8>, count: u32 },
}

#[derive(Clone)]
pub struct HostAccelerationStructure(Arc<HostAccelInner>);

struct HostAccelInner {
    address: u64,
    build: Mutex<Option<HostBuild>>,
    _reservation: Option<Reservation>,
}

impl HostAccelerationStructure {
    pub fn address(&self) -> u64 {
        self.0.address
    }

    pub fn build(&self) -> Option<HostBuild> {
        self.0.build.lock().unwrap().clone()
    }
}

#[derive(Clone)]
pub struct HostDescriptorSetLayout(pub Arc<Vec<LayoutBinding>>);

/// What a descriptor slot was last written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostDescriptor {
    AccelerationStructure(u64),
    StorageBuffer(u64),
    StorageImage(usize),
    SampledImage(usize),
    Sampler,
}

#[derive(Clone)]
pub struct HostDescriptorSet(Arc<HostDescriptorSetInner>);

struct HostDescriptorSetInner {
    layout: HostDescriptorSetLayout,
    bound: Mutex<HashMap<(u32, u32), HostDescriptor>>,
}

impl HostDescriptorSet {
    pub fn get(&self, binding: u32, element: u32) -> Option<HostDescriptor> {
        self.0.bound.lock().unwrap().get(&(binding, element)).copied()
    }

    pub fn bound_count(&self, binding: u32) -> usize {
        self.0.bound.lock().unwrap()
            .keys()
            .filter(|(b, _)| *b == binding)
            .count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineKind {
    RayTracing,
    Compute,
}

#[derive(Clone)]
pub struct HostPipeline(Arc<HostPipelineInner>);

struct HostPipelineInner {
    name: String,
    kind: PipelineKind,
    group_count: u32,
}

impl HostPipeline {
    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn kind(&self) -> PipelineKind {
        self.0.kind
    }

    pub fn group_count(&self) -> u32 {
        self.0.group_count
    }
}

#[derive(Clone)]
pub struct HostBindingTable(pub Arc<Vec<u32>>);

/// A command the host device executed.
#[derive(Debug, Clone, PartialEq)]
pub enum Executed {
    TraceRays {
        pipeline: String,
        push_constants: Vec<u8>,
        extent: Extent,
        hit_groups: Vec<u32>,
    },
    Dispatch {
        pipeline: String,
        push_constants: Vec<u8>,
        groups: [u32; 3],
    },
    Barrier {
        src: Access,
        dst: Access,
    },
    Transition {
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    },
}

pub struct HostDevice {
    staging: Arc<Heap>,
    device: Arc<Heap>,
    frame_count: usize,
    frames_begun: AtomicU64,
    frames_submitted: AtomicU64,
    next_address: AtomicU64,
    drop_queue: DropQueue,
    queue: Mutex<()>,
    history: Mutex<Vec<Executed>>,
    layout_mismatches: AtomicU64,
}

impl HostDevice {
    pub fn new(staging_bytes: u64, device_bytes: u64, frame_count: usize) -> Self {
        Self {
            staging: Heap::new("staging", staging_bytes),
            device: Heap::new("device", device_bytes),
            frame_count,
            frames_begun: AtomicU64::new(0),
            frames_submitted: AtomicU64::new(0),
            next_address: AtomicU64::new(0x1000_0000),
            drop_queue: DropQueue::new(frame_count),
            queue: Mutex::new(()),
            history: Mutex::new(Vec::new()),
            layout_mismatches: AtomicU64::new(0),
        }
    }

    /// Device memory a BLAS over `sizes` occupies.
    pub fn blas_size(sizes: &[BlasSize]) -> u64 {
        let triangles: u64 = sizes
            .iter()
            .map(|size| size.vertex_count as u64 * 12 + size.index_count as u64 * 4)
            .sum();
        align_up(triangles + 256, ADDRESS_ALIGNMENT)
    }

    /// Device memory a TLAS over `instance_count` instances occupies.
    pub fn tlas_size(instance_count: u32) -> u64 {
        align_up(instance_count as u64 * 128 + 256, ADDRESS_ALIGNMENT)
    }

    pub fn staging_heap(&self) -> &Arc<Heap> {
        &self.staging
    }

    pub fn device_heap(&self) -> &Arc<Heap> {
        &self.device
    }

    pub fn frames_submitted(&self) -> u64 {
        self.frames_submitted.load(Ordering::Acquire)
    }

    pub fn pending_drops(&self) -> usize {
        self.drop_queue.pending()
    }

    pub fn layout_mismatches(&self) -> u64 {
        self.layout_mismatches.load(Ordering::Acquire)
    }

    /// Holds the queue, submissions block until the guard is dropped.
    pub fn hold_queue(&self) -> MutexGuard<'_, ()> {
        self.queue.lock().unwrap()
    }

    pub fn history(&self) -> Vec<Executed> {
        self.history.lock().unwrap().clone()
    }

    pub fn clear_history(&self) {
        self.history.lock().unwrap().clear();
    }

    /// Number of ray dispatches per pipeline name since the history was last cleared.
    pub fn trace_count(&self, pipeline: &str) -> usize {
        self.history.lock().unwrap()
            .iter()
            .filter(|e| matches!(e, Executed::TraceRays { pipeline: p, .. } if p == pipeline))
            .count()
    }

    pub fn dispatch_count(&self, pipeline: &str) -> usize {
        self.history.lock().unwrap()
            .iter()
            .filter(|e| matches!(e, Executed::Dispatch { pipeline: p, .. } if p == pipeline))
            .count()
    }

    fn next_address(&self, size: u64) -> u64 {
        self.next_address.fetch_add(
            align_up(size.max(1), ADDRESS_ALIGNMENT),
            Ordering::AcqRel,
        )
    }

    fn reserve(heap: &Arc<Heap>, size: u64) -> Option<Option<Reservation>> {
        if size == 0 {
            return Some(None);
        }
        heap.try_reserve(size).map(Some)
    }

    fn check_spirv(name: &str, code: &[u32]) -> anyhow::Result<()> {
        if code.first() != Some(&SPIRV_MAGIC) {
            bail!(GpuError::InvalidShader(format!(
                "{name}: missing SPIR-V magic number"
            )));
        }
        Ok(())
    }

    fn record(&self, executed: Executed) {
        self.history.lock().unwrap().push(executed);
    }

    fn execute(&self, commands: CommandList<Self>) {
        for command in commands.into_commands() {
            match command {
                Command::CopyBuffer { src, dst, size } => {
                    if Arc::ptr_eq(&src.0, &dst.0) {
                        continue;
                    }
                    let src = src.0.data.lock().unwrap();
                    let mut dst = dst.0.data.lock().unwrap();
                    let size = (size as usize).min(src.len()).min(dst.len());
                    dst[..size].copy_from_slice(&src[..size]);
                }
                Command::CopyBufferToImage { src, dst } => {
                    let src = src.0.data.lock().unwrap();
                    let mut dst = dst.0.data.lock().unwrap();
                    let size = src.len().min(dst.len());
                    dst[..size].copy_from_slice(&src[..size]);
                }
                Command::CopyImageToBuffer { src, dst } => {
                    let src = src.0.data.lock().unwrap();
                    let mut dst = dst.0.data.lock().unwrap();
                    let size = src.len().min(dst.len());
                    dst[..size].copy_from_slice(&src[..size]);
                }
                Command::TransitionImage {
                    image,
                    old_layout,
                    new_layout,
                    ..
                } => {
                    let mut layout = image.0.layout.lock().unwrap();
                    if old_layout != vk::ImageLayout::UNDEFINED && *layout != old_layout {
                        log::error!(
                            "Image transition from {:?}, but image is in {:?}",
                            old_layout,
                            *layout
                        );
                        self.layout_mismatches.fetch_add(1, Ordering::AcqRel);
                    }
                    *layout = new_layout;
                    self.record(Executed::Transition {
                        old_layout,
                        new_layout,
                    });
                }
                Command::MemoryBarrier { src, dst } => {
                    self.record(Executed::Barrier { src, dst });
                }
                Command::BuildBlas { blas, ranges, .. } => {
                    *blas.0.build.lock().unwrap() = Some(HostBuild::Blas { ranges });
                }
                Command::BuildTlas {
                    tlas,
                    instances,
                    instance_count,
                } => {
                    let bytes = instances.0.data.lock().unwrap().clone();
                    *tlas.0.build.lock().unwrap() = Some(HostBuild::Tlas {
                        instances: bytes,
                        count: instance_count,
                    });
                }
                Command::TraceRays {
                    pipeline,
                    table,
                    push_constants,
                    extent,
                    ..
                } => {
                    self.record(Executed::TraceRays {
                        pipeline: pipeline.0.name.clone(),
                        push_constants,
                        extent,
                        hit_groups: table.0.as_ref().clone(),
                    });
                }
                Command::Dispatch {
                    pipeline,
                    push_constants,
                    groups,
                    ..
                } => {
                    self.record(Executed::Dispatch {
                        pipeline: pipeline.0.name.clone(),
                        push_constants,
                        groups,
                    });
                }
            }
        }
    }
}

impl Device for HostDevice {
    type Buffer = HostBuffer;
    type Image = HostImage;
    type Sampler = HostSampler;
    type AccelerationStructure = HostAccelerationStructure;
    type Pipeline = HostPipeline;
    type BindingTable = HostBindingTable;
    type DescriptorSetLayout = HostDescriptorSetLayout;
    type DescriptorSet = HostDescriptorSet;

    fn frame_count(&self) -> usize {
        self.frame_count
    }

    fn frame(&self) -> usize {
        let begun = self.frames_begun.load(Ordering::Acquire);
        (begun.saturating_sub(1) % self.frame_count as u64) as usize
    }

    fn create_staging(&self, size: u64) -> Alloc<HostBuffer> {
        let Some(reservation) = Self::reserve(&self.staging, size) else {
            return Alloc::StagingFull;
        };
        Alloc::Success(HostBuffer(Arc::new(HostBufferInner {
            data: Mutex::new(vec![0; size as usize]),
            address: self.next_address(size),
            usage: vk::BufferUsageFlags::TRANSFER_SRC,
            host_visible: true,
            _reservation: reservation,
        })))
    }

    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Alloc<HostBuffer> {
        let Some(reservation) = Self::reserve(&self.device, size) else {
            return Alloc::DeviceFull;
        };
        Alloc::Success(HostBuffer(Arc::new(HostBufferInner {
            data: Mutex::new(vec![0; size as usize]),
            address: self.next_address(size),
            usage: usage | vk::BufferUsageFlags::TRANSFER_DST,
            host_visible: false,
            _reservation: reservation,
        })))
    }

    fn map<R>(&self, buffer: &HostBuffer, f: impl FnOnce(&mut [u8]) -> R) -> R {
        debug_assert!(buffer.0.host_visible, "mapping a device local buffer");
        let mut data = buffer.0.data.lock().unwrap();
        f(&mut data)
    }

    fn buffer_address(&self, buffer: &HostBuffer) -> u64 {
        buffer.0.address
    }

    fn buffer_size(&self, buffer: &HostBuffer) -> u64 {
        buffer.size()
    }

    fn create_image(&self, desc: &ImageDesc) -> Alloc<HostImage> {
        let size = desc.extent.pixels() * format_size(desc.format);
        let Some(reservation) = Self::reserve(&self.device, size) else {
            return Alloc::DeviceFull;
        };
        Alloc::Success(HostImage(Arc::new(HostImageInner {
            desc: *desc,
            data: Mutex::new(vec![0; size as usize]),
            layout: Mutex::new(vk::ImageLayout::UNDEFINED),
            _reservation: reservation,
        })))
    }

    fn image_extent(&self, image: &HostImage) -> Extent {
        image.0.desc.extent
    }

    fn create_sampler(&self, config: &SamplerConfig) -> anyhow::Result<HostSampler> {
        Ok(HostSampler(Arc::new(*config)))
    }

    fn create_blas(&self, sizes: &[BlasSize]) -> Alloc<HostAccelerationStructure> {
        let size = Self::blas_size(sizes);
        let Some(reservation) = Self::reserve(&self.device, size) else {
            return Alloc::DeviceFull;
        };
        Alloc::Success(HostAccelerationStructure(Arc::new(HostAccelInner {
            address: self.next_address(size),
            build: Mutex::new(None),
            _reservation: reservation,
        })))
    }

    fn create_tlas(&self, instance_count: u32) -> Alloc<HostAccelerationStructure> {
        let size = Self::tlas_size(instance_count);
        let Some(reservation) = Self::reserve(&self.device, size) else {
            return Alloc::DeviceFull;
        };
        Alloc::Success(HostAccelerationStructure(Arc::new(HostAccelInner {
            address: self.next_address(size),
            build: Mutex::new(None),
            _reservation: reservation,
        })))
    }

    fn acceleration_structure_address(&self, accel: &HostAccelerationStructure) -> u64 {
        accel.0.address
    }

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> anyhow::Result<HostDescriptorSetLayout> {
        Ok(HostDescriptorSetLayout(Arc::new(bindings.to_vec())))
    }

    fn create_descriptor_set(
        &self,
        layout: &HostDescriptorSetLayout,
    ) -> anyhow::Result<HostDescriptorSet> {
        Ok(HostDescriptorSet(Arc::new(HostDescriptorSetInner {
            layout: layout.clone(),
            bound: Mutex::new(HashMap::new()),
        })))
    }

    fn update_descriptor_set(&self, set: &HostDescriptorSet, writes: &[DescriptorWrite<Self>]) {
        let mut bound = set.0.bound.lock().unwrap();
        for write in writes {
            let binding = write.binding();
            let Some(layout) = set.0.layout.0.iter().find(|b| b.binding == binding) else {
                log::error!("Descriptor write to binding {} not in layout", binding);
                continue;
            };
            let (element, descriptor) = match write {
                DescriptorWrite::AccelerationStructure { accel, .. } => {
                    (0, HostDescriptor::AccelerationStructure(accel.0.address))
                }
                DescriptorWrite::StorageBuffer { buffer, .. } => {
                    (0, HostDescriptor::StorageBuffer(buffer.0.address))
                }
                DescriptorWrite::StorageImage { image, .. } => {
                    (0, HostDescriptor::StorageImage(image.id()))
                }
                DescriptorWrite::SampledImage {
                    array_element,
                    image,
                    ..
                } => (*array_element, HostDescriptor::SampledImage(image.id())),
                DescriptorWrite::Sampler { array_element, .. } => {
                    (*array_element, HostDescriptor::Sampler)
                }
            };
            if element >= layout.count {
                log::error!(
                    "Descriptor write to element {} of binding {} with {} elements",
                    element,
                    binding,
                    layout.count
                );
                continue;
            }
            bound.insert((binding, element), descriptor);
        }
    }

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<Self>,
    ) -> anyhow::Result<HostPipeline> {
        Self::check_spirv(desc.name, desc.raygen)?;
        Self::check_spirv(desc.name, desc.miss)?;
        for group in &desc.hit_groups {
            for code in [group.closest_hit, group.any_hit].into_iter().flatten() {
                Self::check_spirv(desc.name, code)?;
            }
        }
        Ok(HostPipeline(Arc::new(HostPipelineInner {
            name: desc.name.to_string(),
            kind: PipelineKind::RayTracing,
            group_count: 2 + desc.hit_groups.len() as u32,
        })))
    }

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<Self>,
    ) -> anyhow::Result<HostPipeline> {
        Self::check_spirv(desc.name, desc.shader)?;
        Ok(HostPipeline(Arc::new(HostPipelineInner {
            name: desc.name.to_string(),
            kind: PipelineKind::Compute,
            group_count: 0,
        })))
    }

    fn create_binding_table(
        &self,
        pipeline: &HostPipeline,
        hit_groups: &[u32],
    ) -> anyhow::Result<HostBindingTable> {
        let count = pipeline.0.group_count;
        if let Some(&index) = hit_groups.iter().find(|&&index| index >= count) {
            bail!(GpuError::HitGroupOutOfRange { index, count });
        }
        Ok(HostBindingTable(Arc::new(hit_groups.to_vec())))
    }

    fn sync<R>(&self, record: impl FnOnce(&mut CommandList<Self>) -> R) -> R {
        let mut commands = CommandList::new();
        let result = record(&mut commands);
        let _queue = self.queue.lock().unwrap();
        self.execute(commands);
        result
    }

    fn begin_frame(&self) {
        let begun = self.frames_begun.fetch_add(1, Ordering::AcqRel);
        self.drop_queue
            .retire((begun % self.frame_count as u64) as usize);
    }

    fn submit_frame(&self, commands: CommandList<Self>) {
        let _queue = self.queue.lock().unwrap();
        self.execute(commands);
        self.frames_submitted.fetch_add(1, Ordering::AcqRel);
    }

    fn defer_drop(&self, value: Box<dyn std::any::Any + Send>) {
        self.drop_queue.defer(self.frame(), value);
    }

    fn wait_idle(&self) {
        let _queue = self.queue.lock().unwrap();
    }
}

impl Drop for HostDevice {
    fn drop(&mut self) {
        self.drop_queue.retire_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_failures_are_values() {
        let device = HostDevice::new(64, 64, 2);
        let staging = device.create_staging(64).ok().unwrap();
        assert!(matches!(device.create_staging(1), Alloc::StagingFull));
        assert!(matches!(
            device.create_buffer(65, vk::BufferUsageFlags::STORAGE_BUFFER),
            Alloc::DeviceFull
        ));
        drop(staging);
        assert!(device.create_staging(64).is_success());
    }

    #[test]
    fn sync_copies_staging_into_device_buffer() {
        let device = HostDevice::new(1024, 1024, 2);
        let staging = device.create_staging(4).ok().unwrap();
        let buffer = device
            .create_buffer(4, vk::BufferUsageFlags::STORAGE_BUFFER)
            .ok()
            .unwrap();
        device.map(&staging, |map| map.copy_from_slice(&[1, 2, 3, 4]));
        device.sync(|cmds| cmds.copy_buffer(&staging, &buffer, 4));
        assert_eq!(buffer.contents(), [1, 2, 3, 4]);
        assert_ne!(device.buffer_address(&staging), device.buffer_address(&buffer));
    }

    #[test]
    fn deferred_drops_wait_for_the_ring() {
        let device = HostDevice::new(1024, 1024, 2);
        device.begin_frame();
        let buffer = device.create_staging(16).ok().unwrap();
        let heap = device.staging_heap().clone();
        device.defer_drop(Box::new(buffer));
        assert_eq!(heap.used(), 16);

        device.submit_frame(CommandList::new());
        device.begin_frame();
        assert_eq!(heap.used(), 16);
        device.submit_frame(CommandList::new());
        device.begin_frame();
        assert_eq!(heap.used(), 0);
    }

    #[test]
    fn binding_table_validates_groups() {
        let device = HostDevice::new(0, 0, 1);
        let shader = vec![SPIRV_MAGIC, 0];
        let pipeline = device
            .create_ray_tracing_pipeline(&RayTracingPipelineDesc {
                name: "test",
                raygen: &shader,
                miss: &shader,
                hit_groups: vec![super::super::HitGroup {
                    closest_hit: Some(&shader),
                    any_hit: None,
                    specialization: None,
                }],
                set_layouts: vec![],
                push_constant_size: 0,
            })
            .unwrap();
        assert!(device.create_binding_table(&pipeline, &[2, 2]).is_ok());
        assert!(device.create_binding_table(&pipeline, &[3]).is_err());
    }
}
