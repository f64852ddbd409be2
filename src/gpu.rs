//! The GPU runtime seam. Everything above this module talks to a [`Device`], so the scene
//! upload pipeline and the renderer run unchanged on Vulkan or on the software [`host`]
//! runtime used by the tests.

mod alloc;
mod budget;
mod command;
mod drop_queue;
pub mod host;

pub use alloc::Alloc;
pub use budget::{Heap, Reservation};
pub use command::{Access, BlasRange, Command, CommandList};
pub use drop_queue::DropQueue;

use ash::vk;
use serde::{Deserialize, Serialize};

/// Handles are cheap to clone; the underlying resource lives until the last clone drops.
pub trait Resource: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> Resource for T {}

pub type Spirv = Vec<u32>;

/// First word of every SPIR-V module.
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub width: u32,
    pub height: u32,
}

impl Extent {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixels(&self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDesc {
    pub extent: Extent,
    pub format: vk::Format,
    pub usage: vk::ImageUsageFlags,
}

/// Bytes per texel of the formats images are created with.
pub fn format_size(format: vk::Format) -> u64 {
    match format {
        vk::Format::R8_UNORM | vk::Format::R8_SRGB => 1,
        vk::Format::R16G16B16A16_SFLOAT => 8,
        vk::Format::R32G32B32A32_SFLOAT => 16,
        _ => 4,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerConfig {
    pub min: vk::Filter,
    pub mag: vk::Filter,
    pub u: vk::SamplerAddressMode,
    pub v: vk::SamplerAddressMode,
    pub w: vk::SamplerAddressMode,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            min: vk::Filter::LINEAR,
            mag: vk::Filter::LINEAR,
            u: vk::SamplerAddressMode::REPEAT,
            v: vk::SamplerAddressMode::REPEAT,
            w: vk::SamplerAddressMode::REPEAT,
        }
    }
}

/// Triangle counts of one geometry inside a bottom level acceleration structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasSize {
    pub vertex_count: u32,
    pub index_count: u32,
    pub opaque: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutBinding {
    pub binding: u32,
    pub ty: vk::DescriptorType,
    pub count: u32,
    pub stages: vk::ShaderStageFlags,
}

pub enum DescriptorWrite<'a, D: Device> {
    AccelerationStructure {
        binding: u32,
        accel: &'a D::AccelerationStructure,
    },
    StorageBuffer {
        binding: u32,
        buffer: &'a D::Buffer,
    },
    StorageImage {
        binding: u32,
        image: &'a D::Image,
    },
    SampledImage {
        binding: u32,
        array_element: u32,
        image: &'a D::Image,
    },
    Sampler {
        binding: u32,
        array_element: u32,
        sampler: &'a D::Sampler,
    },
}

impl<'a, D: Device> DescriptorWrite<'a, D> {
    pub fn binding(&self) -> u32 {
        match self {
            DescriptorWrite::AccelerationStructure { binding, .. }
            | DescriptorWrite::StorageBuffer { binding, .. }
            | DescriptorWrite::StorageImage { binding, .. }
            | DescriptorWrite::SampledImage { binding, .. }
            | DescriptorWrite::Sampler { binding, .. } => *binding,
        }
    }
}

pub struct HitGroup<'a> {
    pub closest_hit: Option<&'a [u32]>,
    pub any_hit: Option<&'a [u32]>,
    /// Value of specialization constant 0 for the closest hit shader.
    pub specialization: Option<u32>,
}

pub struct RayTracingPipelineDesc<'a, D: Device> {
    pub name: &'a str,
    pub raygen: &'a [u32],
    pub miss: &'a [u32],
    pub hit_groups: Vec<HitGroup<'a>>,
    pub set_layouts: Vec<&'a D::DescriptorSetLayout>,
    pub push_constant_size: u32,
}

pub struct ComputePipelineDesc<'a, D: Device> {
    pub name: &'a str,
    pub shader: &'a [u32],
    pub set_layouts: Vec<&'a D::DescriptorSetLayout>,
    pub push_constant_size: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum GpuError {
    #[error("Vulkan call failed: {0}")]
    Vulkan(#[from] vk::Result),
    #[error("Hit group {index} out of range, pipeline has {count} groups")]
    HitGroupOutOfRange { index: u32, count: u32 },
    #[error("Out of memory while creating {0}")]
    OutOfMemory(&'static str),
    #[error("Invalid shader: {0}")]
    InvalidShader(String),
}

/// Ray tracing capable GPU runtime.
///
/// Memory allocation reports exhaustion as a value. All other creation failures are errors.
pub trait Device: Send + Sync + Sized + 'static {
    type Buffer: Resource;
    type Image: Resource;
    type Sampler: Resource;
    type AccelerationStructure: Resource;
    type Pipeline: Resource;
    type BindingTable: Resource;
    type DescriptorSetLayout: Resource;
    type DescriptorSet: Resource;

    /// Depth of the frames in flight ring.
    fn frame_count(&self) -> usize;

    /// Current slot in the frames in flight ring.
    fn frame(&self) -> usize;

    /// Host visible upload memory, drawn from the staging heap.
    fn create_staging(&self, size: u64) -> Alloc<Self::Buffer>;

    /// Device local memory. Always usable as a transfer destination.
    fn create_buffer(&self, size: u64, usage: vk::BufferUsageFlags) -> Alloc<Self::Buffer>;

    /// Runs `f` on the mapped contents of a staging buffer.
    fn map<R>(&self, buffer: &Self::Buffer, f: impl FnOnce(&mut [u8]) -> R) -> R;

    fn buffer_address(&self, buffer: &Self::Buffer) -> u64;

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    fn create_image(&self, desc: &ImageDesc) -> Alloc<Self::Image>;

    fn image_extent(&self, image: &Self::Image) -> Extent;

    fn create_sampler(&self, config: &SamplerConfig) -> anyhow::Result<Self::Sampler>;

    fn create_blas(&self, sizes: &[BlasSize]) -> Alloc<Self::AccelerationStructure>;

    fn create_tlas(&self, instance_count: u32) -> Alloc<Self::AccelerationStructure>;

    fn acceleration_structure_address(&self, accel: &Self::AccelerationStructure) -> u64;

    fn create_descriptor_set_layout(
        &self,
        bindings: &[LayoutBinding],
    ) -> anyhow::Result<Self::DescriptorSetLayout>;

    fn create_descriptor_set(
        &self,
        layout: &Self::DescriptorSetLayout,
    ) -> anyhow::Result<Self::DescriptorSet>;

    fn update_descriptor_set(&self, set: &Self::DescriptorSet, writes: &[DescriptorWrite<Self>]);

    fn create_ray_tracing_pipeline(
        &self,
        desc: &RayTracingPipelineDesc<Self>,
    ) -> anyhow::Result<Self::Pipeline>;

    fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc<Self>,
    ) -> anyhow::Result<Self::Pipeline>;

    /// Shader binding table with one hit record per entry of `hit_groups`.
    fn create_binding_table(
        &self,
        pipeline: &Self::Pipeline,
        hit_groups: &[u32],
    ) -> anyhow::Result<Self::BindingTable>;

    /// Records into a one shot command list, submits it and waits for completion.
    /// Submissions are serialized, so this may be called from any thread.
    fn sync<R>(&self, record: impl FnOnce(&mut CommandList<Self>) -> R) -> R;

    /// Advances to the next slot, waits until it is free again and releases what was
    /// deferred in it.
    fn begin_frame(&self);

    /// Submits the frame's commands. The slot stays current until the next `begin_frame`.
    fn submit_frame(&self, commands: CommandList<Self>);

    /// Keeps `value` alive until no frame in flight can reference it any more.
    fn defer_drop(&self, value: Box<dyn std::any::Any + Send>);

    fn wait_idle(&self);
}
