use ash::vk;

use super::{Device, Extent};

/// Pipeline stage and access pair on one side of a barrier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub stage: vk::PipelineStageFlags2,
    pub access: vk::AccessFlags2,
}

impl Access {
    pub const NONE: Access = Access::new(vk::PipelineStageFlags2::NONE, vk::AccessFlags2::NONE);

    pub const fn new(stage: vk::PipelineStageFlags2, access: vk::AccessFlags2) -> Self {
        Self { stage, access }
    }

    pub const fn transfer_write() -> Self {
        Self::new(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_WRITE,
        )
    }

    pub const fn transfer_read() -> Self {
        Self::new(
            vk::PipelineStageFlags2::TRANSFER,
            vk::AccessFlags2::TRANSFER_READ,
        )
    }
}

/// Byte offsets of one geometry inside a BLAS input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlasRange {
    pub vertex_offset: u64,
    pub index_offset: u64,
    pub transform_offset: u64,
    pub vertex_count: u32,
    pub index_count: u32,
    pub opaque: bool,
}

/// A recorded GPU command. Commands hold handle clones, which keeps the resources they touch
/// alive until the list is executed and dropped.
pub enum Command<D: Device> {
    CopyBuffer {
        src: D::Buffer,
        dst: D::Buffer,
        size: u64,
    },
    CopyBufferToImage {
        src: D::Buffer,
        dst: D::Image,
    },
    CopyImageToBuffer {
        src: D::Image,
        dst: D::Buffer,
    },
    TransitionImage {
        image: D::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src: Access,
        dst: Access,
    },
    MemoryBarrier {
        src: Access,
        dst: Access,
    },
    BuildBlas {
        blas: D::AccelerationStructure,
        input: D::Buffer,
        ranges: Vec<BlasRange>,
    },
    BuildTlas {
        tlas: D::AccelerationStructure,
        instances: D::Buffer,
        instance_count: u32,
    },
    TraceRays {
        pipeline: D::Pipeline,
        table: D::BindingTable,
        sets: Vec<D::DescriptorSet>,
        push_constants: Vec<u8>,
        extent: Extent,
    },
    Dispatch {
        pipeline: D::Pipeline,
        sets: Vec<D::DescriptorSet>,
        push_constants: Vec<u8>,
        groups: [u32; 3],
    },
}

pub struct CommandList<D: Device> {
    commands: Vec<Command<D>>,
}

impl<D: Device> Default for CommandList<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: Device> CommandList<D> {
    pub fn new() -> Self {
        Self {
            commands: Vec::new(),
        }
    }

    pub fn push(&mut self, command: Command<D>) {
        self.commands.push(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn commands(&self) -> &[Command<D>] {
        &self.commands
    }

    pub fn into_commands(self) -> Vec<Command<D>> {
        self.commands
    }

    pub fn copy_buffer(&mut self, src: &D::Buffer, dst: &D::Buffer, size: u64) {
        self.push(Command::CopyBuffer {
            src: src.clone(),
            dst: dst.clone(),
            size,
        });
    }

    pub fn copy_buffer_to_image(&mut self, src: &D::Buffer, dst: &D::Image) {
        self.push(Command::CopyBufferToImage {
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    pub fn copy_image_to_buffer(&mut self, src: &D::Image, dst: &D::Buffer) {
        self.push(Command::CopyImageToBuffer {
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    pub fn transition(
        &mut self,
        image: &D::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
        src: Access,
        dst: Access,
    ) {
        self.push(Command::TransitionImage {
            image: image.clone(),
            old_layout,
            new_layout,
            src,
            dst,
        });
    }

    pub fn barrier(&mut self, src: Access, dst: Access) {
        self.push(Command::MemoryBarrier { src, dst });
    }

    /// Makes transfer writes visible to acceleration structure builds.
    pub fn transfer_build_barrier(&mut self) {
        self.barrier(
            Access::transfer_write(),
            Access::new(
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::SHADER_READ,
            ),
        );
    }

    pub fn build_blas(
        &mut self,
        blas: &D::AccelerationStructure,
        input: &D::Buffer,
        ranges: Vec<BlasRange>,
    ) {
        self.push(Command::BuildBlas {
            blas: blas.clone(),
            input: input.clone(),
            ranges,
        });
    }

    pub fn build_tlas(
        &mut self,
        tlas: &D::AccelerationStructure,
        instances: &D::Buffer,
        instance_count: u32,
    ) {
        self.push(Command::BuildTlas {
            tlas: tlas.clone(),
            instances: instances.clone(),
            instance_count,
        });
    }

    pub fn trace_rays(
        &mut self,
        pipeline: &D::Pipeline,
        table: &D::BindingTable,
        sets: &[&D::DescriptorSet],
        push_constants: &[u8],
        extent: Extent,
    ) {
        self.push(Command::TraceRays {
            pipeline: pipeline.clone(),
            table: table.clone(),
            sets: sets.iter().map(|set| (*set).clone()).collect(),
            push_constants: push_constants.to_vec(),
            extent,
        });
    }

    pub fn dispatch(
        &mut self,
        pipeline: &D::Pipeline,
        sets: &[&D::DescriptorSet],
        push_constants: &[u8],
        groups: [u32; 3],
    ) {
        self.push(Command::Dispatch {
            pipeline: pipeline.clone(),
            sets: sets.iter().map(|set| (*set).clone()).collect(),
            push_constants: push_constants.to_vec(),
            groups,
        });
    }
}
