use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{vulkan::Allocator, MemoryLocation};

use crate::{
    gpu::{BlasSize, Heap},
    utility::align_up,
};

use super::{
    buffer::{Buffer, BufferError},
    context::Context,
};

pub struct AccelerationStructureInner {
    pub inner: vk::AccelerationStructureKHR,
    pub ty: vk::AccelerationStructureTypeKHR,
    pub device_address: vk::DeviceAddress,
    _buffer: Buffer,
    /// Released after the first build.
    scratch: Mutex<Option<Buffer>>,
    context: Arc<Context>,
}

impl Drop for AccelerationStructureInner {
    fn drop(&mut self) {
        unsafe {
            self.context
                .acceleration_structure
                .destroy_acceleration_structure(self.inner, None);
        }
    }
}

#[derive(Clone)]
pub struct AccelerationStructure(Arc<AccelerationStructureInner>);

pub fn triangles(
    vertex_data: vk::DeviceAddress,
    index_data: vk::DeviceAddress,
    transform_data: vk::DeviceAddress,
    vertex_count: u32,
    opaque: bool,
) -> vk::AccelerationStructureGeometryKHR {
    let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::builder()
        .vertex_format(vk::Format::R32G32B32_SFLOAT)
        .vertex_data(vk::DeviceOrHostAddressConstKHR {
            device_address: vertex_data,
        })
        .vertex_stride(12)
        .max_vertex(vertex_count.saturating_sub(1))
        .index_type(vk::IndexType::UINT32)
        .index_data(vk::DeviceOrHostAddressConstKHR {
            device_address: index_data,
        })
        .transform_data(vk::DeviceOrHostAddressConstKHR {
            device_address: transform_data,
        })
        .build();

    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
        .flags(if opaque {
            vk::GeometryFlagsKHR::OPAQUE
        } else {
            vk::GeometryFlagsKHR::NO_DUPLICATE_ANY_HIT_INVOCATION
        })
        .build()
}

pub fn instances(data: vk::DeviceAddress) -> vk::AccelerationStructureGeometryKHR {
    let instances = vk::AccelerationStructureGeometryInstancesDataKHR::builder()
        .array_of_pointers(false)
        .data(vk::DeviceOrHostAddressConstKHR {
            device_address: data,
        })
        .build();

    vk::AccelerationStructureGeometryKHR::builder()
        .geometry_type(vk::GeometryTypeKHR::INSTANCES)
        .geometry(vk::AccelerationStructureGeometryDataKHR { instances })
        .build()
}

pub fn build_flags() -> vk::BuildAccelerationStructureFlagsKHR {
    vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
}

fn build_sizes(
    context: &Context,
    ty: vk::AccelerationStructureTypeKHR,
    geometries: &[vk::AccelerationStructureGeometryKHR],
    primitive_counts: &[u32],
) -> vk::AccelerationStructureBuildSizesInfoKHR {
    let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
        .ty(ty)
        .flags(build_flags())
        .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
        .geometries(geometries);

    unsafe {
        context
            .acceleration_structure
            .get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                primitive_counts,
            )
    }
}

impl AccelerationStructure {
    pub fn blas(
        context: Arc<Context>,
        allocator: &Arc<Mutex<Allocator>>,
        heap: &Arc<Heap>,
        sizes: &[BlasSize],
    ) -> Result<Self, BufferError> {
        let geometries: Vec<_> = sizes
            .iter()
            .map(|size| triangles(0, 0, 0, size.vertex_count, size.opaque))
            .collect();
        let primitive_counts: Vec<u32> = sizes.iter().map(|size| size.index_count / 3).collect();
        let build_size_info = build_sizes(
            &context,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            &geometries,
            &primitive_counts,
        );
        Self::new(
            context,
            allocator,
            heap,
            vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL,
            build_size_info,
        )
    }

    pub fn tlas(
        context: Arc<Context>,
        allocator: &Arc<Mutex<Allocator>>,
        heap: &Arc<Heap>,
        instance_count: u32,
    ) -> Result<Self, BufferError> {
        let build_size_info = build_sizes(
            &context,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            &[instances(0)],
            &[instance_count],
        );
        Self::new(
            context,
            allocator,
            heap,
            vk::AccelerationStructureTypeKHR::TOP_LEVEL,
            build_size_info,
        )
    }

    // See https://github.com/SaschaWillems/Vulkan/blob/a467d941599a2cef5bd0eff696999bca8d75ee23/base/VulkanRaytracingSample.cpp#L149
    fn new(
        context: Arc<Context>,
        allocator: &Arc<Mutex<Allocator>>,
        heap: &Arc<Heap>,
        structure_type: vk::AccelerationStructureTypeKHR,
        build_size_info: vk::AccelerationStructureBuildSizesInfoKHR,
    ) -> Result<Self, BufferError> {
        let scratch_size =
            build_size_info.build_scratch_size + context.scratch_alignment().max(1);
        let storage_reservation = heap
            .try_reserve(build_size_info.acceleration_structure_size)
            .ok_or(BufferError::OutOfMemory)?;
        let scratch_reservation = heap
            .try_reserve(scratch_size)
            .ok_or(BufferError::OutOfMemory)?;

        let buffer = Buffer::new(
            context.clone(),
            allocator,
            "acceleration structure",
            build_size_info.acceleration_structure_size,
            vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR,
            MemoryLocation::GpuOnly,
            Some(storage_reservation),
        )?;
        let scratch = Buffer::new(
            context.clone(),
            allocator,
            "acceleration structure scratch",
            scratch_size,
            vk::BufferUsageFlags::STORAGE_BUFFER,
            MemoryLocation::GpuOnly,
            Some(scratch_reservation),
        )?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::builder()
            .buffer(buffer.inner())
            .size(build_size_info.acceleration_structure_size)
            .ty(structure_type);

        let inner = unsafe {
            context
                .acceleration_structure
                .create_acceleration_structure(&create_info, None)
        }?;

        let device_address = {
            let acceleration_structure_device_address_info =
                vk::AccelerationStructureDeviceAddressInfoKHR::builder()
                    .acceleration_structure(inner);

            unsafe {
                context
                    .acceleration_structure
                    .get_acceleration_structure_device_address(
                        &acceleration_structure_device_address_info,
                    )
            }
        };

        Ok(Self(Arc::new(AccelerationStructureInner {
            inner,
            ty: structure_type,
            device_address,
            _buffer: buffer,
            scratch: Mutex::new(Some(scratch)),
            context,
        })))
    }

    pub fn inner(&self) -> vk::AccelerationStructureKHR {
        self.0.inner
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.0.device_address
    }

    /// Hands out the scratch buffer for the one build this structure gets. The caller keeps
    /// it alive until the build completed.
    pub fn take_scratch(&self) -> Option<(Buffer, vk::DeviceAddress)> {
        let scratch = self.0.scratch.lock().unwrap().take()?;
        let address = align_up(
            scratch.device_address(),
            self.0.context.scratch_alignment().max(1),
        );
        Some((scratch, address))
    }
}
