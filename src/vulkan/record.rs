use ash::vk;

use crate::gpu::{Access, Command};

use super::{
    acceleration_structure::{build_flags, instances, triangles},
    buffer::Buffer,
    context::Context,
    image::{full_subresource_layers, full_subresource_range},
    VulkanDevice,
};

fn memory_barrier(context: &Context, command_buffer: vk::CommandBuffer, src: Access, dst: Access) {
    let barrier = vk::MemoryBarrier2::builder()
        .src_stage_mask(src.stage)
        .src_access_mask(src.access)
        .dst_stage_mask(dst.stage)
        .dst_access_mask(dst.access)
        .build();
    let dependency_info =
        vk::DependencyInfo::builder().memory_barriers(std::slice::from_ref(&barrier));
    unsafe {
        context
            .synchronization2
            .cmd_pipeline_barrier2(command_buffer, &dependency_info)
    };
}

fn build_to_trace() -> (Access, Access) {
    (
        Access::new(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR,
        ),
        Access::new(
            vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR
                | vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
        ),
    )
}

/// Records `commands` into `command_buffer`. Scratch buffers of the builds are pushed to
/// `keep`, they must outlive the submission.
pub fn record(
    context: &Context,
    command_buffer: vk::CommandBuffer,
    commands: &[Command<VulkanDevice>],
    keep: &mut Vec<Buffer>,
) {
    let device = &context.device;
    for command in commands {
        match command {
            Command::CopyBuffer { src, dst, size } => {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size: *size,
                };
                unsafe {
                    device.cmd_copy_buffer(
                        command_buffer,
                        src.inner(),
                        dst.inner(),
                        std::slice::from_ref(&region),
                    )
                };
            }
            Command::CopyBufferToImage { src, dst } => {
                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: full_subresource_layers(),
                    image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                    image_extent: dst.extent_3d(),
                };
                unsafe {
                    device.cmd_copy_buffer_to_image(
                        command_buffer,
                        src.inner(),
                        dst.inner(),
                        vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                        std::slice::from_ref(&region),
                    )
                };
            }
            Command::CopyImageToBuffer { src, dst } => {
                let region = vk::BufferImageCopy {
                    buffer_offset: 0,
                    buffer_row_length: 0,
                    buffer_image_height: 0,
                    image_subresource: full_subresource_layers(),
                    image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                    image_extent: src.extent_3d(),
                };
                unsafe {
                    device.cmd_copy_image_to_buffer(
                        command_buffer,
                        src.inner(),
                        vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                        dst.inner(),
                        std::slice::from_ref(&region),
                    )
                };
            }
            Command::TransitionImage {
                image,
                old_layout,
                new_layout,
                src,
                dst,
            } => {
                let barrier = vk::ImageMemoryBarrier2 {
                    src_stage_mask: src.stage,
                    src_access_mask: src.access,
                    dst_stage_mask: dst.stage,
                    dst_access_mask: dst.access,
                    old_layout: *old_layout,
                    new_layout: *new_layout,
                    src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                    dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                    image: image.inner(),
                    subresource_range: full_subresource_range(),
                    ..vk::ImageMemoryBarrier2::default()
                };
                let dependency_info = vk::DependencyInfo::builder()
                    .image_memory_barriers(std::slice::from_ref(&barrier));
                unsafe {
                    context
                        .synchronization2
                        .cmd_pipeline_barrier2(command_buffer, &dependency_info)
                };
            }
            Command::MemoryBarrier { src, dst } => {
                memory_barrier(context, command_buffer, *src, *dst);
            }
            Command::BuildBlas {
                blas,
                input,
                ranges,
            } => {
                let Some((scratch, scratch_address)) = blas.take_scratch() else {
                    log::warn!("BLAS was already built, skipping rebuild.");
                    continue;
                };
                keep.push(scratch);

                let base = input.device_address();
                let geometries: Vec<_> = ranges
                    .iter()
                    .map(|range| {
                        triangles(
                            base + range.vertex_offset,
                            base + range.index_offset,
                            base + range.transform_offset,
                            range.vertex_count,
                            range.opaque,
                        )
                    })
                    .collect();
                let range_infos: Vec<_> = ranges
                    .iter()
                    .map(|range| vk::AccelerationStructureBuildRangeInfoKHR {
                        primitive_count: range.index_count / 3,
                        primitive_offset: 0,
                        first_vertex: 0,
                        transform_offset: 0,
                    })
                    .collect();
                let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
                    .flags(build_flags())
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(blas.inner())
                    .geometries(&geometries)
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_address,
                    })
                    .build();

                unsafe {
                    context
                        .acceleration_structure
                        .cmd_build_acceleration_structures(
                            command_buffer,
                            std::slice::from_ref(&build_info),
                            &[&range_infos],
                        )
                };
                let (src, dst) = build_to_trace();
                memory_barrier(context, command_buffer, src, dst);
            }
            Command::BuildTlas {
                tlas,
                instances: instance_buffer,
                instance_count,
            } => {
                let Some((scratch, scratch_address)) = tlas.take_scratch() else {
                    log::warn!("TLAS was already built, skipping rebuild.");
                    continue;
                };
                keep.push(scratch);

                let geometry = instances(instance_buffer.device_address());
                let range_info = vk::AccelerationStructureBuildRangeInfoKHR {
                    primitive_count: *instance_count,
                    primitive_offset: 0,
                    first_vertex: 0,
                    transform_offset: 0,
                };
                let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::builder()
                    .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
                    .flags(build_flags())
                    .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
                    .dst_acceleration_structure(tlas.inner())
                    .geometries(std::slice::from_ref(&geometry))
                    .scratch_data(vk::DeviceOrHostAddressKHR {
                        device_address: scratch_address,
                    })
                    .build();

                unsafe {
                    context
                        .acceleration_structure
                        .cmd_build_acceleration_structures(
                            command_buffer,
                            std::slice::from_ref(&build_info),
                            &[std::slice::from_ref(&range_info)],
                        )
                };
                let (src, dst) = build_to_trace();
                memory_barrier(context, command_buffer, src, dst);
            }
            Command::TraceRays {
                pipeline,
                table,
                sets,
                push_constants,
                extent,
            } => {
                bind(context, command_buffer, pipeline, sets, push_constants);
                let empty_sbt_entry = vk::StridedDeviceAddressRegionKHR::default();
                unsafe {
                    context
                        .ray_tracing
                        .cmd_trace_rays(
                            command_buffer,
                            &table.0.raygen,
                            &table.0.miss,
                            &table.0.hit,
                            &empty_sbt_entry,
                            extent.width,
                            extent.height,
                            1,
                        )
                };
            }
            Command::Dispatch {
                pipeline,
                sets,
                push_constants,
                groups,
            } => {
                bind(context, command_buffer, pipeline, sets, push_constants);
                unsafe { device.cmd_dispatch(command_buffer, groups[0], groups[1], groups[2]) };
            }
        }
    }
}

fn bind(
    context: &Context,
    command_buffer: vk::CommandBuffer,
    pipeline: &super::pipeline::Pipeline,
    sets: &[super::descriptor_set::DescriptorSet],
    push_constants: &[u8],
) {
    let device = &context.device;
    let pipeline = &pipeline.0;
    unsafe { device.cmd_bind_pipeline(command_buffer, pipeline.bind_point, pipeline.inner) };

    let descriptor_sets: Vec<vk::DescriptorSet> = sets.iter().map(|set| set.inner()).collect();
    if !descriptor_sets.is_empty() {
        unsafe {
            device.cmd_bind_descriptor_sets(
                command_buffer,
                pipeline.bind_point,
                pipeline.layout,
                0,
                &descriptor_sets,
                &[],
            )
        };
    }
    if !push_constants.is_empty() {
        unsafe {
            device.cmd_push_constants(
                command_buffer,
                pipeline.layout,
                pipeline.push_stages,
                0,
                push_constants,
            )
        };
    }
}
