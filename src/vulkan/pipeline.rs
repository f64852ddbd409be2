use std::sync::{Arc, Mutex};

use anyhow::bail;
use ash::vk;
use gpu_allocator::{vulkan::Allocator, MemoryLocation};

use crate::{
    gpu::{GpuError, HitGroup, SPIRV_MAGIC},
    utility::{align_up, aligned_size},
};

use super::{
    buffer::{Buffer, BufferError},
    context::Context,
    shader_create_info::{stage_info, ShaderModules, SPECIALIZATION_ENTRY},
};

pub const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw(),
);

pub struct PipelineInner {
    pub inner: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub bind_point: vk::PipelineBindPoint,
    pub push_stages: vk::ShaderStageFlags,
    pub group_count: u32,
    context: Arc<Context>,
}

impl Drop for PipelineInner {
    fn drop(&mut self) {
        let device = &self.context.device;

        unsafe { device.destroy_pipeline(self.inner, None) };
        unsafe { device.destroy_pipeline_layout(self.layout, None) };
    }
}

#[derive(Clone)]
pub struct Pipeline(pub Arc<PipelineInner>);

fn check_spirv(name: &str, code: &[u32]) -> Result<(), GpuError> {
    if code.first() != Some(&SPIRV_MAGIC) {
        return Err(GpuError::InvalidShader(format!(
            "{} is not SPIR-V",
            name
        )));
    }
    Ok(())
}

fn create_layout(
    context: &Context,
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
    push_stages: vk::ShaderStageFlags,
) -> Result<vk::PipelineLayout, vk::Result> {
    let push_constant_ranges = [vk::PushConstantRange {
        stage_flags: push_stages,
        offset: 0,
        size: push_constant_size,
    }];
    let ranges: &[vk::PushConstantRange] = if push_constant_size == 0 {
        &[]
    } else {
        &push_constant_ranges
    };
    let create_info = vk::PipelineLayoutCreateInfo::builder()
        .set_layouts(set_layouts)
        .push_constant_ranges(ranges);
    unsafe { context.device.create_pipeline_layout(&create_info, None) }
}

/// Groups are laid out as raygen, miss, then one triangle hit group per entry of
/// `hit_groups`.
pub fn create_ray_tracing_pipeline(
    context: Arc<Context>,
    name: &str,
    raygen: &[u32],
    miss: &[u32],
    hit_groups: &[HitGroup],
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
) -> anyhow::Result<Pipeline> {
    check_spirv(name, raygen)?;
    check_spirv(name, miss)?;
    for group in hit_groups {
        for code in [group.closest_hit, group.any_hit].into_iter().flatten() {
            check_spirv(name, code)?;
        }
    }

    let mut modules = ShaderModules::new(context.clone());

    let specialization_data: Vec<[u8; 4]> = hit_groups
        .iter()
        .map(|group| group.specialization.unwrap_or(0).to_ne_bytes())
        .collect();
    let entries = [SPECIALIZATION_ENTRY];
    let specializations: Vec<vk::SpecializationInfo> = specialization_data
        .iter()
        .map(|data| {
            vk::SpecializationInfo::builder()
                .map_entries(&entries)
                .data(data)
                .build()
        })
        .collect();

    let mut stages = vec![
        stage_info(
            vk::ShaderStageFlags::RAYGEN_KHR,
            modules.get(raygen)?,
            None,
        ),
        stage_info(vk::ShaderStageFlags::MISS_KHR, modules.get(miss)?, None),
    ];
    let mut groups = vec![
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(0)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
        vk::RayTracingShaderGroupCreateInfoKHR::builder()
            .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
            .general_shader(1)
            .closest_hit_shader(vk::SHADER_UNUSED_KHR)
            .any_hit_shader(vk::SHADER_UNUSED_KHR)
            .intersection_shader(vk::SHADER_UNUSED_KHR)
            .build(),
    ];

    for (group, specialization) in hit_groups.iter().zip(&specializations) {
        let specialization = group.specialization.map(|_| specialization);
        let mut closest_hit_shader = vk::SHADER_UNUSED_KHR;
        let mut any_hit_shader = vk::SHADER_UNUSED_KHR;
        if let Some(code) = group.closest_hit {
            closest_hit_shader = stages.len() as u32;
            stages.push(stage_info(
                vk::ShaderStageFlags::CLOSEST_HIT_KHR,
                modules.get(code)?,
                specialization,
            ));
        }
        if let Some(code) = group.any_hit {
            any_hit_shader = stages.len() as u32;
            stages.push(stage_info(
                vk::ShaderStageFlags::ANY_HIT_KHR,
                modules.get(code)?,
                None,
            ));
        }
        groups.push(
            vk::RayTracingShaderGroupCreateInfoKHR::builder()
                .ty(vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(closest_hit_shader)
                .any_hit_shader(any_hit_shader)
                .intersection_shader(vk::SHADER_UNUSED_KHR)
                .build(),
        );
    }

    let layout = create_layout(&context, set_layouts, push_constant_size, RAY_TRACING_STAGES)?;

    let max_recursion = context
        .ray_tracing_properties
        .max_ray_recursion_depth
        .min(1);
    let create_info = vk::RayTracingPipelineCreateInfoKHR::builder()
        .stages(&stages)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(max_recursion)
        .layout(layout)
        .build();

    let pipeline = unsafe {
        context
            .ray_tracing
            .create_ray_tracing_pipelines(
                vk::DeferredOperationKHR::null(),
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
    };
    let pipeline = match pipeline.map(|pipelines| pipelines.into_iter().next()) {
        Ok(Some(pipeline)) => pipeline,
        Ok(None) => {
            unsafe { context.device.destroy_pipeline_layout(layout, None) };
            bail!("No pipeline was created for {}", name);
        }
        Err(error) => {
            unsafe { context.device.destroy_pipeline_layout(layout, None) };
            return Err(GpuError::Vulkan(error).into());
        }
    };

    Ok(Pipeline(Arc::new(PipelineInner {
        inner: pipeline,
        layout,
        bind_point: vk::PipelineBindPoint::RAY_TRACING_KHR,
        push_stages: RAY_TRACING_STAGES,
        group_count: groups.len() as u32,
        context,
    })))
}

pub fn create_compute_pipeline(
    context: Arc<Context>,
    name: &str,
    shader: &[u32],
    set_layouts: &[vk::DescriptorSetLayout],
    push_constant_size: u32,
) -> anyhow::Result<Pipeline> {
    check_spirv(name, shader)?;
    let mut modules = ShaderModules::new(context.clone());
    let stage = stage_info(vk::ShaderStageFlags::COMPUTE, modules.get(shader)?, None);

    let layout = create_layout(
        &context,
        set_layouts,
        push_constant_size,
        vk::ShaderStageFlags::COMPUTE,
    )?;
    let create_info = vk::ComputePipelineCreateInfo::builder()
        .stage(stage)
        .layout(layout)
        .build();

    let pipeline = unsafe {
        context.device.create_compute_pipelines(
            vk::PipelineCache::null(),
            std::slice::from_ref(&create_info),
            None,
        )
    };
    let pipeline = match pipeline {
        Ok(pipelines) if !pipelines.is_empty() => pipelines[0],
        Ok(_) => {
            unsafe { context.device.destroy_pipeline_layout(layout, None) };
            bail!("No pipeline was created for {}", name);
        }
        Err((_, error)) => {
            unsafe { context.device.destroy_pipeline_layout(layout, None) };
            return Err(GpuError::Vulkan(error).into());
        }
    };

    Ok(Pipeline(Arc::new(PipelineInner {
        inner: pipeline,
        layout,
        bind_point: vk::PipelineBindPoint::COMPUTE,
        push_stages: vk::ShaderStageFlags::COMPUTE,
        group_count: 0,
        context,
    })))
}

pub struct BindingTableInner {
    _buffer: Buffer,
    pub raygen: vk::StridedDeviceAddressRegionKHR,
    pub miss: vk::StridedDeviceAddressRegionKHR,
    pub hit: vk::StridedDeviceAddressRegionKHR,
}

#[derive(Clone)]
pub struct BindingTable(pub Arc<BindingTableInner>);

/// Shader binding table with the raygen, miss and one record per hit group entry.
pub fn create_binding_table(
    context: Arc<Context>,
    allocator: &Arc<Mutex<Allocator>>,
    pipeline: &Pipeline,
    hit_groups: &[u32],
) -> anyhow::Result<BindingTable> {
    let count = pipeline.0.group_count;
    if let Some(&index) = hit_groups.iter().find(|&&index| index >= count) {
        bail!(GpuError::HitGroupOutOfRange { index, count });
    }

    let handle_size = context.shader_group_handle_size();
    let base_alignment = context.shader_group_base_alignment();
    let stride = aligned_size(handle_size, context.shader_group_handle_alignment());

    let raygen_size = aligned_size(stride, base_alignment);
    let miss_size = aligned_size(stride, base_alignment);
    let hit_size = aligned_size(stride * hit_groups.len() as u32, base_alignment);
    let size = (raygen_size + miss_size + hit_size + base_alignment) as u64;

    let handles = unsafe {
        context
            .ray_tracing
            .get_ray_tracing_shader_group_handles(
                pipeline.0.inner,
                0,
                count,
                (count * handle_size) as usize,
            )
    }
    .map_err(GpuError::Vulkan)?;

    let buffer = match Buffer::new(
        context,
        allocator,
        "shader binding table",
        size,
        vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR,
        MemoryLocation::CpuToGpu,
        None,
    ) {
        Ok(buffer) => buffer,
        Err(BufferError::OutOfMemory) => bail!(GpuError::OutOfMemory("shader binding table")),
        Err(BufferError::Vulkan(error)) => bail!(GpuError::Vulkan(error)),
    };

    let address = align_up(buffer.device_address(), base_alignment as u64);
    let start = (address - buffer.device_address()) as usize;
    let handle = |group: u32| {
        let at = (group * handle_size) as usize;
        &handles[at..at + handle_size as usize]
    };
    buffer.map(|map| {
        let raygen_at = start;
        let miss_at = raygen_at + raygen_size as usize;
        let hit_at = miss_at + miss_size as usize;
        map[raygen_at..raygen_at + handle_size as usize].copy_from_slice(handle(0));
        map[miss_at..miss_at + handle_size as usize].copy_from_slice(handle(1));
        for (i, &group) in hit_groups.iter().enumerate() {
            let at = hit_at + i * stride as usize;
            map[at..at + handle_size as usize].copy_from_slice(handle(group));
        }
    });

    let raygen = vk::StridedDeviceAddressRegionKHR {
        device_address: address,
        stride: raygen_size as u64,
        size: raygen_size as u64,
    };
    let miss = vk::StridedDeviceAddressRegionKHR {
        device_address: address + raygen_size as u64,
        stride: stride as u64,
        size: miss_size as u64,
    };
    let hit = if hit_groups.is_empty() {
        vk::StridedDeviceAddressRegionKHR::default()
    } else {
        vk::StridedDeviceAddressRegionKHR {
            device_address: address + (raygen_size + miss_size) as u64,
            stride: stride as u64,
            size: hit_size as u64,
        }
    };

    Ok(BindingTable(Arc::new(BindingTableInner {
        _buffer: buffer,
        raygen,
        miss,
        hit,
    })))
}
