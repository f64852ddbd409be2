use ash::vk;
use log::{info, warn};

use crate::{
    gpu::{ComputePipelineDesc, Device, HitGroup, LayoutBinding, RayTracingPipelineDesc},
    gpu_scene::{MaterialType, Scene, TableType},
    time::Stopwatch,
};

use super::{
    settings::Integrator,
    shader_loader::ShaderLoader,
    shader_types::{
        push_size, AmbientOcclusionConstants, GeometryConstants, MaterialPathConstants,
        PostConstants, ShadingConstants,
    },
};

/// Identifies a pipeline towards the shader loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PipelineId {
    Trace(Integrator),
    Post,
}

pub const POST_SHADER: &str = "post.comp.spv";

/// File name prefix of an integrator's shaders.
pub fn shader_prefix(integrator: Integrator) -> &'static str {
    match integrator {
        Integrator::Geometry => "geometry",
        Integrator::Shading => "shading",
        Integrator::AmbientOcclusion => "ao",
        Integrator::MaterialPath => "mp",
    }
}

fn display_name(integrator: Integrator) -> &'static str {
    match integrator {
        Integrator::Geometry => "geometry",
        Integrator::Shading => "shading",
        Integrator::AmbientOcclusion => "ao",
        Integrator::MaterialPath => "material path",
    }
}

pub fn table_type(integrator: Integrator) -> TableType {
    match integrator {
        Integrator::Geometry | Integrator::AmbientOcclusion => TableType::Single,
        Integrator::Shading | Integrator::MaterialPath => TableType::Material,
    }
}

fn uses_any_hit(integrator: Integrator) -> bool {
    integrator != Integrator::Shading
}

fn push_constant_size(integrator: Integrator) -> u32 {
    match integrator {
        Integrator::Geometry => push_size::<GeometryConstants>(),
        Integrator::Shading => push_size::<ShadingConstants>(),
        Integrator::AmbientOcclusion => push_size::<AmbientOcclusionConstants>(),
        Integrator::MaterialPath => push_size::<MaterialPathConstants>(),
    }
}

fn shader_files(integrator: Integrator) -> Vec<String> {
    let prefix = shader_prefix(integrator);
    let mut files = vec![
        format!("{prefix}.rgen.spv"),
        format!("{prefix}.rmiss.spv"),
        format!("{prefix}.rchit.spv"),
    ];
    if uses_any_hit(integrator) {
        files.push(format!("{prefix}.rahit.spv"));
    }
    files
}

/// Lets the loader report changes to the shaders of every pipeline.
pub fn register_shaders(loader: &mut ShaderLoader<PipelineId>) {
    for &integrator in Integrator::ALL {
        let files = shader_files(integrator);
        let files: Vec<&str> = files.iter().map(String::as_str).collect();
        loader.register(PipelineId::Trace(integrator), &files);
    }
    loader.register(PipelineId::Post, &[POST_SHADER]);
}

/// Layout of the per frame images of the ray tracing passes: b0 is written this frame, b1
/// holds the previous frame's result.
pub fn create_pass_layout<D: Device>(device: &D) -> anyhow::Result<D::DescriptorSetLayout> {
    create_image_pair_layout(device, vk::ShaderStageFlags::RAYGEN_KHR)
}

/// Layout of the post pass: b0 is the traced input, b1 the output.
pub fn create_post_layout<D: Device>(device: &D) -> anyhow::Result<D::DescriptorSetLayout> {
    create_image_pair_layout(device, vk::ShaderStageFlags::COMPUTE)
}

fn create_image_pair_layout<D: Device>(
    device: &D,
    stages: vk::ShaderStageFlags,
) -> anyhow::Result<D::DescriptorSetLayout> {
    let binding = |binding| LayoutBinding {
        binding,
        ty: vk::DescriptorType::STORAGE_IMAGE,
        count: 1,
        stages,
    };
    device.create_descriptor_set_layout(&[binding(0), binding(1)])
}

/// A ray tracing pipeline and its shader binding table for the current scene.
pub struct TracePipeline<D: Device> {
    pub pipeline: D::Pipeline,
    pub table: Option<D::BindingTable>,
}

pub fn create_trace_pipeline<D: Device>(
    device: &D,
    loader: &ShaderLoader<PipelineId>,
    integrator: Integrator,
    scene_layout: &D::DescriptorSetLayout,
    pass_layout: &D::DescriptorSetLayout,
) -> anyhow::Result<D::Pipeline> {
    let stopwatch = Stopwatch::start();
    let prefix = shader_prefix(integrator);
    let raygen = loader.load(&format!("{prefix}.rgen.spv"))?;
    let miss = loader.load(&format!("{prefix}.rmiss.spv"))?;
    let closest_hit = loader.load(&format!("{prefix}.rchit.spv"))?;
    let any_hit = if uses_any_hit(integrator) {
        Some(loader.load(&format!("{prefix}.rahit.spv"))?)
    } else {
        None
    };

    let hit_groups = match table_type(integrator) {
        TableType::Material => MaterialType::ALL
            .iter()
            .map(|&ty| HitGroup {
                closest_hit: Some(&closest_hit),
                any_hit: any_hit.as_deref(),
                specialization: Some(ty as u32),
            })
            .collect(),
        TableType::Single | TableType::Id => vec![HitGroup {
            closest_hit: Some(&closest_hit),
            any_hit: any_hit.as_deref(),
            specialization: None,
        }],
    };

    let pipeline = device.create_ray_tracing_pipeline(&RayTracingPipelineDesc {
        name: prefix,
        raygen: &raygen,
        miss: &miss,
        hit_groups,
        set_layouts: vec![scene_layout, pass_layout],
        push_constant_size: push_constant_size(integrator),
    })?;
    info!(
        "Recreated {} pipeline in {:.2} ms.",
        display_name(integrator),
        stopwatch.ms()
    );
    Ok(pipeline)
}

pub fn create_post_pipeline<D: Device>(
    device: &D,
    loader: &ShaderLoader<PipelineId>,
    post_layout: &D::DescriptorSetLayout,
) -> anyhow::Result<D::Pipeline> {
    let stopwatch = Stopwatch::start();
    let shader = loader.load(POST_SHADER)?;
    let pipeline = device.create_compute_pipeline(&ComputePipelineDesc {
        name: "post",
        shader: &shader,
        set_layouts: vec![post_layout],
        push_constant_size: push_size::<PostConstants>(),
    })?;
    info!(
        "Recreated post-processing pipeline in {:.2} ms.",
        stopwatch.ms()
    );
    Ok(pipeline)
}

/// Every pipeline the renderer dispatches. A pipeline that failed to build is absent and its
/// pass is skipped.
pub struct Pipelines<D: Device> {
    trace: [Option<TracePipeline<D>>; 4],
    pub post: Option<D::Pipeline>,
}

impl<D: Device> Default for Pipelines<D> {
    fn default() -> Self {
        Self {
            trace: [None, None, None, None],
            post: None,
        }
    }
}

impl<D: Device> Pipelines<D> {
    pub fn trace(&self, integrator: Integrator) -> Option<&TracePipeline<D>> {
        self.trace[integrator as usize].as_ref()
    }

    /// Installs a rebuilt pipeline with a fresh table for `scene`. The replaced pipeline is
    /// returned so the caller can retire it.
    pub fn replace_trace(
        &mut self,
        integrator: Integrator,
        pipeline: D::Pipeline,
        scene: &Scene<D>,
    ) -> Option<TracePipeline<D>> {
        let table = scene.table(table_type(integrator), &pipeline);
        self.trace[integrator as usize].replace(TracePipeline { pipeline, table })
    }

    pub fn replace_post(&mut self, pipeline: D::Pipeline) -> Option<D::Pipeline> {
        self.post.replace(pipeline)
    }

    /// Rebuilds every binding table against `scene`, retiring the old ones on `device`.
    pub fn rebuild_tables(&mut self, device: &D, scene: &Scene<D>) {
        for &integrator in Integrator::ALL {
            let Some(trace) = self.trace[integrator as usize].as_mut() else {
                continue;
            };
            let table = scene.table(table_type(integrator), &trace.pipeline);
            if let Some(old) = std::mem::replace(&mut trace.table, table) {
                device.defer_drop(Box::new(old));
            }
        }
    }
}

/// Builds the pipeline `id` names, logging instead of failing.
pub fn try_create<D: Device>(
    device: &D,
    loader: &ShaderLoader<PipelineId>,
    id: PipelineId,
    layouts: [&D::DescriptorSetLayout; 3],
) -> Option<D::Pipeline> {
    let [scene_layout, pass_layout, post_layout] = layouts;
    let result = match id {
        PipelineId::Trace(integrator) => {
            create_trace_pipeline(device, loader, integrator, scene_layout, pass_layout)
        }
        PipelineId::Post => create_post_pipeline(device, loader, post_layout),
    };
    match result {
        Ok(pipeline) => Some(pipeline),
        Err(error) => {
            warn!("Failed to create {:?} pipeline: {:#}", id, error);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn material_integrators_use_material_tables() {
        assert_eq!(table_type(Integrator::Geometry), TableType::Single);
        assert_eq!(table_type(Integrator::AmbientOcclusion), TableType::Single);
        assert_eq!(table_type(Integrator::Shading), TableType::Material);
        assert_eq!(table_type(Integrator::MaterialPath), TableType::Material);
    }

    #[test]
    fn shading_has_no_any_hit_shader() {
        assert_eq!(
            shader_files(Integrator::Shading),
            vec!["shading.rgen.spv", "shading.rmiss.spv", "shading.rchit.spv"]
        );
        assert_eq!(shader_files(Integrator::MaterialPath).len(), 4);
    }
}
