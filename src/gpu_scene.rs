//! GPU resident scene: acceleration structures, geometry, materials, textures and lights,
//! bound through one descriptor set.

pub mod format;
mod gltf;
pub mod mesh_ref;
mod pbrt;
pub mod resources;
pub mod types;
mod upload;

use std::{collections::HashMap, sync::Arc};

use ash::vk;

use crate::{
    gpu::{DescriptorWrite, Device, LayoutBinding, SamplerConfig},
    scene::CpuScene,
    time::Stopwatch,
};

pub use self::{
    format::{TextureMaps, UploadFormat},
    types::{CpuGeometryReference, MaterialType, MAX_IMAGES, MAX_SAMPLERS},
};

pub const TLAS_BINDING: u32 = 0;
pub const EMISSIVE_TLAS_BINDING: u32 = 1;
pub const GEOMETRY_BINDING: u32 = 2;
pub const MATERIALS_BINDING: u32 = 3;
pub const ENVIRONMENT_BINDING: u32 = 4;
pub const IMAGES_BINDING: u32 = 5;
pub const SAMPLERS_BINDING: u32 = 6;
pub const LIGHTS_BINDING: u32 = 7;

/// How geometry references map to hit groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    /// Every geometry uses the one hit group after raygen and miss.
    Single,
    /// One hit group per material type.
    Material,
    /// One hit group per geometry reference.
    Id,
}

/// Counts of what a scene holds, for the UI and the logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SceneStats {
    pub blases: usize,
    pub geometry_references: usize,
    pub images: usize,
    pub samplers: usize,
    pub materials: usize,
    pub lights: usize,
    pub instances: usize,
    pub emissive_instances: usize,
}

pub struct Scene<D: Device> {
    device: Arc<D>,
    layout: D::DescriptorSetLayout,
    set: D::DescriptorSet,

    tlas: Option<D::AccelerationStructure>,
    emissive_tlas: Option<D::AccelerationStructure>,
    instance_count: usize,
    emissive_instance_count: usize,

    object_blases: Vec<Option<D::AccelerationStructure>>,
    object_to_geometry_index: Vec<u64>,
    geometry_buffers: Vec<Option<D::Buffer>>,
    cpu_geometry_references: Vec<CpuGeometryReference>,
    geometry_references: Option<D::Buffer>,

    images: Vec<Option<D::Image>>,
    samplers: Vec<D::Sampler>,
    sampler_slots: HashMap<SamplerConfig, u64>,
    texture_maps: TextureMaps,

    materials: Option<D::Buffer>,
    material_count: usize,
    lights: Option<D::Buffer>,
    light_count: usize,
    environment_map: Option<D::Image>,
}

impl<D: Device> Scene<D> {
    /// The scene descriptor set layout, shared by every pipeline tracing the scene.
    pub fn create_layout(device: &D) -> anyhow::Result<D::DescriptorSetLayout> {
        let stages = vk::ShaderStageFlags::RAYGEN_KHR
            | vk::ShaderStageFlags::CLOSEST_HIT_KHR
            | vk::ShaderStageFlags::ANY_HIT_KHR
            | vk::ShaderStageFlags::MISS_KHR;
        let binding = |binding, ty, count, stages| LayoutBinding {
            binding,
            ty,
            count,
            stages,
        };
        device.create_descriptor_set_layout(&[
            binding(
                TLAS_BINDING,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                1,
                vk::ShaderStageFlags::RAYGEN_KHR,
            ),
            binding(
                EMISSIVE_TLAS_BINDING,
                vk::DescriptorType::ACCELERATION_STRUCTURE_KHR,
                1,
                stages,
            ),
            binding(GEOMETRY_BINDING, vk::DescriptorType::STORAGE_BUFFER, 1, stages),
            binding(MATERIALS_BINDING, vk::DescriptorType::STORAGE_BUFFER, 1, stages),
            binding(
                ENVIRONMENT_BINDING,
                vk::DescriptorType::SAMPLED_IMAGE,
                1,
                stages,
            ),
            binding(
                IMAGES_BINDING,
                vk::DescriptorType::SAMPLED_IMAGE,
                MAX_IMAGES as u32,
                stages,
            ),
            binding(
                SAMPLERS_BINDING,
                vk::DescriptorType::SAMPLER,
                MAX_SAMPLERS as u32,
                stages,
            ),
            binding(LIGHTS_BINDING, vk::DescriptorType::STORAGE_BUFFER, 1, stages),
        ])
    }

    /// A scene without any geometry. Tracing it only hits the miss shader.
    pub fn empty(device: Arc<D>, layout: D::DescriptorSetLayout) -> anyhow::Result<Self> {
        let set = device.create_descriptor_set(&layout)?;
        Ok(Self {
            device,
            layout,
            set,
            tlas: None,
            emissive_tlas: None,
            instance_count: 0,
            emissive_instance_count: 0,
            object_blases: Vec::new(),
            object_to_geometry_index: Vec::new(),
            geometry_buffers: Vec::new(),
            cpu_geometry_references: Vec::new(),
            geometry_references: None,
            images: Vec::new(),
            samplers: Vec::new(),
            sampler_slots: HashMap::new(),
            texture_maps: TextureMaps::default(),
            materials: None,
            material_count: 0,
            lights: None,
            light_count: 0,
            environment_map: None,
        })
    }

    /// Uploads a parsed scene. Resources that do not fit are skipped with a warning, so only
    /// descriptor set creation can fail.
    pub async fn load(
        device: Arc<D>,
        layout: D::DescriptorSetLayout,
        cpu: CpuScene,
        parallelism: usize,
    ) -> anyhow::Result<Self> {
        let mut scene = Self::empty(device, layout)?;
        match cpu {
            CpuScene::Pbrt(cpu) => scene.upload(Arc::new(cpu), parallelism).await?,
            CpuScene::Gltf(cpu) => scene.upload(Arc::new(cpu), parallelism).await?,
        }
        Ok(scene)
    }

    pub fn set(&self) -> &D::DescriptorSet {
        &self.set
    }

    pub fn has_environment_map(&self) -> bool {
        self.environment_map.is_some()
    }

    pub fn geometry_references(&self) -> &[CpuGeometryReference] {
        &self.cpu_geometry_references
    }

    pub fn object_to_geometry_index(&self) -> &[u64] {
        &self.object_to_geometry_index
    }

    pub fn object_blases(&self) -> &[Option<D::AccelerationStructure>] {
        &self.object_blases
    }

    pub fn tlas(&self) -> Option<&D::AccelerationStructure> {
        self.tlas.as_ref()
    }

    pub fn emissive_tlas(&self) -> Option<&D::AccelerationStructure> {
        self.emissive_tlas.as_ref()
    }

    pub fn images(&self) -> &[Option<D::Image>] {
        &self.images
    }

    pub fn samplers(&self) -> &[D::Sampler] {
        &self.samplers
    }

    pub fn texture_maps(&self) -> &TextureMaps {
        &self.texture_maps
    }

    pub fn materials_buffer(&self) -> Option<&D::Buffer> {
        self.materials.as_ref()
    }

    pub fn lights_buffer(&self) -> Option<&D::Buffer> {
        self.lights.as_ref()
    }

    pub fn geometry_reference_buffer(&self) -> Option<&D::Buffer> {
        self.geometry_references.as_ref()
    }

    pub fn stats(&self) -> SceneStats {
        SceneStats {
            blases: self.object_blases.iter().flatten().count(),
            geometry_references: self.cpu_geometry_references.len(),
            images: self.images.iter().flatten().count(),
            samplers: self.samplers.len(),
            materials: self.material_count,
            lights: self.light_count,
            instances: self.instance_count,
            emissive_instances: self.emissive_instance_count,
        }
    }

    /// Hit group index of every geometry reference for `ty`. Groups 0 and 1 are raygen and
    /// miss.
    pub fn hit_groups(&self, ty: TableType) -> Vec<u32> {
        self.cpu_geometry_references
            .iter()
            .enumerate()
            .map(|(i, reference)| match ty {
                TableType::Single => 2,
                TableType::Material => 2 + reference.material_type as u32,
                TableType::Id => 2 + i as u32,
            })
            .collect()
    }

    /// Builds the shader binding table of `pipeline` for this scene.
    pub fn table(&self, ty: TableType, pipeline: &D::Pipeline) -> Option<D::BindingTable> {
        let stopwatch = Stopwatch::start();
        match self
            .device
            .create_binding_table(pipeline, &self.hit_groups(ty))
        {
            Ok(table) => {
                log::info!("Created shader binding table in {:.2} ms.", stopwatch.ms());
                Some(table)
            }
            Err(error) => {
                log::warn!("Failed to create {:?} shader binding table: {}", ty, error);
                None
            }
        }
    }

    /// Replaces the descriptor set with one pointing at the current resources. The old set
    /// stays alive until frames using it have retired.
    fn recreate_set(&mut self) -> anyhow::Result<()> {
        let stopwatch = Stopwatch::start();
        let set = self.device.create_descriptor_set(&self.layout)?;

        let mut writes: Vec<DescriptorWrite<D>> = Vec::new();
        if let Some(tlas) = &self.tlas {
            writes.push(DescriptorWrite::AccelerationStructure {
                binding: TLAS_BINDING,
                accel: tlas,
            });
        }
        if let Some(tlas) = &self.emissive_tlas {
            writes.push(DescriptorWrite::AccelerationStructure {
                binding: EMISSIVE_TLAS_BINDING,
                accel: tlas,
            });
        }
        for (binding, buffer) in [
            (GEOMETRY_BINDING, &self.geometry_references),
            (MATERIALS_BINDING, &self.materials),
            (LIGHTS_BINDING, &self.lights),
        ] {
            if let Some(buffer) = buffer {
                writes.push(DescriptorWrite::StorageBuffer { binding, buffer });
            }
        }
        if let Some(image) = &self.environment_map {
            writes.push(DescriptorWrite::SampledImage {
                binding: ENVIRONMENT_BINDING,
                array_element: 0,
                image,
            });
        }
        for (i, image) in self.images.iter().enumerate().take(MAX_IMAGES as usize) {
            if let Some(image) = image {
                writes.push(DescriptorWrite::SampledImage {
                    binding: IMAGES_BINDING,
                    array_element: i as u32,
                    image,
                });
            }
        }
        for (i, sampler) in self.samplers.iter().enumerate().take(MAX_SAMPLERS as usize) {
            writes.push(DescriptorWrite::Sampler {
                binding: SAMPLERS_BINDING,
                array_element: i as u32,
                sampler,
            });
        }
        self.device.update_descriptor_set(&set, &writes);

        let old = std::mem::replace(&mut self.set, set);
        self.device.defer_drop(Box::new(old));
        log::info!("Wrote descriptor set in {:.2} ms.", stopwatch.ms());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use ultraviolet::Vec4;

    use super::{types::GeometryFlags, *};
    use crate::gpu::host::HostDevice;

    fn reference(material_type: MaterialType) -> CpuGeometryReference {
        CpuGeometryReference {
            vertex_address: 0,
            index_address: 0,
            flags: GeometryFlags::default(),
            material_type,
            material_id: 0,
            alpha_texture_id: u32::MAX,
            alpha_cutoff: 0.0,
            emission: Vec4::zero(),
        }
    }

    fn scene() -> Scene<HostDevice> {
        let device = Arc::new(HostDevice::new(1024, 1024, 2));
        let layout = Scene::create_layout(device.as_ref()).unwrap();
        let mut scene = Scene::empty(device, layout).unwrap();
        scene.cpu_geometry_references = vec![
            reference(MaterialType::Gltf),
            reference(MaterialType::PbrtDiffuse),
            reference(MaterialType::None),
        ];
        scene
    }

    #[test]
    fn hit_groups_per_table_type() {
        let scene = scene();
        assert_eq!(scene.hit_groups(TableType::Single), vec![2, 2, 2]);
        assert_eq!(scene.hit_groups(TableType::Material), vec![3, 6, 2]);
        assert_eq!(scene.hit_groups(TableType::Id), vec![2, 3, 4]);
    }

    #[test]
    fn empty_scene_binds_nothing() {
        let device = Arc::new(HostDevice::new(0, 0, 2));
        let layout = Scene::create_layout(device.as_ref()).unwrap();
        let scene = Scene::empty(device, layout).unwrap();
        assert_eq!(scene.stats(), SceneStats::default());
        assert!(!scene.has_environment_map());
        assert_eq!(scene.set().bound_count(TLAS_BINDING), 0);
        assert!(scene.hit_groups(TableType::Material).is_empty());
    }
}
