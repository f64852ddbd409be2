use ash::vk;
use log::warn;
use ultraviolet::{Mat4, Vec4};

use crate::{
    gpu::SamplerConfig,
    scene::pbrt::{
        Encoding, Filter, Id, Instance, LightType, Material, MaterialType as PbrtMaterialType,
        Mesh, Scene, Texture, TextureData, TextureImage, TextureType, Wrap,
    },
};

use super::{
    format::{
        ImageKey, ImageSource, MeshGroup, ObjectTable, PixelData, TextureMaps, Traversal,
        UploadFormat,
    },
    mesh_ref::{MeshFlags, MeshRef},
    types::{DeltaLightType, GpuDeltaLight, GpuMaterial, MaterialType, TextureId, TlasInstance},
};

/// BLAS slots taken by the two top level groups before the first object.
const TOP_LEVEL_GROUPS: usize = 2;

/// Permutes the x and z axes.
fn swap_x_z() -> Mat4 {
    Mat4::new(
        Vec4::new(0.0, 0.0, 1.0, 0.0),
        Vec4::new(0.0, 1.0, 0.0, 0.0),
        Vec4::new(1.0, 0.0, 0.0, 0.0),
        Vec4::new(0.0, 0.0, 0.0, 1.0),
    )
}

pub fn material_type(ty: PbrtMaterialType) -> MaterialType {
    match ty {
        PbrtMaterialType::Conductor => MaterialType::PbrtConductor,
        PbrtMaterialType::Dielectric => MaterialType::PbrtDielectric,
        PbrtMaterialType::Diffuse => MaterialType::PbrtDiffuse,
        PbrtMaterialType::DiffuseTransmission => MaterialType::PbrtDiffuseTransmission,
        PbrtMaterialType::Mix => MaterialType::PbrtMix,
        PbrtMaterialType::CoatedDiffuse => MaterialType::TungstenRoughPlastic,
        PbrtMaterialType::CoatedConductor => MaterialType::TungstenSmoothCoat,
        PbrtMaterialType::Hair => MaterialType::PbrtHair,
        PbrtMaterialType::Interface => MaterialType::PbrtInterface,
        PbrtMaterialType::Measured => MaterialType::PbrtMeasured,
        PbrtMaterialType::Subsurface => MaterialType::PbrtSubsurface,
        PbrtMaterialType::ThinDielectric => MaterialType::PbrtThinDielectric,
    }
}

fn mesh_ref<'a>(scene: &Scene, id: Id<Mesh>, mesh: &'a Mesh) -> MeshRef<'a> {
    let material_type = scene
        .material(mesh.material)
        .map_or(MaterialType::None, |material| material_type(material.ty));

    let mut flags = MeshFlags {
        material_type,
        material_id: mesh.material.id as u32,
        emission: Vec4::new(mesh.emission.x, mesh.emission.y, mesh.emission.z, 0.0),
        flip_v: true,
        double_sided: true,
        ..Default::default()
    };
    if let Some(alpha) = scene.texture(mesh.alpha) {
        if alpha.ty == TextureType::ImageMap {
            flags.alpha_id = mesh.alpha.id as u32;
            flags.alpha_cutoff = 0.25;
        }
    }
    if mesh.is_emissive()
        || matches!(
            material_type,
            MaterialType::PbrtDielectric
                | MaterialType::PbrtThinDielectric
                | MaterialType::PbrtInterface
        )
    {
        flags.double_sided = false;
    }

    MeshRef {
        mesh_to_instance: mesh.mesh_to_instance,
        id: id.id,
        flags,
        positions: &mesh.positions,
        normals: &mesh.normals,
        tangents: &mesh.tangents,
        uvs: &mesh.uvs,
        indices: &mesh.indices,
    }
}

/// Texture slot contents: an inline constant, an image or a procedural texture.
fn texture_slot(scene: &Scene, id: Id<Texture>, maps: &TextureMaps) -> (Vec4, TextureId) {
    let Some(texture) = scene.texture(id) else {
        return (Vec4::zero(), TextureId::NONE);
    };
    match texture.ty {
        TextureType::Constant => {
            let value = match texture.data_type {
                TextureData::Scalar => Vec4::new(texture.scalar, 0.0, 0.0, 0.0),
                TextureData::Spectrum => Vec4::new(
                    texture.spectrum.x,
                    texture.spectrum.y,
                    texture.spectrum.z,
                    0.0,
                ),
            };
            (value, TextureId::constant())
        }
        TextureType::ImageMap => (Vec4::zero(), maps.image_id(id.id as usize)),
        _ => (Vec4::zero(), TextureId::procedural(id.id)),
    }
}

pub fn convert_material(scene: &Scene, material: &Material, maps: &TextureMaps) -> GpuMaterial {
    let mut out = GpuMaterial::default();
    let slot = |id: Id<Texture>| texture_slot(scene, id, maps);

    let roughness = |out: &mut GpuMaterial, first: usize| {
        out.set(first, slot(material.roughness));
        out.set(first + 1, slot(material.uroughness));
        out.set(first + 2, slot(material.vroughness));
        out.parameters[0] = material.remap_roughness as u32;
    };
    let coated = |out: &mut GpuMaterial, first: usize| {
        out.set(first, slot(material.albedo));
        out.set(first + 1, slot(material.g));
        out.set(first + 2, slot(material.thickness));
        out.parameters[1] = material.n_samples as u32;
        out.parameters[2] = material.max_depth as u32;
    };

    match material.ty {
        PbrtMaterialType::Conductor => {
            roughness(&mut out, 0);
            let use_eta_k = material.reflectance.is_invalid();
            if use_eta_k {
                out.set(3, slot(material.eta));
                out.set(4, slot(material.k));
            } else {
                out.set(3, slot(material.reflectance));
            }
            out.parameters[1] = use_eta_k as u32;
        }
        PbrtMaterialType::Dielectric => {
            roughness(&mut out, 0);
            out.set(3, slot(material.eta));
        }
        PbrtMaterialType::ThinDielectric => {
            out.set(0, slot(material.eta));
        }
        PbrtMaterialType::Diffuse => {
            out.set(0, slot(material.reflectance));
        }
        PbrtMaterialType::DiffuseTransmission => {
            out.set(0, slot(material.reflectance));
            out.set(1, slot(material.transmittance));
            out.set(2, slot(material.scale));
        }
        PbrtMaterialType::Mix => {
            out.set(0, slot(material.amount));
            out.parameters[0] = material.a.id as u32;
            out.parameters[1] = material.b.id as u32;
        }
        PbrtMaterialType::CoatedDiffuse => {
            roughness(&mut out, 0);
            coated(&mut out, 3);
            out.set(6, slot(material.reflectance));
        }
        PbrtMaterialType::CoatedConductor => {
            out.set(0, slot(material.conductor_roughness));
            out.set(1, slot(material.conductor_uroughness));
            out.set(2, slot(material.conductor_vroughness));
            out.set(3, slot(material.interface_roughness));
            out.set(4, slot(material.interface_uroughness));
            out.set(5, slot(material.interface_vroughness));
            out.parameters[0] = material.remap_roughness as u32;
            coated(&mut out, 6);

            let use_eta_k = material.reflectance.is_invalid();
            if use_eta_k {
                out.set(9, slot(material.conductor_eta));
                out.set(10, slot(material.conductor_k));
            } else {
                out.set(9, slot(material.reflectance));
            }
            out.parameters[1] = use_eta_k as u32;
        }
        PbrtMaterialType::Hair => {
            if !material.sigma_a.is_invalid() {
                out.set(0, slot(material.sigma_a));
                out.parameters[0] = 0;
            } else if !material.reflectance.is_invalid() {
                out.set(0, slot(material.reflectance));
                out.parameters[0] = 1;
            } else {
                out.set(0, slot(material.eumelanin));
                out.set(1, slot(material.pheomelanin));
                out.parameters[0] = 2;
            }
            out.set(2, slot(material.eta));
            out.set(3, slot(material.beta_m));
            out.set(4, slot(material.beta_n));
            out.set(5, slot(material.alpha));
        }
        PbrtMaterialType::Subsurface => {
            out.set(0, slot(material.eta));
            out.set(1, slot(material.g));
            out.set(2, slot(material.mfp));
            out.set(3, slot(material.reflectance));
            out.set(4, slot(material.sigma_a));
            out.set(5, slot(material.sigma_s));
            out.set(6, slot(material.scale));
        }
        PbrtMaterialType::Interface | PbrtMaterialType::Measured => {}
    }
    out
}

pub fn sampler_config(texture: &Texture) -> SamplerConfig {
    let filter = match texture.filter {
        Filter::Point => vk::Filter::NEAREST,
        _ => vk::Filter::LINEAR,
    };
    let address = match texture.wrap {
        Wrap::Repeat => vk::SamplerAddressMode::REPEAT,
        Wrap::Clamp => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        Wrap::Black => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    };
    SamplerConfig {
        min: filter,
        mag: filter,
        u: address,
        v: address,
        w: address,
    }
}

fn is_emissive_object(scene: &Scene, meshes: &[Id<Mesh>]) -> bool {
    meshes
        .iter()
        .filter_map(|&id| scene.mesh(id))
        .any(Mesh::is_emissive)
}

fn traverse_instance(
    scene: &Scene,
    objects: &ObjectTable,
    instance: &Instance,
    parent_to_world: Mat4,
    out: &mut Traversal,
) {
    let Some(object) = scene.object(instance.object) else {
        warn!("Instance of unknown object {:?}, skipping.", instance.object);
        return;
    };
    let instance_to_world =
        parent_to_world * object.object_to_parent * instance.instance_to_object;

    let slot = instance.object.id as usize + TOP_LEVEL_GROUPS;
    if let Some((address, geometry_index)) = objects.get(slot) {
        let tlas_instance = TlasInstance::new(instance_to_world, geometry_index, address);
        out.instances.push(tlas_instance);
        if is_emissive_object(scene, &object.meshes) {
            out.emissive_instances.push(tlas_instance);
        }
    }

    for child in &object.instances {
        traverse_instance(scene, objects, child, instance_to_world, out);
    }
}

impl UploadFormat for Scene {
    fn has_top_level(&self) -> bool {
        true
    }

    fn object_count(&self) -> usize {
        self.objects.len()
    }

    fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    fn meshes(&self, group: MeshGroup) -> Vec<MeshRef<'_>> {
        let ids: &[Id<Mesh>] = match group {
            MeshGroup::TopLevel { .. } => &self.top_level_meshes,
            MeshGroup::Object(index) => match self.objects.get(index) {
                Some(object) => &object.meshes,
                None => &[],
            },
        };
        ids.iter()
            .filter_map(|&id| self.mesh(id).map(|mesh| (id, mesh)))
            .filter(|(_, mesh)| match group {
                MeshGroup::TopLevel { emissive } => mesh.is_emissive() == emissive,
                MeshGroup::Object(_) => true,
            })
            .map(|(id, mesh)| mesh_ref(self, id, mesh))
            .collect()
    }

    fn traverse(&self, objects: &ObjectTable) -> Traversal {
        let mut out = Traversal::default();
        let to_camera = swap_x_z() * self.camera.world_to_camera;

        if let Some((address, geometry_index)) = objects.get(0) {
            out.instances
                .push(TlasInstance::new(to_camera, geometry_index, address));
        }
        if let Some((address, geometry_index)) = objects.get(1) {
            let instance = TlasInstance::new(to_camera, geometry_index, address);
            out.instances.push(instance);
            out.emissive_instances.push(instance);
        }
        for instance in &self.top_level_instances {
            traverse_instance(self, objects, instance, to_camera, &mut out);
        }
        out
    }

    fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn sampler_config(&self, texture: usize) -> SamplerConfig {
        self.textures
            .get(texture)
            .map(sampler_config)
            .unwrap_or_default()
    }

    fn reserved_samplers(&self) -> Vec<SamplerConfig> {
        let clamp = vk::SamplerAddressMode::CLAMP_TO_EDGE;
        vec![SamplerConfig {
            min: vk::Filter::LINEAR,
            mag: vk::Filter::LINEAR,
            u: clamp,
            v: clamp,
            w: clamp,
        }]
    }

    fn has_image(&self, texture: usize) -> bool {
        self.textures
            .get(texture)
            .is_some_and(|texture| texture.ty == TextureType::ImageMap)
    }

    fn image(&self, key: ImageKey) -> Option<ImageSource<'_>> {
        match key {
            ImageKey::Texture(index) => {
                let texture = self.textures.get(index)?;
                let srgb = texture.encoding == Encoding::Srgb;
                Some(match &texture.image {
                    TextureImage::U8(image) => ImageSource {
                        data: PixelData::U8(&image.data),
                        width: image.width,
                        height: image.height,
                        channels: image.channels,
                        srgb,
                    },
                    TextureImage::F32(image) => ImageSource {
                        data: PixelData::F32(&image.data),
                        width: image.width,
                        height: image.height,
                        channels: image.channels,
                        srgb,
                    },
                })
            }
            ImageKey::Environment(index) => {
                let light = self.lights.get(index)?;
                (light.ty == LightType::Infinite).then_some(ImageSource {
                    data: PixelData::F32(&light.map.data),
                    width: light.map.width,
                    height: light.map.height,
                    channels: light.map.channels,
                    srgb: false,
                })
            }
        }
    }

    fn material_count(&self) -> usize {
        self.materials.len()
    }

    fn material(&self, index: usize, maps: &TextureMaps) -> GpuMaterial {
        self.materials
            .get(index)
            .map(|material| convert_material(self, material, maps))
            .unwrap_or_default()
    }

    fn light_count(&self) -> usize {
        self.lights.len()
    }

    fn delta_lights(&self, _traversal: &Traversal) -> Vec<(Mat4, usize)> {
        self.lights
            .iter()
            .enumerate()
            .filter(|(_, light)| light.ty != LightType::Infinite)
            .map(|(index, _)| (Mat4::identity(), index))
            .collect()
    }

    fn delta_light(&self, _transform: Mat4, index: usize) -> GpuDeltaLight {
        let Some(light) = self.lights.get(index) else {
            return GpuDeltaLight::default();
        };
        let power = light.scale * light.l;
        let direction = light.to - light.from;
        let from = light.from;
        match light.ty {
            LightType::Point => GpuDeltaLight::new(
                DeltaLightType::Point,
                power,
                Vec4::new(from.x, from.y, from.z, 0.0),
                Vec4::zero(),
            ),
            LightType::Spot => GpuDeltaLight::new(
                DeltaLightType::Spot,
                power,
                Vec4::new(from.x, from.y, from.z, light.cone_angle),
                Vec4::new(direction.x, direction.y, direction.z, light.cone_delta_angle),
            ),
            LightType::Distant => GpuDeltaLight::new(
                DeltaLightType::Directional,
                power,
                Vec4::new(direction.x, direction.y, direction.z, 0.0),
                Vec4::zero(),
            ),
            ty => {
                warn!("Unsupported light type {:?}, skipping.", ty);
                GpuDeltaLight {
                    power: power.into(),
                    ..Default::default()
                }
            }
        }
    }

    fn environment_lights(&self) -> Vec<usize> {
        self.lights
            .iter()
            .enumerate()
            .filter(|(_, light)| light.ty == LightType::Infinite)
            .map(|(index, _)| index)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use ultraviolet::Vec3;

    use super::*;
    use crate::scene::pbrt::{Light, Object};

    fn triangle(emission: Vec3) -> Mesh {
        Mesh {
            emission,
            positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            indices: vec![0, 1, 2],
            ..Default::default()
        }
    }

    fn constant(value: f32) -> Texture {
        Texture {
            ty: TextureType::Constant,
            data_type: TextureData::Scalar,
            scalar: value,
            ..Default::default()
        }
    }

    #[test]
    fn top_level_groups_split_by_emission() {
        let scene = Scene {
            meshes: vec![triangle(Vec3::zero()), triangle(Vec3::one())],
            top_level_meshes: vec![Id::new(0, 0), Id::new(0, 1), Id::INVALID],
            ..Default::default()
        };
        let plain = scene.meshes(MeshGroup::TopLevel { emissive: false });
        let emissive = scene.meshes(MeshGroup::TopLevel { emissive: true });
        assert_eq!(plain.len(), 1);
        assert_eq!(emissive.len(), 1);
        assert_eq!(emissive[0].id, 1);
        assert!(!emissive[0].flags.double_sided);
        assert!(plain[0].flags.double_sided);
        assert!(plain[0].flags.flip_v);
    }

    #[test]
    fn dielectric_meshes_are_single_sided() {
        let mut mesh = triangle(Vec3::zero());
        mesh.material = Id::new(0, 0);
        let scene = Scene {
            meshes: vec![mesh],
            materials: vec![Material {
                ty: PbrtMaterialType::Dielectric,
                ..Default::default()
            }],
            objects: vec![Object {
                meshes: vec![Id::new(0, 0)],
                ..Default::default()
            }],
            ..Default::default()
        };
        let meshes = scene.meshes(MeshGroup::Object(0));
        assert_eq!(meshes[0].flags.material_type, MaterialType::PbrtDielectric);
        assert_eq!(meshes[0].flags.material_id, 0);
        assert!(!meshes[0].flags.double_sided);
    }

    #[test]
    fn conductor_uses_eta_k_without_reflectance() {
        let scene = Scene {
            textures: vec![constant(0.5), constant(2.0)],
            ..Default::default()
        };
        let material = Material {
            ty: PbrtMaterialType::Conductor,
            roughness: Id::new(0, 0),
            eta: Id::new(0, 1),
            remap_roughness: true,
            ..Default::default()
        };
        let gpu = convert_material(&scene, &material, &TextureMaps::default());
        assert_eq!(gpu.spectra[0], [0.5, 0.0, 0.0, 0.0]);
        assert_eq!(gpu.textures[0], TextureId::constant());
        assert_eq!(gpu.spectra[3], [2.0, 0.0, 0.0, 0.0]);
        assert_eq!(gpu.textures[4], TextureId::NONE);
        assert_eq!(gpu.parameters[..2], [1, 1]);
    }

    #[test]
    fn image_textures_respect_slot_limits() {
        let scene = Scene {
            textures: vec![
                Texture {
                    ty: TextureType::ImageMap,
                    ..Default::default()
                },
                Texture {
                    ty: TextureType::ImageMap,
                    ..Default::default()
                },
                Texture {
                    ty: TextureType::Checkerboard,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let maps = TextureMaps {
            image: vec![4, 2048, u64::MAX],
            sampler: vec![1, 0, 0],
        };
        assert_eq!(
            texture_slot(&scene, Id::new(0, 0), &maps).1,
            TextureId::image(4, 1)
        );
        assert_eq!(texture_slot(&scene, Id::new(0, 1), &maps).1, TextureId::NONE);
        assert_eq!(
            texture_slot(&scene, Id::new(0, 2), &maps).1,
            TextureId::procedural(2)
        );
        assert_eq!(texture_slot(&scene, Id::INVALID, &maps).1, TextureId::NONE);
    }

    #[test]
    fn lights_and_environment_maps() {
        let scene = Scene {
            lights: vec![
                Light {
                    ty: LightType::Spot,
                    scale: Vec3::broadcast(2.0),
                    l: Vec3::one(),
                    from: Vec3::new(0.0, 1.0, 0.0),
                    to: Vec3::zero(),
                    cone_angle: 30.0,
                    cone_delta_angle: 5.0,
                    ..Default::default()
                },
                Light {
                    ty: LightType::Infinite,
                    ..Default::default()
                },
                Light {
                    ty: LightType::Goniometric,
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let delta = scene.delta_lights(&Traversal::default());
        assert_eq!(
            delta.iter().map(|(_, i)| *i).collect::<Vec<_>>(),
            vec![0, 2]
        );
        assert_eq!(scene.environment_lights(), vec![1]);

        let spot = scene.delta_light(Mat4::identity(), 0);
        assert_eq!(spot.ty, DeltaLightType::Spot as u32);
        assert_eq!(spot.power, [2.0; 3]);
        assert_eq!(spot.params[0], [0.0, 1.0, 0.0, 30.0]);
        assert_eq!(spot.params[1], [0.0, -1.0, 0.0, 5.0]);

        let unsupported = scene.delta_light(Mat4::identity(), 2);
        assert_eq!(unsupported.ty, DeltaLightType::None as u32);
    }

    #[test]
    fn every_instance_of_an_emissive_object_is_emissive() {
        let scene = Scene {
            meshes: vec![triangle(Vec3::zero()), triangle(Vec3::one())],
            objects: vec![Object {
                meshes: vec![Id::new(0, 0), Id::new(0, 1)],
                ..Default::default()
            }],
            top_level_instances: vec![
                Instance {
                    instance_to_object: Mat4::identity(),
                    object: Id::new(0, 0),
                },
                Instance {
                    instance_to_object: Mat4::from_translation(Vec3::new(0.0, 2.0, 0.0)),
                    object: Id::new(0, 0),
                },
            ],
            ..Default::default()
        };
        let blases = [None, None, Some(0x100)];
        let geometry_index = [0, 0, 0];
        let traversal = scene.traverse(&ObjectTable {
            blas_addresses: &blases,
            geometry_index: &geometry_index,
        });

        assert_eq!(traversal.instances.len(), 2);
        assert_eq!(traversal.emissive_instances, traversal.instances);
    }

    #[test]
    fn objects_without_blas_still_visit_children() {
        let scene = Scene {
            meshes: vec![triangle(Vec3::zero())],
            objects: vec![
                Object {
                    instances: vec![Instance {
                        instance_to_object: Mat4::identity(),
                        object: Id::new(0, 1),
                    }],
                    ..Default::default()
                },
                Object {
                    meshes: vec![Id::new(0, 0)],
                    ..Default::default()
                },
            ],
            top_level_instances: vec![Instance {
                instance_to_object: Mat4::identity(),
                object: Id::new(0, 0),
            }],
            ..Default::default()
        };
        let blases = [None, None, None, Some(0x200)];
        let geometry_index = [0, 0, 0, 0];
        let traversal = scene.traverse(&ObjectTable {
            blas_addresses: &blases,
            geometry_index: &geometry_index,
        });

        assert_eq!(traversal.instances.len(), 1);
        assert_eq!(traversal.instances[0].acceleration_structure_reference, 0x200);
        assert!(traversal.emissive_instances.is_empty());
    }

    #[test]
    fn traversal_composes_nested_instances() {
        let translate = |x: f32| Mat4::from_translation(Vec3::new(x, 0.0, 0.0));
        let scene = Scene {
            meshes: vec![triangle(Vec3::zero()), triangle(Vec3::one())],
            objects: vec![
                Object {
                    meshes: vec![Id::new(0, 0)],
                    instances: vec![Instance {
                        instance_to_object: translate(10.0),
                        object: Id::new(0, 1),
                    }],
                    object_to_parent: translate(1.0),
                },
                Object {
                    meshes: vec![Id::new(0, 1)],
                    ..Default::default()
                },
            ],
            top_level_instances: vec![Instance {
                instance_to_object: translate(100.0),
                object: Id::new(0, 0),
            }],
            ..Default::default()
        };
        let blases = [None, None, Some(0x100), Some(0x200)];
        let geometry_index = [0, 0, 0, 1];
        let traversal = scene.traverse(&ObjectTable {
            blas_addresses: &blases,
            geometry_index: &geometry_index,
        });

        assert_eq!(traversal.instances.len(), 2);
        assert_eq!(traversal.emissive_instances.len(), 1);

        let outer = &traversal.instances[0];
        let inner = &traversal.instances[1];
        assert_eq!(outer.acceleration_structure_reference, 0x100);
        assert_eq!(inner.acceleration_structure_reference, 0x200);
        assert_eq!(inner.custom_index(), 1);
        assert_eq!(inner.sbt_offset(), 1);
        assert_eq!(traversal.emissive_instances[0], *inner);

        // The identity camera maps x to z.
        assert_eq!(outer.transform[2][3], 101.0);
        assert_eq!(inner.transform[2][3], 111.0);
    }
}
