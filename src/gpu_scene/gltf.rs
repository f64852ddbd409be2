use ultraviolet::{Mat4, Vec3, Vec4};

use crate::{
    gpu::SamplerConfig,
    scene::gltf::{LightType, Material, Node, Scene},
};

use super::{
    format::{
        ImageKey, ImageSource, MeshGroup, ObjectTable, PixelData, TextureMaps, Traversal,
        UploadFormat,
    },
    mesh_ref::{MeshFlags, MeshRef},
    types::{DeltaLightType, GpuDeltaLight, GpuMaterial, MaterialType, TextureId, TlasInstance},
};

fn remap(texture: Option<usize>, has_constant: bool, maps: &TextureMaps) -> TextureId {
    match texture {
        Some(texture) => maps.image_id(texture),
        None if has_constant => TextureId::constant(),
        None => TextureId::NONE,
    }
}

pub fn convert_material(material: &Material, maps: &TextureMaps) -> GpuMaterial {
    let mut out = GpuMaterial::default();
    out.textures[0] = remap(material.base_color_texture, true, maps);
    out.textures[1] = remap(material.emissive_texture, true, maps);
    out.textures[2] = remap(material.metallic_roughness_texture, true, maps);
    out.textures[3] = remap(material.normal_texture, false, maps);
    out.spectra[0] = material.base_color.into();
    out.spectra[1] = [
        material.emissive.x,
        material.emissive.y,
        material.emissive.z,
        0.0,
    ];
    out.spectra[2] = [material.metallic, material.roughness, 0.0, 0.0];
    out.spectra[3] = [material.normal_scale, material.alpha_cutoff, 0.0, 0.0];
    out
}

fn traverse_node(
    scene: &Scene,
    objects: &ObjectTable,
    node: &Node,
    parent_to_world: Mat4,
    out: &mut Traversal,
) {
    let node_to_world = parent_to_world * node.node_to_parent;

    if let Some(light) = node.light {
        out.lights.push((node_to_world, light));
    }

    if let Some(mesh) = node.mesh {
        if let Some((address, geometry_index)) = objects.get(mesh) {
            let instance = TlasInstance::new(node_to_world, geometry_index, address);
            out.instances.push(instance);

            let emissive = scene.meshes.get(mesh).is_some_and(|mesh| {
                mesh.primitives
                    .iter()
                    .filter_map(|primitive| scene.materials.get(primitive.material?))
                    .any(Material::is_emissive)
            });
            if emissive {
                out.emissive_instances.push(instance);
            }
        }
    }

    for child in node.children.iter().filter_map(|&child| scene.nodes.get(child)) {
        traverse_node(scene, objects, child, node_to_world, out);
    }
}

impl UploadFormat for Scene {
    fn has_top_level(&self) -> bool {
        false
    }

    fn object_count(&self) -> usize {
        self.meshes.len()
    }

    fn mesh_count(&self) -> usize {
        self.meshes.len()
    }

    fn meshes(&self, group: MeshGroup) -> Vec<MeshRef<'_>> {
        let MeshGroup::Object(index) = group else {
            return Vec::new();
        };
        let Some(mesh) = self.meshes.get(index) else {
            return Vec::new();
        };
        mesh.primitives
            .iter()
            .map(|primitive| {
                let mut flags = MeshFlags {
                    material_type: MaterialType::Gltf,
                    flip_bitangent: primitive.flip_bitangent,
                    ..Default::default()
                };
                if let Some((id, material)) = primitive
                    .material
                    .and_then(|id| Some((id, self.materials.get(id)?)))
                {
                    flags.material_id = id as u32;
                    flags.double_sided = material.double_sided;
                    if material.alpha_cutoff != 0.0 {
                        flags.alpha_cutoff = material.alpha_cutoff;
                        if let Some(texture) = material.base_color_texture {
                            flags.alpha_id = texture as u32;
                        }
                    }
                }
                MeshRef {
                    mesh_to_instance: Mat4::identity(),
                    id: index as u64,
                    flags,
                    positions: &primitive.positions,
                    normals: &primitive.normals,
                    tangents: &primitive.tangents,
                    uvs: &primitive.uvs,
                    indices: &primitive.indices,
                }
            })
            .collect()
    }

    fn traverse(&self, objects: &ObjectTable) -> Traversal {
        let mut out = Traversal::default();
        for node in self
            .top_level_nodes
            .iter()
            .filter_map(|&node| self.nodes.get(node))
        {
            traverse_node(self, objects, node, Mat4::identity(), &mut out);
        }
        out
    }

    fn texture_count(&self) -> usize {
        self.textures.len()
    }

    fn sampler_config(&self, _texture: usize) -> SamplerConfig {
        SamplerConfig::default()
    }

    fn has_image(&self, texture: usize) -> bool {
        texture < self.textures.len()
    }

    fn image(&self, key: ImageKey) -> Option<ImageSource<'_>> {
        let ImageKey::Texture(index) = key else {
            return None;
        };
        let texture = self.textures.get(index)?;
        Some(ImageSource {
            data: PixelData::U8(&texture.data),
            width: texture.width,
            height: texture.height,
            channels: texture.components,
            srgb: true,
        })
    }

    fn material_count(&self) -> usize {
        self.materials.len()
    }

    fn material(&self, index: usize, maps: &TextureMaps) -> GpuMaterial {
        self.materials
            .get(index)
            .map(|material| convert_material(material, maps))
            .unwrap_or_default()
    }

    fn light_count(&self) -> usize {
        self.lights.len()
    }

    fn delta_lights(&self, traversal: &Traversal) -> Vec<(Mat4, usize)> {
        traversal.lights.clone()
    }

    fn delta_light(&self, transform: Mat4, index: usize) -> GpuDeltaLight {
        let Some(light) = self.lights.get(index) else {
            return GpuDeltaLight::default();
        };
        let location = transform.cols[3].xyz();
        let direction = transform.transform_vec3(Vec3::new(0.0, 0.0, -1.0));
        let power = light.color * light.intensity;
        let point = |w: f32| Vec4::new(location.x, location.y, location.z, w);
        let towards = |w: f32| Vec4::new(direction.x, direction.y, direction.z, w);
        match light.ty {
            LightType::Point => {
                GpuDeltaLight::new(DeltaLightType::Point, power, point(0.0), Vec4::zero())
            }
            LightType::Spot => GpuDeltaLight::new(
                DeltaLightType::Spot,
                power,
                point(light.inner_cone_angle),
                towards(light.outer_cone_angle),
            ),
            LightType::Directional => GpuDeltaLight::new(
                DeltaLightType::Directional,
                power,
                towards(0.0),
                Vec4::zero(),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scene::gltf::{Light, Mesh, Primitive, Texture};

    fn primitive(material: Option<usize>) -> Primitive {
        Primitive {
            positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
            indices: vec![0, 1, 2],
            material,
            ..Default::default()
        }
    }

    fn scene() -> Scene {
        Scene {
            meshes: vec![
                Mesh {
                    primitives: vec![primitive(Some(0)), primitive(None)],
                },
                Mesh {
                    primitives: vec![primitive(Some(1))],
                },
            ],
            materials: vec![
                Material {
                    alpha_cutoff: 0.5,
                    double_sided: true,
                    base_color_texture: Some(0),
                    ..Default::default()
                },
                Material {
                    emissive: Vec3::one(),
                    ..Default::default()
                },
            ],
            textures: vec![Texture {
                data: vec![255; 4],
                width: 1,
                height: 1,
                components: 4,
            }],
            lights: vec![Light {
                ty: LightType::Spot,
                intensity: 3.0,
                inner_cone_angle: 0.1,
                outer_cone_angle: 0.2,
                ..Default::default()
            }],
            nodes: vec![
                Node {
                    node_to_parent: Mat4::from_translation(Vec3::new(0.0, 5.0, 0.0)),
                    mesh: Some(0),
                    children: vec![1],
                    ..Default::default()
                },
                Node {
                    mesh: Some(1),
                    light: Some(0),
                    ..Default::default()
                },
            ],
            top_level_nodes: vec![0],
        }
    }

    #[test]
    fn primitives_share_the_mesh_id() {
        let scene = scene();
        let meshes = scene.meshes(MeshGroup::Object(0));
        assert_eq!(meshes.len(), 2);
        assert!(meshes.iter().all(|mesh| mesh.id == 0));
        assert_eq!(meshes[0].flags.material_type, MaterialType::Gltf);
        assert_eq!(meshes[0].flags.alpha_id, 0);
        assert_eq!(meshes[0].flags.alpha_cutoff, 0.5);
        assert!(meshes[0].flags.double_sided);
        assert_eq!(meshes[1].flags.material_id, u32::MAX);
        assert!(scene.meshes(MeshGroup::TopLevel { emissive: false }).is_empty());
    }

    #[test]
    fn missing_textures_fall_back_to_constants() {
        let material = Material::default();
        let gpu = convert_material(&material, &TextureMaps::default());
        assert_eq!(gpu.textures[0], TextureId::constant());
        assert_eq!(gpu.textures[3], TextureId::NONE);

        let textured = Material {
            base_color_texture: Some(0),
            ..Default::default()
        };
        let maps = TextureMaps {
            image: vec![0],
            sampler: vec![0],
        };
        assert_eq!(
            convert_material(&textured, &maps).textures[0],
            TextureId::image(0, 0)
        );
    }

    #[test]
    fn traversal_collects_lights_and_emissive_meshes() {
        let scene = scene();
        let blases = [Some(0x10), Some(0x20)];
        let traversal = scene.traverse(&ObjectTable {
            blas_addresses: &blases,
            geometry_index: &[0, 2],
        });
        assert_eq!(traversal.instances.len(), 2);
        assert_eq!(traversal.emissive_instances.len(), 1);
        assert_eq!(traversal.emissive_instances[0].custom_index(), 2);
        assert_eq!(traversal.instances[1].transform[1][3], 5.0);

        assert_eq!(traversal.lights.len(), 1);
        let (transform, index) = traversal.lights[0];
        let light = scene.delta_light(transform, index);
        assert_eq!(light.ty, DeltaLightType::Spot as u32);
        assert_eq!(light.power, [3.0; 3]);
        assert_eq!(light.params[0], [0.0, 5.0, 0.0, 0.1]);
        assert_eq!(light.params[1], [0.0, 0.0, -1.0, 0.2]);
    }

    #[test]
    fn skipped_blases_produce_no_instances() {
        let scene = scene();
        let blases = [None, Some(0x20)];
        let traversal = scene.traverse(&ObjectTable {
            blas_addresses: &blases,
            geometry_index: &[0, 2],
        });
        assert_eq!(traversal.instances.len(), 1);
    }
}
