//! glTF 2.0 scene schema and its parser.

use std::path::Path;

use ::gltf::{
    image::Format,
    khr_lights_punctual::Kind,
    material::AlphaMode,
    mesh::{util::ReadIndices, Mode},
};
use ultraviolet::{Mat4, Vec3, Vec4};

use super::{CpuScene, ParseError, SceneParser};

#[derive(Debug, Clone)]
pub struct Node {
    pub node_to_parent: Mat4,
    pub mesh: Option<usize>,
    pub light: Option<usize>,
    pub children: Vec<usize>,
}

impl Default for Node {
    fn default() -> Self {
        Self {
            node_to_parent: Mat4::identity(),
            mesh: None,
            light: None,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Primitive {
    pub positions: Vec<f32>,
    pub normals: Vec<f32>,
    pub tangents: Vec<f32>,
    pub uvs: Vec<f32>,
    pub indices: Vec<u32>,
    pub material: Option<usize>,
    /// Set when any tangent has a negative handedness.
    pub flip_bitangent: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Mesh {
    pub primitives: Vec<Primitive>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightType {
    #[default]
    Point,
    Spot,
    Directional,
}

#[derive(Debug, Clone)]
pub struct Light {
    pub ty: LightType,
    pub color: Vec3,
    pub intensity: f32,
    pub range: f32,
    pub inner_cone_angle: f32,
    pub outer_cone_angle: f32,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            ty: LightType::Point,
            color: Vec3::one(),
            intensity: 1.0,
            range: 0.0,
            inner_cone_angle: 0.0,
            outer_cone_angle: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Material {
    /// Zero for opaque materials.
    pub alpha_cutoff: f32,
    pub double_sided: bool,

    pub base_color: Vec4,
    pub base_color_texture: Option<usize>,

    pub metallic: f32,
    pub roughness: f32,
    pub metallic_roughness_texture: Option<usize>,

    pub normal_scale: f32,
    pub normal_texture: Option<usize>,

    pub emissive: Vec3,
    pub emissive_texture: Option<usize>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            alpha_cutoff: 0.0,
            double_sided: false,
            base_color: Vec4::one(),
            base_color_texture: None,
            metallic: 1.0,
            roughness: 1.0,
            metallic_roughness_texture: None,
            normal_scale: 1.0,
            normal_texture: None,
            emissive: Vec3::zero(),
            emissive_texture: None,
        }
    }
}

impl Material {
    pub fn is_emissive(&self) -> bool {
        self.emissive_texture.is_some() || self.emissive != Vec3::zero()
    }
}

/// Decoded 8 bit texture data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Texture {
    pub data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub components: u32,
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub meshes: Vec<Mesh>,
    pub lights: Vec<Light>,
    pub textures: Vec<Texture>,
    pub materials: Vec<Material>,
    pub nodes: Vec<Node>,
    pub top_level_nodes: Vec<usize>,
}

pub struct GltfParser;

impl SceneParser for GltfParser {
    fn extensions(&self) -> &[&'static str] {
        &["gltf", "glb"]
    }

    fn parse(&self, path: &Path) -> Result<CpuScene, ParseError> {
        let (document, buffers, images) =
            ::gltf::import(path).map_err(|source| ParseError::Gltf {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(CpuScene::Gltf(convert(&document, &buffers, &images)))
    }
}

/// Converts an imported document into the flat scene schema.
pub fn convert(
    document: &::gltf::Document,
    buffers: &[::gltf::buffer::Data],
    images: &[::gltf::image::Data],
) -> Scene {
    let mut scene = Scene {
        meshes: document
            .meshes()
            .map(|mesh| load_mesh(&mesh, buffers))
            .collect(),
        textures: document
            .textures()
            .map(|texture| {
                images
                    .get(texture.source().index())
                    .map(load_texture)
                    .unwrap_or_default()
            })
            .collect(),
        materials: document.materials().map(|m| load_material(&m)).collect(),
        lights: document
            .lights()
            .map(|lights| lights.map(|l| load_light(&l)).collect())
            .unwrap_or_default(),
        ..Default::default()
    };

    for gscene in document.scenes() {
        for root in gscene.nodes() {
            let id = load_node(&mut scene, &root);
            scene.top_level_nodes.push(id);
        }
    }

    scene
}

/// Children are pushed before their parent.
fn load_node(scene: &mut Scene, gnode: &::gltf::Node<'_>) -> usize {
    let [c0, c1, c2, c3] = gnode.transform().matrix();
    let mut node = Node {
        node_to_parent: Mat4::new(c0.into(), c1.into(), c2.into(), c3.into()),
        mesh: gnode.mesh().map(|mesh| mesh.index()),
        light: gnode.light().map(|light| light.index()),
        children: Vec::new(),
    };

    for child in gnode.children() {
        node.children.push(load_node(scene, &child));
    }

    scene.nodes.push(node);
    scene.nodes.len() - 1
}

fn load_mesh(gmesh: &::gltf::Mesh<'_>, buffers: &[::gltf::buffer::Data]) -> Mesh {
    Mesh {
        primitives: gmesh
            .primitives()
            .map(|p| load_primitive(&p, buffers))
            .collect(),
    }
}

fn load_primitive(gprimitive: &::gltf::Primitive<'_>, buffers: &[::gltf::buffer::Data]) -> Primitive {
    let mut primitive = Primitive {
        material: gprimitive.material().index(),
        ..Default::default()
    };

    let reader = gprimitive.reader(|buffer| buffers.get(buffer.index()).map(|data| &data.0[..]));

    let mode = gprimitive.mode();
    if matches!(mode, Mode::Points | Mode::Lines | Mode::LineLoop | Mode::LineStrip) {
        log::warn!("[gltf] Geometry is not triangle-based, ignoring.");
        return primitive;
    }

    if let Some(positions) = reader.read_positions() {
        primitive.positions = positions.flatten().collect();
    }
    if let Some(normals) = reader.read_normals() {
        primitive.normals = normals.flatten().collect();
    }
    if let Some(tangents) = reader.read_tangents() {
        for [x, y, z, w] in tangents {
            primitive.tangents.extend([x, y, z]);
            if w < 0.0 {
                primitive.flip_bitangent = true;
            }
        }
    }
    if let Some(uvs) = reader.read_tex_coords(0) {
        primitive.uvs = uvs.into_f32().flatten().collect();
    }

    let indices: Vec<u32> = match reader.read_indices() {
        Some(ReadIndices::U8(iter)) => iter.map(u32::from).collect(),
        Some(ReadIndices::U16(iter)) => iter.map(u32::from).collect(),
        Some(ReadIndices::U32(iter)) => iter.collect(),
        None => (0..(primitive.positions.len() / 3) as u32).collect(),
    };

    primitive.indices = match mode {
        Mode::TriangleFan => fan_to_list(&indices),
        Mode::TriangleStrip => strip_to_list(&indices),
        _ => indices,
    };

    primitive
}

fn fan_to_list(fan: &[u32]) -> Vec<u32> {
    (2..fan.len())
        .flat_map(|i| [fan[0], fan[i - 1], fan[i]])
        .collect()
}

fn strip_to_list(strip: &[u32]) -> Vec<u32> {
    (2..strip.len())
        .flat_map(|i| [strip[i - 2], strip[i - 1], strip[i]])
        .collect()
}

fn load_material(gmat: &::gltf::Material<'_>) -> Material {
    let pbr = gmat.pbr_metallic_roughness();
    let emissive_strength = gmat.emissive_strength().unwrap_or(1.0);

    Material {
        alpha_cutoff: match gmat.alpha_mode() {
            AlphaMode::Opaque => 0.0,
            _ => gmat.alpha_cutoff().unwrap_or(0.5),
        },
        double_sided: gmat.double_sided(),
        base_color: pbr.base_color_factor().into(),
        base_color_texture: pbr.base_color_texture().map(|info| info.texture().index()),
        metallic: pbr.metallic_factor(),
        roughness: pbr.roughness_factor(),
        metallic_roughness_texture: pbr
            .metallic_roughness_texture()
            .map(|info| info.texture().index()),
        normal_scale: gmat.normal_texture().map_or(1.0, |normal| normal.scale()),
        normal_texture: gmat
            .normal_texture()
            .map(|normal| normal.texture().index()),
        emissive: Vec3::from(gmat.emissive_factor()) * emissive_strength,
        emissive_texture: gmat.emissive_texture().map(|info| info.texture().index()),
    }
}

fn load_light(glight: &::gltf::khr_lights_punctual::Light<'_>) -> Light {
    let mut light = Light {
        color: glight.color().into(),
        intensity: glight.intensity(),
        range: glight.range().unwrap_or(0.0),
        ..Default::default()
    };
    match glight.kind() {
        Kind::Point => light.ty = LightType::Point,
        Kind::Directional => light.ty = LightType::Directional,
        Kind::Spot {
            inner_cone_angle,
            outer_cone_angle,
        } => {
            light.ty = LightType::Spot;
            light.inner_cone_angle = inner_cone_angle;
            light.outer_cone_angle = outer_cone_angle;
        }
    }
    light
}

/// Reduces every supported image format to 8 bits per channel.
fn load_texture(image: &::gltf::image::Data) -> Texture {
    let (components, data): (u32, Vec<u8>) = match image.format {
        Format::R8 => (1, image.pixels.clone()),
        Format::R8G8 => (2, image.pixels.clone()),
        Format::R8G8B8 => (3, image.pixels.clone()),
        Format::R8G8B8A8 => (4, image.pixels.clone()),
        Format::R16 => (1, high_bytes(&image.pixels)),
        Format::R16G16 => (2, high_bytes(&image.pixels)),
        Format::R16G16B16 => (3, high_bytes(&image.pixels)),
        Format::R16G16B16A16 => (4, high_bytes(&image.pixels)),
        Format::R32G32B32FLOAT => (3, unit_floats(&image.pixels)),
        Format::R32G32B32A32FLOAT => (4, unit_floats(&image.pixels)),
        #[allow(unreachable_patterns)]
        format => {
            log::warn!("[gltf] Unsupported image format {:?}, skipping.", format);
            return Texture::default();
        }
    };
    Texture {
        data,
        width: image.width,
        height: image.height,
        components,
    }
}

fn high_bytes(pixels: &[u8]) -> Vec<u8> {
    pixels.chunks_exact(2).map(|c| c[1]).collect()
}

fn unit_floats(pixels: &[u8]) -> Vec<u8> {
    pixels
        .chunks_exact(4)
        .map(|c| {
            let value = f32::from_le_bytes([c[0], c[1], c[2], c[3]]);
            (value.clamp(0.0, 1.0) * 255.0).round() as u8
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fans_and_strips_become_lists() {
        assert_eq!(fan_to_list(&[0, 1, 2, 3]), vec![0, 1, 2, 0, 2, 3]);
        assert_eq!(strip_to_list(&[0, 1, 2, 3]), vec![0, 1, 2, 1, 2, 3]);
        assert!(fan_to_list(&[0, 1]).is_empty());
    }

    #[test]
    fn wide_formats_are_narrowed() {
        assert_eq!(high_bytes(&[0x34, 0x12, 0xff, 0xff]), vec![0x12, 0xff]);
        let floats: Vec<u8> = [0.0f32, 1.0, 2.0, -1.0]
            .iter()
            .flat_map(|f| f.to_le_bytes())
            .collect();
        assert_eq!(unit_floats(&floats), vec![0, 255, 255, 0]);
    }

    #[test]
    fn emissive_materials() {
        let mut material = Material::default();
        assert!(!material.is_emissive());
        material.emissive_texture = Some(0);
        assert!(material.is_emissive());
    }

    #[test]
    fn parses_minimal_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("triangle.gltf");

        // One triangle, 3 float3 positions followed by 3 u16 indices (plus padding).
        let mut bytes = Vec::new();
        for v in [0.0f32, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        for i in [0u16, 1, 2, 0] {
            bytes.extend_from_slice(&i.to_le_bytes());
        }
        std::fs::write(dir.path().join("triangle.bin"), &bytes).unwrap();

        let json = r#"{
            "asset": { "version": "2.0" },
            "scene": 0,
            "scenes": [ { "nodes": [ 0 ] } ],
            "nodes": [ { "children": [ 1 ], "translation": [ 1.0, 2.0, 3.0 ] }, { "mesh": 0 } ],
            "meshes": [ { "primitives": [ { "attributes": { "POSITION": 0 }, "indices": 1, "material": 0 } ] } ],
            "materials": [ { "alphaMode": "MASK", "emissiveFactor": [ 1.0, 0.0, 0.0 ] } ],
            "buffers": [ { "uri": "triangle.bin", "byteLength": 44 } ],
            "bufferViews": [
                { "buffer": 0, "byteOffset": 0, "byteLength": 36 },
                { "buffer": 0, "byteOffset": 36, "byteLength": 6 }
            ],
            "accessors": [
                { "bufferView": 0, "componentType": 5126, "count": 3, "type": "VEC3",
                  "min": [ 0.0, 0.0, 0.0 ], "max": [ 1.0, 1.0, 0.0 ] },
                { "bufferView": 1, "componentType": 5123, "count": 3, "type": "SCALAR" }
            ]
        }"#;
        std::fs::write(&path, json).unwrap();

        let CpuScene::Gltf(scene) = GltfParser.parse(&path).unwrap() else {
            panic!("expected a glTF scene");
        };

        assert_eq!(scene.meshes.len(), 1);
        let primitive = &scene.meshes[0].primitives[0];
        assert_eq!(primitive.positions.len(), 9);
        assert_eq!(primitive.indices, vec![0, 1, 2]);
        assert_eq!(primitive.material, Some(0));

        // Post order: the child comes first.
        assert_eq!(scene.nodes.len(), 2);
        assert_eq!(scene.nodes[0].mesh, Some(0));
        assert_eq!(scene.nodes[1].children, vec![0]);
        assert_eq!(scene.top_level_nodes, vec![1]);
        assert_eq!(scene.nodes[1].node_to_parent.cols[3], Vec4::new(1.0, 2.0, 3.0, 1.0));

        assert_eq!(scene.materials[0].alpha_cutoff, 0.5);
        assert!(scene.materials[0].is_emissive());
    }

    #[test]
    fn missing_file_is_an_error() {
        let error = GltfParser.parse(Path::new("does/not/exist.gltf"));
        assert!(matches!(error, Err(ParseError::Gltf { .. })));
    }
}
