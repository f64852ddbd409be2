//! Scene schema produced by PBRT v4 parsers.
//!
//! Objects form a DAG: an object owns meshes and instances of other objects. Cross references
//! are [`Id`]s into the flat arrays of [`Scene`].

use std::{
    fmt,
    hash::{Hash, Hasher},
    marker::PhantomData,
};

use ultraviolet::{Mat4, Vec3};

pub type Spectrum = Vec3;

/// Typed index into one of the scene arrays. `depth` is the nesting level of the file that
/// defined the referenced item.
pub struct Id<T> {
    pub depth: u8,
    pub id: u64,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Id<T> {
    pub const INVALID: Id<T> = Id {
        depth: u8::MAX,
        id: u64::MAX,
        _marker: PhantomData,
    };

    pub const fn new(depth: u8, id: u64) -> Self {
        Self {
            depth,
            id,
            _marker: PhantomData,
        }
    }

    pub fn is_invalid(&self) -> bool {
        self.depth == u8::MAX || self.id == u64::MAX
    }

    /// Position in the scene array, or `None` for the sentinel.
    pub fn index(&self) -> Option<usize> {
        (!self.is_invalid()).then_some(self.id as usize)
    }
}

impl<T> Default for Id<T> {
    fn default() -> Self {
        Self::INVALID
    }
}

impl<T> Clone for Id<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Id<T> {}

impl<T> PartialEq for Id<T> {
    fn eq(&self, other: &Self) -> bool {
        self.depth == other.depth && self.id == other.id
    }
}

impl<T> Eq for Id<T> {}

impl<T> Hash for Id<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.depth.hash(state);
        self.id.hash(state);
    }
}

impl<T> fmt::Debug for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_invalid() {
            write!(f, "Id(invalid)")
        } else {
            write!(f, "Id({}:{})", self.depth, self.id)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageData<T> {
    pub data: Vec<T>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
}

impl<T> ImageData<T> {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty() || self.width == 0 || self.height == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightType {
    Distant,
    Goniometric,
    Infinite,
    #[default]
    Point,
    Projection,
    Spot,
}

#[derive(Debug, Clone)]
pub struct Light {
    pub ty: LightType,
    pub scale: Spectrum,
    pub power: f32,
    pub illuminance: f32,
    pub l: Spectrum,
    pub from: Vec3,
    pub to: Vec3,
    pub i: Spectrum,
    pub portal: [Vec3; 4],
    pub fov: f32,
    pub cone_angle: f32,
    pub cone_delta_angle: f32,
    pub map: ImageData<f32>,
}

impl Default for Light {
    fn default() -> Self {
        Self {
            ty: LightType::Point,
            scale: Vec3::one(),
            power: 0.0,
            illuminance: 0.0,
            l: Vec3::zero(),
            from: Vec3::zero(),
            to: Vec3::unit_z(),
            i: Vec3::zero(),
            portal: [Vec3::zero(); 4],
            fov: 90.0,
            cone_angle: 30.0,
            cone_delta_angle: 5.0,
            map: ImageData::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureType {
    Bilerp,
    Checkerboard,
    #[default]
    Constant,
    DirectionMix,
    Dots,
    Fbm,
    ImageMap,
    Marble,
    Mix,
    Ptex,
    Scale,
    Windy,
    Wrinkled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureMapping {
    #[default]
    Uv,
    Spherical,
    Cylindrical,
    Planar,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextureData {
    #[default]
    Scalar,
    Spectrum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wrap {
    #[default]
    Repeat,
    Clamp,
    Black,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Filter {
    Point,
    #[default]
    Bilinear,
    Trilinear,
    Ewa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Srgb,
    Linear,
    Gamma,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextureImage {
    U8(ImageData<u8>),
    F32(ImageData<f32>),
}

impl Default for TextureImage {
    fn default() -> Self {
        TextureImage::U8(ImageData::default())
    }
}

#[derive(Debug, Clone)]
pub struct Texture {
    pub ty: TextureType,
    pub data_type: TextureData,

    pub scalar: f32,
    pub spectrum: Spectrum,

    pub mapping: TextureMapping,
    pub wrap: Wrap,
    pub filter: Filter,
    pub encoding: Encoding,
    pub gamma: f32,
    pub invert: bool,

    pub u_scale: f32,
    pub v_scale: f32,
    pub u_delta: f32,
    pub v_delta: f32,
    pub roughness: f32,
    pub variation: f32,
    pub max_anisotropy: f32,
    pub octaves: i32,
    pub dimension: i32,

    pub v1: Vec3,
    pub v2: Vec3,
    pub dir: Vec3,

    pub v00: Id<Texture>,
    pub v01: Id<Texture>,
    pub v10: Id<Texture>,
    pub v11: Id<Texture>,
    pub tex1: Id<Texture>,
    pub tex2: Id<Texture>,
    pub inside: Id<Texture>,
    pub outside: Id<Texture>,
    pub amount: Id<Texture>,
    pub tex: Id<Texture>,
    pub scale: Id<Texture>,

    pub image: TextureImage,
}

impl Default for Texture {
    fn default() -> Self {
        Self {
            ty: TextureType::Constant,
            data_type: TextureData::Scalar,
            scalar: 1.0,
            spectrum: Vec3::one(),
            mapping: TextureMapping::Uv,
            wrap: Wrap::Repeat,
            filter: Filter::Bilinear,
            encoding: Encoding::Srgb,
            gamma: 2.2,
            invert: false,
            u_scale: 1.0,
            v_scale: 1.0,
            u_delta: 0.0,
            v_delta: 0.0,
            roughness: 0.5,
            variation: 0.2,
            max_anisotropy: 8.0,
            octaves: 8,
            dimension: 2,
            v1: Vec3::unit_x(),
            v2: Vec3::unit_y(),
            dir: Vec3::unit_y(),
            v00: Id::INVALID,
            v01: Id::INVALID,
            v10: Id::INVALID,
            v11: Id::INVALID,
            tex1: Id::INVALID,
            tex2: Id::INVALID,
            inside: Id::INVALID,
            outside: Id::INVALID,
            amount: Id::INVALID,
            tex: Id::INVALID,
            scale: Id::INVALID,
            image: TextureImage::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaterialType {
    Conductor,
    Dielectric,
    #[default]
    Diffuse,
    DiffuseTransmission,
    Mix,
    CoatedDiffuse,
    CoatedConductor,
    Hair,
    Interface,
    Measured,
    Subsurface,
    ThinDielectric,
}

#[derive(Debug, Clone)]
pub struct Material {
    pub ty: MaterialType,
    pub remap_roughness: bool,
    pub max_depth: i32,
    pub n_samples: i32,
    pub normal_map: String,
    pub measured: String,
    pub sss_coefficients: String,
    pub color: Spectrum,
    pub roughness: Id<Texture>,
    pub uroughness: Id<Texture>,
    pub vroughness: Id<Texture>,
    pub albedo: Id<Texture>,
    pub g: Id<Texture>,
    pub sigma_a: Id<Texture>,
    pub displacement_map: Id<Texture>,
    pub reflectance: Id<Texture>,
    pub transmittance: Id<Texture>,
    pub eumelanin: Id<Texture>,
    pub pheomelanin: Id<Texture>,
    pub beta_m: Id<Texture>,
    pub beta_n: Id<Texture>,
    pub alpha: Id<Texture>,
    pub eta: Id<Texture>,
    pub k: Id<Texture>,
    pub scale: Id<Texture>,
    pub amount: Id<Texture>,
    pub mfp: Id<Texture>,
    pub sigma_s: Id<Texture>,
    pub conductor_eta: Id<Texture>,
    pub conductor_k: Id<Texture>,
    pub conductor_roughness: Id<Texture>,
    pub conductor_uroughness: Id<Texture>,
    pub conductor_vroughness: Id<Texture>,
    pub interface_eta: Id<Texture>,
    pub interface_k: Id<Texture>,
    pub interface_roughness: Id<Texture>,
    pub interface_uroughness: Id<Texture>,
    pub interface_vroughness: Id<Texture>,
    pub thickness: Id<Texture>,
    pub a: Id<Material>,
    pub b: Id<Material>,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            ty: MaterialType::Diffuse,
            remap_roughness: true,
            max_depth: 6,
            n_samples: 1,
            normal_map: String::new(),
            measured: String::new(),
            sss_coefficients: String::new(),
            color: Vec3::zero(),
            roughness: Id::INVALID,
            uroughness: Id::INVALID,
            vroughness: Id::INVALID,
            albedo: Id::INVALID,
            g: Id::INVALID,
            sigma_a: Id::INVALID,
            displacement_map: Id::INVALID,
            reflectance: Id::INVALID,
            transmittance: Id::INVALID,
            eumelanin: Id::INVALID,
            pheomelanin: Id::INVALID,
            beta_m: Id::INVALID,
            beta_n: Id::INVALID,
            alpha: Id::INVALID,
            eta: Id::INVALID,
            k: Id::INVALID,
            scale: Id::INVALID,
            amount: Id::INVALID,
            mfp: Id::INVALID,
            sigma_s: Id::INVALID,
            conductor_eta: Id::INVALID,
            conductor_k: Id::INVALID,
            conductor_roughness: Id::INVALID,
            conductor_uroughness: Id::INVALID,
            conductor_vroughness: Id::INVALID,
            interface_eta: Id::INVALID,
            interface_k: Id::INVALID,
            interface_roughness: Id::INVALID,
            interface_uroughness: Id::INVALID,
            interface_vroughness: Id::INVALID,
            thickness: Id::INVALID,
            a: Id::INVALID,
            b: Id::INVALID,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Mesh {
    pub mesh_to_instance: Mat4,
    pub material: Id<Material>,
    pub alpha: Id<Texture>,
    pub emission: Spectrum,

    pub positions: Vec<f32>,
    pub normals: Vec<f32>,
    pub tangents: Vec<f32>,
    pub uvs: Vec<f32>,
    pub indices: Vec<u32>,
    pub face_indices: Vec<u32>,
}

impl Default for Mesh {
    fn default() -> Self {
        Self {
            mesh_to_instance: Mat4::identity(),
            material: Id::INVALID,
            alpha: Id::INVALID,
            emission: Vec3::zero(),
            positions: Vec::new(),
            normals: Vec::new(),
            tangents: Vec::new(),
            uvs: Vec::new(),
            indices: Vec::new(),
            face_indices: Vec::new(),
        }
    }
}

impl Mesh {
    pub fn is_emissive(&self) -> bool {
        self.emission != Vec3::zero()
    }
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub world_to_camera: Mat4,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            world_to_camera: Mat4::identity(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub instance_to_object: Mat4,
    pub object: Id<Object>,
}

#[derive(Debug, Clone)]
pub struct Object {
    pub object_to_parent: Mat4,
    pub meshes: Vec<Id<Mesh>>,
    pub instances: Vec<Instance>,
}

impl Default for Object {
    fn default() -> Self {
        Self {
            object_to_parent: Mat4::identity(),
            meshes: Vec::new(),
            instances: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Scene {
    pub camera: Camera,

    pub top_level_meshes: Vec<Id<Mesh>>,
    pub top_level_instances: Vec<Instance>,

    pub meshes: Vec<Mesh>,
    pub objects: Vec<Object>,
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
    pub lights: Vec<Light>,
}

impl Scene {
    pub fn mesh(&self, id: Id<Mesh>) -> Option<&Mesh> {
        id.index().and_then(|i| self.meshes.get(i))
    }

    pub fn object(&self, id: Id<Object>) -> Option<&Object> {
        id.index().and_then(|i| self.objects.get(i))
    }

    pub fn material(&self, id: Id<Material>) -> Option<&Material> {
        id.index().and_then(|i| self.materials.get(i))
    }

    pub fn texture(&self, id: Id<Texture>) -> Option<&Texture> {
        id.index().and_then(|i| self.textures.get(i))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_ids_resolve_to_nothing() {
        let mut scene = Scene::default();
        scene.meshes.push(Mesh::default());

        assert!(scene.mesh(Id::new(0, 0)).is_some());
        assert!(scene.mesh(Id::new(0, 1)).is_none());
        assert!(scene.mesh(Id::INVALID).is_none());
        assert!(Id::<Mesh>::new(u8::MAX, 0).is_invalid());
        assert_eq!(Id::<Texture>::default(), Id::INVALID);
        assert_eq!(format!("{:?}", Id::<Texture>::new(1, 4)), "Id(1:4)");
    }
}
