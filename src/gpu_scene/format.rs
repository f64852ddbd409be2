//! What the upload pipeline needs from a CPU scene, independent of its source format.

use ultraviolet::Mat4;

use crate::gpu::SamplerConfig;

use super::{
    mesh_ref::MeshRef,
    types::{GpuDeltaLight, GpuMaterial, TextureId, TlasInstance, MAX_IMAGES, MAX_SAMPLERS},
};

/// A set of meshes that shares one BLAS and one geometry buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshGroup {
    /// PBRT meshes outside of any object, split by whether they emit light.
    TopLevel { emissive: bool },
    /// A PBRT object or a glTF mesh.
    Object(usize),
}

#[derive(Debug, Clone, Copy)]
pub enum PixelData<'a> {
    U8(&'a [u8]),
    F32(&'a [f32]),
}

impl PixelData<'_> {
    pub fn is_empty(&self) -> bool {
        match self {
            PixelData::U8(data) => data.is_empty(),
            PixelData::F32(data) => data.is_empty(),
        }
    }

    pub fn is_hdr(&self) -> bool {
        matches!(self, PixelData::F32(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match self {
            PixelData::U8(data) => data,
            PixelData::F32(data) => bytemuck::cast_slice(data),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ImageSource<'a> {
    pub data: PixelData<'a>,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub srgb: bool,
}

/// Which image of a CPU scene to upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageKey {
    Texture(usize),
    /// Index into the scene's lights.
    Environment(usize),
}

/// Maps scene texture indices to GPU image and sampler slots. `u64::MAX` marks textures
/// without an image.
#[derive(Debug, Clone, Default)]
pub struct TextureMaps {
    pub image: Vec<u64>,
    pub sampler: Vec<u64>,
}

impl TextureMaps {
    /// Image reference for a texture, none if it has no image or its slots exceed the
    /// descriptor array limits.
    pub fn image_id(&self, texture: usize) -> TextureId {
        match (self.image.get(texture), self.sampler.get(texture)) {
            (Some(&image), Some(&sampler)) if image < MAX_IMAGES && sampler < MAX_SAMPLERS => {
                TextureId::image(image, sampler)
            }
            _ => TextureId::NONE,
        }
    }
}

/// Flattened instance hierarchy.
#[derive(Debug, Clone, Default)]
pub struct Traversal {
    pub instances: Vec<TlasInstance>,
    pub emissive_instances: Vec<TlasInstance>,
    /// World transform and light index of every light attached to a node.
    pub lights: Vec<(Mat4, usize)>,
}

/// BLAS and geometry results indexed by object, as produced by the upload phases.
pub struct ObjectTable<'a> {
    /// Device address per object BLAS, `None` where it was skipped.
    pub blas_addresses: &'a [Option<u64>],
    pub geometry_index: &'a [u64],
}

impl ObjectTable<'_> {
    pub fn get(&self, object: usize) -> Option<(u64, u32)> {
        let address = (*self.blas_addresses.get(object)?)?;
        let geometry_index = *self.geometry_index.get(object)?;
        Some((address, geometry_index as u32))
    }
}

/// A CPU scene format the upload pipeline understands.
pub trait UploadFormat: Send + Sync + 'static {
    /// Whether the format has top level meshes uploaded before any object.
    fn has_top_level(&self) -> bool;

    fn object_count(&self) -> usize;

    fn mesh_count(&self) -> usize;

    fn meshes(&self, group: MeshGroup) -> Vec<MeshRef<'_>>;

    /// Flattens the instance hierarchy. `objects` is indexed the same way the upload
    /// pushed BLASes: top level groups first, if any.
    fn traverse(&self, objects: &ObjectTable) -> Traversal;

    fn texture_count(&self) -> usize;

    fn sampler_config(&self, texture: usize) -> SamplerConfig;

    /// Samplers created before any texture is looked at.
    fn reserved_samplers(&self) -> Vec<SamplerConfig> {
        Vec::new()
    }

    /// Whether a texture occupies an image slot.
    fn has_image(&self, texture: usize) -> bool;

    fn image(&self, key: ImageKey) -> Option<ImageSource<'_>>;

    fn material_count(&self) -> usize;

    fn material(&self, index: usize, maps: &TextureMaps) -> GpuMaterial;

    fn light_count(&self) -> usize;

    /// Delta lights to upload, as world transform and light index.
    fn delta_lights(&self, traversal: &Traversal) -> Vec<(Mat4, usize)>;

    fn delta_light(&self, transform: Mat4, index: usize) -> GpuDeltaLight;

    /// Light indices carrying an environment map.
    fn environment_lights(&self) -> Vec<usize> {
        Vec::new()
    }
}
