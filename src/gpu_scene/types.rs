//! Records shared with the shaders. Layouts are fixed, every `Gpu*` type is written into
//! storage buffers byte for byte.

use bytemuck::{Pod, Zeroable};
use ultraviolet::{Mat4, Vec3, Vec4};

pub const MAX_IMAGES: u64 = 2048;
pub const MAX_SAMPLERS: u64 = 64;

/// Packed texture reference: bits 0..22 image index, 22..30 sampler index, 30..32 kind.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureKind {
    None = 0,
    Image = 1,
    Constant = 2,
    Procedural = 3,
}

impl TextureId {
    const ID_BITS: u32 = 22;
    const SAMPLER_BITS: u32 = 8;
    const ID_MASK: u32 = (1 << Self::ID_BITS) - 1;
    const SAMPLER_MASK: u32 = (1 << Self::SAMPLER_BITS) - 1;

    pub const NONE: TextureId = TextureId(0);

    const fn pack(id: u32, sampler: u32, kind: TextureKind) -> Self {
        TextureId(
            (id & Self::ID_MASK)
                | ((sampler & Self::SAMPLER_MASK) << Self::ID_BITS)
                | ((kind as u32) << (Self::ID_BITS + Self::SAMPLER_BITS)),
        )
    }

    pub fn image(id: u64, sampler: u64) -> Self {
        Self::pack(id as u32, sampler as u32, TextureKind::Image)
    }

    pub const fn constant() -> Self {
        Self::pack(0, 0, TextureKind::Constant)
    }

    pub fn procedural(id: u64) -> Self {
        Self::pack(id as u32, 0, TextureKind::Procedural)
    }

    pub fn id(self) -> u32 {
        self.0 & Self::ID_MASK
    }

    pub fn sampler(self) -> u32 {
        (self.0 >> Self::ID_BITS) & Self::SAMPLER_MASK
    }

    pub fn kind(self) -> TextureKind {
        match self.0 >> (Self::ID_BITS + Self::SAMPLER_BITS) {
            0 => TextureKind::None,
            1 => TextureKind::Image,
            2 => TextureKind::Constant,
            _ => TextureKind::Procedural,
        }
    }
}

/// Per geometry attribute flags.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct GeometryFlags(u32);

bitflags::bitflags! {
    impl GeometryFlags: u32 {
        const NORMALS = 1 << 0;
        const TANGENTS = 1 << 1;
        const UVS = 1 << 2;
        const FLIP_BITANGENT = 1 << 3;
        const DOUBLE_SIDED = 1 << 4;
        const FLIP_V = 1 << 5;
    }
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MaterialType {
    #[default]
    None,
    Gltf,
    PbrtConductor,
    PbrtDielectric,
    PbrtDiffuse,
    PbrtDiffuseTransmission,
    PbrtMix,
    PbrtHair,
    PbrtSubsurface,
    PbrtThinDielectric,
    PbrtInterface,
    PbrtMeasured,
    TungstenRoughPlastic,
    TungstenSmoothCoat,
}

impl MaterialType {
    pub const ALL: [MaterialType; 14] = [
        MaterialType::None,
        MaterialType::Gltf,
        MaterialType::PbrtConductor,
        MaterialType::PbrtDielectric,
        MaterialType::PbrtDiffuse,
        MaterialType::PbrtDiffuseTransmission,
        MaterialType::PbrtMix,
        MaterialType::PbrtHair,
        MaterialType::PbrtSubsurface,
        MaterialType::PbrtThinDielectric,
        MaterialType::PbrtInterface,
        MaterialType::PbrtMeasured,
        MaterialType::TungstenRoughPlastic,
        MaterialType::TungstenSmoothCoat,
    ];

    pub const COUNT: usize = Self::ALL.len();
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct GpuMaterial {
    pub textures: [TextureId; 12],
    pub spectra: [[f32; 4]; 12],
    pub parameters: [u32; 4],
}

impl GpuMaterial {
    pub fn set(&mut self, slot: usize, (spectrum, texture): (Vec4, TextureId)) {
        self.spectra[slot] = spectrum.into();
        self.textures[slot] = texture;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Default, Pod, Zeroable)]
pub struct GpuGeometryReference {
    pub vertex_address: u64,
    pub index_address: u64,
    pub material_id: u32,
    pub alpha_texture_id: TextureId,
    pub alpha_cutoff: f32,
    pub flags: GeometryFlags,
    pub emission: [f32; 4],
}

/// Host side geometry reference, kept for building binding tables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CpuGeometryReference {
    pub vertex_address: u64,
    pub index_address: u64,
    pub flags: GeometryFlags,
    pub material_type: MaterialType,
    pub material_id: u32,
    /// Scene texture index, `u32::MAX` for none.
    pub alpha_texture_id: u32,
    pub alpha_cutoff: f32,
    pub emission: Vec4,
}

#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeltaLightType {
    #[default]
    None = 0,
    Point = 1,
    Spot = 2,
    Directional = 3,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct GpuDeltaLight {
    pub ty: u32,
    pub power: [f32; 3],
    pub params: [[f32; 4]; 2],
}

impl Default for GpuDeltaLight {
    fn default() -> Self {
        Self {
            ty: DeltaLightType::None as u32,
            power: [1.0; 3],
            params: [[0.0; 4]; 2],
        }
    }
}

impl GpuDeltaLight {
    pub fn new(ty: DeltaLightType, power: Vec3, p0: Vec4, p1: Vec4) -> Self {
        Self {
            ty: ty as u32,
            power: power.into(),
            params: [p0.into(), p1.into()],
        }
    }
}

/// `VkAccelerationStructureInstanceKHR`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct TlasInstance {
    pub transform: [[f32; 4]; 3],
    pub custom_index_and_mask: u32,
    pub sbt_offset_and_flags: u32,
    pub acceleration_structure_reference: u64,
}

impl TlasInstance {
    /// `VK_GEOMETRY_INSTANCE_TRIANGLE_FACING_CULL_DISABLE_BIT_KHR`
    pub const FACING_CULL_DISABLE: u32 = 0x1;

    /// An instance whose custom index and binding table offset both point at the first
    /// geometry reference of its BLAS.
    pub fn new(transform: Mat4, geometry_index: u32, blas_address: u64) -> Self {
        Self {
            transform: to_transform(transform),
            custom_index_and_mask: (geometry_index & 0x00ff_ffff) | (0xff << 24),
            sbt_offset_and_flags: (geometry_index & 0x00ff_ffff)
                | (Self::FACING_CULL_DISABLE << 24),
            acceleration_structure_reference: blas_address,
        }
    }

    pub fn custom_index(&self) -> u32 {
        self.custom_index_and_mask & 0x00ff_ffff
    }

    pub fn mask(&self) -> u32 {
        self.custom_index_and_mask >> 24
    }

    pub fn sbt_offset(&self) -> u32 {
        self.sbt_offset_and_flags & 0x00ff_ffff
    }

    pub fn flags(&self) -> u32 {
        self.sbt_offset_and_flags >> 24
    }
}

/// Top three rows of a column major matrix, `VkTransformMatrixKHR`.
pub fn to_transform(m: Mat4) -> [[f32; 4]; 3] {
    let row = |r: usize| [m.cols[0][r], m.cols[1][r], m.cols[2][r], m.cols[3][r]];
    [row(0), row(1), row(2)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_sizes() {
        assert_eq!(std::mem::size_of::<TextureId>(), 4);
        assert_eq!(std::mem::size_of::<GpuMaterial>(), 256);
        assert_eq!(std::mem::size_of::<GpuGeometryReference>(), 48);
        assert_eq!(std::mem::size_of::<GpuDeltaLight>(), 48);
        assert_eq!(std::mem::size_of::<TlasInstance>(), 64);
    }

    #[test]
    fn texture_id_bits() {
        let id = TextureId::image(5, 3);
        assert_eq!(id.0, 5 | (3 << 22) | (1 << 30));
        assert_eq!((id.id(), id.sampler(), id.kind()), (5, 3, TextureKind::Image));
        assert_eq!(TextureId::constant().0, 2 << 30);
        assert_eq!(TextureId::procedural(7).0, 7 | (3 << 30));
        assert_eq!(TextureId::NONE.kind(), TextureKind::None);
    }

    #[test]
    fn geometry_flag_bits() {
        let mut flags = GeometryFlags::default();
        assert!(flags.is_empty());
        flags.insert(GeometryFlags::UVS | GeometryFlags::FLIP_V);
        assert_eq!(flags.bits(), 0b100100);
        assert_eq!(bytemuck::bytes_of(&flags), &0b100100u32.to_ne_bytes());
        flags.remove(GeometryFlags::UVS);
        assert!(!flags.contains(GeometryFlags::UVS));
    }

    #[test]
    fn transform_rows() {
        let m = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let t = to_transform(m);
        assert_eq!(t[0], [1.0, 0.0, 0.0, 1.0]);
        assert_eq!(t[1], [0.0, 1.0, 0.0, 2.0]);
        assert_eq!(t[2], [0.0, 0.0, 1.0, 3.0]);

        let instance = TlasInstance::new(m, 7, 0xabc);
        assert_eq!(instance.custom_index(), 7);
        assert_eq!(instance.sbt_offset(), 7);
        assert_eq!(instance.mask(), 0xff);
        assert_eq!(instance.flags(), TlasInstance::FACING_CULL_DISABLE);
    }
}
