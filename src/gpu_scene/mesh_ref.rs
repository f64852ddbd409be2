use log::warn;
use ultraviolet::{Mat4, Vec4};

use super::types::{GeometryFlags, MaterialType};

/// Per mesh properties that end up in its geometry reference.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeshFlags {
    pub material_type: MaterialType,
    pub material_id: u32,
    /// Scene texture index of the alpha mask, `u32::MAX` for none.
    pub alpha_id: u32,
    pub alpha_cutoff: f32,
    pub flip_v: bool,
    pub flip_bitangent: bool,
    pub double_sided: bool,
    pub emission: Vec4,
}

impl Default for MeshFlags {
    fn default() -> Self {
        Self {
            material_type: MaterialType::None,
            material_id: u32::MAX,
            alpha_id: u32::MAX,
            alpha_cutoff: 0.0,
            flip_v: false,
            flip_bitangent: false,
            double_sided: false,
            emission: Vec4::zero(),
        }
    }
}

/// A borrowed view of one mesh of a CPU scene, in either source format.
#[derive(Debug, Clone)]
pub struct MeshRef<'a> {
    pub mesh_to_instance: Mat4,
    /// Used in diagnostics only.
    pub id: u64,
    pub flags: MeshFlags,
    pub positions: &'a [f32],
    pub normals: &'a [f32],
    pub tangents: &'a [f32],
    pub uvs: &'a [f32],
    pub indices: &'a [u32],
}

impl<'a> MeshRef<'a> {
    pub fn new(id: u64, flags: MeshFlags) -> Self {
        Self {
            mesh_to_instance: Mat4::identity(),
            id,
            flags,
            positions: &[],
            normals: &[],
            tangents: &[],
            uvs: &[],
            indices: &[],
        }
    }

    /// Whether the attribute streams are consistent. Inconsistent meshes are left out of
    /// BLAS and geometry uploads.
    pub fn check(&self) -> bool {
        if self.positions.is_empty() {
            return false;
        }
        if self.positions.len() % 3 != 0 {
            warn!(
                "Mesh {} has a position count that is not a multiple of 3, skipping.",
                self.id
            );
            return false;
        }
        if !self.normals.is_empty() && self.normals.len() != self.positions.len() {
            warn!(
                "Mesh {} has a different number of normals and positions, skipping.",
                self.id
            );
            return false;
        }
        if !self.tangents.is_empty() {
            if self.tangents.len() != self.positions.len() {
                warn!(
                    "Mesh {} has a different number of tangents and positions, skipping.",
                    self.id
                );
                return false;
            }
            if self.tangents.len() != self.normals.len() {
                warn!(
                    "Mesh {} has a different number of tangents and normals, skipping.",
                    self.id
                );
                return false;
            }
        }
        if self.uvs.len() % 2 != 0 {
            warn!(
                "Mesh {} has a uv count that is not a multiple of 2, skipping.",
                self.id
            );
            return false;
        }
        if !self.uvs.is_empty() && self.uvs.len() / 2 != self.positions.len() / 3 {
            warn!(
                "Mesh {} has a different number of uvs and positions, skipping.",
                self.id
            );
            return false;
        }
        true
    }

    pub fn geometry_flags(&self) -> GeometryFlags {
        [
            (GeometryFlags::NORMALS, !self.normals.is_empty()),
            (GeometryFlags::TANGENTS, !self.tangents.is_empty()),
            (GeometryFlags::UVS, !self.uvs.is_empty()),
            (GeometryFlags::FLIP_BITANGENT, self.flags.flip_bitangent),
            (GeometryFlags::DOUBLE_SIDED, self.flags.double_sided),
            (GeometryFlags::FLIP_V, self.flags.flip_v),
        ]
        .into_iter()
        .filter(|(_, present)| *present)
        .fold(GeometryFlags::empty(), |mut flags, (flag, _)| {
            flags.insert(flag);
            flags
        })
    }

    /// Tangents are only encoded alongside normals.
    pub fn encoded_tangents(&self) -> &'a [f32] {
        if self.normals.is_empty() {
            &[]
        } else {
            self.tangents
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TRIANGLE: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];

    #[test]
    fn empty_positions_fail_quietly() {
        assert!(!MeshRef::new(0, MeshFlags::default()).check());
    }

    #[test]
    fn mismatched_streams_fail() {
        let mut mesh = MeshRef::new(3, MeshFlags::default());
        mesh.positions = &TRIANGLE;
        assert!(mesh.check());

        mesh.normals = &TRIANGLE[..6];
        assert!(!mesh.check());

        mesh.normals = &TRIANGLE;
        mesh.tangents = &TRIANGLE[..3];
        assert!(!mesh.check());

        mesh.tangents = &TRIANGLE;
        mesh.uvs = &[0.0; 4];
        assert!(!mesh.check());

        mesh.uvs = &[0.0; 6];
        assert!(mesh.check());
    }

    #[test]
    fn partial_vertices_fail() {
        let mut mesh = MeshRef::new(4, MeshFlags::default());
        mesh.positions = &TRIANGLE[..4];
        mesh.normals = &TRIANGLE[..4];
        assert!(!mesh.check());

        mesh.positions = &TRIANGLE;
        mesh.normals = &[];
        mesh.uvs = &[0.0; 7];
        assert!(!mesh.check());
    }

    #[test]
    fn tangents_without_normals_are_inconsistent() {
        let mut mesh = MeshRef::new(1, MeshFlags::default());
        mesh.positions = &TRIANGLE;
        mesh.tangents = &TRIANGLE;
        assert!(!mesh.check());
        assert!(mesh.encoded_tangents().is_empty());
    }

    #[test]
    fn flags_follow_streams() {
        let mut mesh = MeshRef::new(
            0,
            MeshFlags {
                double_sided: true,
                flip_v: true,
                ..Default::default()
            },
        );
        mesh.positions = &TRIANGLE;
        mesh.uvs = &[0.0; 6];
        let flags = mesh.geometry_flags();
        assert!(flags.contains(GeometryFlags::UVS));
        assert!(!flags.contains(GeometryFlags::NORMALS));
        assert!(flags.contains(GeometryFlags::DOUBLE_SIDED | GeometryFlags::FLIP_V));
    }
}
