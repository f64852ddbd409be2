//! Push constant blocks, laid out with std430 rules to match the shaders.

use crevice::std430::{AsStd430, Std430};
use ultraviolet::Mat4;

#[derive(AsStd430)]
pub struct GeometryConstants {
    pub iview: Mat4,
    pub iproj: Mat4,
    pub mode: u32,
    pub stationary_frames: u32,
}

#[derive(AsStd430)]
pub struct AmbientOcclusionConstants {
    pub iview: Mat4,
    pub iproj: Mat4,
    pub stationary_frames: u32,
    pub samples_per_frame: u32,
    pub enable_shading_normals: u32,
    pub sun: f32,
}

#[derive(AsStd430)]
pub struct MaterialPathConstants {
    pub iview: Mat4,
    pub iproj: Mat4,
    pub stationary_frames: u32,
    pub samples_per_frame: u32,
    pub max_depth: u32,
    pub roulette: u32,
    pub suppress_fireflies: u32,
    pub shading_normals: u32,
    /// Negative when the scene has an environment map, otherwise the sun strength
    pub environment: f32,
}

#[derive(AsStd430)]
pub struct ShadingConstants {
    pub iview: Mat4,
    pub iproj: Mat4,
    pub mode: u32,
}

#[derive(AsStd430)]
pub struct PostConstants {
    pub op: u32,
    pub width: u32,
    pub height: u32,
    pub gamma: f32,
    pub exposure: f32,
}

/// Serialized push constants of a block.
pub fn push_bytes<T: AsStd430>(constants: &T) -> Vec<u8> {
    constants.as_std430().as_bytes().to_vec()
}

/// Size of the push constant range of a block.
pub fn push_size<T: AsStd430>() -> u32 {
    T::std430_size_static() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalars_follow_the_matrices() {
        let constants = GeometryConstants {
            iview: Mat4::identity(),
            iproj: Mat4::identity(),
            mode: 7,
            stationary_frames: 3,
        };
        let bytes = push_bytes(&constants);
        assert_eq!(bytes.len() as u32, push_size::<GeometryConstants>());
        assert_eq!(&bytes[128..132], &7u32.to_ne_bytes());
        assert_eq!(&bytes[132..136], &3u32.to_ne_bytes());
    }

    #[test]
    fn post_constants_are_packed() {
        let constants = PostConstants {
            op: 5,
            width: 640,
            height: 480,
            gamma: 2.2,
            exposure: 1.0,
        };
        let bytes = push_bytes(&constants);
        assert_eq!(&bytes[0..4], &5u32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &640u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &2.2f32.to_ne_bytes());
    }
}
