//! Compact vertex attribute and pixel encodings shared with the shaders.
//!
//! Per vertex, the encoded attribute stream is `[normal: u32][tangent: u16][uv: u32]`,
//! where only the streams that are present get written.

use half::f16;
use ultraviolet::{Vec2, Vec3};

fn f32_to_snorm16(f: f32) -> i16 {
    (f * 32767.0) as i16
}

fn snorm16_to_f32(v: i16) -> f32 {
    (v as f32 / 32767.0).clamp(-1.0, 1.0)
}

fn sign_nonzero(f: f32) -> f32 {
    if f >= 0.0 {
        1.0
    } else {
        -1.0
    }
}

fn octahedral(n: Vec3) -> Vec2 {
    let l1 = n.x.abs() + n.y.abs() + n.z.abs();
    if l1 == 0.0 {
        return Vec2::zero();
    }
    let p = Vec2::new(n.x, n.y) / l1;
    if n.z < 0.0 {
        Vec2::new(
            (1.0 - p.y.abs()) * sign_nonzero(p.x),
            (1.0 - p.x.abs()) * sign_nonzero(p.y),
        )
    } else {
        p
    }
}

/// Octahedral normal, packed as two snorm16 values: `(y << 16) | x`.
pub fn normal_octahedral(n: Vec3) -> u32 {
    let p = octahedral(n);
    let x = f32_to_snorm16(p.x) as u16 as u32;
    let y = f32_to_snorm16(p.y) as u16 as u32;
    (y << 16) | x
}

pub fn decode_normal_octahedral(packed: u32) -> Vec3 {
    let x = snorm16_to_f32(packed as u16 as i16);
    let y = snorm16_to_f32((packed >> 16) as u16 as i16);
    let mut n = Vec3::new(x, y, 1.0 - x.abs() - y.abs());
    let t = (-n.z).max(0.0);
    n.x += if n.x >= 0.0 { -t } else { t };
    n.y += if n.y >= 0.0 { -t } else { t };
    n.normalized()
}

/// Builds the orthonormal frame the tangent is expressed in.
fn tangent_frame(normal: Vec3) -> (Vec3, Vec3) {
    let t1 = if normal.y.abs() > normal.z.abs() {
        Vec3::new(normal.y, -normal.x, 0.0)
    } else {
        Vec3::new(normal.z, 0.0, -normal.x)
    };
    let len = t1.mag();
    let t1 = if len > 0.0 { t1 / len } else { Vec3::unit_x() };
    let t2 = t1.cross(normal);
    (t1, t2)
}

fn diamond_encode(p: Vec2) -> f32 {
    let l1 = p.x.abs() + p.y.abs();
    let x = if l1 > 0.0 { p.x / l1 } else { 0.0 };
    let py_sign = sign_nonzero(p.y);
    -py_sign * 0.25 * x + 0.5 + py_sign * 0.25
}

/// Diamond encoding of `tangent` relative to the frame of `normal`, in `[0, 1]`.
pub fn tangent_diamond(normal: Vec3, tangent: Vec3) -> f32 {
    let (t1, t2) = tangent_frame(normal);
    diamond_encode(Vec2::new(tangent.dot(t1), tangent.dot(t2)))
}

pub fn decode_tangent_diamond(normal: Vec3, value: f32) -> Vec3 {
    let (t1, t2) = tangent_frame(normal);
    let (x, sign) = if value >= 0.5 {
        (3.0 - 4.0 * value, 1.0)
    } else {
        (4.0 * value - 1.0, -1.0)
    };
    let y = sign * (1.0 - x.abs());
    (t1 * x + t2 * y).normalized()
}

/// Two half floats: `(f16(v) << 16) | f16(u)`.
pub fn uv_half(uv: Vec2) -> u32 {
    let u = f16::from_f32(uv.x).to_bits() as u32;
    let v = f16::from_f32(uv.y).to_bits() as u32;
    (v << 16) | u
}

fn vertex_count(uvs: &[f32], normals: &[f32]) -> usize {
    if !normals.is_empty() {
        normals.len() / 3
    } else {
        uvs.len() / 2
    }
}

fn vertex_stride(uvs: &[f32], normals: &[f32], tangents: &[f32]) -> usize {
    let mut stride = 0;
    if !normals.is_empty() {
        stride += 4;
        if !tangents.is_empty() {
            stride += 2;
        }
    }
    if !uvs.is_empty() {
        stride += 4;
    }
    stride
}

/// Number of bytes [`mesh`] writes for these attribute streams.
pub fn mesh_size(uvs: &[f32], normals: &[f32], tangents: &[f32]) -> usize {
    vertex_count(uvs, normals) * vertex_stride(uvs, normals, tangents)
}

/// Encodes the vertex attributes into `out` and returns the number of bytes written.
/// Writes nothing when the mesh has neither normals nor uvs. Tangents are dropped without
/// normals.
pub fn mesh(out: &mut [u8], uvs: &[f32], normals: &[f32], tangents: &[f32]) -> usize {
    debug_assert!(uvs.len() % 2 == 0);
    debug_assert!(normals.len() % 3 == 0);
    debug_assert!(tangents.len() % 3 == 0);

    let has_uvs = !uvs.is_empty();
    let has_normals = !normals.is_empty();
    let has_tangents = has_normals && !tangents.is_empty();

    if !(has_uvs || has_normals) {
        return 0;
    }

    let n = vertex_count(uvs, normals);
    if has_uvs && has_normals {
        debug_assert_eq!(uvs.len() / 2, n);
    }
    if has_tangents {
        debug_assert_eq!(tangents.len() / 3, n);
    }

    let mut offset = 0;
    for i in 0..n {
        if has_normals {
            let normal = Vec3::new(normals[i * 3], normals[i * 3 + 1], normals[i * 3 + 2]);
            out[offset..offset + 4].copy_from_slice(&normal_octahedral(normal).to_le_bytes());
            offset += 4;

            if has_tangents {
                let tangent =
                    Vec3::new(tangents[i * 3], tangents[i * 3 + 1], tangents[i * 3 + 2]);
                let diamond = f32_to_snorm16(tangent_diamond(normal, tangent)) as u16;
                out[offset..offset + 2].copy_from_slice(&diamond.to_le_bytes());
                offset += 2;
            }
        }
        if has_uvs {
            let uv = Vec2::new(uvs[i * 2], uvs[i * 2 + 1]);
            out[offset..offset + 4].copy_from_slice(&uv_half(uv).to_le_bytes());
            offset += 4;
        }
    }
    offset
}

pub fn rg8_to_rgba8(out: &mut [u8], input: &[u8], width: u32, height: u32) {
    let pixels = width as usize * height as usize;
    for (dst, src) in out
        .chunks_exact_mut(4)
        .zip(input.chunks_exact(2))
        .take(pixels)
    {
        dst.copy_from_slice(&[src[0], src[1], 0, 255]);
    }
}

pub fn rgb8_to_rgba8(out: &mut [u8], input: &[u8], width: u32, height: u32) {
    let pixels = width as usize * height as usize;
    for (dst, src) in out
        .chunks_exact_mut(4)
        .zip(input.chunks_exact(3))
        .take(pixels)
    {
        dst.copy_from_slice(&[src[0], src[1], src[2], 255]);
    }
}

fn write_rgba32f(dst: &mut [u8], rgba: [f32; 4]) {
    for (bytes, value) in dst.chunks_exact_mut(4).zip(rgba) {
        bytes.copy_from_slice(&value.to_ne_bytes());
    }
}

pub fn rg32f_to_rgba32f(out: &mut [u8], input: &[f32], width: u32, height: u32) {
    let pixels = width as usize * height as usize;
    for (dst, src) in out
        .chunks_exact_mut(16)
        .zip(input.chunks_exact(2))
        .take(pixels)
    {
        write_rgba32f(dst, [src[0], src[1], 0.0, 1.0]);
    }
}

pub fn rgb32f_to_rgba32f(out: &mut [u8], input: &[f32], width: u32, height: u32) {
    let pixels = width as usize * height as usize;
    for (dst, src) in out
        .chunks_exact_mut(16)
        .zip(input.chunks_exact(3))
        .take(pixels)
    {
        write_rgba32f(dst, [src[0], src[1], src[2], 1.0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic points spread over the sphere.
    fn sphere_points(count: usize) -> Vec<Vec3> {
        let golden = std::f32::consts::PI * (3.0 - 5f32.sqrt());
        (0..count)
            .map(|i| {
                let y = 1.0 - (i as f32 + 0.5) / count as f32 * 2.0;
                let r = (1.0 - y * y).sqrt();
                let theta = golden * i as f32;
                Vec3::new(theta.cos() * r, y, theta.sin() * r)
            })
            .collect()
    }

    #[test]
    fn octahedral_round_trip() {
        for n in sphere_points(512) {
            let decoded = decode_normal_octahedral(normal_octahedral(n));
            assert!((decoded - n).mag() < 1e-3, "{n:?} decoded as {decoded:?}");
        }
    }

    #[test]
    fn octahedral_axis_values() {
        assert_eq!(normal_octahedral(Vec3::unit_z()), 0);
        assert_eq!(normal_octahedral(Vec3::unit_x()), 32767);
        assert_eq!(normal_octahedral(Vec3::unit_y()), 32767 << 16);
    }

    #[test]
    fn degenerate_vectors_do_not_produce_nan() {
        let decoded = decode_normal_octahedral(normal_octahedral(Vec3::zero()));
        assert!(!decoded.x.is_nan() && !decoded.y.is_nan() && !decoded.z.is_nan());

        let d = tangent_diamond(Vec3::zero(), Vec3::zero());
        assert!(!d.is_nan());
        let d = tangent_diamond(Vec3::unit_z(), Vec3::zero());
        assert!(!d.is_nan());

        let mut out = vec![0u8; 10];
        mesh(&mut out, &[0.0, 0.0], &[0.0, 0.0, 0.0], &[0.0, 0.0, 0.0]);
        let encoded = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
        assert_eq!(encoded, 0);
    }

    #[test]
    fn diamond_round_trip() {
        for n in sphere_points(64) {
            let (t1, t2) = tangent_frame(n);
            for angle in [0.0f32, 0.7, 1.9, 3.0, 4.4, 5.8] {
                let tangent = t1 * angle.cos() + t2 * angle.sin();
                let decoded = decode_tangent_diamond(n, tangent_diamond(n, tangent));
                assert!((decoded - tangent).mag() < 1e-3);
            }
        }
    }

    #[test]
    fn uv_half_packs_u_low() {
        let packed = uv_half(Vec2::new(1.0, 0.5));
        assert_eq!(packed & 0xffff, f16::from_f32(1.0).to_bits() as u32);
        assert_eq!(packed >> 16, f16::from_f32(0.5).to_bits() as u32);
    }

    #[test]
    fn mesh_layout_interleaves_present_streams() {
        let normals = [0.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let tangents = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let uvs = [0.25, 0.75, 1.0, 0.0];

        assert_eq!(mesh_size(&uvs, &normals, &tangents), 20);
        let mut out = vec![0u8; 20];
        assert_eq!(mesh(&mut out, &uvs, &normals, &tangents), 20);

        let second_uv = u32::from_le_bytes([out[16], out[17], out[18], out[19]]);
        assert_eq!(second_uv, uv_half(Vec2::new(1.0, 0.0)));

        assert_eq!(mesh_size(&uvs, &[], &[]), 8);
        assert_eq!(mesh(&mut out, &[], &[], &[]), 0);
        assert_eq!(mesh_size(&[], &[], &[]), 0);
    }

    #[test]
    fn tangents_without_normals_take_no_space() {
        let tangents = [1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let uvs = [0.25, 0.75, 1.0, 0.0];

        assert_eq!(mesh_size(&uvs, &[], &tangents), 8);
        let mut out = vec![0u8; 8];
        assert_eq!(mesh(&mut out, &uvs, &[], &tangents), 8);
        assert_eq!(mesh_size(&[], &[], &tangents), 0);
    }

    #[test]
    fn widens_pixels() {
        let mut out = vec![0u8; 8];
        rg8_to_rgba8(&mut out, &[1, 2, 3, 4], 2, 1);
        assert_eq!(out, [1, 2, 0, 255, 3, 4, 0, 255]);

        rgb8_to_rgba8(&mut out, &[1, 2, 3, 4, 5, 6], 1, 2);
        assert_eq!(out, [1, 2, 3, 255, 4, 5, 6, 255]);

        let mut out = vec![0u8; 16];
        rg32f_to_rgba32f(&mut out, &[0.5, 0.25], 1, 1);
        let floats: Vec<f32> = out
            .chunks_exact(4)
            .map(|b| f32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
            .collect();
        assert_eq!(floats, [0.5, 0.25, 0.0, 1.0]);
    }
}
