//! Allocate/write pairs for every GPU resource of a scene.
//!
//! Allocation runs on the coordinating task and only reserves memory, so exhaustion can be
//! handled by draining in flight uploads. Writing fills the staging memory and records the
//! copies; it runs on a blocking worker and consumes the allocation.

use ash::vk;
use log::warn;

use crate::{
    encode,
    gpu::{Access, Alloc, BlasRange, BlasSize, Device, ImageDesc, Extent},
    try_alloc,
    utility::align_up,
};

use super::{
    format::{ImageSource, PixelData},
    mesh_ref::MeshRef,
    types::{to_transform, CpuGeometryReference, TlasInstance},
};

/// `VkTransformMatrixKHR`
const TRANSFORM_SIZE: u64 = 48;

/// Staging and device memory for one buffer upload. Both are absent for empty uploads.
pub struct BufferUpload<D: Device> {
    staging: Option<D::Buffer>,
    device: Option<D::Buffer>,
}

impl<D: Device> BufferUpload<D> {
    pub fn empty() -> Self {
        Self {
            staging: None,
            device: None,
        }
    }
}

pub fn allocate_buffer<D: Device>(
    device: &D,
    size: u64,
    usage: vk::BufferUsageFlags,
) -> Alloc<BufferUpload<D>> {
    if size == 0 {
        return Alloc::Success(BufferUpload::empty());
    }
    let staging = try_alloc!(device.create_staging(size));
    let buffer = try_alloc!(device.create_buffer(size, usage));
    Alloc::Success(BufferUpload {
        staging: Some(staging),
        device: Some(buffer),
    })
}

/// Fills the staging memory with `fill` and copies it to the device buffer.
pub fn write_buffer<D: Device>(
    device: &D,
    upload: BufferUpload<D>,
    fill: impl FnOnce(&mut [u8]),
) -> Option<D::Buffer> {
    let (staging, buffer) = (upload.staging?, upload.device?);
    device.map(&staging, fill);
    let size = device.buffer_size(&staging);
    device.sync(|cmds| cmds.copy_buffer(&staging, &buffer, size));
    Some(buffer)
}

/// Writes `records` back to back into `out`.
pub fn write_records<T: bytemuck::Pod>(out: &mut [u8], records: impl IntoIterator<Item = T>) {
    let size = std::mem::size_of::<T>();
    for (dst, record) in out.chunks_exact_mut(size).zip(records) {
        dst.copy_from_slice(bytemuck::bytes_of(&record));
    }
}

/// Encoded vertex attributes and indices of a mesh group.
pub struct GeometryResult<B> {
    pub buffer: Option<B>,
    pub references: Vec<CpuGeometryReference>,
}

impl<B> Default for GeometryResult<B> {
    fn default() -> Self {
        Self {
            buffer: None,
            references: Vec::new(),
        }
    }
}

fn geometry_size(mesh: &MeshRef) -> u64 {
    let attributes = encode::mesh_size(mesh.uvs, mesh.normals, mesh.encoded_tangents()) as u64;
    if attributes == 0 {
        return 0;
    }
    let indices = std::mem::size_of_val(mesh.indices) as u64;
    align_up(align_up(attributes, 16) + indices, 16)
}

pub fn allocate_geometry<D: Device>(device: &D, meshes: &[MeshRef]) -> Alloc<BufferUpload<D>> {
    let size = meshes
        .iter()
        .filter(|mesh| mesh.check())
        .map(geometry_size)
        .sum();
    allocate_buffer(
        device,
        size,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS | vk::BufferUsageFlags::STORAGE_BUFFER,
    )
}

/// Encodes every consistent mesh and returns one reference per mesh, in order.
pub fn write_geometry<D: Device>(
    device: &D,
    upload: BufferUpload<D>,
    meshes: &[MeshRef],
) -> GeometryResult<D::Buffer> {
    if meshes.is_empty() {
        return GeometryResult::default();
    }

    let base = upload
        .device
        .as_ref()
        .map_or(0, |buffer| device.buffer_address(buffer));
    let reference = |mesh: &MeshRef, vertex_address, index_address| CpuGeometryReference {
        vertex_address,
        index_address,
        flags: mesh.geometry_flags(),
        material_type: mesh.flags.material_type,
        material_id: mesh.flags.material_id,
        alpha_texture_id: mesh.flags.alpha_id,
        alpha_cutoff: mesh.flags.alpha_cutoff,
        emission: mesh.flags.emission,
    };

    let mut references = Vec::with_capacity(meshes.len());
    let mut encode_all = |map: &mut [u8]| {
        let mut offset = 0usize;
        for mesh in meshes {
            if !mesh.check() {
                references.push(reference(mesh, 0, 0));
                continue;
            }
            let vertex_start = offset;
            let vertex_size = encode::mesh(
                &mut map[offset..],
                mesh.uvs,
                mesh.normals,
                mesh.encoded_tangents(),
            );
            offset = align_up((offset + vertex_size) as u64, 16) as usize;

            let index_start = offset;
            if vertex_size > 0 {
                let indices: &[u8] = bytemuck::cast_slice(mesh.indices);
                map[offset..offset + indices.len()].copy_from_slice(indices);
                offset = align_up((offset + indices.len()) as u64, 16) as usize;
            }

            if vertex_size > 0 {
                references.push(reference(
                    mesh,
                    base + vertex_start as u64,
                    base + index_start as u64,
                ));
            } else {
                references.push(reference(mesh, 0, 0));
            }
        }
    };

    let buffer = match (upload.staging, upload.device) {
        (Some(staging), Some(buffer)) => {
            device.map(&staging, &mut encode_all);
            let size = device.buffer_size(&staging);
            device.sync(|cmds| cmds.copy_buffer(&staging, &buffer, size));
            Some(buffer)
        }
        _ => {
            encode_all(&mut []);
            None
        }
    };

    GeometryResult { buffer, references }
}

/// Staging, build input and acceleration structure memory for one BLAS.
pub struct BlasUpload<D: Device> {
    staging: Option<D::Buffer>,
    input: Option<D::Buffer>,
    blas: Option<D::AccelerationStructure>,
}

impl<D: Device> BlasUpload<D> {
    pub fn empty() -> Self {
        Self {
            staging: None,
            input: None,
            blas: None,
        }
    }
}

fn blas_input_size(mesh: &MeshRef) -> (u64, u64) {
    let positions = std::mem::size_of_val(mesh.positions) as u64;
    let indices = std::mem::size_of_val(mesh.indices) as u64;
    (positions, align_up(positions + indices, 16))
}

pub fn allocate_blas<D: Device>(device: &D, meshes: &[MeshRef]) -> Alloc<BlasUpload<D>> {
    let mut size = 0;
    let mut sizes = Vec::with_capacity(meshes.len());
    for mesh in meshes.iter().filter(|mesh| mesh.check()) {
        let (_, inputs) = blas_input_size(mesh);
        size += inputs + TRANSFORM_SIZE;
        sizes.push(BlasSize {
            vertex_count: (mesh.positions.len() / 3) as u32,
            index_count: mesh.indices.len() as u32,
            opaque: mesh.flags.alpha_cutoff == 0.0,
        });
    }
    if size == 0 {
        return Alloc::Success(BlasUpload::empty());
    }

    let staging = try_alloc!(device.create_staging(size));
    let input = try_alloc!(device.create_buffer(
        size,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
    ));
    let blas = try_alloc!(device.create_blas(&sizes));
    Alloc::Success(BlasUpload {
        staging: Some(staging),
        input: Some(input),
        blas: Some(blas),
    })
}

pub fn write_blas<D: Device>(
    device: &D,
    upload: BlasUpload<D>,
    meshes: &[MeshRef],
) -> Option<D::AccelerationStructure> {
    let (staging, input, blas) = (upload.staging?, upload.input?, upload.blas?);

    let ranges = device.map(&staging, |map| {
        let mut offset = 0u64;
        let mut ranges = Vec::with_capacity(meshes.len());
        for mesh in meshes.iter().filter(|mesh| mesh.check()) {
            let (positions, inputs) = blas_input_size(mesh);
            let at = offset as usize;

            let vertex_bytes: &[u8] = bytemuck::cast_slice(mesh.positions);
            let index_bytes: &[u8] = bytemuck::cast_slice(mesh.indices);
            map[at..at + vertex_bytes.len()].copy_from_slice(vertex_bytes);
            let at = at + vertex_bytes.len();
            map[at..at + index_bytes.len()].copy_from_slice(index_bytes);

            let transform = to_transform(mesh.mesh_to_instance);
            let at = (offset + inputs) as usize;
            map[at..at + TRANSFORM_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&transform));

            ranges.push(BlasRange {
                vertex_offset: offset,
                index_offset: offset + positions,
                transform_offset: offset + inputs,
                vertex_count: (mesh.positions.len() / 3) as u32,
                index_count: mesh.indices.len() as u32,
                opaque: mesh.flags.alpha_cutoff == 0.0,
            });
            offset += inputs + TRANSFORM_SIZE;
        }
        ranges
    });

    let size = device.buffer_size(&staging);
    device.sync(|cmds| {
        cmds.copy_buffer(&staging, &input, size);
        cmds.transfer_build_barrier();
        cmds.build_blas(&blas, &input, ranges);
    });
    Some(blas)
}

pub struct TlasUpload<D: Device> {
    staging: Option<D::Buffer>,
    instances: Option<D::Buffer>,
    tlas: Option<D::AccelerationStructure>,
    count: u32,
}

impl<D: Device> TlasUpload<D> {
    pub fn empty() -> Self {
        Self {
            staging: None,
            instances: None,
            tlas: None,
            count: 0,
        }
    }
}

pub fn allocate_tlas<D: Device>(device: &D, instances: &[TlasInstance]) -> Alloc<TlasUpload<D>> {
    let size = std::mem::size_of_val(instances) as u64;
    if size == 0 {
        return Alloc::Success(TlasUpload::empty());
    }
    let staging = try_alloc!(device.create_staging(size));
    let buffer = try_alloc!(device.create_buffer(
        size,
        vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
            | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
    ));
    let tlas = try_alloc!(device.create_tlas(instances.len() as u32));
    Alloc::Success(TlasUpload {
        staging: Some(staging),
        instances: Some(buffer),
        tlas: Some(tlas),
        count: instances.len() as u32,
    })
}

pub fn write_tlas<D: Device>(
    device: &D,
    upload: TlasUpload<D>,
    instances: &[TlasInstance],
) -> Option<D::AccelerationStructure> {
    let (staging, buffer, tlas) = (upload.staging?, upload.instances?, upload.tlas?);
    let bytes: &[u8] = bytemuck::cast_slice(instances);
    device.map(&staging, |map| map[..bytes.len()].copy_from_slice(bytes));
    device.sync(|cmds| {
        cmds.copy_buffer(&staging, &buffer, bytes.len() as u64);
        cmds.transfer_build_barrier();
        cmds.build_tlas(&tlas, &buffer, upload.count);
    });
    Some(tlas)
}

pub struct ImageUpload<D: Device> {
    staging: Option<D::Buffer>,
    image: Option<D::Image>,
}

impl<D: Device> ImageUpload<D> {
    pub fn empty() -> Self {
        Self {
            staging: None,
            image: None,
        }
    }
}

/// One and four channel images upload as is, two and three channels widen to four.
fn image_format(source: &ImageSource) -> vk::Format {
    let single = source.channels == 1;
    match (source.data.is_hdr(), single, source.srgb) {
        (true, true, _) => vk::Format::R32_SFLOAT,
        (true, false, _) => vk::Format::R32G32B32A32_SFLOAT,
        (false, true, true) => vk::Format::R8_SRGB,
        (false, true, false) => vk::Format::R8_UNORM,
        (false, false, true) => vk::Format::R8G8B8A8_SRGB,
        (false, false, false) => vk::Format::R8G8B8A8_UNORM,
    }
}

fn staging_size(source: &ImageSource) -> u64 {
    let channels = if source.channels == 1 { 1 } else { 4 };
    let element = if source.data.is_hdr() { 4 } else { 1 };
    source.width as u64 * source.height as u64 * channels * element
}

pub fn allocate_image<D: Device>(device: &D, source: &ImageSource) -> Alloc<ImageUpload<D>> {
    if !(1..=4).contains(&source.channels) {
        warn!("Image texture has bad channels ({}).", source.channels);
        return Alloc::Success(ImageUpload::empty());
    }
    let size = staging_size(source);
    if size == 0 || source.data.is_empty() {
        return Alloc::Success(ImageUpload::empty());
    }

    let staging = try_alloc!(device.create_staging(size));
    let image = try_alloc!(device.create_image(&ImageDesc {
        extent: Extent::new(source.width, source.height),
        format: image_format(source),
        usage: vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
    }));
    Alloc::Success(ImageUpload {
        staging: Some(staging),
        image: Some(image),
    })
}

pub fn write_image<D: Device>(
    device: &D,
    upload: ImageUpload<D>,
    source: &ImageSource,
) -> Option<D::Image> {
    let (staging, image) = (upload.staging?, upload.image?);
    if source.data.is_empty() {
        return None;
    }

    let (width, height) = (source.width, source.height);
    device.map(&staging, |map| match (source.channels, source.data) {
        (1 | 4, data) => {
            let bytes = data.bytes();
            let size = bytes.len().min(map.len());
            map[..size].copy_from_slice(&bytes[..size]);
        }
        (2, PixelData::U8(data)) => encode::rg8_to_rgba8(map, data, width, height),
        (2, PixelData::F32(data)) => encode::rg32f_to_rgba32f(map, data, width, height),
        (_, PixelData::U8(data)) => encode::rgb8_to_rgba8(map, data, width, height),
        (_, PixelData::F32(data)) => encode::rgb32f_to_rgba32f(map, data, width, height),
    });

    device.sync(|cmds| {
        cmds.transition(
            &image,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            Access::new(vk::PipelineStageFlags2::TOP_OF_PIPE, vk::AccessFlags2::NONE),
            Access::transfer_write(),
        );
        cmds.copy_buffer_to_image(&staging, &image);
        cmds.transition(
            &image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::transfer_write(),
            Access::new(
                vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                vk::AccessFlags2::SHADER_READ,
            ),
        );
    });
    Some(image)
}

#[cfg(test)]
mod tests {
    use ultraviolet::{Mat4, Vec3};

    use super::*;
    use crate::{
        gpu::host::{HostBuild, HostDevice},
        gpu_scene::{mesh_ref::MeshFlags, types::GeometryFlags},
    };

    const POSITIONS: [f32; 9] = [0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0];
    const NORMALS: [f32; 9] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    const UVS: [f32; 6] = [0.0, 0.0, 1.0, 0.0, 0.0, 1.0];
    const INDICES: [u32; 3] = [0, 1, 2];

    fn mesh(id: u64) -> MeshRef<'static> {
        let mut mesh = MeshRef::new(id, MeshFlags::default());
        mesh.positions = &POSITIONS;
        mesh.indices = &INDICES;
        mesh
    }

    #[test]
    fn geometry_matches_cpu_encoding() {
        let device = HostDevice::new(1 << 16, 1 << 16, 2);
        let mut shaded = mesh(0);
        shaded.normals = &NORMALS;
        shaded.uvs = &UVS;
        let mut broken = mesh(1);
        broken.normals = &NORMALS[..3];
        let meshes = [shaded.clone(), broken, mesh(2)];

        let upload = allocate_geometry(&device, &meshes).ok().unwrap();
        let result = write_geometry(&device, upload, &meshes);
        let buffer = result.buffer.unwrap();
        let base = device.buffer_address(&buffer);

        let mut expected = vec![0u8; encode::mesh_size(&UVS, &NORMALS, &[])];
        encode::mesh(&mut expected, &UVS, &NORMALS, &[]);
        let contents = buffer.contents();
        assert_eq!(&contents[..expected.len()], &expected[..]);
        assert_eq!(contents.len(), 48);
        assert_eq!(&contents[32..44], bytemuck::cast_slice::<u32, u8>(&INDICES));

        assert_eq!(result.references.len(), 3);
        assert_eq!(result.references[0].vertex_address, base);
        assert_eq!(result.references[0].index_address, base + 32);
        assert_eq!(result.references[1].vertex_address, 0);
        assert!(result.references[1].flags.contains(GeometryFlags::NORMALS));
        assert_eq!(result.references[2].vertex_address, 0);
    }

    #[test]
    fn streamless_meshes_need_no_geometry_memory() {
        let device = HostDevice::new(0, 0, 2);
        let meshes = [mesh(0)];
        let upload = allocate_geometry(&device, &meshes).ok().unwrap();
        let result = write_geometry(&device, upload, &meshes);
        assert!(result.buffer.is_none());
        assert_eq!(result.references.len(), 1);
    }

    #[test]
    fn blas_input_layout() {
        let device = HostDevice::new(1 << 16, 1 << 16, 2);
        let mut second = mesh(1);
        second.mesh_to_instance = Mat4::from_translation(Vec3::new(0.0, 0.0, 2.0));
        second.flags.alpha_cutoff = 0.5;
        let meshes = [mesh(0), second];

        let upload = allocate_blas(&device, &meshes).ok().unwrap();
        let blas = write_blas(&device, upload, &meshes).unwrap();

        let Some(HostBuild::Blas { ranges }) = blas.build() else {
            panic!("BLAS was not built");
        };
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].index_offset, 36);
        assert_eq!(ranges[0].transform_offset, 48);
        assert_eq!(ranges[1].vertex_offset, 96);
        assert!(ranges[0].opaque);
        assert!(!ranges[1].opaque);
    }

    #[test]
    fn blas_reports_exhausted_heaps() {
        let meshes = [mesh(0)];
        let no_staging = HostDevice::new(0, 1 << 16, 2);
        assert!(matches!(
            allocate_blas(&no_staging, &meshes),
            Alloc::StagingFull
        ));
        let no_device = HostDevice::new(1 << 16, 0, 2);
        assert!(matches!(allocate_blas(&no_device, &meshes), Alloc::DeviceFull));
        assert!(allocate_blas(&no_device, &[]).is_success());
    }

    #[test]
    fn images_widen_three_channels() {
        let device = HostDevice::new(1 << 16, 1 << 16, 2);
        let pixels = [1u8, 2, 3, 4, 5, 6];
        let source = ImageSource {
            data: PixelData::U8(&pixels),
            width: 2,
            height: 1,
            channels: 3,
            srgb: true,
        };
        let upload = allocate_image(&device, &source).ok().unwrap();
        let image = write_image(&device, upload, &source).unwrap();
        assert_eq!(image.desc().format, vk::Format::R8G8B8A8_SRGB);
        assert_eq!(image.contents(), [1, 2, 3, 255, 4, 5, 6, 255]);
        assert_eq!(image.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    #[test]
    fn bad_channel_counts_are_skipped() {
        let device = HostDevice::new(1 << 16, 1 << 16, 2);
        let pixels = [0u8; 5];
        let source = ImageSource {
            data: PixelData::U8(&pixels),
            width: 1,
            height: 1,
            channels: 5,
            srgb: false,
        };
        let upload = allocate_image(&device, &source).ok().unwrap();
        assert!(write_image(&device, upload, &source).is_none());
    }

    #[test]
    fn hdr_single_channel_format() {
        let pixels = [0.5f32; 4];
        let source = ImageSource {
            data: PixelData::F32(&pixels),
            width: 2,
            height: 2,
            channels: 1,
            srgb: true,
        };
        assert_eq!(image_format(&source), vk::Format::R32_SFLOAT);
        assert_eq!(staging_size(&source), 16);
    }
}
