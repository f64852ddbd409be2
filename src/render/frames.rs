use ash::vk;

use crate::gpu::{Access, Alloc, DescriptorWrite, Device, Extent, GpuError, ImageDesc};

pub const TRACE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;
pub const POST_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Render targets of one slot in the frames in flight ring.
pub struct Frame<D: Device> {
    /// Traced radiance, kept in `GENERAL`
    pub trace: D::Image,
    /// Post processed output, kept in `SHADER_READ_ONLY_OPTIMAL` between frames
    pub post: D::Image,
    /// This slot's trace image and the previous slot's trace image
    pub pass_set: D::DescriptorSet,
    /// This slot's trace image and post image
    pub post_set: D::DescriptorSet,
}

pub struct Frames<D: Device> {
    frames: Vec<Frame<D>>,
    extent: Extent,
}

fn create_image<D: Device>(
    device: &D,
    extent: Extent,
    format: vk::Format,
    usage: vk::ImageUsageFlags,
) -> anyhow::Result<D::Image> {
    match device.create_image(&ImageDesc {
        extent,
        format,
        usage,
    }) {
        Alloc::Success(image) => Ok(image),
        _ => Err(GpuError::OutOfMemory("frame targets").into()),
    }
}

impl<D: Device> Frames<D> {
    pub fn create(
        device: &D,
        extent: Extent,
        pass_layout: &D::DescriptorSetLayout,
        post_layout: &D::DescriptorSetLayout,
    ) -> anyhow::Result<Self> {
        let extent = Extent::new(extent.width.max(1), extent.height.max(1));
        let count = device.frame_count();

        let mut images = Vec::with_capacity(count);
        for _ in 0..count {
            let trace = create_image(
                device,
                extent,
                TRACE_FORMAT,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            )?;
            let post = create_image(
                device,
                extent,
                POST_FORMAT,
                vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            )?;
            images.push((trace, post));
        }

        let mut frames = Vec::with_capacity(count);
        for (i, (trace, post)) in images.iter().enumerate() {
            let previous = &images[(i + count - 1) % count].0;

            let pass_set = device.create_descriptor_set(pass_layout)?;
            device.update_descriptor_set(
                &pass_set,
                &[
                    DescriptorWrite::StorageImage {
                        binding: 0,
                        image: trace,
                    },
                    DescriptorWrite::StorageImage {
                        binding: 1,
                        image: previous,
                    },
                ],
            );

            let post_set = device.create_descriptor_set(post_layout)?;
            device.update_descriptor_set(
                &post_set,
                &[
                    DescriptorWrite::StorageImage {
                        binding: 0,
                        image: trace,
                    },
                    DescriptorWrite::StorageImage {
                        binding: 1,
                        image: post,
                    },
                ],
            );

            frames.push(Frame {
                trace: trace.clone(),
                post: post.clone(),
                pass_set,
                post_set,
            });
        }

        device.sync(|cmds| {
            for frame in &frames {
                cmds.transition(
                    &frame.trace,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::GENERAL,
                    Access::NONE,
                    Access::new(
                        vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
                        vk::AccessFlags2::SHADER_STORAGE_WRITE,
                    ),
                );
                cmds.transition(
                    &frame.post,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                    Access::NONE,
                    Access::new(
                        vk::PipelineStageFlags2::FRAGMENT_SHADER,
                        vk::AccessFlags2::SHADER_READ,
                    ),
                );
            }
        });

        Ok(Self { frames, extent })
    }

    pub fn extent(&self) -> Extent {
        self.extent
    }

    pub fn get(&self, slot: usize) -> Option<&Frame<D>> {
        self.frames.get(slot)
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        gpu::host::{HostDescriptor, HostDevice},
        render::pipelines::{create_pass_layout, create_post_layout},
    };

    #[test]
    fn slots_read_the_previous_trace() {
        let device = HostDevice::new(0, 1 << 20, 3);
        let pass_layout = create_pass_layout(&device).unwrap();
        let post_layout = create_post_layout(&device).unwrap();
        let frames = Frames::create(&device, Extent::new(4, 2), &pass_layout, &post_layout)
            .unwrap();
        assert_eq!(frames.len(), 3);

        let trace_id = |slot: usize| frames.get(slot).unwrap().trace.id();
        let pass_set = &frames.get(0).unwrap().pass_set;
        assert_eq!(pass_set.get(0, 0), Some(HostDescriptor::StorageImage(trace_id(0))));
        assert_eq!(pass_set.get(1, 0), Some(HostDescriptor::StorageImage(trace_id(2))));

        let frame = frames.get(1).unwrap();
        assert_eq!(frame.trace.layout(), vk::ImageLayout::GENERAL);
        assert_eq!(frame.post.layout(), vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(frame.trace.desc().format, TRACE_FORMAT);
    }

    #[test]
    fn zero_extent_is_clamped() {
        let device = HostDevice::new(0, 1 << 20, 2);
        let pass_layout = create_pass_layout(&device).unwrap();
        let post_layout = create_post_layout(&device).unwrap();
        let frames = Frames::create(&device, Extent::new(0, 0), &pass_layout, &post_layout)
            .unwrap();
        assert_eq!(frames.extent(), Extent::new(1, 1));
    }

    #[test]
    fn exhausted_device_memory_is_an_error() {
        let device = HostDevice::new(0, 16, 2);
        let pass_layout = create_pass_layout(&device).unwrap();
        let post_layout = create_post_layout(&device).unwrap();
        assert!(Frames::create(&device, Extent::new(64, 64), &pass_layout, &post_layout).is_err());
    }
}
