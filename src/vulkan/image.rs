use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{vulkan::Allocator, MemoryLocation};

use crate::gpu::{Extent, ImageDesc, Reservation};

use super::{
    buffer::{BufferError, Memory},
    context::Context,
};

pub struct ImageInner {
    pub inner: vk::Image,
    pub view: vk::ImageView,
    pub desc: ImageDesc,
    _memory: Memory,
    context: Arc<Context>,
}

impl Drop for ImageInner {
    fn drop(&mut self) {
        let device = &self.context.device;
        unsafe { device.destroy_image_view(self.view, None) };
        unsafe { device.destroy_image(self.inner, None) };
    }
}

/// Single mip, single layer 2D color image with a full view.
#[derive(Clone)]
pub struct Image(Arc<ImageInner>);

pub fn full_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

pub fn full_subresource_layers() -> vk::ImageSubresourceLayers {
    vk::ImageSubresourceLayers {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        mip_level: 0,
        base_array_layer: 0,
        layer_count: 1,
    }
}

impl Image {
    pub fn new(
        context: Arc<Context>,
        allocator: &Arc<Mutex<Allocator>>,
        desc: &ImageDesc,
        reservation: Reservation,
    ) -> Result<Image, BufferError> {
        let device = &context.device;

        let create_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .format(desc.format)
            .extent(vk::Extent3D {
                width: desc.extent.width.max(1),
                height: desc.extent.height.max(1),
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(desc.usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&create_info, None) }?;
        let requirements = unsafe { device.get_image_memory_requirements(image) };

        let memory = match Memory::allocate(
            allocator,
            "image",
            requirements,
            MemoryLocation::GpuOnly,
            false,
            Some(reservation),
        ) {
            Ok(memory) => memory,
            Err(error) => {
                unsafe { device.destroy_image(image, None) };
                return Err(error.into());
            }
        };

        let (device_memory, offset) = memory.binding();
        if let Err(error) = unsafe { device.bind_image_memory(image, device_memory, offset) } {
            unsafe { device.destroy_image(image, None) };
            return Err(error.into());
        }

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(desc.format)
            .subresource_range(full_subresource_range());
        let view = match unsafe { device.create_image_view(&view_info, None) } {
            Ok(view) => view,
            Err(error) => {
                unsafe { device.destroy_image(image, None) };
                return Err(error.into());
            }
        };

        Ok(Image(Arc::new(ImageInner {
            inner: image,
            view,
            desc: *desc,
            _memory: memory,
            context,
        })))
    }

    pub fn inner(&self) -> vk::Image {
        self.0.inner
    }

    pub fn view(&self) -> vk::ImageView {
        self.0.view
    }

    pub fn extent(&self) -> Extent {
        self.0.desc.extent
    }

    pub fn extent_3d(&self) -> vk::Extent3D {
        vk::Extent3D {
            width: self.0.desc.extent.width.max(1),
            height: self.0.desc.extent.height.max(1),
            depth: 1,
        }
    }
}

struct SamplerInner {
    inner: vk::Sampler,
    context: Arc<Context>,
}

impl Drop for SamplerInner {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_sampler(self.inner, None) };
    }
}

#[derive(Clone)]
pub struct Sampler(Arc<SamplerInner>);

impl Sampler {
    pub fn new(
        context: Arc<Context>,
        config: &crate::gpu::SamplerConfig,
    ) -> Result<Sampler, vk::Result> {
        let create_info = vk::SamplerCreateInfo::builder()
            .min_filter(config.min)
            .mag_filter(config.mag)
            .address_mode_u(config.u)
            .address_mode_v(config.v)
            .address_mode_w(config.w)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .max_lod(vk::LOD_CLAMP_NONE);
        let inner = unsafe { context.device.create_sampler(&create_info, None) }?;
        Ok(Sampler(Arc::new(SamplerInner { inner, context })))
    }

    pub fn inner(&self) -> vk::Sampler {
        self.0.inner
    }
}
