use std::path::PathBuf;

use anyhow::{format_err, Context};
use ash::vk;
use log::info;

use crate::gpu::{Access, Alloc, DescriptorWrite, Device, GpuError, ImageDesc};

use super::{
    post::{dispatch_groups, postprocess_op},
    shader_types::{push_bytes, PostConstants},
    Renderer,
};

/// `path` with a `.png` extension.
pub fn png_path(path: impl Into<PathBuf>) -> PathBuf {
    let mut path = path.into();
    let is_png = path
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("png"));
    if !is_png {
        let mut name = path.clone().into_os_string();
        name.push(".png");
        path = PathBuf::from(name);
    }
    path
}

impl<D: Device> Renderer<D> {
    /// Post processes the current trace into an 8 bit sRGB image and writes it as a PNG.
    /// Returns the path written to.
    pub fn save_image(&self, path: impl Into<PathBuf>) -> anyhow::Result<PathBuf> {
        let path = png_path(path);
        let device = self.device.as_ref();
        let frame = self
            .frames
            .get(device.frame())
            .ok_or_else(|| format_err!("No frame to save"))?;
        let post = self
            .pipelines
            .post
            .as_ref()
            .ok_or_else(|| format_err!("Post processing pipeline is not available"))?;
        let extent = self.frames.extent();

        let Alloc::Success(image) = device.create_image(&ImageDesc {
            extent,
            format: vk::Format::R8G8B8A8_UNORM,
            usage: vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_SRC,
        }) else {
            return Err(GpuError::OutOfMemory("output image").into());
        };
        let Alloc::Success(staging) = device.create_staging(extent.pixels() * 4) else {
            return Err(GpuError::OutOfMemory("output staging buffer").into());
        };

        let set = device.create_descriptor_set(&self.post_layout)?;
        device.update_descriptor_set(
            &set,
            &[
                DescriptorWrite::StorageImage {
                    binding: 0,
                    image: &frame.trace,
                },
                DescriptorWrite::StorageImage {
                    binding: 1,
                    image: &image,
                },
            ],
        );

        let constants = PostConstants {
            op: postprocess_op(&self.settings, true) as u32,
            width: extent.width,
            height: extent.height,
            gamma: self.settings.gamma,
            exposure: self.settings.exposure,
        };
        let compute_write = Access::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_WRITE,
        );
        device.sync(|cmds| {
            cmds.transition(
                &image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::GENERAL,
                Access::NONE,
                compute_write,
            );
            cmds.dispatch(
                post,
                &[&set],
                &push_bytes(&constants),
                dispatch_groups(extent.width, extent.height),
            );
            cmds.transition(
                &image,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                compute_write,
                Access::transfer_read(),
            );
            cmds.copy_image_to_buffer(&image, &staging);
        });

        let pixels = device.map(&staging, |data| data.to_vec());
        let output = image::RgbaImage::from_raw(extent.width, extent.height, pixels)
            .context("Output buffer does not match the image size")?;
        output
            .save(&path)
            .with_context(|| format!("Could not write {}", path.display()))?;
        info!("Saved image to {}", path.display());
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn png_extension_is_appended() {
        assert_eq!(png_path("out"), PathBuf::from("out.png"));
        assert_eq!(png_path("out.jpg"), PathBuf::from("out.jpg.png"));
        assert_eq!(png_path("dir/out.PNG"), PathBuf::from("dir/out.PNG"));
    }
}
