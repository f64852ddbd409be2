use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use env_logger::Env;
use log::{info, warn};

use ray_cat::{
    camera::{Camera, CameraSettings},
    config_loader::ConfigFileLoader,
    render::{PipelineId, Renderer, ShaderLoader},
    time::Stopwatch,
    vulkan::{VulkanDevice, VulkanSettings},
};

const DEFAULT_FRAMES: u32 = 64;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config_path = args.next().unwrap_or_else(|| "config.json".to_string());
    let frames = match args.next() {
        Some(frames) => frames
            .parse::<u32>()
            .with_context(|| format!("Invalid frame count {}", frames))?,
        None => DEFAULT_FRAMES,
    };

    let mut config_loader = ConfigFileLoader::new(&config_path);
    let config = config_loader.load_config()?.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Could not create the async runtime")?;

    let device = Arc::new(VulkanDevice::new(&VulkanSettings {
        frames_in_flight: config.frames_in_flight,
        staging_heap_bytes: config.staging_heap_bytes,
        device_heap_bytes: config.device_heap_bytes,
    })?);

    let shaders = match ShaderLoader::<PipelineId>::watch(&config.shader_dir) {
        Ok(shaders) => shaders,
        Err(error) => {
            warn!("Shader hot reload disabled: {:#}", error);
            ShaderLoader::new(&config.shader_dir)
        }
    };

    let mut camera = match &config.cached.camera_position {
        Some(cached) => Camera::from_cached(CameraSettings::default(), cached),
        None => Camera::new(CameraSettings::default()),
    };
    camera.set_extent(config.extent);

    let mut renderer = Renderer::new(
        device,
        runtime.handle().clone(),
        config.render.clone(),
        shaders,
        config.extent,
    )?;

    if let Some(scene_path) = &config.scene_path {
        renderer.load_scene(scene_path.clone());
        if renderer.wait_for_scene(&mut camera) {
            // Loading resets the camera, the cached position wins.
            if let Some(cached) = &config.cached.camera_position {
                camera = Camera::from_cached(camera.settings.clone(), cached);
            }
        }
    }

    let stopwatch = Stopwatch::start();
    for _ in 0..frames {
        renderer.render(&camera);
    }
    info!("Rendered {} frames in {:.2} ms.", frames, stopwatch.ms());

    let path = renderer.save_image(PathBuf::from("render.png"))?;
    info!("Wrote {}", path.display());
    Ok(())
}
