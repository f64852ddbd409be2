//! The frame loop: integrator selection, progressive accumulation, pipeline hot reload and
//! asynchronous scene swaps.

pub mod frames;
mod gui;
pub mod pipelines;
pub mod post;
mod save;
pub mod settings;
pub mod shader_loader;
pub mod shader_types;

use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use ash::vk;
use log::{error, info, warn};
use tokio::{runtime::Handle, task::JoinHandle};
use ultraviolet::{Mat4, Vec3};

use crate::{
    async_pool,
    camera::Camera,
    gpu::{Access, CommandList, Device, Extent},
    gpu_scene::Scene,
    scene::{ParseError, SceneParsers},
    time::Stopwatch,
};

pub use self::{
    pipelines::PipelineId,
    post::{postprocess_op, PostOp},
    settings::{GeometryMode, Integrator, Settings, ShadingMode, Tonemap},
    shader_loader::ShaderLoader,
};

use self::{
    frames::{Frame, Frames},
    pipelines::Pipelines,
    post::dispatch_groups,
    shader_types::{
        push_bytes, AmbientOcclusionConstants, GeometryConstants, MaterialPathConstants,
        PostConstants, ShadingConstants,
    },
};

pub struct Renderer<D: Device> {
    device: Arc<D>,
    runtime: Handle,
    settings: Settings,

    scene_layout: D::DescriptorSetLayout,
    pass_layout: D::DescriptorSetLayout,
    post_layout: D::DescriptorSetLayout,

    shaders: ShaderLoader<PipelineId>,
    pipelines: Pipelines<D>,
    frames: Frames<D>,

    scene: Scene<D>,
    parsers: SceneParsers,
    loading: Option<JoinHandle<Option<Scene<D>>>>,

    stationary_frames: u32,
    needs_reset: bool,
    current_iview: Mat4,
    current_iproj: Mat4,

    scene_path: String,
    image_path: String,
}

impl<D: Device> Renderer<D> {
    /// Creates the layouts, every pipeline and the frame targets, and starts with an empty
    /// scene. Pipelines whose shaders fail to build are skipped until a reload succeeds.
    pub fn new(
        device: Arc<D>,
        runtime: Handle,
        settings: Settings,
        mut shaders: ShaderLoader<PipelineId>,
        extent: Extent,
    ) -> anyhow::Result<Self> {
        let scene_layout = Scene::create_layout(device.as_ref())
            .context("Failed to create the scene descriptor set layout")?;
        let pass_layout = pipelines::create_pass_layout(device.as_ref())?;
        let post_layout = pipelines::create_post_layout(device.as_ref())?;
        let scene = Scene::empty(device.clone(), scene_layout.clone())?;

        pipelines::register_shaders(&mut shaders);
        let mut pipelines = Pipelines::default();
        let layouts = [&scene_layout, &pass_layout, &post_layout];
        for &integrator in Integrator::ALL {
            let id = PipelineId::Trace(integrator);
            if let Some(pipeline) = pipelines::try_create(device.as_ref(), &shaders, id, layouts)
            {
                pipelines.replace_trace(integrator, pipeline, &scene);
            }
        }
        pipelines.post = pipelines::try_create(device.as_ref(), &shaders, PipelineId::Post, layouts);

        let frames = Frames::create(device.as_ref(), extent, &pass_layout, &post_layout)?;

        Ok(Self {
            device,
            runtime,
            settings,
            scene_layout,
            pass_layout,
            post_layout,
            shaders,
            pipelines,
            frames,
            scene,
            parsers: SceneParsers::default(),
            loading: None,
            stationary_frames: 0,
            needs_reset: true,
            current_iview: Mat4::identity(),
            current_iproj: Mat4::identity(),
            scene_path: String::new(),
            image_path: "render.png".to_string(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replaces the settings, resetting accumulation when the traced image changes.
    pub fn set_settings(&mut self, settings: Settings) {
        if self.settings.resets_accumulation(&settings) {
            self.needs_reset = true;
        }
        self.settings = settings;
    }

    pub fn stationary_frames(&self) -> u32 {
        self.stationary_frames
    }

    pub fn needs_reset(&self) -> bool {
        self.needs_reset
    }

    pub fn scene(&self) -> &Scene<D> {
        &self.scene
    }

    pub fn is_loading(&self) -> bool {
        self.loading.is_some()
    }

    pub fn extent(&self) -> Extent {
        self.frames.extent()
    }

    pub fn parsers_mut(&mut self) -> &mut SceneParsers {
        &mut self.parsers
    }

    pub fn shaders_mut(&mut self) -> &mut ShaderLoader<PipelineId> {
        &mut self.shaders
    }

    /// Renders one frame: traces with the selected integrator, then post processes into the
    /// output image of the current slot.
    pub fn render(&mut self, camera: &Camera) {
        self.device.begin_frame();
        self.reload_pipelines();

        let iview = camera.inverse_view();
        let iproj = camera.inverse_projection();
        self.accumulate(iview, iproj);

        let slot = self.device.frame();
        let Some(frame) = self.frames.get(slot) else {
            error!("No render targets for frame slot {}", slot);
            return;
        };

        let mut commands = CommandList::new();
        self.trace(&mut commands, frame, iview, iproj);
        trace_compute_barrier(&mut commands);

        commands.transition(
            &frame.post,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            vk::ImageLayout::GENERAL,
            Access::new(
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_READ,
            ),
            Access::new(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
        );
        if let Some(post) = &self.pipelines.post {
            let extent = self.frames.extent();
            let constants = PostConstants {
                op: postprocess_op(&self.settings, false) as u32,
                width: extent.width,
                height: extent.height,
                gamma: self.settings.gamma,
                exposure: self.settings.exposure,
            };
            commands.dispatch(
                post,
                &[&frame.post_set],
                &push_bytes(&constants),
                dispatch_groups(extent.width, extent.height),
            );
        }
        commands.transition(
            &frame.post,
            vk::ImageLayout::GENERAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            Access::new(
                vk::PipelineStageFlags2::COMPUTE_SHADER,
                vk::AccessFlags2::SHADER_STORAGE_WRITE,
            ),
            Access::new(
                vk::PipelineStageFlags2::FRAGMENT_SHADER,
                vk::AccessFlags2::SHADER_READ,
            ),
        );

        self.device.submit_frame(commands);
    }

    /// Updates the stationary frame count for this frame's camera matrices.
    fn accumulate(&mut self, iview: Mat4, iproj: Mat4) {
        if !self.settings.accumulate
            || self.needs_reset
            || iview != self.current_iview
            || iproj != self.current_iproj
        {
            self.current_iview = iview;
            self.current_iproj = iproj;
            self.stationary_frames = 0;
            self.needs_reset = false;
        } else {
            self.stationary_frames = self.stationary_frames.saturating_add(1);
        }
        self.stationary_frames = self
            .stationary_frames
            .min(self.settings.max_stationary_frames);
    }

    fn trace(&self, commands: &mut CommandList<D>, frame: &Frame<D>, iview: Mat4, iproj: Mat4) {
        let settings = &self.settings;
        let stationary_frames = self.stationary_frames;
        let converged = stationary_frames >= settings.max_stationary_frames;
        if settings.integrator.is_progressive() && converged {
            return;
        }

        let push_constants = match settings.integrator {
            Integrator::Geometry => push_bytes(&GeometryConstants {
                iview,
                iproj,
                mode: settings.geometry_mode as u32,
                stationary_frames,
            }),
            Integrator::Shading => push_bytes(&ShadingConstants {
                iview,
                iproj,
                mode: settings.shading_mode as u32,
            }),
            Integrator::AmbientOcclusion => push_bytes(&AmbientOcclusionConstants {
                iview,
                iproj,
                stationary_frames,
                samples_per_frame: settings.samples_per_frame,
                enable_shading_normals: settings.shading_normals as u32,
                sun: settings.sun,
            }),
            Integrator::MaterialPath => push_bytes(&MaterialPathConstants {
                iview,
                iproj,
                stationary_frames,
                samples_per_frame: settings.samples_per_frame,
                max_depth: settings.max_depth,
                roulette: settings.roulette as u32,
                suppress_fireflies: settings.suppress_fireflies,
                shading_normals: settings.shading_normals as u32,
                environment: if self.scene.has_environment_map() {
                    -1.0
                } else {
                    settings.sun
                },
            }),
        };

        let Some(trace) = self.pipelines.trace(settings.integrator) else {
            return;
        };
        let Some(table) = &trace.table else {
            return;
        };
        commands.trace_rays(
            &trace.pipeline,
            table,
            &[self.scene.set(), &frame.pass_set],
            &push_constants,
            self.frames.extent(),
        );
    }

    /// Applies finished shader reloads. Each rebuilt pipeline gets a fresh binding table and
    /// resets accumulation.
    fn reload_pipelines(&mut self) {
        for id in self.shaders.poll() {
            let layouts = [&self.scene_layout, &self.pass_layout, &self.post_layout];
            let Some(pipeline) =
                pipelines::try_create(self.device.as_ref(), &self.shaders, id, layouts)
            else {
                continue;
            };
            match id {
                PipelineId::Trace(integrator) => {
                    if let Some(old) =
                        self.pipelines
                            .replace_trace(integrator, pipeline, &self.scene)
                    {
                        self.device.defer_drop(Box::new(old));
                    }
                }
                PipelineId::Post => {
                    if let Some(old) = self.pipelines.replace_post(pipeline) {
                        self.device.defer_drop(Box::new(old));
                    }
                }
            }
            self.stationary_frames = 0;
            self.needs_reset = true;
        }
    }

    /// Recreates the frame targets at `extent`.
    pub fn on_resize(&mut self, extent: Extent) -> anyhow::Result<()> {
        let frames = Frames::create(
            self.device.as_ref(),
            extent,
            &self.pass_layout,
            &self.post_layout,
        )?;
        let old = std::mem::replace(&mut self.frames, frames);
        self.device.defer_drop(Box::new(old));
        self.needs_reset = true;
        Ok(())
    }

    /// The post processed image of the current frame slot, in `SHADER_READ_ONLY_OPTIMAL`.
    pub fn output(&self) -> Option<&D::Image> {
        self.frames.get(self.device.frame()).map(|frame| &frame.post)
    }

    /// Starts loading the scene at `path` in the background. Ignored while another load runs.
    pub fn load_scene(&mut self, path: impl Into<PathBuf>) {
        if self.loading.is_some() {
            warn!("A scene is already loading.");
            return;
        }
        let path = path.into();
        let device = self.device.clone();
        let layout = self.scene_layout.clone();
        let parsers = self.parsers.clone();
        let parallelism = self.settings.max_parallelism.max(1);
        self.loading = Some(self.runtime.spawn(load_scene(
            device,
            layout,
            parsers,
            path,
            parallelism,
        )));
    }

    /// Swaps in a finished load without blocking. Returns true when the scene changed.
    pub fn poll_scene(&mut self, camera: &mut Camera) -> bool {
        if !self.loading.as_ref().is_some_and(JoinHandle::is_finished) {
            return false;
        }
        self.finish_loading(camera)
    }

    /// Blocks until the running load finishes and swaps it in.
    pub fn wait_for_scene(&mut self, camera: &mut Camera) -> bool {
        self.finish_loading(camera)
    }

    fn finish_loading(&mut self, camera: &mut Camera) -> bool {
        let Some(handle) = self.loading.take() else {
            return false;
        };
        let Some(scene) = async_pool::block_on(&self.runtime, async_pool::join(handle)) else {
            return false;
        };
        self.swap_scene(scene);
        camera.set_position(Vec3::zero());
        true
    }

    /// Replaces the scene with an empty one.
    pub fn clear_scene(&mut self) -> anyhow::Result<()> {
        let scene = Scene::empty(self.device.clone(), self.scene_layout.clone())?;
        self.swap_scene(scene);
        Ok(())
    }

    fn swap_scene(&mut self, scene: Scene<D>) {
        let old = std::mem::replace(&mut self.scene, scene);
        self.device.defer_drop(Box::new(old));
        self.needs_reset = true;
        self.pipelines
            .rebuild_tables(self.device.as_ref(), &self.scene);
    }
}

impl<D: Device> Drop for Renderer<D> {
    fn drop(&mut self) {
        if let Some(handle) = self.loading.take() {
            drop(async_pool::block_on(&self.runtime, async_pool::join(handle)));
        }
        self.device.wait_idle();
    }
}

/// Makes ray tracing writes visible to the post pass and to the next frame's trace.
fn trace_compute_barrier<D: Device>(commands: &mut CommandList<D>) {
    let trace_write = Access::new(
        vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
        vk::AccessFlags2::SHADER_STORAGE_WRITE,
    );
    commands.barrier(
        trace_write,
        Access::new(
            vk::PipelineStageFlags2::COMPUTE_SHADER,
            vk::AccessFlags2::SHADER_STORAGE_READ,
        ),
    );
    commands.barrier(
        trace_write,
        Access::new(
            vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR,
            vk::AccessFlags2::SHADER_STORAGE_READ | vk::AccessFlags2::SHADER_STORAGE_WRITE,
        ),
    );
}

async fn load_scene<D: Device>(
    device: Arc<D>,
    layout: D::DescriptorSetLayout,
    parsers: SceneParsers,
    path: PathBuf,
    parallelism: usize,
) -> Option<Scene<D>> {
    let started = Stopwatch::start();
    let parse_path = path.clone();
    let cpu = match async_pool::suspend(move || parsers.parse(&parse_path)).await {
        Ok(cpu) => cpu,
        Err(error @ ParseError::UnknownFileType(_)) => {
            warn!("{}", error);
            return None;
        }
        Err(error) => {
            error!("Failed to load scene {}: {}", path.display(), error);
            return None;
        }
    };
    info!("Loaded scene from disk in {:.2} ms.", started.ms());

    let upload = Stopwatch::start();
    let scene = match Scene::load(device, layout, cpu, parallelism).await {
        Ok(scene) => scene,
        Err(error) => {
            error!("Failed to upload scene {}: {:#}", path.display(), error);
            return None;
        }
    };
    info!("Uploaded scene to GPU in {:.2} ms.", upload.ms());
    info!("Scene loaded in {:.2} ms.", started.ms());
    Some(scene)
}
