mod common;

use std::{
    path::Path,
    sync::{mpsc, Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use ray_cat::{
    camera::{Camera, CameraSettings},
    gpu::{host::HostDevice, Extent},
    render::{Integrator, PipelineId, Renderer, Settings, ShaderLoader},
    scene::{CpuScene, ParseError, SceneParser},
};
use tempfile::TempDir;
use tokio::runtime::Runtime;
use ultraviolet::Vec3;

/// Fields drop in order, the renderer has to go before its runtime.
struct Harness {
    renderer: Renderer<HostDevice>,
    device: Arc<HostDevice>,
    _runtime: Runtime,
    shaders: TempDir,
}

fn harness(settings: Settings) -> Harness {
    let shaders = common::shader_dir();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap();
    let device = Arc::new(HostDevice::new(1 << 20, 1 << 24, 2));
    let renderer = Renderer::new(
        device.clone(),
        runtime.handle().clone(),
        settings,
        ShaderLoader::new(shaders.path()),
        Extent::new(8, 8),
    )
    .unwrap();
    device.clear_history();
    Harness {
        renderer,
        device,
        _runtime: runtime,
        shaders,
    }
}

fn camera() -> Camera {
    let mut camera = Camera::new(CameraSettings::default());
    camera.set_extent(Extent::new(8, 8));
    camera
}

struct Triangles;

impl SceneParser for Triangles {
    fn extensions(&self) -> &[&'static str] {
        &["tri"]
    }

    fn parse(&self, _path: &Path) -> Result<CpuScene, ParseError> {
        Ok(CpuScene::Pbrt(common::triangle_objects(3)))
    }
}

#[test]
fn stationary_frames_count_up_while_the_camera_rests() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let camera = camera();

    for _ in 0..4 {
        h.renderer.render(&camera);
    }
    assert_eq!(h.renderer.stationary_frames(), 3);
    assert_eq!(h.device.frames_submitted(), 4);
}

#[test]
fn camera_movement_resets_accumulation() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let mut camera = camera();

    h.renderer.render(&camera);
    h.renderer.render(&camera);
    assert_eq!(h.renderer.stationary_frames(), 1);

    camera.set_position(Vec3::new(1.0, 0.0, 0.0));
    h.renderer.render(&camera);
    assert_eq!(h.renderer.stationary_frames(), 0);
}

#[test]
fn disabled_accumulation_never_counts() {
    let _guard = common::setup();
    let mut h = harness(Settings {
        accumulate: false,
        ..Settings::default()
    });
    let camera = camera();

    for _ in 0..3 {
        h.renderer.render(&camera);
        assert_eq!(h.renderer.stationary_frames(), 0);
    }
}

#[test]
fn resize_resets_accumulation() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let camera = camera();

    h.renderer.render(&camera);
    h.renderer.render(&camera);
    h.renderer.on_resize(Extent::new(16, 4)).unwrap();
    assert!(h.renderer.needs_reset());
    assert_eq!(h.renderer.extent(), Extent::new(16, 4));

    h.renderer.render(&camera);
    assert_eq!(h.renderer.stationary_frames(), 0);
    assert!(!h.renderer.needs_reset());
}

#[test]
fn integrator_switch_resets_but_tonemap_does_not() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let camera = camera();
    h.renderer.render(&camera);

    let mut settings = h.renderer.settings().clone();
    settings.exposure = 3.0;
    h.renderer.set_settings(settings.clone());
    assert!(!h.renderer.needs_reset());

    settings.integrator = Integrator::Geometry;
    h.renderer.set_settings(settings);
    assert!(h.renderer.needs_reset());

    h.device.clear_history();
    h.renderer.render(&camera);
    assert_eq!(h.device.trace_count("geometry"), 1);
    assert_eq!(h.device.trace_count("mp"), 0);
}

#[test]
fn converged_progressive_integrators_stop_tracing() {
    let _guard = common::setup();
    let mut h = harness(Settings {
        integrator: Integrator::MaterialPath,
        max_stationary_frames: 2,
        ..Settings::default()
    });
    let camera = camera();

    for _ in 0..5 {
        h.renderer.render(&camera);
    }
    assert_eq!(h.renderer.stationary_frames(), 2);
    assert_eq!(h.device.trace_count("mp"), 2);
    assert_eq!(h.device.dispatch_count("post"), 5);
}

#[test]
fn non_progressive_integrators_keep_tracing() {
    let _guard = common::setup();
    let mut h = harness(Settings {
        integrator: Integrator::Shading,
        max_stationary_frames: 1,
        ..Settings::default()
    });
    let camera = camera();

    for _ in 0..3 {
        h.renderer.render(&camera);
    }
    assert_eq!(h.device.trace_count("shading"), 3);
}

#[test]
fn finished_scene_load_swaps_scene_and_recenters_camera() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    h.renderer.parsers_mut().register(Triangles);
    let mut camera = camera();
    camera.set_position(Vec3::new(4.0, 5.0, 6.0));
    h.renderer.render(&camera);
    h.renderer.render(&camera);

    h.renderer.load_scene(h.shaders.path().join("scene.tri"));
    assert!(h.renderer.is_loading());
    assert!(h.renderer.wait_for_scene(&mut camera));

    assert!(!h.renderer.is_loading());
    assert_eq!(camera.position, Vec3::zero());
    assert_eq!(h.renderer.scene().stats().blases, 3);
    assert!(h.renderer.needs_reset());

    h.renderer.render(&camera);
    assert_eq!(h.renderer.stationary_frames(), 0);
    assert!(!h.renderer.poll_scene(&mut camera));
}

/// Parses only once the test lets it.
struct Gated {
    release: Mutex<mpsc::Receiver<()>>,
}

impl SceneParser for Gated {
    fn extensions(&self) -> &[&'static str] {
        &["gated"]
    }

    fn parse(&self, _path: &Path) -> Result<CpuScene, ParseError> {
        let _ = self.release.lock().unwrap().recv();
        Ok(CpuScene::Pbrt(common::triangle_objects(3)))
    }
}

#[test]
fn scene_swaps_only_after_the_load_finishes() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let (release, gate) = mpsc::channel();
    h.renderer.parsers_mut().register(Gated {
        release: Mutex::new(gate),
    });
    let mut camera = camera();

    h.renderer.load_scene(h.shaders.path().join("scene.gated"));
    for _ in 0..4 {
        h.renderer.render(&camera);
        assert!(!h.renderer.poll_scene(&mut camera));
    }
    assert!(h.renderer.is_loading());
    assert_eq!(h.renderer.scene().stats().blases, 0);
    assert_eq!(h.renderer.stationary_frames(), 3);

    release.send(()).unwrap();
    let deadline = Instant::now() + Duration::from_secs(10);
    while !h.renderer.poll_scene(&mut camera) {
        assert!(Instant::now() < deadline, "scene load did not finish");
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(h.renderer.scene().stats().blases, 3);
    assert!(h.renderer.needs_reset());

    let counts: Vec<u32> = (0..3)
        .map(|_| {
            h.renderer.render(&camera);
            h.renderer.stationary_frames()
        })
        .collect();
    assert_eq!(counts, [0, 1, 2]);
}

#[test]
fn unknown_scene_type_keeps_current_scene() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let mut camera = camera();
    camera.set_position(Vec3::new(1.0, 2.0, 3.0));

    h.renderer.load_scene("scene.unknown");
    assert!(!h.renderer.wait_for_scene(&mut camera));
    assert_eq!(camera.position, Vec3::new(1.0, 2.0, 3.0));
    assert_eq!(common::count_logs("Unknown scene file type unknown."), 1);
}

#[test]
fn clear_scene_resets_accumulation() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let camera = camera();
    h.renderer.render(&camera);
    h.renderer.render(&camera);

    h.renderer.clear_scene().unwrap();
    assert!(h.renderer.needs_reset());
    assert_eq!(h.renderer.scene().stats().blases, 0);
}

#[test]
fn shader_reload_rebuilds_pipeline_and_resets() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let camera = camera();
    for _ in 0..3 {
        h.renderer.render(&camera);
    }
    assert_eq!(h.renderer.stationary_frames(), 2);

    common::clear_logs();
    h.renderer
        .shaders_mut()
        .trigger(PipelineId::Trace(Integrator::MaterialPath));
    h.device.clear_history();
    h.renderer.render(&camera);

    assert_eq!(h.renderer.stationary_frames(), 0);
    assert_eq!(h.device.trace_count("mp"), 1);
    assert_eq!(common::count_logs("Recreated material path pipeline"), 1);
}

#[test]
fn failed_shader_reload_keeps_previous_pipeline() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let camera = camera();
    h.renderer.render(&camera);

    common::write_spirv(&h.shaders.path().join("mp.rgen.spv"), false);
    common::clear_logs();
    h.renderer
        .shaders_mut()
        .trigger(PipelineId::Trace(Integrator::MaterialPath));
    h.device.clear_history();
    h.renderer.render(&camera);

    assert_eq!(common::count_logs("Failed to create"), 1);
    assert_eq!(h.device.trace_count("mp"), 1);
}

#[test]
fn missing_shaders_skip_their_pass() {
    let _guard = common::setup();
    let shaders = common::shader_dir();
    std::fs::remove_file(shaders.path().join("post.comp.spv")).unwrap();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();
    let device = Arc::new(HostDevice::new(1 << 20, 1 << 24, 2));
    let mut renderer = Renderer::new(
        device.clone(),
        runtime.handle().clone(),
        Settings::default(),
        ShaderLoader::new(shaders.path()),
        Extent::new(4, 4),
    )
    .unwrap();
    device.clear_history();

    renderer.render(&camera());
    assert_eq!(device.trace_count("mp"), 1);
    assert_eq!(device.dispatch_count("post"), 0);
    assert!(renderer.save_image(shaders.path().join("out")).is_err());
    drop(renderer);
}

#[test]
fn save_image_writes_png() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    h.renderer.render(&camera());

    let out = tempfile::tempdir().unwrap();
    let path = h.renderer.save_image(out.path().join("frame")).unwrap();
    assert_eq!(path, out.path().join("frame.png"));

    let image = image::open(&path).unwrap();
    assert_eq!((image.width(), image.height()), (8, 8));
}

#[test]
fn gui_draws_without_a_scene() {
    let _guard = common::setup();
    let mut h = harness(Settings::default());
    let mut camera = camera();
    let ctx = egui::Context::default();
    let _ = ctx.run(egui::RawInput::default(), |ctx| {
        egui::CentralPanel::default().show(ctx, |ui| {
            h.renderer.gui(ui);
            h.renderer.pick_scene(&mut camera, ui);
        });
    });
    assert!(!h.renderer.is_loading());
}
