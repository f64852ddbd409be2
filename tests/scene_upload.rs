mod common;

use std::{
    sync::{mpsc, Arc},
    thread,
    time::{Duration, Instant},
};

use ray_cat::{
    gpu::{host::HostDevice, Device},
    gpu_scene::Scene,
    scene::CpuScene,
};
use tokio::runtime::Runtime;

const DRAIN: &str = "Out of staging memory, draining tasks...";

fn runtime() -> Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .unwrap()
}

fn load(device: &Arc<HostDevice>, cpu: CpuScene, parallelism: usize) -> Scene<HostDevice> {
    let layout = Scene::create_layout(device.as_ref()).unwrap();
    runtime()
        .block_on(Scene::load(device.clone(), layout, cpu, parallelism))
        .unwrap()
}

#[test]
fn out_of_staging_memory_drains_and_retries_once() {
    let _guard = common::setup();
    // One triangle BLAS stages 96 bytes, two of them do not fit at once.
    let device = Arc::new(HostDevice::new(150, 1 << 20, 2));

    // The first BLAS keeps its staging memory until its build is submitted, which waits for
    // the drain.
    let (held, queue_held) = mpsc::channel();
    let holder = {
        let device = device.clone();
        thread::spawn(move || {
            let _queue = device.hold_queue();
            held.send(()).unwrap();
            let deadline = Instant::now() + Duration::from_secs(10);
            while common::count_logs(DRAIN) == 0 && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(1));
            }
        })
    };
    queue_held.recv().unwrap();

    let scene = load(&device, CpuScene::Pbrt(common::triangle_objects(2)), 32);
    holder.join().unwrap();

    assert_eq!(common::count_logs(DRAIN), 1);
    assert_eq!(common::count_logs("BLAS too large for staging heap."), 0);
    assert_eq!(scene.stats().blases, 2);
    assert_eq!(scene.stats().geometry_references, 2);
    assert_eq!(device.staging_heap().used(), 0);
}

#[test]
fn blas_larger_than_device_heap_is_skipped_once_per_object() {
    let _guard = common::setup();
    let device = Arc::new(HostDevice::new(1 << 20, 100, 2));
    let scene = load(&device, CpuScene::Pbrt(common::triangle_objects(2)), 4);

    assert_eq!(common::count_logs("BLAS too large for device heap."), 2);
    assert_eq!(common::count_logs("Out of device memory, draining tasks..."), 2);
    assert_eq!(scene.stats().blases, 0);
    assert_eq!(scene.stats().geometry_references, 2);
    assert!(device.device_heap().used() <= 100);
}

#[test]
fn objects_upload_with_small_parallelism() {
    let _guard = common::setup();
    let device = Arc::new(HostDevice::new(1 << 20, 1 << 20, 2));
    let scene = load(&device, CpuScene::Pbrt(common::triangle_objects(5)), 1);

    assert_eq!(scene.stats().blases, 5);
    assert_eq!(common::count_logs("too large"), 0);
}

#[test]
fn empty_scene_uploads_nothing() {
    let _guard = common::setup();
    let device = Arc::new(HostDevice::new(1024, 1024, 2));
    let scene = load(
        &device,
        CpuScene::Pbrt(ray_cat::scene::pbrt::Scene::default()),
        4,
    );

    let stats = scene.stats();
    assert_eq!(stats.blases, 0);
    assert_eq!(stats.instances, 0);
    assert_eq!(stats.geometry_references, 0);
    assert!(!scene.has_environment_map());
    device.wait_idle();
}

#[test]
fn partial_vertex_streams_skip_the_mesh() {
    let _guard = common::setup();
    let device = Arc::new(HostDevice::new(1 << 20, 1 << 20, 2));
    let mut cpu = common::triangle_objects(2);
    cpu.meshes[0].positions.truncate(4);
    cpu.meshes[0].normals = vec![0.0, 0.0, 1.0, 0.0];
    let scene = load(&device, CpuScene::Pbrt(cpu), 4);

    assert!(common::count_logs("not a multiple of 3") > 0);
    assert_eq!(scene.stats().blases, 1);
}
