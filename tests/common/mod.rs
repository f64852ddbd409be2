#![allow(dead_code)]

use std::{
    fs,
    path::Path,
    sync::{Mutex, MutexGuard, OnceLock},
};

use log::{LevelFilter, Log, Metadata, Record};
use ray_cat::{
    gpu::SPIRV_MAGIC,
    scene::pbrt::{Id, Mesh, Object, Scene},
};
use tempfile::TempDir;

/// Records every log message so tests can count warnings.
struct CapturingLogger {
    messages: Mutex<Vec<String>>,
}

impl Log for CapturingLogger {
    fn enabled(&self, _metadata: &Metadata) -> bool {
        true
    }

    fn log(&self, record: &Record) {
        let mut messages = self.messages.lock().unwrap_or_else(|e| e.into_inner());
        messages.push(record.args().to_string());
    }

    fn flush(&self) {}
}

static LOGGER: CapturingLogger = CapturingLogger {
    messages: Mutex::new(Vec::new()),
};

/// Serializes the tests of one binary, the logger is global.
static TEST_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

/// Installs the logger, clears previous messages and holds the test lock.
pub fn setup() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    if log::set_logger(&LOGGER).is_ok() {
        log::set_max_level(LevelFilter::Debug);
    }
    clear_logs();
    guard
}

pub fn clear_logs() {
    LOGGER.messages.lock().unwrap().clear();
}

pub fn count_logs(message: &str) -> usize {
    LOGGER
        .messages
        .lock()
        .unwrap()
        .iter()
        .filter(|m| m.contains(message))
        .count()
}

pub fn write_spirv(path: &Path, valid: bool) {
    let magic = if valid { SPIRV_MAGIC } else { 0xdead_beef };
    let words = [magic, 0x0001_0500, 0, 1, 0];
    let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
    fs::write(path, bytes).unwrap();
}

/// A directory holding a placeholder module for every shader the renderer loads.
pub fn shader_dir() -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for prefix in ["geometry", "shading", "ao", "mp"] {
        for stage in ["rgen", "rmiss", "rchit", "rahit"] {
            write_spirv(&dir.path().join(format!("{prefix}.{stage}.spv")), true);
        }
    }
    write_spirv(&dir.path().join("post.comp.spv"), true);
    dir
}

/// One triangle with positions only.
pub fn triangle() -> Mesh {
    Mesh {
        positions: vec![0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0, 0.0],
        indices: vec![0, 1, 2],
        ..Mesh::default()
    }
}

/// `count` objects, each holding its own triangle.
pub fn triangle_objects(count: usize) -> Scene {
    Scene {
        meshes: (0..count).map(|_| triangle()).collect(),
        objects: (0..count)
            .map(|i| Object {
                meshes: vec![Id::new(0, i as u64)],
                ..Object::default()
            })
            .collect(),
        ..Scene::default()
    }
}
