use std::{
    collections::HashMap,
    ffi::OsString,
    fs::File,
    hash::Hash,
    path::{Path, PathBuf},
    sync::mpsc::{self, Receiver},
    time::Duration,
};

use anyhow::Context;
use notify_debouncer_full::{
    new_debouncer,
    notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher},
    DebounceEventResult, Debouncer, FileIdMap,
};

use crate::gpu::Spirv;

/// Reads SPIR-V shaders from a directory and reports which pipelines need rebuilding after
/// their shader files changed on disk.
pub struct ShaderLoader<T> {
    dir: PathBuf,
    files: HashMap<OsString, Vec<T>>,
    changes: Receiver<PathBuf>,
    triggered: Vec<T>,
    _debouncer: Option<Debouncer<RecommendedWatcher, FileIdMap>>,
}

impl<T: Copy + Eq + Hash> ShaderLoader<T> {
    /// A loader without a file watcher. Reloads only happen through [`ShaderLoader::trigger`].
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let (_, changes) = mpsc::channel();
        Self {
            dir: dir.into(),
            files: HashMap::new(),
            changes,
            triggered: Vec::new(),
            _debouncer: None,
        }
    }

    /// A loader watching `dir` for modified shaders.
    pub fn watch(dir: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let dir = dir.into();
        let (sender, changes) = mpsc::channel();
        let mut debouncer = new_debouncer(
            Duration::from_millis(200),
            None,
            move |result: DebounceEventResult| match result {
                Ok(events) => {
                    for event in events {
                        if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
                            continue;
                        }
                        for path in &event.paths {
                            let _ = sender.send(path.clone());
                        }
                    }
                }
                Err(errors) => {
                    for error in errors {
                        log::warn!("Shader watcher error: {}", error);
                    }
                }
            },
        )?;
        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::Recursive)
            .with_context(|| format!("Could not watch shader directory {}", dir.display()))?;
        log::info!("Watching shaders in {}", dir.display());

        Ok(Self {
            dir,
            files: HashMap::new(),
            changes,
            triggered: Vec::new(),
            _debouncer: Some(debouncer),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reports `token` from [`ShaderLoader::poll`] whenever one of `files` changes.
    pub fn register(&mut self, token: T, files: &[&str]) {
        for file in files {
            let tokens = self.files.entry(OsString::from(file)).or_default();
            if !tokens.contains(&token) {
                tokens.push(token);
            }
        }
    }

    pub fn load(&self, file: &str) -> anyhow::Result<Spirv> {
        let path = self.dir.join(file);
        let mut spv_file = File::open(&path)
            .with_context(|| format!("Could not open shader {}", path.display()))?;
        ash::util::read_spv(&mut spv_file)
            .with_context(|| format!("Could not read shader {}", path.display()))
    }

    /// Marks `token` for reloading on the next poll.
    pub fn trigger(&mut self, token: T) {
        if !self.triggered.contains(&token) {
            self.triggered.push(token);
        }
    }

    /// Tokens whose shaders changed since the last poll. Never blocks.
    pub fn poll(&mut self) -> Vec<T> {
        while let Ok(path) = self.changes.try_recv() {
            let Some(name) = path.file_name() else {
                continue;
            };
            if let Some(tokens) = self.files.get(name) {
                log::debug!("Shader {} changed", path.display());
                for &token in tokens {
                    if !self.triggered.contains(&token) {
                        self.triggered.push(token);
                    }
                }
            }
        }
        std::mem::take(&mut self.triggered)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn triggers_are_reported_once() {
        let mut loader = ShaderLoader::new("shaders");
        loader.register(1, &["a.rgen.spv", "shared.spv"]);
        loader.register(2, &["shared.spv"]);

        loader.trigger(2);
        loader.trigger(1);
        loader.trigger(2);
        assert_eq!(loader.poll(), vec![2, 1]);
        assert!(loader.poll().is_empty());
    }

    #[test]
    fn loads_spirv_words() {
        let dir = tempfile::tempdir().unwrap();
        let mut file = File::create(dir.path().join("post.comp.spv")).unwrap();
        file.write_all(&0x0723_0203u32.to_le_bytes()).unwrap();
        file.write_all(&42u32.to_le_bytes()).unwrap();

        let loader: ShaderLoader<u32> = ShaderLoader::new(dir.path());
        assert_eq!(loader.load("post.comp.spv").unwrap(), vec![0x0723_0203, 42]);
        assert!(loader.load("missing.spv").is_err());
    }
}
