//! CPU side scene descriptions and the parsers producing them.

pub mod gltf;
pub mod pbrt;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use self::gltf::GltfParser;

/// A parsed scene in one of the supported source formats.
pub enum CpuScene {
    Pbrt(pbrt::Scene),
    Gltf(gltf::Scene),
}

impl CpuScene {
    pub fn format_name(&self) -> &'static str {
        match self {
            CpuScene::Pbrt(_) => "pbrt",
            CpuScene::Gltf(_) => "gltf",
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("Unknown scene file type {0}.")]
    UnknownFileType(String),
    #[error("Could not import {path}: {source}")]
    Gltf {
        path: PathBuf,
        #[source]
        source: ::gltf::Error,
    },
    #[error("Invalid scene {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

pub trait SceneParser: Send + Sync {
    /// Lower case file extensions this parser accepts, without the dot.
    fn extensions(&self) -> &[&'static str];

    fn parse(&self, path: &Path) -> Result<CpuScene, ParseError>;
}

/// Parsers selected by file extension.
#[derive(Clone)]
pub struct SceneParsers {
    parsers: Vec<Arc<dyn SceneParser>>,
}

impl Default for SceneParsers {
    fn default() -> Self {
        let mut parsers = Self::empty();
        parsers.register(GltfParser);
        parsers
    }
}

impl SceneParsers {
    pub fn empty() -> Self {
        Self {
            parsers: Vec::new(),
        }
    }

    /// Later registrations win over earlier ones for the same extension.
    pub fn register(&mut self, parser: impl SceneParser + 'static) {
        self.parsers.insert(0, Arc::new(parser));
    }

    pub fn find(&self, path: &Path) -> Result<Arc<dyn SceneParser>, ParseError> {
        let extension = path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        self.parsers
            .iter()
            .find(|parser| parser.extensions().contains(&extension.as_str()))
            .cloned()
            .ok_or(ParseError::UnknownFileType(extension))
    }

    pub fn parse(&self, path: &Path) -> Result<CpuScene, ParseError> {
        self.find(path)?.parse(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EmptyPbrt;

    impl SceneParser for EmptyPbrt {
        fn extensions(&self) -> &[&'static str] {
            &["pbrt"]
        }

        fn parse(&self, _path: &Path) -> Result<CpuScene, ParseError> {
            Ok(CpuScene::Pbrt(pbrt::Scene::default()))
        }
    }

    #[test]
    fn selects_parser_by_extension() {
        let mut parsers = SceneParsers::default();
        assert!(matches!(
            parsers.find(Path::new("scene.pbrt")),
            Err(ParseError::UnknownFileType(ext)) if ext == "pbrt"
        ));

        parsers.register(EmptyPbrt);
        let scene = parsers.parse(Path::new("dir/Scene.PBRT")).unwrap();
        assert_eq!(scene.format_name(), "pbrt");

        assert!(parsers.find(Path::new("a.glb")).is_ok());
        assert!(parsers.find(Path::new("a.gltf")).is_ok());
        assert!(parsers.find(Path::new("no_extension")).is_err());
    }

    #[test]
    fn unknown_file_type_message() {
        let error = SceneParsers::default()
            .parse(Path::new("model.obj"))
            .err()
            .unwrap();
        assert_eq!(error.to_string(), "Unknown scene file type obj.");
    }
}
