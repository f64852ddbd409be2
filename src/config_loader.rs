use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use ultraviolet::Vec3;

use crate::{gpu::Extent, render::Settings};

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    pub scene_path: Option<PathBuf>,
    pub shader_dir: PathBuf,
    pub extent: Extent,
    pub frames_in_flight: usize,
    pub staging_heap_bytes: u64,
    pub device_heap_bytes: u64,
    pub render: Settings,
    pub cached: CachedData,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scene_path: None,
            shader_dir: "shaders".into(),
            extent: Extent::new(1280, 720),
            frames_in_flight: 2,
            staging_heap_bytes: 2 * 1024 * 1024 * 1024,
            device_heap_bytes: 8188 * 1024 * 1024,
            render: Settings::default(),
            cached: CachedData::default(),
        }
    }
}

impl Config {
    pub fn from_str(value: &str) -> anyhow::Result<Self> {
        serde_json::from_str(value).context("Could not parse config")
    }
}

pub struct ConfigFileLoader {
    pub path: PathBuf,
    config: Option<Config>,
}

impl ConfigFileLoader {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().into(),
            config: None,
        }
    }

    /// Reads the config file, creating it with defaults if it does not exist yet.
    pub fn load_config(&mut self) -> anyhow::Result<&mut Config> {
        let config = match std::fs::read_to_string(&self.path) {
            Ok(content) => Config::from_str(&content)
                .with_context(|| format!("Invalid config file {}", self.path.display()))?,
            Err(_) => {
                log::info!("Creating default config at {}", self.path.display());
                self.config = Some(Config::default());
                self.save_config()?;
                Config::default()
            }
        };
        Ok(self.config.insert(config))
    }

    pub fn get_or_load_config(&mut self) -> anyhow::Result<&mut Config> {
        match self.config {
            Some(ref mut config) => Ok(config),
            None => self.load_config(),
        }
    }

    pub fn save_config(&self) -> anyhow::Result<()> {
        if let Some(config) = &self.config {
            let content = serde_json::to_string_pretty(config)?;
            std::fs::write(&self.path, content)
                .with_context(|| format!("Could not write config to {}", self.path.display()))?;
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CachedData {
    pub camera_position: Option<CameraPosition>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CameraPosition {
    pub position: Vec3,
    pub pitch: f32,
    pub yaw: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::Integrator;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut loader = ConfigFileLoader::new(&path);
        let config = loader.load_config().unwrap();
        assert_eq!(config.render.max_parallelism, 32);
        assert_eq!(config.frames_in_flight, 2);
        assert!(path.exists());
    }

    #[test]
    fn saved_config_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");

        let mut loader = ConfigFileLoader::new(&path);
        {
            let config = loader.load_config().unwrap();
            config.scene_path = Some("scenes/box.gltf".into());
            config.render.integrator = Integrator::AmbientOcclusion;
            config.cached.camera_position = Some(CameraPosition {
                position: Vec3::new(1.0, 2.0, 3.0),
                pitch: 0.5,
                yaw: -0.25,
            });
        }
        loader.save_config().unwrap();

        let mut reloaded = ConfigFileLoader::new(&path);
        let config = reloaded.get_or_load_config().unwrap();
        assert_eq!(config.scene_path, Some(PathBuf::from("scenes/box.gltf")));
        assert_eq!(config.render.integrator, Integrator::AmbientOcclusion);
        let cached = config.cached.camera_position.as_ref().unwrap();
        assert_eq!(cached.position, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn partial_config_uses_defaults() {
        let config = Config::from_str(r#"{ "frames_in_flight": 3 }"#).unwrap();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.extent, Extent::new(1280, 720));
        assert_eq!(config.shader_dir, PathBuf::from("shaders"));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(Config::from_str("not json").is_err());
    }
}
