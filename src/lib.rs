pub mod async_pool;
pub mod camera;
pub mod config_loader;
pub mod encode;
pub mod gpu;
pub mod gpu_scene;
pub mod render;
pub mod scene;
pub mod time;
pub mod utility;
pub mod vulkan;
