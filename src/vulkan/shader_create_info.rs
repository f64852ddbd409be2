use std::{ffi::CStr, sync::Arc};

use ash::vk;

use super::context::Context;

pub const SHADER_ENTRY_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

/// Shader module that lives as long as the pipeline creation using it.
pub struct ShaderModule {
    pub inner: vk::ShaderModule,
    context: Arc<Context>,
}

impl ShaderModule {
    pub fn new(context: Arc<Context>, code: &[u32]) -> Result<Self, vk::Result> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        let inner = unsafe { context.device.create_shader_module(&create_info, None) }?;
        Ok(Self { inner, context })
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_shader_module(self.inner, None) };
    }
}

/// Deduplicates modules of a pipeline by their code, hit groups often share shaders.
pub struct ShaderModules {
    context: Arc<Context>,
    modules: Vec<(*const u32, usize, ShaderModule)>,
}

impl ShaderModules {
    pub fn new(context: Arc<Context>) -> Self {
        Self {
            context,
            modules: Vec::new(),
        }
    }

    pub fn get(&mut self, code: &[u32]) -> Result<vk::ShaderModule, vk::Result> {
        let key = (code.as_ptr(), code.len());
        if let Some((_, _, module)) = self
            .modules
            .iter()
            .find(|(ptr, len, _)| (*ptr, *len) == key)
        {
            return Ok(module.inner);
        }
        let module = ShaderModule::new(self.context.clone(), code)?;
        let inner = module.inner;
        self.modules.push((key.0, key.1, module));
        Ok(inner)
    }
}

pub const SPECIALIZATION_ENTRY: vk::SpecializationMapEntry = vk::SpecializationMapEntry {
    constant_id: 0,
    offset: 0,
    size: std::mem::size_of::<u32>(),
};

pub fn stage_info(
    stage: vk::ShaderStageFlags,
    module: vk::ShaderModule,
    specialization: Option<&vk::SpecializationInfo>,
) -> vk::PipelineShaderStageCreateInfo {
    let mut builder = vk::PipelineShaderStageCreateInfo::builder()
        .module(module)
        .name(SHADER_ENTRY_NAME)
        .stage(stage);
    if let Some(specialization) = specialization {
        builder = builder.specialization_info(specialization);
    }
    builder.build()
}
