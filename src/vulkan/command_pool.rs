use std::sync::Arc;

use ash::vk;

use super::context::Context;

/// Command pool plus the buffers allocated from it. Not thread safe, owners lock around it.
pub struct CommandPool {
    inner: vk::CommandPool,
    context: Arc<Context>,
}

impl CommandPool {
    pub fn new(context: Arc<Context>) -> Result<Self, vk::Result> {
        let create_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(context.queue_family_index)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );

        let command_pool = unsafe { context.device.create_command_pool(&create_info, None) }?;

        Ok(Self {
            inner: command_pool,
            context,
        })
    }

    pub fn allocate(&self) -> Result<vk::CommandBuffer, vk::Result> {
        let allocate_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.inner)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.context.device.allocate_command_buffers(&allocate_info) }?;
        buffers
            .into_iter()
            .next()
            .ok_or(vk::Result::ERROR_OUT_OF_HOST_MEMORY)
    }

    pub fn free(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.context
                .device
                .free_command_buffers(self.inner, std::slice::from_ref(&command_buffer))
        };
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_command_pool(self.inner, None) };
    }
}
