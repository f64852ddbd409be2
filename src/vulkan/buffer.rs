use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::{
    vulkan::{Allocation, AllocationCreateDesc, AllocationScheme, Allocator},
    AllocationError, MemoryLocation,
};

use crate::gpu::Reservation;

use super::context::Context;

/// A gpu-allocator allocation that returns itself to the allocator and its heap budget
/// when dropped.
pub struct Memory {
    allocator: Arc<Mutex<Allocator>>,
    allocation: Mutex<Option<Allocation>>,
    _reservation: Option<Reservation>,
}

impl Memory {
    pub fn allocate(
        allocator: &Arc<Mutex<Allocator>>,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
        linear: bool,
        reservation: Option<Reservation>,
    ) -> Result<Self, AllocationError> {
        let allocation = allocator.lock().unwrap().allocate(&AllocationCreateDesc {
            name,
            requirements,
            location,
            linear,
            allocation_scheme: AllocationScheme::GpuAllocatorManaged,
        })?;
        Ok(Self {
            allocator: allocator.clone(),
            allocation: Mutex::new(Some(allocation)),
            _reservation: reservation,
        })
    }

    /// Memory object and offset to bind a resource at.
    pub fn binding(&self) -> (vk::DeviceMemory, u64) {
        let allocation = self.allocation.lock().unwrap();
        match allocation.as_ref() {
            // SAFETY: only `Drop` takes the allocation.
            Some(allocation) => unsafe { (allocation.memory(), allocation.offset()) },
            None => (vk::DeviceMemory::null(), 0),
        }
    }

    pub fn map<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut allocation = self.allocation.lock().unwrap();
        let slice = allocation
            .as_mut()
            .and_then(|allocation| allocation.mapped_slice_mut());
        match slice {
            Some(slice) => f(slice),
            None => f(&mut []),
        }
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        let allocation = self
            .allocation
            .get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(allocation) = allocation {
            if let Err(error) = self.allocator.lock().unwrap().free(allocation) {
                log::warn!("Could not free allocation: {}", error);
            }
        }
    }
}

pub struct UntypedBuffer {
    pub inner: vk::Buffer,
    pub usage: vk::BufferUsageFlags,
    pub size: vk::DeviceSize,
    pub device_address: vk::DeviceAddress,
    pub memory: Memory,
    context: Arc<Context>,
}

impl Drop for UntypedBuffer {
    fn drop(&mut self) {
        unsafe { self.context.device.destroy_buffer(self.inner, None) };
    }
}

/// Shared handle to a buffer and its memory.
#[derive(Clone)]
pub struct Buffer(Arc<UntypedBuffer>);

/// Why a buffer could not be created.
pub enum BufferError {
    OutOfMemory,
    Vulkan(vk::Result),
}

impl From<vk::Result> for BufferError {
    fn from(value: vk::Result) -> Self {
        match value {
            vk::Result::ERROR_OUT_OF_DEVICE_MEMORY | vk::Result::ERROR_OUT_OF_HOST_MEMORY => {
                BufferError::OutOfMemory
            }
            other => BufferError::Vulkan(other),
        }
    }
}

impl From<AllocationError> for BufferError {
    fn from(value: AllocationError) -> Self {
        match value {
            AllocationError::OutOfMemory => BufferError::OutOfMemory,
            other => {
                log::warn!("Buffer allocation failed: {}", other);
                BufferError::OutOfMemory
            }
        }
    }
}

impl Buffer {
    pub fn new(
        context: Arc<Context>,
        allocator: &Arc<Mutex<Allocator>>,
        name: &str,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        reservation: Option<Reservation>,
    ) -> Result<Buffer, BufferError> {
        let device = &context.device;
        let usage = usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;

        let create_info = vk::BufferCreateInfo::builder()
            .size(size.max(1))
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&create_info, None) }?;
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let memory = match Memory::allocate(
            allocator,
            name,
            requirements,
            location,
            true,
            reservation,
        ) {
            Ok(memory) => memory,
            Err(error) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(error.into());
            }
        };

        let (device_memory, offset) = memory.binding();
        if let Err(error) = unsafe { device.bind_buffer_memory(buffer, device_memory, offset) } {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(error.into());
        }

        let device_address = {
            let info = vk::BufferDeviceAddressInfo::builder().buffer(buffer);
            unsafe { context.buffer_device_address.get_buffer_device_address(&info) }
        };

        Ok(Buffer(Arc::new(UntypedBuffer {
            inner: buffer,
            usage,
            size,
            device_address,
            memory,
            context,
        })))
    }

    pub fn inner(&self) -> vk::Buffer {
        self.0.inner
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.0.size
    }

    pub fn device_address(&self) -> vk::DeviceAddress {
        self.0.device_address
    }

    pub fn usage(&self) -> vk::BufferUsageFlags {
        self.0.usage
    }

    /// Runs `f` on the mapped memory. Device local buffers map to an empty slice.
    pub fn map<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let size = self.0.size as usize;
        self.0.memory.map(|slice| {
            let end = size.min(slice.len());
            f(&mut slice[..end])
        })
    }
}
