use std::sync::{Arc, Mutex};

use ash::vk;

use crate::gpu::LayoutBinding;

use super::context::Context;

/// Shared pool every set is allocated from. Access is serialized by the mutex.
pub struct DescriptorPool {
    inner: Mutex<vk::DescriptorPool>,
    context: Arc<Context>,
}

impl DescriptorPool {
    pub fn new(context: Arc<Context>, max_sets: u32) -> Result<Arc<Self>, vk::Result> {
        let pool_sizes = [
            (vk::DescriptorType::ACCELERATION_STRUCTURE_KHR, 4),
            (vk::DescriptorType::STORAGE_BUFFER, 8),
            (vk::DescriptorType::STORAGE_IMAGE, 4),
            (vk::DescriptorType::SAMPLED_IMAGE, 2048),
            (vk::DescriptorType::SAMPLER, 64),
        ]
        .map(|(ty, per_set)| vk::DescriptorPoolSize {
            ty,
            descriptor_count: per_set * max_sets,
        });

        let create_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(max_sets)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { context.device.create_descriptor_pool(&create_info, None) }?;
        Ok(Arc::new(Self {
            inner: Mutex::new(pool),
            context,
        }))
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        let pool = *self.inner.get_mut().unwrap_or_else(|e| e.into_inner());
        unsafe { self.context.device.destroy_descriptor_pool(pool, None) };
    }
}

pub struct SetLayoutInner {
    pub inner: vk::DescriptorSetLayout,
    pub bindings: Vec<LayoutBinding>,
    context: Arc<Context>,
}

impl Drop for SetLayoutInner {
    fn drop(&mut self) {
        unsafe {
            self.context
                .device
                .destroy_descriptor_set_layout(self.inner, None)
        };
    }
}

#[derive(Clone)]
pub struct DescriptorSetLayout(Arc<SetLayoutInner>);

impl DescriptorSetLayout {
    /// Arrays are partially bound, so unused slots may stay empty.
    pub fn new(context: Arc<Context>, bindings: &[LayoutBinding]) -> Result<Self, vk::Result> {
        let vk_bindings: Vec<_> = bindings
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(binding.binding)
                    .descriptor_type(binding.ty)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
                    .build()
            })
            .collect();
        let flags: Vec<_> = bindings
            .iter()
            .map(|binding| {
                if binding.count > 1 {
                    vk::DescriptorBindingFlags::PARTIALLY_BOUND
                } else {
                    vk::DescriptorBindingFlags::empty()
                }
            })
            .collect();
        let mut binding_flags =
            vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder().binding_flags(&flags);

        let create_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&vk_bindings)
            .push_next(&mut binding_flags);

        let inner = unsafe {
            context
                .device
                .create_descriptor_set_layout(&create_info, None)
        }?;

        Ok(Self(Arc::new(SetLayoutInner {
            inner,
            bindings: bindings.to_vec(),
            context,
        })))
    }

    pub fn inner(&self) -> vk::DescriptorSetLayout {
        self.0.inner
    }
}

struct DescriptorSetInner {
    inner: vk::DescriptorSet,
    pool: Arc<DescriptorPool>,
    _layout: DescriptorSetLayout,
}

impl Drop for DescriptorSetInner {
    fn drop(&mut self) {
        let pool = self.pool.inner.lock().unwrap();
        let result = unsafe {
            self.pool
                .context
                .device
                .free_descriptor_sets(*pool, std::slice::from_ref(&self.inner))
        };
        if let Err(error) = result {
            log::warn!("Could not free descriptor set: {}", error);
        }
    }
}

#[derive(Clone)]
pub struct DescriptorSet(Arc<DescriptorSetInner>);

impl DescriptorSet {
    pub fn new(pool: &Arc<DescriptorPool>, layout: &DescriptorSetLayout) -> Result<Self, vk::Result> {
        let inner = {
            let vk_pool = pool.inner.lock().unwrap();
            let allocate_info = vk::DescriptorSetAllocateInfo::builder()
                .descriptor_pool(*vk_pool)
                .set_layouts(std::slice::from_ref(&layout.0.inner));
            unsafe { pool.context.device.allocate_descriptor_sets(&allocate_info) }?
                .into_iter()
                .next()
                .ok_or(vk::Result::ERROR_OUT_OF_POOL_MEMORY)?
        };

        Ok(Self(Arc::new(DescriptorSetInner {
            inner,
            pool: pool.clone(),
            _layout: layout.clone(),
        })))
    }

    pub fn inner(&self) -> vk::DescriptorSet {
        self.0.inner
    }
}

pub enum DescriptorInfo {
    Buffer(vk::DescriptorBufferInfo),
    Image(vk::DescriptorImageInfo),
    AccelerationStructure(vk::AccelerationStructureKHR),
}

/// One descriptor update, applied on its own.
pub struct WriteDescriptorSet {
    pub binding: u32,
    pub array_element: u32,
    pub ty: vk::DescriptorType,
    pub info: DescriptorInfo,
}

impl WriteDescriptorSet {
    pub fn apply(&self, context: &Context, set: &DescriptorSet) {
        let mut vk_write = vk::WriteDescriptorSet::builder()
            .dst_set(set.inner())
            .dst_binding(self.binding)
            .dst_array_element(self.array_element)
            .descriptor_type(self.ty);

        let mut acceleration_structure_info;
        match &self.info {
            DescriptorInfo::Buffer(info) => {
                vk_write = vk_write.buffer_info(std::slice::from_ref(info));
            }
            DescriptorInfo::Image(info) => {
                vk_write = vk_write.image_info(std::slice::from_ref(info));
            }
            DescriptorInfo::AccelerationStructure(handle) => {
                acceleration_structure_info =
                    vk::WriteDescriptorSetAccelerationStructureKHR::builder()
                        .acceleration_structures(std::slice::from_ref(handle));
                vk_write = vk_write.push_next(&mut acceleration_structure_info);
                vk_write.descriptor_count = 1;
            }
        }

        let vk_write = vk_write.build();
        unsafe {
            context
                .device
                .update_descriptor_sets(std::slice::from_ref(&vk_write), &[])
        };
    }
}
