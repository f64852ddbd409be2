use std::ffi::CStr;

use anyhow::{format_err, Context as _};
use ash::{
    extensions::khr::{
        AccelerationStructure, BufferDeviceAddress, DeferredHostOperations, RayTracingPipeline,
        Synchronization2,
    },
    vk,
};

const APP_NAME: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"ray-cat\0") };

fn required_extensions() -> [&'static CStr; 5] {
    [
        Synchronization2::name(),
        AccelerationStructure::name(),
        RayTracingPipeline::name(),
        DeferredHostOperations::name(),
        BufferDeviceAddress::name(),
    ]
}

/// Instance, logical device and the extension loaders of one ray tracing GPU. Headless, there
/// is no surface.
pub struct Context {
    _entry: ash::Entry,
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub queue_family_index: u32,
    pub device: ash::Device,
    pub queue: vk::Queue,

    pub synchronization2: Synchronization2,
    pub buffer_device_address: BufferDeviceAddress,
    pub ray_tracing: RayTracingPipeline,
    pub ray_tracing_properties: vk::PhysicalDeviceRayTracingPipelinePropertiesKHR,
    pub acceleration_structure: AccelerationStructure,
    pub acceleration_structure_properties: vk::PhysicalDeviceAccelerationStructurePropertiesKHR,
}

/// A physical device able to run the renderer.
struct Candidate {
    physical_device: vk::PhysicalDevice,
    queue_family_index: u32,
    rank: u32,
}

impl Context {
    /// Creates a headless context on the best ray tracing capable GPU.
    pub fn new() -> anyhow::Result<Self> {
        let entry = unsafe { ash::Entry::load() }.context("Could not load vulkan library")?;

        let app_info = vk::ApplicationInfo::builder()
            .application_name(APP_NAME)
            .api_version(vk::API_VERSION_1_3);
        let instance_info = vk::InstanceCreateInfo::builder().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None) }
            .context("Could not create instance")?;

        let candidate = match pick_device(&instance) {
            Ok(candidate) => candidate,
            Err(error) => {
                unsafe { instance.destroy_instance(None) };
                return Err(error);
            }
        };
        let device = match create_device(&instance, &candidate) {
            Ok(device) => device,
            Err(error) => {
                unsafe { instance.destroy_instance(None) };
                return Err(error);
            }
        };

        let physical_device = candidate.physical_device;
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        log::info!("Using {}", name.to_string_lossy());

        Ok(Self {
            queue: unsafe { device.get_device_queue(candidate.queue_family_index, 0) },
            synchronization2: Synchronization2::new(&instance, &device),
            buffer_device_address: BufferDeviceAddress::new(&instance, &device),
            ray_tracing: RayTracingPipeline::new(&instance, &device),
            ray_tracing_properties: unsafe {
                RayTracingPipeline::get_properties(&instance, physical_device)
            },
            acceleration_structure: AccelerationStructure::new(&instance, &device),
            acceleration_structure_properties: unsafe {
                AccelerationStructure::get_properties(&instance, physical_device)
            },
            physical_device,
            queue_family_index: candidate.queue_family_index,
            device,
            instance,
            _entry: entry,
        })
    }

    pub fn shader_group_handle_size(&self) -> u32 {
        self.ray_tracing_properties.shader_group_handle_size
    }

    pub fn shader_group_handle_alignment(&self) -> u32 {
        self.ray_tracing_properties.shader_group_handle_alignment
    }

    pub fn shader_group_base_alignment(&self) -> u32 {
        self.ray_tracing_properties.shader_group_base_alignment
    }

    pub fn scratch_alignment(&self) -> u64 {
        self.acceleration_structure_properties
            .min_acceleration_structure_scratch_offset_alignment as u64
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn supports_extensions(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> bool {
    let Ok(available) = (unsafe { instance.enumerate_device_extension_properties(physical_device) })
    else {
        return false;
    };
    required_extensions().iter().all(|required| {
        available
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == *required)
    })
}

/// Lower is better, discrete GPUs first.
fn rank(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 0,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 1,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 2,
        vk::PhysicalDeviceType::CPU => 3,
        _ => 4,
    }
}

fn candidate(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Option<Candidate> {
    if !supports_extensions(instance, physical_device) {
        return None;
    }
    let families =
        unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
    let queue_family_index = families.iter().position(|family| {
        family
            .queue_flags
            .contains(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)
    })? as u32;
    let properties = unsafe { instance.get_physical_device_properties(physical_device) };
    Some(Candidate {
        physical_device,
        queue_family_index,
        rank: rank(properties.device_type),
    })
}

fn pick_device(instance: &ash::Instance) -> anyhow::Result<Candidate> {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }
        .context("Could not enumerate physical devices")?;
    physical_devices
        .into_iter()
        .filter_map(|physical_device| candidate(instance, physical_device))
        .min_by_key(|candidate| candidate.rank)
        .ok_or_else(|| format_err!("Couldn't find a ray tracing capable device"))
}

fn create_device(instance: &ash::Instance, candidate: &Candidate) -> anyhow::Result<ash::Device> {
    let extension_names = required_extensions().map(CStr::as_ptr);
    let priorities = [1.0];
    let queue_info = vk::DeviceQueueCreateInfo::builder()
        .queue_family_index(candidate.queue_family_index)
        .queue_priorities(&priorities)
        .build();

    let mut vulkan13 = vk::PhysicalDeviceVulkan13Features::builder().synchronization2(true);
    let mut vulkan12 = vk::PhysicalDeviceVulkan12Features::builder()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .descriptor_binding_partially_bound(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true)
        .scalar_block_layout(true);
    let mut ray_tracing =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::builder().ray_tracing_pipeline(true);
    let mut acceleration_structure =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::builder().acceleration_structure(true);
    let features = vk::PhysicalDeviceFeatures::builder().shader_int64(true);

    let create_info = vk::DeviceCreateInfo::builder()
        .queue_create_infos(std::slice::from_ref(&queue_info))
        .enabled_extension_names(&extension_names)
        .enabled_features(&features)
        .push_next(&mut vulkan13)
        .push_next(&mut vulkan12)
        .push_next(&mut ray_tracing)
        .push_next(&mut acceleration_structure);

    unsafe { instance.create_device(candidate.physical_device, &create_info, None) }
        .context("Could not create logical device")
}
