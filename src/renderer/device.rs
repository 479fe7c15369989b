use crate::cli::Args;
use ash::prelude::VkResult;
use ash::{vk, Entry, Instance};
use log::{debug, error, info, warn};
use std::ffi::CStr;
use std::ops::Deref;

/// Everything the rest of the renderer needs to talk to the GPU. Derefs to
/// the logical device so command recording reads naturally.
pub struct Dev {
    pub logical: ash::Device,
    pub physical: vk::PhysicalDevice,
    pub instance: Instance,
    pub swapchain_ext: ash::khr::swapchain::Device,
    pub draw_indirect_count_ext: Option<ash::khr::draw_indirect_count::Device>,
    pub debug_utils_ext: Option<ash::ext::debug_utils::Device>,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub support: DeviceSupport,
    pub queue_family: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceSupport {
    pub multi_draw_indirect: bool,
    pub draw_indirect_count: bool,
}

impl Deref for Dev {
    type Target = ash::Device;

    fn deref(&self) -> &ash::Device {
        &self.logical
    }
}

pub fn create_instance(
    entry: &Entry,
    display_handle: raw_window_handle::RawDisplayHandle,
    args: &Args,
) -> Instance {
    let app_info = vk::ApplicationInfo::default()
        .application_name(c"voxen")
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"voxen")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_0);
    let mut extensions = ash_window::enumerate_required_extensions(display_handle)
        .unwrap()
        .to_vec();
    let mut layers = Vec::new();
    if args.debug_layers {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        layers.push(c"VK_LAYER_KHRONOS_validation".as_ptr());
    }
    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers);
    unsafe { entry.create_instance(&create_info, None) }.unwrap()
}

pub struct PhysicalDeviceInfo {
    pub physical_device: vk::PhysicalDevice,
    pub queue_family: u32,
    pub support: DeviceSupport,
}

/// Picks the GPU selected by `--gpu`, falling back to the first device with
/// a graphics + present queue. Device initialisation failures are fatal.
pub fn select_physical_device(
    instance: &Instance,
    surface_ext: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    gpu_index: usize,
) -> PhysicalDeviceInfo {
    let physical_devices = unsafe { instance.enumerate_physical_devices() }.unwrap();
    let mut usable = Vec::new();
    for device in physical_devices {
        let properties = unsafe { instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy();
        let Some(queue_family) = find_queue_family(instance, surface_ext, device, surface) else {
            warn!("physical device rejected, no suitable queue, \x1B[1mname\x1B[0m: {name}");
            continue;
        };
        usable.push((device, queue_family, name.into_owned()));
    }
    if usable.is_empty() {
        crate::fatal!("no usable GPU found");
    }
    if gpu_index >= usable.len() {
        crate::fatal!("--gpu {gpu_index} out of range, {} devices available", usable.len());
    }
    let (physical_device, queue_family, name) = usable.swap_remove(gpu_index);

    let features = unsafe { instance.get_physical_device_features(physical_device) };
    let extensions =
        unsafe { instance.enumerate_device_extension_properties(physical_device) }.unwrap();
    let draw_indirect_count = extensions.iter().any(|extension| {
        let extension_name = unsafe { CStr::from_ptr(extension.extension_name.as_ptr()) };
        extension_name == ash::khr::draw_indirect_count::NAME
    });
    let support = DeviceSupport {
        multi_draw_indirect: features.multi_draw_indirect == vk::TRUE,
        draw_indirect_count,
    };
    debug!("physical device selected, \x1B[1mname\x1B[0m: {name}, \x1B[1msupport\x1B[0m: {support:?}");
    PhysicalDeviceInfo {
        physical_device,
        queue_family,
        support,
    }
}

fn find_queue_family(
    instance: &Instance,
    surface_ext: &ash::khr::surface::Instance,
    device: vk::PhysicalDevice,
    surface: vk::SurfaceKHR,
) -> Option<u32> {
    let queue_families =
        unsafe { instance.get_physical_device_queue_family_properties(device) };
    for (index, family) in queue_families.iter().enumerate() {
        let index = index as u32;
        let supports_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let supports_present = unsafe {
            surface_ext.get_physical_device_surface_support(device, index, surface)
        }
        .unwrap();
        if supports_graphics && supports_present {
            return Some(index);
        }
    }
    None
}

pub fn create_logical_device(
    instance: &Instance,
    info: &PhysicalDeviceInfo,
    debug_layers: bool,
) -> Dev {
    let queue_priorities = [1.];
    let queue_info = vk::DeviceQueueCreateInfo::default()
        .queue_family_index(info.queue_family)
        .queue_priorities(&queue_priorities);
    let mut extensions = vec![ash::khr::swapchain::NAME.as_ptr()];
    if info.support.draw_indirect_count {
        extensions.push(ash::khr::draw_indirect_count::NAME.as_ptr());
    }
    let features = vk::PhysicalDeviceFeatures::default()
        .multi_draw_indirect(info.support.multi_draw_indirect);
    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(std::array::from_ref(&queue_info))
        .enabled_extension_names(&extensions)
        .enabled_features(&features);
    let logical =
        unsafe { instance.create_device(info.physical_device, &create_info, None) }.unwrap();
    let swapchain_ext = ash::khr::swapchain::Device::new(instance, &logical);
    let draw_indirect_count_ext = info
        .support
        .draw_indirect_count
        .then(|| ash::khr::draw_indirect_count::Device::new(instance, &logical));
    let debug_utils_ext = debug_layers.then(|| ash::ext::debug_utils::Device::new(instance, &logical));
    let properties = unsafe { instance.get_physical_device_properties(info.physical_device) };
    let memory_properties =
        unsafe { instance.get_physical_device_memory_properties(info.physical_device) };
    info!("logical device created");
    Dev {
        logical,
        physical: info.physical_device,
        instance: instance.clone(),
        swapchain_ext,
        draw_indirect_count_ext,
        debug_utils_ext,
        properties,
        memory_properties,
        support: info.support,
        queue_family: info.queue_family,
    }
}

/// Two pools: a static one whose sets live for the process, and a
/// resettable one for sets tied to resizable attachments.
pub struct DescriptorPools {
    static_pool: vk::DescriptorPool,
    reset_pool: vk::DescriptorPool,
}

impl DescriptorPools {
    pub fn create(dev: &Dev) -> DescriptorPools {
        DescriptorPools {
            static_pool: create_pool(dev, vk::DescriptorPoolCreateFlags::empty()),
            reset_pool: create_pool(dev, vk::DescriptorPoolCreateFlags::empty()),
        }
    }

    pub fn allocate(
        &self,
        dev: &Dev,
        layout: vk::DescriptorSetLayout,
        count: usize,
        resettable: bool,
    ) -> VkResult<Vec<vk::DescriptorSet>> {
        let pool = if resettable {
            self.reset_pool
        } else {
            self.static_pool
        };
        let layouts = vec![layout; count];
        let allocate_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        unsafe { dev.allocate_descriptor_sets(&allocate_info) }
            .inspect_err(|err| error!("failed to allocate descriptor sets with error {err}"))
    }

    /// Invalidates every set handed out from the resettable pool. Done on
    /// swapchain recreation before attachment sets are rebuilt.
    pub fn reset_dynamic(&self, dev: &Dev) {
        unsafe {
            dev.reset_descriptor_pool(self.reset_pool, vk::DescriptorPoolResetFlags::empty())
        }
        .unwrap();
    }

    pub fn destroy(&self, dev: &Dev) {
        unsafe {
            dev.destroy_descriptor_pool(self.static_pool, None);
            dev.destroy_descriptor_pool(self.reset_pool, None);
        }
    }
}

fn create_pool(dev: &Dev, flags: vk::DescriptorPoolCreateFlags) -> vk::DescriptorPool {
    let sizes = [
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 64,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 128,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_BUFFER,
            descriptor_count: 64,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::STORAGE_IMAGE,
            descriptor_count: 64,
        },
        vk::DescriptorPoolSize {
            ty: vk::DescriptorType::INPUT_ATTACHMENT,
            descriptor_count: 8,
        },
    ];
    let pool_info = vk::DescriptorPoolCreateInfo::default()
        .flags(flags)
        .max_sets(256)
        .pool_sizes(&sizes);
    unsafe { dev.create_descriptor_pool(&pool_info, None) }.unwrap()
}
