use crate::renderer::device::Dev;
use ash::vk;

pub struct ImageResources {
    pub image: vk::Image,
    pub view: vk::ImageView,
}

pub fn create_image_view(
    dev: &Dev,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> vk::ImageView {
    let view_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });
    unsafe { dev.create_image_view(&view_info, None) }.unwrap()
}

pub fn select_format(
    dev: &Dev,
    candidates: &[vk::Format],
    features: vk::FormatFeatureFlags,
) -> vk::Format {
    for format in candidates {
        let props = unsafe {
            dev.instance
                .get_physical_device_format_properties(dev.physical, *format)
        };
        if props.optimal_tiling_features.contains(features) {
            return *format;
        }
    }
    panic!("no supported format among {candidates:?}");
}

/// Clamps the requested sample count to what the device's colour and depth
/// framebuffers both support.
pub fn max_sample_count(dev: &Dev, requested: u32) -> vk::SampleCountFlags {
    let counts = dev.properties.limits.framebuffer_color_sample_counts
        & dev.properties.limits.framebuffer_depth_sample_counts;
    let best_order = [
        vk::SampleCountFlags::TYPE_64,
        vk::SampleCountFlags::TYPE_32,
        vk::SampleCountFlags::TYPE_16,
        vk::SampleCountFlags::TYPE_8,
        vk::SampleCountFlags::TYPE_4,
        vk::SampleCountFlags::TYPE_2,
    ];
    for count in best_order {
        if counts.contains(count) && count.as_raw() <= requested {
            return count;
        }
    }
    vk::SampleCountFlags::TYPE_1
}

/// Pure execution dependency, no memory visibility operations.
pub fn execution_barrier(
    dev: &Dev,
    buf: vk::CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    dst_stage: vk::PipelineStageFlags,
) {
    unsafe {
        dev.cmd_pipeline_barrier(
            buf,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[],
        )
    };
}
