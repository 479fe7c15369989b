use crate::renderer::device::Dev;
use crate::renderer::util::create_image_view;
use ash::vk;
use log::debug;
use winit::dpi::PhysicalSize;

pub struct Swapchain {
    pub handle: vk::SwapchainKHR,
    pub format: vk::SurfaceFormatKHR,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,
    pub framebuffers: Vec<vk::Framebuffer>,
}

pub fn query_surface_format(
    dev: &Dev,
    surface_ext: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
) -> vk::SurfaceFormatKHR {
    let formats =
        unsafe { surface_ext.get_physical_device_surface_formats(dev.physical, surface) }.unwrap();
    select_format(&formats)
}

/// The blit render pass is created once from the surface format and shared
/// across swapchain recreations.
pub fn create_swapchain(
    dev: &Dev,
    surface_ext: &ash::khr::surface::Instance,
    surface: vk::SurfaceKHR,
    window_size: PhysicalSize<u32>,
    render_pass: vk::RenderPass,
    old_swapchain: vk::SwapchainKHR,
) -> Swapchain {
    let capabilities = unsafe {
        surface_ext.get_physical_device_surface_capabilities(dev.physical, surface)
    }
    .unwrap();
    let formats =
        unsafe { surface_ext.get_physical_device_surface_formats(dev.physical, surface) }.unwrap();
    let present_modes = unsafe {
        surface_ext.get_physical_device_surface_present_modes(dev.physical, surface)
    }
    .unwrap();
    let image_count = select_image_count(capabilities);
    let format = select_format(&formats);
    let extent = select_extent(capabilities, window_size);
    let present_mode = if present_modes.contains(&vk::PresentModeKHR::MAILBOX) {
        vk::PresentModeKHR::MAILBOX
    } else {
        vk::PresentModeKHR::FIFO
    };

    let create_info = vk::SwapchainCreateInfoKHR::default()
        .surface(surface)
        .min_image_count(image_count)
        .image_format(format.format)
        .image_color_space(format.color_space)
        .image_extent(extent)
        .image_array_layers(1)
        .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        .image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        .pre_transform(capabilities.current_transform)
        .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
        .present_mode(present_mode)
        .clipped(true)
        .old_swapchain(old_swapchain);
    let handle = unsafe { dev.swapchain_ext.create_swapchain(&create_info, None) }.unwrap();

    let images = unsafe { dev.swapchain_ext.get_swapchain_images(handle) }.unwrap();
    let mut views = Vec::new();
    let mut framebuffers = Vec::new();
    for image in &images {
        let view = create_image_view(dev, *image, format.format, vk::ImageAspectFlags::COLOR);
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(std::slice::from_ref(&view))
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        framebuffers.push(unsafe { dev.create_framebuffer(&framebuffer_info, None) }.unwrap());
        views.push(view);
    }
    debug!(
        "swapchain created, \x1B[1mextent\x1B[0m: {}x{}, \x1B[1mimages\x1B[0m: {}, \x1B[1mpresent mode\x1B[0m: {present_mode:?}",
        extent.width,
        extent.height,
        images.len()
    );
    Swapchain {
        handle,
        format,
        extent,
        render_pass,
        images,
        views,
        framebuffers,
    }
}

impl Swapchain {
    /// Single-subpass, store-only pass compositing the forward result and
    /// any overlays straight into the presentable image.
    pub fn begin(&self, dev: &Dev, cmd: vk::CommandBuffer, image_index: usize) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffers[image_index])
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            });
        unsafe {
            dev.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            let viewport = vk::Viewport {
                x: 0.,
                y: 0.,
                width: self.extent.width as f32,
                height: self.extent.height as f32,
                min_depth: 0.,
                max_depth: 1.,
            };
            dev.cmd_set_viewport(cmd, 0, &[viewport]);
            dev.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D { x: 0, y: 0 },
                    extent: self.extent,
                }],
            );
        }
    }

    pub fn destroy(&mut self, dev: &Dev) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { dev.destroy_framebuffer(framebuffer, None) };
        }
        for view in self.views.drain(..) {
            unsafe { dev.destroy_image_view(view, None) };
        }
        unsafe {
            dev.swapchain_ext.destroy_swapchain(self.handle, None);
        }
    }
}

fn select_image_count(capabilities: vk::SurfaceCapabilitiesKHR) -> u32 {
    let no_image_limit = capabilities.max_image_count == 0;
    let preferred_image_count = capabilities.min_image_count.max(3);
    if no_image_limit {
        preferred_image_count
    } else {
        preferred_image_count.min(capabilities.max_image_count)
    }
}

fn select_format(formats: &[vk::SurfaceFormatKHR]) -> vk::SurfaceFormatKHR {
    for format in formats {
        let good_color_space = format.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR;
        // Selecting an SRGB format leaves the gamma conversion to the
        // hardware, which is faster and more accurate than doing a power
        // curve in the blit shader.
        let good_format = format.format == vk::Format::R8G8B8A8_SRGB
            || format.format == vk::Format::B8G8R8A8_SRGB;
        if good_color_space && good_format {
            return *format;
        }
    }
    panic!("surface doesn't support SRGB color space with a desired format");
}

fn select_extent(
    capabilities: vk::SurfaceCapabilitiesKHR,
    window_size: PhysicalSize<u32>,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: window_size.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: window_size.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

pub fn create_render_pass(dev: &Dev, format: vk::Format) -> vk::RenderPass {
    let attachment = vk::AttachmentDescription {
        format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::DONT_CARE,
        store_op: vk::AttachmentStoreOp::STORE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::PRESENT_SRC_KHR,
        ..Default::default()
    };
    let color_reference = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(std::slice::from_ref(&color_reference));
    let dependency = vk::SubpassDependency {
        src_subpass: vk::SUBPASS_EXTERNAL,
        dst_subpass: 0,
        src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        dst_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        src_access_mask: vk::AccessFlags::empty(),
        dst_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        dependency_flags: vk::DependencyFlags::empty(),
    };
    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(std::slice::from_ref(&attachment))
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(std::slice::from_ref(&dependency));
    unsafe { dev.create_render_pass(&render_pass_info, None) }.unwrap()
}
