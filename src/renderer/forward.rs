use crate::renderer::caches::{allocate_descriptor_sets, Caches};
use crate::renderer::deletion_queue::DeletionQueue;
use crate::renderer::device::{DescriptorPools, Dev};
use crate::renderer::memory::{self, VideoMemory};
use crate::renderer::pyramid::DepthPyramid;
use crate::renderer::shader::BindingDesc;
use crate::renderer::util::select_format;
use ash::vk;
use log::trace;
use nalgebra::{Matrix4, Vector3};

/// Per-frame uniform data shared by every pass.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct SceneData {
    pub camera_projview: Matrix4<f32>,
    pub camera_projection: Matrix4<f32>,
    pub camera_view: Matrix4<f32>,
    pub light_space: Matrix4<f32>,
    pub sun_dir: Vector3<f32>,
    pub sun_ambient: f32,
    pub camera_pos: Vector3<f32>,
    pub _pad: f32,
}

/// Offscreen pass rasterising voxels and debug lines into MSAA colour +
/// depth, with a single-sample resolve target when MSAA is on. The depth
/// pyramid lives here because it is derived from this pass's depth
/// attachment and shares its memory region.
pub struct ForwardPass {
    pub render_pass: vk::RenderPass,
    pub color_image: vk::Image,
    pub color_view: vk::ImageView,
    pub depth_image: vk::Image,
    pub depth_view: vk::ImageView,
    pub resolve_image: vk::Image,
    pub resolve_view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub pyramid: DepthPyramid,
    pub gpu_memory: VideoMemory,
    pub cpu_memory: VideoMemory,
    pub uniform_buffer: vk::Buffer,
    pub uniform_mapped: *mut SceneData,
    pub uniform_range: vk::MappedMemoryRange<'static>,
    pub scene_data_set: vk::DescriptorSet,
    pub resulting_image_set: vk::DescriptorSet,
    pub color_format: vk::Format,
    pub depth_format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub extent: vk::Extent2D,
}

impl ForwardPass {
    pub fn new(
        dev: &Dev,
        caches: &mut Caches,
        pools: &DescriptorPools,
        width: u32,
        height: u32,
        samples: vk::SampleCountFlags,
    ) -> ForwardPass {
        let color_format = select_format(
            dev,
            &[
                vk::Format::R16G16B16A16_SFLOAT,
                vk::Format::R32G32B32A32_SFLOAT,
                vk::Format::R8G8B8A8_UNORM,
            ],
            vk::FormatFeatureFlags::COLOR_ATTACHMENT
                | vk::FormatFeatureFlags::SAMPLED_IMAGE
                | vk::FormatFeatureFlags::SAMPLED_IMAGE_FILTER_LINEAR,
        );
        let depth_format = select_format(
            dev,
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
                vk::Format::D16_UNORM,
            ],
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT
                | vk::FormatFeatureFlags::SAMPLED_IMAGE,
        );
        trace!("forward pass formats, \x1B[1mcolor\x1B[0m: {color_format:?}, \x1B[1mdepth\x1B[0m: {depth_format:?}, \x1B[1msamples\x1B[0m: {samples:?}");
        let render_pass = create_render_pass(dev, color_format, depth_format, samples);

        let mut pass = ForwardPass {
            render_pass,
            color_image: vk::Image::null(),
            color_view: vk::ImageView::null(),
            depth_image: vk::Image::null(),
            depth_view: vk::ImageView::null(),
            resolve_image: vk::Image::null(),
            resolve_view: vk::ImageView::null(),
            framebuffer: vk::Framebuffer::null(),
            pyramid: DepthPyramid {
                image: vk::Image::null(),
                mips: Vec::new(),
                full_view: vk::ImageView::null(),
                num_mips: 0,
                base_width: 0,
                base_height: 0,
                reduce_sets: Vec::new(),
                read_set: vk::DescriptorSet::null(),
            },
            gpu_memory: VideoMemory::null(),
            cpu_memory: VideoMemory::null(),
            uniform_buffer: vk::Buffer::null(),
            uniform_mapped: std::ptr::null_mut(),
            uniform_range: vk::MappedMemoryRange::default(),
            scene_data_set: vk::DescriptorSet::null(),
            resulting_image_set: vk::DescriptorSet::null(),
            color_format,
            depth_format,
            samples,
            extent: vk::Extent2D { width, height },
        };
        pass.create_uniform_buffer(dev, caches, pools);
        let mut scratch_queue = DeletionQueue::new();
        pass.create_attachments(dev, caches, pools, &mut scratch_queue, 0);
        pass
    }

    fn create_uniform_buffer(&mut self, dev: &Dev, caches: &mut Caches, pools: &DescriptorPools) {
        let size = std::mem::size_of::<SceneData>() as vk::DeviceSize;
        self.uniform_buffer = memory::create_buffer(
            dev,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            "forward/uniform-buffer",
        )
        .unwrap();
        let requirements =
            unsafe { dev.get_buffer_memory_requirements(self.uniform_buffer) };
        self.cpu_memory = VideoMemory::allocate(
            dev,
            requirements.size,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
            requirements.memory_type_bits,
            "forward/uniform-memory",
        )
        .unwrap();
        let mapped = self
            .cpu_memory
            .bind_buffer(dev, self.uniform_buffer, &requirements)
            .unwrap();
        self.uniform_mapped = mapped as *mut SceneData;
        self.uniform_range = vk::MappedMemoryRange::default()
            .memory(self.cpu_memory.handle)
            .offset(0)
            .size(vk::WHOLE_SIZE);

        let bindings = [BindingDesc {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            stages: vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
        }];
        self.scene_data_set =
            allocate_descriptor_sets(dev, caches, pools, &bindings, 1, false).unwrap()[0];
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(self.uniform_buffer)
            .offset(0)
            .range(size);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.scene_data_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe { dev.update_descriptor_sets(&[write], &[]) };
    }

    fn create_attachments(
        &mut self,
        dev: &Dev,
        caches: &mut Caches,
        pools: &DescriptorPools,
        deletion_queue: &mut DeletionQueue,
        frame: u64,
    ) {
        let msaa = self.samples != vk::SampleCountFlags::TYPE_1;
        let extent = vk::Extent3D {
            width: self.extent.width,
            height: self.extent.height,
            depth: 1,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let color_info = image_info
            .format(self.color_format)
            .samples(self.samples)
            .usage(if msaa {
                vk::ImageUsageFlags::COLOR_ATTACHMENT
            } else {
                vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED
            });
        self.color_image = unsafe { dev.create_image(&color_info, None) }.unwrap();
        let depth_info = image_info
            .format(self.depth_format)
            .samples(self.samples)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED);
        self.depth_image = unsafe { dev.create_image(&depth_info, None) }.unwrap();
        if msaa {
            let resolve_info = image_info
                .format(self.color_format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED);
            self.resolve_image = unsafe { dev.create_image(&resolve_info, None) }.unwrap();
        }
        let (pyramid_image, num_mips, base_width, base_height) =
            DepthPyramid::create_image(dev, self.extent.width, self.extent.height);

        let mut requirements = vec![
            unsafe { dev.get_image_memory_requirements(self.color_image) },
            unsafe { dev.get_image_memory_requirements(self.depth_image) },
            unsafe { dev.get_image_memory_requirements(pyramid_image) },
        ];
        if msaa {
            requirements
                .push(unsafe { dev.get_image_memory_requirements(self.resolve_image) });
        }
        let merged = memory::merge_requirements(&requirements);
        self.gpu_memory.reset();
        if self
            .gpu_memory
            .reallocate_if_needed(
                dev,
                deletion_queue,
                frame,
                &merged,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                "forward/attachment-memory",
            )
            .is_err()
        {
            // Attachments cannot grow, nothing sensible left to do.
            crate::fatal!("cannot allocate forward pass attachments");
        }
        self.gpu_memory
            .bind_image(dev, self.color_image, &requirements[0])
            .unwrap();
        self.gpu_memory
            .bind_image(dev, self.depth_image, &requirements[1])
            .unwrap();
        self.gpu_memory
            .bind_image(dev, pyramid_image, &requirements[2])
            .unwrap();
        if msaa {
            self.gpu_memory
                .bind_image(dev, self.resolve_image, &requirements[3])
                .unwrap();
        }

        let view_info = vk::ImageViewCreateInfo::default()
            .view_type(vk::ImageViewType::TYPE_2D)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.color_view = unsafe {
            dev.create_image_view(
                &view_info.image(self.color_image).format(self.color_format),
                None,
            )
        }
        .unwrap();
        let depth_view_info = vk::ImageViewCreateInfo::default()
            .view_type(vk::ImageViewType::TYPE_2D)
            .image(self.depth_image)
            .format(self.depth_format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.depth_view = unsafe { dev.create_image_view(&depth_view_info, None) }.unwrap();
        if msaa {
            self.resolve_view = unsafe {
                dev.create_image_view(
                    &view_info.image(self.resolve_image).format(self.color_format),
                    None,
                )
            }
            .unwrap();
        }

        let mut framebuffer_views = vec![self.color_view, self.depth_view];
        if msaa {
            framebuffer_views.push(self.resolve_view);
        }
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(self.render_pass)
            .attachments(&framebuffer_views)
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);
        self.framebuffer = unsafe { dev.create_framebuffer(&framebuffer_info, None) }.unwrap();

        self.pyramid = DepthPyramid::create_views_and_sets(
            dev,
            caches,
            pools,
            pyramid_image,
            num_mips,
            base_width,
            base_height,
            self.depth_view,
        );

        // The fullscreen blit samples the resolved colour, or the MSAA
        // colour directly when multisampling is off.
        let blit_bindings = [BindingDesc {
            binding: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            stages: vk::ShaderStageFlags::FRAGMENT,
        }];
        self.resulting_image_set =
            allocate_descriptor_sets(dev, caches, pools, &blit_bindings, 1, true).unwrap()[0];
        let sampler = caches.sampler(
            dev,
            vk::Filter::NEAREST,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            vk::BorderColor::FLOAT_OPAQUE_WHITE,
        );
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(if msaa { self.resolve_view } else { self.color_view })
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
            .sampler(sampler);
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.resulting_image_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(std::slice::from_ref(&image_info));
        unsafe { dev.update_descriptor_sets(&[write], &[]) };
    }

    fn destroy_attachments(&mut self, dev: &Dev) {
        unsafe {
            dev.destroy_framebuffer(self.framebuffer, None);
            dev.destroy_image_view(self.depth_view, None);
            dev.destroy_image_view(self.color_view, None);
            if self.resolve_view != vk::ImageView::null() {
                dev.destroy_image_view(self.resolve_view, None);
                dev.destroy_image(self.resolve_image, None);
                self.resolve_view = vk::ImageView::null();
                self.resolve_image = vk::Image::null();
            }
            dev.destroy_image(self.depth_image, None);
            dev.destroy_image(self.color_image, None);
        }
        self.pyramid.destroy_views(dev);
    }

    /// Device must be idle; the resettable descriptor pool is reset by the
    /// caller before this.
    pub fn resize(
        &mut self,
        dev: &Dev,
        caches: &mut Caches,
        pools: &DescriptorPools,
        deletion_queue: &mut DeletionQueue,
        frame: u64,
        width: u32,
        height: u32,
    ) {
        self.destroy_attachments(dev);
        self.extent = vk::Extent2D { width, height };
        self.create_attachments(dev, caches, pools, deletion_queue, frame);
    }

    pub fn begin(&self, dev: &Dev, cmd: vk::CommandBuffer, clear_color: [f32; 4]) {
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: clear_color,
                },
            },
            vk::ClearValue {
                // Reversed depth clears to far = 0.
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 0.,
                    stencil: 0,
                },
            },
        ];
        let render_area = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: self.extent,
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffer)
            .render_area(render_area)
            .clear_values(&clear_values);
        unsafe {
            dev.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE);
            let viewport = vk::Viewport {
                x: 0.,
                y: 0.,
                width: render_area.extent.width as f32,
                height: render_area.extent.height as f32,
                min_depth: 0.,
                max_depth: 1.,
            };
            dev.cmd_set_viewport(cmd, 0, &[viewport]);
            dev.cmd_set_scissor(cmd, 0, &[render_area]);
        }
    }

    pub fn write_uniform(&self, data: &SceneData) {
        unsafe { self.uniform_mapped.write(*data) };
    }

    pub fn flush_uniform(&self, dev: &Dev) {
        let result = unsafe { dev.flush_mapped_memory_ranges(&[self.uniform_range]) };
        if let Err(err) = result {
            log::warn!("failed to flush scene data with error {err}");
        }
    }

    pub fn destroy(&mut self, dev: &Dev) {
        self.destroy_attachments(dev);
        unsafe {
            dev.destroy_buffer(self.uniform_buffer, None);
            dev.destroy_render_pass(self.render_pass, None);
        }
        self.cpu_memory.free(dev);
        self.gpu_memory.free(dev);
    }

}

fn create_render_pass(
    dev: &Dev,
    color_format: vk::Format,
    depth_format: vk::Format,
    samples: vk::SampleCountFlags,
) -> vk::RenderPass {
    let msaa = samples != vk::SampleCountFlags::TYPE_1;
    let mut attachments = vec![
        vk::AttachmentDescription {
            format: color_format,
            samples,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: if msaa {
                vk::AttachmentStoreOp::DONT_CARE
            } else {
                vk::AttachmentStoreOp::STORE
            },
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: if msaa {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            },
            ..Default::default()
        },
        vk::AttachmentDescription {
            format: depth_format,
            samples,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ..Default::default()
        },
    ];
    if msaa {
        attachments.push(vk::AttachmentDescription {
            format: color_format,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::DONT_CARE,
            store_op: vk::AttachmentStoreOp::STORE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ..Default::default()
        });
    }
    let color_reference = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_reference = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let resolve_reference = [vk::AttachmentReference {
        attachment: 2,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_reference)
        .depth_stencil_attachment(&depth_reference);
    if msaa {
        subpass = subpass.resolve_attachments(&resolve_reference);
    }
    // The depth attachment of the previous frame is still being reduced
    // into the pyramid when this pass starts, and this frame's results are
    // sampled by the pyramid reduce and the swapchain blit afterwards.
    let dependencies = [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
                | vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::empty(),
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            src_access_mask: vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            dependency_flags: vk::DependencyFlags::empty(),
        },
    ];
    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(std::array::from_ref(&subpass))
        .dependencies(&dependencies);
    unsafe { dev.create_render_pass(&render_pass_info, None) }.unwrap()
}
