use crate::renderer::caches::{allocate_descriptor_sets, Caches};
use crate::renderer::deletion_queue::{DeletedObject, DeletionQueue};
use crate::renderer::device::{DescriptorPools, Dev};
use crate::renderer::memory::VideoMemory;
use crate::renderer::shader::BindingDesc;
use ash::vk;
use log::trace;

/// Depth-only pass rasterising voxels from the sun camera. The attachment
/// is stored and sampled by the forward pass's fragment shader.
pub struct ShadowPass {
    pub render_pass: vk::RenderPass,
    pub image: vk::Image,
    pub image_view: vk::ImageView,
    pub framebuffer: vk::Framebuffer,
    pub memory: VideoMemory,
    pub extent: vk::Extent2D,
    pub scene_data_set: vk::DescriptorSet,
    pub shadow_set: vk::DescriptorSet,
    depth_format: vk::Format,
}

impl ShadowPass {
    pub fn new(
        dev: &Dev,
        caches: &mut Caches,
        pools: &DescriptorPools,
        depth_format: vk::Format,
        uniform_buffer: vk::Buffer,
        uniform_size: vk::DeviceSize,
        dim: u32,
    ) -> ShadowPass {
        let render_pass = create_render_pass(dev, depth_format);
        let mut pass = ShadowPass {
            render_pass,
            image: vk::Image::null(),
            image_view: vk::ImageView::null(),
            framebuffer: vk::Framebuffer::null(),
            memory: VideoMemory::null(),
            extent: vk::Extent2D {
                width: dim,
                height: dim,
            },
            scene_data_set: vk::DescriptorSet::null(),
            shadow_set: vk::DescriptorSet::null(),
            depth_format,
        };
        let mut scratch_queue = DeletionQueue::new();
        pass.create_attachments(dev, &mut scratch_queue, 0);
        pass.allocate_descriptor_sets(dev, caches, pools, uniform_buffer, uniform_size);
        pass
    }

    fn create_attachments(&mut self, dev: &Dev, deletion_queue: &mut DeletionQueue, frame: u64) {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(self.depth_format)
            .extent(vk::Extent3D {
                width: self.extent.width,
                height: self.extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT | vk::ImageUsageFlags::SAMPLED)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        self.image = unsafe { dev.create_image(&image_info, None) }.unwrap();
        let requirements = unsafe { dev.get_image_memory_requirements(self.image) };
        self.memory
            .reallocate_if_needed(
                dev,
                deletion_queue,
                frame,
                &requirements,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
                "shadow/attachment-memory",
            )
            .unwrap();
        self.memory
            .bind_image(dev, self.image, &requirements)
            .unwrap();
        let view_info = vk::ImageViewCreateInfo::default()
            .image(self.image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(self.depth_format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::DEPTH,
                base_mip_level: 0,
                level_count: 1,
                base_array_layer: 0,
                layer_count: 1,
            });
        self.image_view = unsafe { dev.create_image_view(&view_info, None) }.unwrap();
        let framebuffer_info = vk::FramebufferCreateInfo::default()
            .render_pass(self.render_pass)
            .attachments(std::slice::from_ref(&self.image_view))
            .width(self.extent.width)
            .height(self.extent.height)
            .layers(1);
        self.framebuffer = unsafe { dev.create_framebuffer(&framebuffer_info, None) }.unwrap();
        trace!("allocated {} bytes for shadow map", requirements.size);
    }

    fn allocate_descriptor_sets(
        &mut self,
        dev: &Dev,
        caches: &mut Caches,
        pools: &DescriptorPools,
        uniform_buffer: vk::Buffer,
        uniform_size: vk::DeviceSize,
    ) {
        let scene_bindings = [BindingDesc {
            binding: 0,
            descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
            count: 1,
            stages: vk::ShaderStageFlags::VERTEX,
        }];
        self.scene_data_set =
            allocate_descriptor_sets(dev, caches, pools, &scene_bindings, 1, false).unwrap()[0];
        let shadow_bindings = [BindingDesc {
            binding: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            stages: vk::ShaderStageFlags::FRAGMENT,
        }];
        self.shadow_set =
            allocate_descriptor_sets(dev, caches, pools, &shadow_bindings, 1, false).unwrap()[0];
        self.update_descriptor_sets(dev, caches, uniform_buffer, uniform_size);
    }

    fn update_descriptor_sets(
        &mut self,
        dev: &Dev,
        caches: &mut Caches,
        uniform_buffer: vk::Buffer,
        uniform_size: vk::DeviceSize,
    ) {
        let buffer_info = vk::DescriptorBufferInfo::default()
            .buffer(uniform_buffer)
            .offset(0)
            .range(uniform_size);
        let sampler = caches.sampler(
            dev,
            vk::Filter::NEAREST,
            vk::SamplerAddressMode::CLAMP_TO_BORDER,
            vk::BorderColor::FLOAT_OPAQUE_BLACK,
        );
        let image_info = vk::DescriptorImageInfo::default()
            .image_view(self.image_view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL)
            .sampler(sampler);
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(self.scene_data_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&buffer_info)),
            vk::WriteDescriptorSet::default()
                .dst_set(self.shadow_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(&image_info)),
        ];
        unsafe { dev.update_descriptor_sets(&writes, &[]) };
    }

    /// Shadow-map resolution changed at runtime. The old attachment retires
    /// through the deletion queue and in-flight frames keep sampling it, so
    /// fresh descriptor sets are allocated rather than updating sets a
    /// pending command buffer still references.
    pub fn recreate(
        &mut self,
        dev: &Dev,
        caches: &mut Caches,
        pools: &DescriptorPools,
        deletion_queue: &mut DeletionQueue,
        frame: u64,
        uniform_buffer: vk::Buffer,
        uniform_size: vk::DeviceSize,
        dim: u32,
    ) {
        deletion_queue.push(DeletedObject::Framebuffer(self.framebuffer), frame);
        deletion_queue.push(DeletedObject::ImageView(self.image_view), frame);
        deletion_queue.push(DeletedObject::Image(self.image), frame);
        self.memory.reset();
        self.extent = vk::Extent2D {
            width: dim,
            height: dim,
        };
        self.create_attachments(dev, deletion_queue, frame);
        self.allocate_descriptor_sets(dev, caches, pools, uniform_buffer, uniform_size);
    }

    pub fn begin(&self, dev: &Dev, cmd: vk::CommandBuffer) {
        let clear_value = vk::ClearValue {
            depth_stencil: vk::ClearDepthStencilValue {
                depth: 0.,
                stencil: 0,
            },
        };
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(self.render_pass)
            .framebuffer(self.framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: self.extent,
            })
            .clear_values(std::slice::from_ref(&clear_value));
        unsafe { dev.cmd_begin_render_pass(cmd, &begin_info, vk::SubpassContents::INLINE) };
    }

    pub fn destroy(&mut self, dev: &Dev) {
        unsafe {
            dev.destroy_framebuffer(self.framebuffer, None);
            dev.destroy_image_view(self.image_view, None);
            dev.destroy_image(self.image, None);
            dev.destroy_render_pass(self.render_pass, None);
        }
        self.memory.free(dev);
    }
}

fn create_render_pass(dev: &Dev, depth_format: vk::Format) -> vk::RenderPass {
    let attachment = vk::AttachmentDescription {
        format: depth_format,
        samples: vk::SampleCountFlags::TYPE_1,
        load_op: vk::AttachmentLoadOp::CLEAR,
        store_op: vk::AttachmentStoreOp::STORE,
        initial_layout: vk::ImageLayout::UNDEFINED,
        final_layout: vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL,
        ..Default::default()
    };
    let depth_reference = vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .depth_stencil_attachment(&depth_reference);
    // Depth writes must complete before the forward pass's fragment shader
    // samples the map.
    let dependencies = [
        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            dst_stage_mask: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            src_access_mask: vk::AccessFlags::SHADER_READ,
            dst_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
        vk::SubpassDependency {
            src_subpass: 0,
            dst_subpass: vk::SUBPASS_EXTERNAL,
            src_stage_mask: vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
            dst_stage_mask: vk::PipelineStageFlags::FRAGMENT_SHADER,
            src_access_mask: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            dst_access_mask: vk::AccessFlags::SHADER_READ,
            dependency_flags: vk::DependencyFlags::BY_REGION,
        },
    ];
    let render_pass_info = vk::RenderPassCreateInfo::default()
        .attachments(std::slice::from_ref(&attachment))
        .subpasses(std::slice::from_ref(&subpass))
        .dependencies(&dependencies);
    unsafe { dev.create_render_pass(&render_pass_info, None) }.unwrap()
}
