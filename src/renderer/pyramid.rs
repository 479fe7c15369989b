use crate::math::nearest_pow2;
use crate::renderer::caches::{allocate_descriptor_sets, Caches};
use crate::renderer::device::{DescriptorPools, Dev};
use crate::renderer::pipeline::{bind_compute, ComputePipeline};
use crate::renderer::shader::BindingDesc;
use ash::vk;

/// Mip chain of per-2x2 maxima of the previous frame's depth. Depth is
/// reversed (near = 1), so storing the numeric minimum of a footprint gives
/// the farthest-from-camera conservative bound the occlusion test needs.
pub struct DepthPyramid {
    pub image: vk::Image,
    pub mips: Vec<vk::ImageView>,
    pub full_view: vk::ImageView,
    pub num_mips: u32,
    pub base_width: u32,
    pub base_height: u32,
    pub reduce_sets: Vec<vk::DescriptorSet>,
    pub read_set: vk::DescriptorSet,
}

const PYRAMID_FORMAT: vk::Format = vk::Format::R32_SFLOAT;

impl DepthPyramid {
    /// Creates the image only; memory binding and descriptor updates are
    /// the forward pass's job since they share its attachment memory.
    pub fn create_image(dev: &Dev, width: u32, height: u32) -> (vk::Image, u32, u32, u32) {
        let base_width = nearest_pow2(width / 2);
        let base_height = nearest_pow2(height / 2);
        let num_mips = base_width.max(base_height).ilog2() + 1;
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(PYRAMID_FORMAT)
            .extent(vk::Extent3D {
                width: base_width,
                height: base_height,
                depth: 1,
            })
            .mip_levels(num_mips)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(
                vk::ImageUsageFlags::STORAGE
                    | vk::ImageUsageFlags::SAMPLED
                    | vk::ImageUsageFlags::TRANSFER_DST,
            )
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let image = unsafe { dev.create_image(&image_info, None) }.unwrap();
        (image, num_mips, base_width, base_height)
    }

    pub fn create_views_and_sets(
        dev: &Dev,
        caches: &mut Caches,
        pools: &DescriptorPools,
        image: vk::Image,
        num_mips: u32,
        base_width: u32,
        base_height: u32,
        depth_attachment_view: vk::ImageView,
    ) -> DepthPyramid {
        let mut mips = Vec::new();
        for mip in 0..num_mips {
            let view_info = vk::ImageViewCreateInfo::default()
                .image(image)
                .view_type(vk::ImageViewType::TYPE_2D)
                .format(PYRAMID_FORMAT)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: mip,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            mips.push(unsafe { dev.create_image_view(&view_info, None) }.unwrap());
        }
        let full_view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(PYRAMID_FORMAT)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: num_mips,
                base_array_layer: 0,
                layer_count: 1,
            });
        let full_view = unsafe { dev.create_image_view(&full_view_info, None) }.unwrap();

        let reduce_bindings = [
            BindingDesc {
                binding: 0,
                descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                count: 1,
                stages: vk::ShaderStageFlags::COMPUTE,
            },
            BindingDesc {
                binding: 1,
                descriptor_type: vk::DescriptorType::STORAGE_IMAGE,
                count: 1,
                stages: vk::ShaderStageFlags::COMPUTE,
            },
        ];
        let reduce_sets = allocate_descriptor_sets(
            dev,
            caches,
            pools,
            &reduce_bindings,
            num_mips as usize,
            true,
        )
        .unwrap();
        let read_bindings = [BindingDesc {
            binding: 0,
            descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count: 1,
            stages: vk::ShaderStageFlags::COMPUTE,
        }];
        let read_set = allocate_descriptor_sets(dev, caches, pools, &read_bindings, 1, true)
            .unwrap()[0];

        let sampler = caches.sampler(
            dev,
            vk::Filter::NEAREST,
            vk::SamplerAddressMode::CLAMP_TO_EDGE,
            vk::BorderColor::FLOAT_OPAQUE_BLACK,
        );
        let mut image_infos = Vec::new();
        let mut writes: Vec<vk::WriteDescriptorSet> = Vec::new();
        for mip in 0..num_mips as usize {
            // Level 0 reduces the main depth attachment, level N reads N-1.
            image_infos.push(
                vk::DescriptorImageInfo::default()
                    .image_view(if mip == 0 {
                        depth_attachment_view
                    } else {
                        mips[mip - 1]
                    })
                    .image_layout(if mip == 0 {
                        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
                    } else {
                        vk::ImageLayout::GENERAL
                    })
                    .sampler(sampler),
            );
            image_infos.push(
                vk::DescriptorImageInfo::default()
                    .image_view(mips[mip])
                    .image_layout(vk::ImageLayout::GENERAL),
            );
        }
        image_infos.push(
            vk::DescriptorImageInfo::default()
                .image_view(full_view)
                .image_layout(vk::ImageLayout::GENERAL)
                .sampler(sampler),
        );
        for mip in 0..num_mips as usize {
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(reduce_sets[mip])
                    .dst_binding(0)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(&image_infos[2 * mip])),
            );
            writes.push(
                vk::WriteDescriptorSet::default()
                    .dst_set(reduce_sets[mip])
                    .dst_binding(1)
                    .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                    .image_info(std::slice::from_ref(&image_infos[2 * mip + 1])),
            );
        }
        writes.push(
            vk::WriteDescriptorSet::default()
                .dst_set(read_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                .image_info(std::slice::from_ref(image_infos.last().unwrap())),
        );
        unsafe { dev.update_descriptor_sets(&writes, &[]) };

        DepthPyramid {
            image,
            mips,
            full_view,
            num_mips,
            base_width,
            base_height,
            reduce_sets,
            read_set,
        }
    }

    /// First-frame setup, recorded before the first cull pass: there is no
    /// depth history yet, so all mips transition to GENERAL and clear to
    /// far (0 in reversed depth) and the cull pass occludes nothing.
    pub fn prepare_history(&self, dev: &Dev, cmd: vk::CommandBuffer) {
        {
            let range = vk::ImageSubresourceRange {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                base_mip_level: 0,
                level_count: self.num_mips,
                base_array_layer: 0,
                layer_count: 1,
            };
            let to_transfer = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .image(self.image)
                .subresource_range(range);
            unsafe {
                dev.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TOP_OF_PIPE,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_transfer],
                );
                dev.cmd_clear_color_image(
                    cmd,
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &vk::ClearColorValue {
                        float32: [0., 0., 0., 0.],
                    },
                    &[range],
                );
            }
            let to_general = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::GENERAL)
                .image(self.image)
                .subresource_range(range);
            unsafe {
                dev.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::TRANSFER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[to_general],
                )
            };
        }
    }

    /// One dispatch per mip, each reading the previous level (level 0 reads
    /// the depth attachment). Recorded after the forward pass so next
    /// frame's culling sees this frame's depth.
    pub fn reduce(&self, dev: &Dev, cmd: vk::CommandBuffer, pipeline: &ComputePipeline) {
        bind_compute(dev, cmd, pipeline, &[]);
        let mut level_width = self.base_width;
        let mut level_height = self.base_height;
        for mip in 0..self.num_mips {
            unsafe {
                dev.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline.layout,
                    0,
                    &[self.reduce_sets[mip as usize]],
                    &[],
                );
                dev.cmd_dispatch(cmd, level_width / 16, level_height / 16, 1);
            }
            // Serialise consecutive levels: level N+1 samples level N.
            let barrier = vk::ImageMemoryBarrier::default()
                .src_access_mask(vk::AccessFlags::SHADER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .old_layout(vk::ImageLayout::GENERAL)
                .new_layout(vk::ImageLayout::GENERAL)
                .image(self.image)
                .subresource_range(vk::ImageSubresourceRange {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    base_mip_level: mip,
                    level_count: 1,
                    base_array_layer: 0,
                    layer_count: 1,
                });
            unsafe {
                dev.cmd_pipeline_barrier(
                    cmd,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::PipelineStageFlags::COMPUTE_SHADER,
                    vk::DependencyFlags::empty(),
                    &[],
                    &[],
                    &[barrier],
                )
            };
            level_width = (level_width >> 1).max(16);
            level_height = (level_height >> 1).max(16);
        }
    }

    pub fn destroy_views(&mut self, dev: &Dev) {
        for view in self.mips.drain(..) {
            unsafe { dev.destroy_image_view(view, None) };
        }
        unsafe { dev.destroy_image_view(self.full_view, None) };
        unsafe { dev.destroy_image(self.image, None) };
    }
}
