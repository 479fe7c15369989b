use crate::renderer::device::{DescriptorPools, Dev};
use crate::renderer::shader::{BindingDesc, ShaderReflect};
use ash::prelude::VkResult;
use ash::vk;
use std::collections::HashMap;

/// Content-addressed caches for descriptor-set layouts, samplers and
/// pipeline layouts. Repeating a reflection + creation sequence on the same
/// module returns the same handles.
pub struct Caches {
    ds_layouts: HashMap<Vec<BindingDesc>, vk::DescriptorSetLayout>,
    samplers: HashMap<SamplerKey, vk::Sampler>,
    pipeline_layouts: HashMap<PipelineLayoutKey, vk::PipelineLayout>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerKey {
    pub filter: vk::Filter,
    pub address_mode: vk::SamplerAddressMode,
    pub border_color: vk::BorderColor,
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct PipelineLayoutKey {
    set_layouts: Vec<vk::DescriptorSetLayout>,
    push_ranges: Vec<(vk::ShaderStageFlags, u32, u32)>,
}

impl Caches {
    pub fn new() -> Caches {
        Caches {
            ds_layouts: HashMap::new(),
            samplers: HashMap::new(),
            pipeline_layouts: HashMap::new(),
        }
    }

    /// Layouts are keyed by the sorted binding array, so binding order in
    /// the shader does not matter.
    pub fn descriptor_set_layout(
        &mut self,
        dev: &Dev,
        bindings: &[BindingDesc],
    ) -> vk::DescriptorSetLayout {
        let mut key = bindings.to_vec();
        key.sort_by_key(|binding| binding.binding);
        if let Some(layout) = self.ds_layouts.get(&key) {
            return *layout;
        }
        let vk_bindings: Vec<vk::DescriptorSetLayoutBinding> = key
            .iter()
            .map(|binding| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .descriptor_count(binding.count)
                    .stage_flags(binding.stages)
            })
            .collect();
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&vk_bindings);
        let layout = unsafe { dev.create_descriptor_set_layout(&layout_info, None) }.unwrap();
        self.ds_layouts.insert(key, layout);
        layout
    }

    pub fn sampler(
        &mut self,
        dev: &Dev,
        filter: vk::Filter,
        address_mode: vk::SamplerAddressMode,
        border_color: vk::BorderColor,
    ) -> vk::Sampler {
        let key = SamplerKey {
            filter,
            address_mode,
            border_color,
        };
        if let Some(sampler) = self.samplers.get(&key) {
            return *sampler;
        }
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(filter)
            .min_filter(filter)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(address_mode)
            .address_mode_v(address_mode)
            .address_mode_w(address_mode)
            .border_color(border_color)
            .max_lod(vk::LOD_CLAMP_NONE);
        let sampler = unsafe { dev.create_sampler(&sampler_info, None) }.unwrap();
        self.samplers.insert(key, sampler);
        sampler
    }

    /// Pipeline layout from a merged reflection record: one cached set
    /// layout per reflected set, plus the push-constant ranges.
    pub fn pipeline_layout(&mut self, dev: &Dev, reflect: &ShaderReflect) -> vk::PipelineLayout {
        let set_layouts: Vec<vk::DescriptorSetLayout> = reflect
            .sets
            .iter()
            .map(|bindings| self.descriptor_set_layout(dev, bindings))
            .collect();
        let key = PipelineLayoutKey {
            set_layouts: set_layouts.clone(),
            push_ranges: reflect
                .push_ranges
                .iter()
                .map(|range| (range.stage_flags, range.offset, range.size))
                .collect(),
        };
        if let Some(layout) = self.pipeline_layouts.get(&key) {
            return *layout;
        }
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&reflect.push_ranges);
        let layout = unsafe { dev.create_pipeline_layout(&layout_info, None) }.unwrap();
        self.pipeline_layouts.insert(key, layout);
        layout
    }

    pub fn destroy(&mut self, dev: &Dev) {
        for (_, layout) in self.pipeline_layouts.drain() {
            unsafe { dev.destroy_pipeline_layout(layout, None) };
        }
        for (_, sampler) in self.samplers.drain() {
            unsafe { dev.destroy_sampler(sampler, None) };
        }
        for (_, layout) in self.ds_layouts.drain() {
            unsafe { dev.destroy_descriptor_set_layout(layout, None) };
        }
    }
}

/// Allocates descriptor sets for a manually described binding list, going
/// through the layout cache so the layout matches the one pipelines derive
/// from reflection.
pub fn allocate_descriptor_sets(
    dev: &Dev,
    caches: &mut Caches,
    pools: &DescriptorPools,
    bindings: &[BindingDesc],
    count: usize,
    resettable: bool,
) -> VkResult<Vec<vk::DescriptorSet>> {
    let layout = caches.descriptor_set_layout(dev, bindings);
    pools.allocate(dev, layout, count, resettable)
}
