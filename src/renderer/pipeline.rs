use crate::renderer::caches::Caches;
use crate::renderer::device::Dev;
use crate::renderer::shader::{merge_reflects, ShaderCache};
use anyhow::{anyhow, Result};
use ash::vk;

pub struct GraphicsPipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub vertex_shader: String,
    pub fragment_shader: Option<String>,
}

pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub shader: String,
}

/// Fixed-function state of a graphics pipeline. Depth compare is always
/// GREATER because the whole engine runs reversed depth.
pub struct PipelineDesc<'a> {
    pub vertex_bindings: &'a [vk::VertexInputBindingDescription],
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    pub topology: vk::PrimitiveTopology,
    pub cull_mode: vk::CullModeFlags,
    pub depth_bias: bool,
    pub samples: vk::SampleCountFlags,
    pub color_attachments: u32,
    pub dynamic_states: &'a [vk::DynamicState],
    pub viewport_extent: Option<vk::Extent2D>,
    pub render_pass: vk::RenderPass,
}

pub fn create_graphics_pipeline(
    dev: &Dev,
    caches: &mut Caches,
    shaders: &mut ShaderCache,
    vertex_shader: &str,
    fragment_shader: Option<&str>,
    desc: &PipelineDesc,
) -> Result<GraphicsPipeline> {
    let (vertex_module, vertex_reflect) = {
        let shader = shaders.get(dev, vertex_shader)?;
        (shader.module, shader.reflect.clone())
    };
    let mut reflect = vertex_reflect;
    let mut stage_infos = vec![vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vertex_module)
        .name(c"main")];
    if let Some(fragment_shader) = fragment_shader {
        let shader = shaders.get(dev, fragment_shader)?;
        reflect = merge_reflects(&reflect, &shader.reflect)?;
        stage_infos.push(
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(shader.module)
                .name(c"main"),
        );
    }
    let layout = caches.pipeline_layout(dev, &reflect);

    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(desc.vertex_bindings)
        .vertex_attribute_descriptions(desc.vertex_attributes);
    let input_assembly =
        vk::PipelineInputAssemblyStateCreateInfo::default().topology(desc.topology);
    let static_viewport;
    let static_scissor;
    let mut viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);
    if let Some(extent) = desc.viewport_extent {
        static_viewport = [vk::Viewport {
            x: 0.,
            y: 0.,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.,
            max_depth: 1.,
        }];
        static_scissor = [vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }];
        viewport_state = viewport_state
            .viewports(&static_viewport)
            .scissors(&static_scissor);
    }
    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .cull_mode(desc.cull_mode)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(desc.depth_bias)
        .line_width(1.);
    let multisample =
        vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(desc.samples);
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::GREATER);
    let blend_attachments = vec![
        vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(false)
            .color_write_mask(vk::ColorComponentFlags::RGBA);
        desc.color_attachments as usize
    ];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(desc.dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stage_infos)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(desc.render_pass)
        .subpass(0);
    let pipeline = unsafe {
        dev.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, err)| anyhow!("failed to create graphics pipeline for {vertex_shader}: {err}"))?
    .into_iter()
    .next()
    .unwrap();

    Ok(GraphicsPipeline {
        pipeline,
        layout,
        vertex_shader: vertex_shader.to_string(),
        fragment_shader: fragment_shader.map(str::to_string),
    })
}

pub fn create_compute_pipeline(
    dev: &Dev,
    caches: &mut Caches,
    shaders: &mut ShaderCache,
    shader_path: &str,
) -> Result<ComputePipeline> {
    let (module, reflect) = {
        let shader = shaders.get(dev, shader_path)?;
        (shader.module, shader.reflect.clone())
    };
    let layout = caches.pipeline_layout(dev, &reflect);
    let stage_info = vk::PipelineShaderStageCreateInfo::default()
        .stage(vk::ShaderStageFlags::COMPUTE)
        .module(module)
        .name(c"main");
    let pipeline_info = vk::ComputePipelineCreateInfo::default()
        .stage(stage_info)
        .layout(layout);
    let pipeline = unsafe {
        dev.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    }
    .map_err(|(_, err)| anyhow!("failed to create compute pipeline for {shader_path}: {err}"))?
    .into_iter()
    .next()
    .unwrap();
    Ok(ComputePipeline {
        pipeline,
        layout,
        shader: shader_path.to_string(),
    })
}

pub fn bind_graphics(
    dev: &Dev,
    buf: vk::CommandBuffer,
    pipeline: &GraphicsPipeline,
    sets: &[vk::DescriptorSet],
) {
    unsafe {
        if !sets.is_empty() {
            dev.cmd_bind_descriptor_sets(
                buf,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.layout,
                0,
                sets,
                &[],
            );
        }
        dev.cmd_bind_pipeline(buf, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
    }
}

pub fn bind_compute(
    dev: &Dev,
    buf: vk::CommandBuffer,
    pipeline: &ComputePipeline,
    sets: &[vk::DescriptorSet],
) {
    unsafe {
        if !sets.is_empty() {
            dev.cmd_bind_descriptor_sets(
                buf,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                sets,
                &[],
            );
        }
        dev.cmd_bind_pipeline(buf, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
    }
}
