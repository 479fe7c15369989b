use crate::assets::ShaderWatcher;
use crate::cli::Args;
use crate::config::Config;
use crate::debug_draw::DebugDrawer;
use crate::renderer::caches::Caches;
use crate::renderer::debug::create_debug_messenger;
use crate::renderer::deletion_queue::DeletionQueue;
use crate::renderer::device::{
    create_instance, create_logical_device, select_physical_device, DescriptorPools, Dev,
};
use crate::renderer::forward::{ForwardPass, SceneData};
use crate::renderer::pipeline::{
    create_compute_pipeline, create_graphics_pipeline, PipelineDesc,
};
use crate::renderer::shader::ShaderCache;
use crate::renderer::shadow::ShadowPass;
use crate::renderer::swapchain::{create_render_pass, create_swapchain, query_surface_format};
use crate::renderer::util::max_sample_count;
use crate::renderer::vertex::{
    LINE_VERTEX_ATTRIBUTES, LINE_VERTEX_BINDINGS, VOXEL_SHADOW_ATTRIBUTES,
    VOXEL_VERTEX_ATTRIBUTES, VOXEL_VERTEX_BINDINGS,
};
use crate::renderer::{
    Pipelines, Renderer, Synchronization, FRAMES_IN_FLIGHT, MAX_DEBUG_VERTICES, MAX_VOXEL_DRAWS,
    MAX_VOXEL_VERTICES,
};
use crate::voxel::VoxelDrawer;
use crate::window::Window;
use anyhow::Result;
use ash::{vk, Entry};
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};
use std::time::Instant;

pub const VOXEL_VERT: &str = "shaders/voxel.vert";
pub const VOXEL_FRAG: &str = "shaders/voxel.frag";
pub const VOXEL_SHADOW_VERT: &str = "shaders/voxel_shadow.vert";
pub const LINE_VERT: &str = "shaders/line.vert";
pub const LINE_FRAG: &str = "shaders/line.frag";
pub const SCREEN_VERT: &str = "shaders/screen.vert";
pub const SCREEN_FRAG: &str = "shaders/screen.frag";
pub const DEPTH_REDUCE_COMP: &str = "shaders/depth_reduce.comp";
pub const CULL_ORTHO_COMP: &str = "shaders/cull_ortho.comp";
pub const CULL_PERSP_COMP: &str = "shaders/cull_persp.comp";
pub const CULL_COUNT_ORTHO_COMP: &str = "shaders/cull_count_ortho.comp";
pub const CULL_COUNT_PERSP_COMP: &str = "shaders/cull_count_persp.comp";

impl Renderer {
    pub fn new(window: &Window, args: &Args, config: &Config) -> Renderer {
        let entry = unsafe { Entry::load() }.unwrap();
        let display_handle = window.window.display_handle().unwrap().as_raw();
        let window_handle = window.window.window_handle().unwrap().as_raw();
        let instance = create_instance(&entry, display_handle, args);
        let debug_messenger = args
            .debug_layers
            .then(|| create_debug_messenger(&entry, &instance));
        let surface = unsafe {
            ash_window::create_surface(&entry, &instance, display_handle, window_handle, None)
        }
        .unwrap();
        let surface_ext = ash::khr::surface::Instance::new(&entry, &instance);
        let physical_info = select_physical_device(&instance, &surface_ext, surface, args.gpu);
        let dev = create_logical_device(&instance, &physical_info, args.debug_layers);
        let queue = unsafe { dev.get_device_queue(dev.queue_family, 0) };

        let pools = DescriptorPools::create(&dev);
        let mut caches = Caches::new();
        let mut shaders = ShaderCache::new();

        let window_size = window.window.inner_size();
        let samples = max_sample_count(&dev, args.msaa);
        let forward = ForwardPass::new(
            &dev,
            &mut caches,
            &pools,
            window_size.width,
            window_size.height,
            samples,
        );
        let shadow = ShadowPass::new(
            &dev,
            &mut caches,
            &pools,
            forward.depth_format,
            forward.uniform_buffer,
            std::mem::size_of::<SceneData>() as u64,
            config.get_int("Render.shadow_map_dim") as u32,
        );

        let surface_format = query_surface_format(&dev, &surface_ext, surface);
        let blit_render_pass = create_render_pass(&dev, surface_format.format);
        let swapchain = create_swapchain(
            &dev,
            &surface_ext,
            surface,
            window_size,
            blit_render_pass,
            vk::SwapchainKHR::null(),
        );

        let pipelines = create_pipelines(
            &dev,
            &mut caches,
            &mut shaders,
            &forward,
            &shadow,
            blit_render_pass,
        )
        .unwrap();

        let drawer = VoxelDrawer::new(
            &dev,
            &mut caches,
            &pools,
            MAX_VOXEL_VERTICES,
            MAX_VOXEL_DRAWS,
        )
        .unwrap();
        let debug_drawer = DebugDrawer::new(&dev, MAX_DEBUG_VERTICES).unwrap();

        let command_pools = create_command_pools(&dev);
        let command_buffers = create_command_buffers(&dev, &command_pools);
        let sync = create_sync(&dev);

        let mut shader_watcher = ShaderWatcher::new();
        for path in [
            VOXEL_VERT,
            VOXEL_FRAG,
            VOXEL_SHADOW_VERT,
            LINE_VERT,
            LINE_FRAG,
            SCREEN_VERT,
            SCREEN_FRAG,
            DEPTH_REDUCE_COMP,
            CULL_ORTHO_COMP,
            CULL_PERSP_COMP,
            CULL_COUNT_ORTHO_COMP,
            CULL_COUNT_PERSP_COMP,
        ] {
            shader_watcher.watch(path);
        }

        // Touch the mapped range once so validation sees initialised data
        // even before the first simulation update.
        forward.write_uniform(&SceneData {
            camera_projview: nalgebra::Matrix4::identity(),
            camera_projection: nalgebra::Matrix4::identity(),
            camera_view: nalgebra::Matrix4::identity(),
            light_space: nalgebra::Matrix4::identity(),
            sun_dir: nalgebra::Vector3::y(),
            sun_ambient: 0.1,
            camera_pos: nalgebra::Vector3::zeros(),
            _pad: 0.,
        });

        Renderer {
            _entry: entry,
            debug_messenger,
            surface_ext,
            surface,
            dev,
            queue,
            pools,
            caches,
            shaders,
            blit_render_pass,
            swapchain,
            forward,
            shadow,
            pipelines,
            drawer,
            debug_drawer,
            deletion_queue: DeletionQueue::new(),
            shader_watcher,
            command_pools,
            command_buffers,
            sync,
            flight_index: 0,
            frame_counter: 0,
            // Initialised before the first submit so the first frame's FPS
            // reading is sane.
            last_submit: Instant::now(),
            fps: 0.,
        }
    }

    /// Shutdown order: drawer, passes, swapchain, device.
    pub fn destroy(&mut self) {
        self.wait_idle();
        self.deletion_queue.drain(&self.dev);
        self.drawer.destroy(&self.dev, None);
        self.debug_drawer.destroy(&self.dev);
        for pipeline in [
            self.pipelines.voxel_colored.pipeline,
            self.pipelines.voxel_shadow.pipeline,
            self.pipelines.line.pipeline,
            self.pipelines.blit.pipeline,
            self.pipelines.depth_reduce.pipeline,
            self.pipelines.cull_ortho.pipeline,
            self.pipelines.cull_persp.pipeline,
        ] {
            unsafe { self.dev.destroy_pipeline(pipeline, None) };
        }
        self.shaders.destroy(&self.dev);
        self.forward.destroy(&self.dev);
        self.shadow.destroy(&self.dev);
        self.swapchain.destroy(&self.dev);
        unsafe { self.dev.destroy_render_pass(self.blit_render_pass, None) };
        self.caches.destroy(&self.dev);
        self.pools.destroy(&self.dev);
        unsafe {
            for semaphore in self.sync.image_available {
                self.dev.destroy_semaphore(semaphore, None);
            }
            self.dev.destroy_semaphore(self.sync.render_finished, None);
            for fence in self.sync.in_flight {
                self.dev.destroy_fence(fence, None);
            }
            for pool in self.command_pools {
                self.dev.destroy_command_pool(pool, None);
            }
            self.dev.destroy_device(None);
            self.surface_ext.destroy_surface(self.surface, None);
            if let Some((debug_ext, messenger)) = &self.debug_messenger {
                debug_ext.destroy_debug_utils_messenger(*messenger, None);
            }
            self.dev.instance.destroy_instance(None);
        }
    }
}

pub fn create_pipelines(
    dev: &Dev,
    caches: &mut Caches,
    shaders: &mut ShaderCache,
    forward: &ForwardPass,
    shadow: &ShadowPass,
    blit_render_pass: vk::RenderPass,
) -> Result<Pipelines> {
    let voxel_colored = create_graphics_pipeline(
        dev,
        caches,
        shaders,
        VOXEL_VERT,
        Some(VOXEL_FRAG),
        &PipelineDesc {
            vertex_bindings: &VOXEL_VERTEX_BINDINGS,
            vertex_attributes: &VOXEL_VERTEX_ATTRIBUTES,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            depth_bias: false,
            samples: forward.samples,
            color_attachments: 1,
            dynamic_states: &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            viewport_extent: None,
            render_pass: forward.render_pass,
        },
    )?;
    // Depth bias is negative at runtime because depth is reversed.
    let voxel_shadow = create_graphics_pipeline(
        dev,
        caches,
        shaders,
        VOXEL_SHADOW_VERT,
        None,
        &PipelineDesc {
            vertex_bindings: &VOXEL_VERTEX_BINDINGS,
            vertex_attributes: &VOXEL_SHADOW_ATTRIBUTES,
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            cull_mode: vk::CullModeFlags::FRONT,
            depth_bias: true,
            samples: vk::SampleCountFlags::TYPE_1,
            color_attachments: 0,
            dynamic_states: &[vk::DynamicState::DEPTH_BIAS],
            viewport_extent: Some(shadow.extent),
            render_pass: shadow.render_pass,
        },
    )?;
    let line = create_graphics_pipeline(
        dev,
        caches,
        shaders,
        LINE_VERT,
        Some(LINE_FRAG),
        &PipelineDesc {
            vertex_bindings: &LINE_VERTEX_BINDINGS,
            vertex_attributes: &LINE_VERTEX_ATTRIBUTES,
            topology: vk::PrimitiveTopology::LINE_LIST,
            cull_mode: vk::CullModeFlags::NONE,
            depth_bias: false,
            samples: forward.samples,
            color_attachments: 1,
            dynamic_states: &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            viewport_extent: None,
            render_pass: forward.render_pass,
        },
    )?;
    let blit = create_graphics_pipeline(
        dev,
        caches,
        shaders,
        SCREEN_VERT,
        Some(SCREEN_FRAG),
        &PipelineDesc {
            vertex_bindings: &[],
            vertex_attributes: &[],
            topology: vk::PrimitiveTopology::TRIANGLE_STRIP,
            cull_mode: vk::CullModeFlags::NONE,
            depth_bias: false,
            samples: vk::SampleCountFlags::TYPE_1,
            color_attachments: 1,
            dynamic_states: &[vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR],
            viewport_extent: None,
            render_pass: blit_render_pass,
        },
    )?;
    let depth_reduce = create_compute_pipeline(dev, caches, shaders, DEPTH_REDUCE_COMP)?;
    let (ortho_path, persp_path) = if dev.support.draw_indirect_count {
        (CULL_COUNT_ORTHO_COMP, CULL_COUNT_PERSP_COMP)
    } else {
        (CULL_ORTHO_COMP, CULL_PERSP_COMP)
    };
    let cull_ortho = create_compute_pipeline(dev, caches, shaders, ortho_path)?;
    let cull_persp = create_compute_pipeline(dev, caches, shaders, persp_path)?;
    Ok(Pipelines {
        voxel_colored,
        voxel_shadow,
        line,
        blit,
        depth_reduce,
        cull_ortho,
        cull_persp,
    })
}

fn create_command_pools(dev: &Dev) -> [vk::CommandPool; FRAMES_IN_FLIGHT] {
    std::array::from_fn(|_| {
        let pool_info =
            vk::CommandPoolCreateInfo::default().queue_family_index(dev.queue_family);
        unsafe { dev.create_command_pool(&pool_info, None) }.unwrap()
    })
}

fn create_command_buffers(
    dev: &Dev,
    pools: &[vk::CommandPool; FRAMES_IN_FLIGHT],
) -> [vk::CommandBuffer; FRAMES_IN_FLIGHT] {
    std::array::from_fn(|i| {
        let buffer_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pools[i])
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        unsafe { dev.allocate_command_buffers(&buffer_info) }.unwrap()[0]
    })
}

fn create_sync(dev: &Dev) -> Synchronization {
    let semaphore_info = vk::SemaphoreCreateInfo::default();
    let fence_info = vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED);
    Synchronization {
        image_available: std::array::from_fn(|_| {
            unsafe { dev.create_semaphore(&semaphore_info, None) }.unwrap()
        }),
        render_finished: unsafe { dev.create_semaphore(&semaphore_info, None) }.unwrap(),
        in_flight: std::array::from_fn(|_| {
            unsafe { dev.create_fence(&fence_info, None) }.unwrap()
        }),
    }
}
