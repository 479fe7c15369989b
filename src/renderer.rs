pub mod caches;
pub mod debug;
pub mod deletion_queue;
pub mod device;
pub mod forward;
pub mod lifecycle;
pub mod memory;
pub mod pipeline;
pub mod pyramid;
pub mod shader;
pub mod shadow;
pub mod swapchain;
pub mod util;
pub mod vertex;

use crate::assets::ShaderWatcher;
use crate::config::Config;
use crate::debug_draw::DebugDrawer;
use crate::ecs::Entity;
use crate::math::{frustum_intersects_obb, Obb};
use crate::renderer::caches::Caches;
use crate::renderer::debug::{begin_label, end_label};
use crate::renderer::deletion_queue::{DeletedObject, DeletionQueue};
use crate::renderer::device::{DescriptorPools, Dev};
use crate::renderer::forward::{ForwardPass, SceneData};
use crate::renderer::pipeline::{bind_graphics, ComputePipeline, GraphicsPipeline};
use crate::renderer::shader::ShaderCache;
use crate::renderer::shadow::ShadowPass;
use crate::renderer::swapchain::Swapchain;
use crate::renderer::vertex::pack_color;
use crate::voxel::drawer::{CullPipelines, VoxelPipelines};
use crate::voxel::VoxelDrawer;
use crate::world::World;
use ash::{vk, Entry};
use log::{error, warn};
use nalgebra::Vector3;
use std::time::Instant;
use winit::dpi::PhysicalSize;

pub const FRAMES_IN_FLIGHT: usize = 2;

/// Capacity of the drawer's shared vertex buffer.
pub const MAX_VOXEL_VERTICES: usize = 4 * 1024 * 1024;

/// Instances per frame.
pub const MAX_VOXEL_DRAWS: usize = 1024;

pub const MAX_DEBUG_VERTICES: usize = 64 * 1024;

pub struct Renderer {
    // Immutable parts of the renderer, kept alive for the whole process.
    pub _entry: Entry,
    pub debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    pub surface_ext: ash::khr::surface::Instance,
    pub surface: vk::SurfaceKHR,
    pub dev: Dev,
    pub queue: vk::Queue,

    // Handle caches and descriptor pools shared by every pass.
    pub pools: DescriptorPools,
    pub caches: Caches,
    pub shaders: ShaderCache,

    // The render graph: shadow -> forward -> depth reduce -> blit.
    pub blit_render_pass: vk::RenderPass,
    pub swapchain: Swapchain,
    pub forward: ForwardPass,
    pub shadow: ShadowPass,
    pub pipelines: Pipelines,

    pub drawer: VoxelDrawer,
    pub debug_drawer: DebugDrawer,
    pub deletion_queue: DeletionQueue,
    pub shader_watcher: ShaderWatcher,

    // Command recording and frame pacing.
    pub command_pools: [vk::CommandPool; FRAMES_IN_FLIGHT],
    pub command_buffers: [vk::CommandBuffer; FRAMES_IN_FLIGHT],
    pub sync: Synchronization,
    pub flight_index: usize,
    pub frame_counter: u64,
    pub last_submit: Instant,
    pub fps: f32,
}

pub struct Synchronization {
    pub image_available: [vk::Semaphore; FRAMES_IN_FLIGHT],
    pub render_finished: vk::Semaphore,
    pub in_flight: [vk::Fence; FRAMES_IN_FLIGHT],
}

pub struct Pipelines {
    pub voxel_colored: GraphicsPipeline,
    pub voxel_shadow: GraphicsPipeline,
    pub line: GraphicsPipeline,
    pub blit: GraphicsPipeline,
    pub depth_reduce: ComputePipeline,
    pub cull_ortho: ComputePipeline,
    pub cull_persp: ComputePipeline,
}

impl Renderer {
    pub fn draw_frame(
        &mut self,
        world: &mut World,
        config: &Config,
        window_size: PhysicalSize<u32>,
    ) {
        match self.frame_counter & 31 {
            31 => {
                self.check_shader_reloads();
                self.check_shadow_map_dim(config);
            }
            _ => {}
        }

        let in_flight = self.sync.in_flight[self.flight_index];
        let image_available = self.sync.image_available[self.flight_index];
        unsafe {
            self.dev.wait_for_fences(&[in_flight], true, u64::MAX).unwrap();
        }
        let acquire_result = unsafe {
            self.dev.swapchain_ext.acquire_next_image(
                self.swapchain.handle,
                u64::MAX,
                image_available,
                vk::Fence::null(),
            )
        };
        let image_index = match acquire_result {
            Ok((image_index, _suboptimal)) => image_index as usize,
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.recreate_swapchain(window_size);
                return;
            }
            Err(err) => panic!("failed to acquire swapchain image: {err}"),
        };
        unsafe {
            self.dev.reset_fences(&[in_flight]).unwrap();
            self.dev
                .reset_command_pool(
                    self.command_pools[self.flight_index],
                    vk::CommandPoolResetFlags::empty(),
                )
                .unwrap();
        }

        self.deletion_queue.update(self.frame_counter, &self.dev);

        self.drawer.new_frame(self.frame_counter);
        self.debug_drawer.new_frame();
        self.feed_drawer(world, config);
        self.update_scene_data(world);

        let cmd = self.command_buffers[self.flight_index];
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.dev.begin_command_buffer(cmd, &begin_info).unwrap() };
        self.record_frame(cmd, world, config, image_index);
        unsafe { self.dev.end_command_buffer(cmd).unwrap() };
        self.forward.flush_uniform(&self.dev);

        self.submit_graphics(cmd);
        self.submit_present(image_index, window_size);

        let now = Instant::now();
        let frame_time = now - self.last_submit;
        self.fps = 1. / frame_time.as_secs_f32().max(1.0e-6);
        self.last_submit = now;
        self.flight_index = (self.flight_index + 1) % FRAMES_IN_FLIGHT;
        self.frame_counter += 1;
    }

    /// The CPU visibility pre-pass: refresh each instance's OBB, test it
    /// against every camera frustum, OR camera bits into its cull mask and
    /// hand visible instances to the drawer.
    fn feed_drawer(&mut self, world: &mut World, config: &Config) {
        let camera_masks: Vec<(u32, nalgebra::Matrix4<f32>)> = world
            .cameras
            .iter()
            .map(|(_, camera)| (camera.cull_mask, camera.projview()))
            .collect();
        let draw_obbs = config.get_int("Render.debug_voxel_obb") != 0;

        let entities: Vec<Entity> = world.views.entities().to_vec();
        for entity in entities {
            let Some(view) = world.views.get(entity).copied() else {
                continue;
            };
            let Some(transform) = world.transforms.get(entity).copied() else {
                continue;
            };
            let Some(grid) = world.grids.get_mut(view.grid) else {
                continue;
            };
            let (half_size, _) = grid.size();
            let obb = Obb::from_half_size(half_size, &transform);
            world.obbs.insert(entity, obb);

            let mut mask = 0;
            for (camera_mask, projview) in &camera_masks {
                if frustum_intersects_obb(projview, &obb) {
                    mask |= camera_mask;
                }
            }
            if mask == 0 {
                continue;
            }
            let view = world.views.get_mut(entity).unwrap();
            view.cull_mask = mask;
            let view = *view;
            self.drawer.push_mesh(entity, &view, grid, &transform);
            if draw_obbs {
                self.debug_drawer.draw_obb(&obb, pack_color(255, 160, 0, 255));
            }
        }

        if draw_obbs {
            let origin = Vector3::zeros();
            self.debug_drawer
                .add_line(origin, Vector3::new(3., 0., 0.), pack_color(255, 0, 0, 255));
            self.debug_drawer
                .add_line(origin, Vector3::new(0., 3., 0.), pack_color(0, 255, 0, 255));
            self.debug_drawer
                .add_line(origin, Vector3::new(0., 0., 3.), pack_color(0, 0, 255, 255));
        }
    }

    fn update_scene_data(&mut self, world: &mut World) {
        let main_camera = world.main_camera;
        let shadow_camera = world.shadow_camera;
        let (projview, projection, view, position) = {
            let camera = world.cameras.get_mut(main_camera).unwrap();
            (
                camera.projview(),
                camera.projection(),
                camera.view(),
                camera.position,
            )
        };
        let light_space = world.cameras.get_mut(shadow_camera).unwrap().projview();
        self.forward.write_uniform(&SceneData {
            camera_projview: projview,
            camera_projection: projection,
            camera_view: view,
            light_space,
            sun_dir: world.sun_dir,
            sun_ambient: world.sun_ambient,
            camera_pos: position,
            _pad: 0.,
        });
    }

    fn record_frame(
        &mut self,
        cmd: vk::CommandBuffer,
        world: &mut World,
        config: &Config,
        image_index: usize,
    ) {
        if self.frame_counter == 0 {
            self.forward.pyramid.prepare_history(&self.dev, cmd);
        }

        // Cull pass: one compute dispatch per active camera, reading the
        // previous frame's depth pyramid.
        begin_label(cmd, c"Voxel cull", [80, 160, 220], &self.dev);
        {
            let shadow_camera = world.cameras.get(world.shadow_camera).unwrap();
            let main_camera = world.cameras.get(world.main_camera).unwrap();
            let cull_pipelines = CullPipelines {
                ortho: &self.pipelines.cull_ortho,
                persp: &self.pipelines.cull_persp,
                pyramid_read_set: self.forward.pyramid.read_set,
            };
            self.drawer
                .cull(&self.dev, cmd, &[shadow_camera, main_camera], &cull_pipelines);
        }
        end_label(cmd, &self.dev);

        let voxel_pipelines = VoxelPipelines {
            colored: &self.pipelines.voxel_colored,
            shadow: &self.pipelines.voxel_shadow,
        };

        // Shadow pass.
        begin_label(cmd, c"Shadow pass", [156, 85, 35], &self.dev);
        self.shadow.begin(&self.dev, cmd);
        unsafe {
            self.dev.cmd_set_depth_bias(
                cmd,
                config.get_float("Render.depth_bias_constant"),
                0.,
                config.get_float("Render.depth_bias_slope"),
            );
        }
        {
            let shadow_camera = world.cameras.get(world.shadow_camera).unwrap();
            self.drawer.render(
                &self.dev,
                cmd,
                shadow_camera,
                &voxel_pipelines,
                &[self.shadow.scene_data_set],
                &world.views,
                &world.transforms,
                &world.obbs,
            );
        }
        unsafe { self.dev.cmd_end_render_pass(cmd) };
        end_label(cmd, &self.dev);

        // Forward pass.
        let clear_color = [
            config.get_float("Render.bg_fill_color_r"),
            config.get_float("Render.bg_fill_color_g"),
            config.get_float("Render.bg_fill_color_b"),
            1.,
        ];
        begin_label(cmd, c"Forward pass", [255, 0, 0], &self.dev);
        self.forward.begin(&self.dev, cmd, clear_color);
        {
            let main_camera = world.cameras.get(world.main_camera).unwrap();
            self.drawer.render(
                &self.dev,
                cmd,
                main_camera,
                &voxel_pipelines,
                &[self.forward.scene_data_set, self.shadow.shadow_set],
                &world.views,
                &world.transforms,
                &world.obbs,
            );
        }
        self.debug_drawer.render(
            &self.dev,
            cmd,
            &self.pipelines.line,
            &[self.shadow.scene_data_set],
        );
        unsafe { self.dev.cmd_end_render_pass(cmd) };
        end_label(cmd, &self.dev);

        // Depth reduction: the pyramid of this frame's depth feeds the next
        // frame's cull pass.
        begin_label(cmd, c"Depth reduce", [120, 120, 120], &self.dev);
        self.forward
            .pyramid
            .reduce(&self.dev, cmd, &self.pipelines.depth_reduce);
        end_label(cmd, &self.dev);

        // Swapchain blit.
        begin_label(cmd, c"Swapchain blit", [129, 147, 164], &self.dev);
        self.swapchain.begin(&self.dev, cmd, image_index);
        bind_graphics(
            &self.dev,
            cmd,
            &self.pipelines.blit,
            &[self.forward.resulting_image_set],
        );
        unsafe {
            self.dev.cmd_draw(cmd, 4, 1, 0, 0);
            self.dev.cmd_end_render_pass(cmd);
        }
        end_label(cmd, &self.dev);
    }

    fn submit_graphics(&self, cmd: vk::CommandBuffer) {
        let wait_semaphores = [self.sync.image_available[self.flight_index]];
        let command_buffers = [cmd];
        let signal_semaphores = [self.sync.render_finished];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&[vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT])
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);
        unsafe {
            self.dev
                .queue_submit(
                    self.queue,
                    &[submit_info],
                    self.sync.in_flight[self.flight_index],
                )
                .unwrap()
        };
    }

    fn submit_present(&mut self, image_index: usize, window_size: PhysicalSize<u32>) {
        let wait_semaphores = [self.sync.render_finished];
        let swapchains = [self.swapchain.handle];
        let image_indices = [image_index as u32];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);
        let result = unsafe {
            self.dev
                .swapchain_ext
                .queue_present(self.queue, &present_info)
        };
        match result {
            Ok(false) => {}
            Ok(true) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                // Suboptimal or lost swapchain: idle the device and rebuild
                // everything extent-dependent.
                self.recreate_swapchain(window_size);
            }
            Err(err) => panic!("failed to present: {err}"),
        }
    }

    pub fn recreate_swapchain(&mut self, window_size: PhysicalSize<u32>) {
        unsafe { self.dev.device_wait_idle().unwrap() };
        let new_swapchain = swapchain::create_swapchain(
            &self.dev,
            &self.surface_ext,
            self.surface,
            window_size,
            self.blit_render_pass,
            self.swapchain.handle,
        );
        let mut old_swapchain = std::mem::replace(&mut self.swapchain, new_swapchain);
        old_swapchain.destroy(&self.dev);
        self.pools.reset_dynamic(&self.dev);
        self.forward.resize(
            &self.dev,
            &mut self.caches,
            &self.pools,
            &mut self.deletion_queue,
            self.frame_counter,
            self.swapchain.extent.width,
            self.swapchain.extent.height,
        );
    }

    /// Hot reload: recompile changed shader modules and rebuild every
    /// pipeline, retiring old handles through the deletion queue so frames
    /// in flight finish with the pipelines they were recorded with.
    fn check_shader_reloads(&mut self) {
        let changed = self.shader_watcher.poll();
        if changed.is_empty() {
            return;
        }
        let mut any_reloaded = false;
        for path in &changed {
            match self.shaders.reload(&self.dev, path) {
                Ok(()) => {
                    any_reloaded = true;
                    log::info!("shader reloaded, \x1B[1mpath\x1B[0m: {path}");
                }
                // The old module stays in the cache, pipelines keep working.
                Err(err) => error!("{err:#}"),
            }
        }
        if any_reloaded {
            self.rebuild_pipelines();
        }
    }

    fn check_shadow_map_dim(&mut self, config: &Config) {
        let dim = config.get_int("Render.shadow_map_dim") as u32;
        if dim == self.shadow.extent.width || dim == 0 {
            return;
        }
        self.shadow.recreate(
            &self.dev,
            &mut self.caches,
            &self.pools,
            &mut self.deletion_queue,
            self.frame_counter,
            self.forward.uniform_buffer,
            std::mem::size_of::<SceneData>() as u64,
            dim,
        );
        // The shadow pipeline bakes the viewport extent.
        self.rebuild_pipelines();
    }

    fn rebuild_pipelines(&mut self) {
        match lifecycle::create_pipelines(
            &self.dev,
            &mut self.caches,
            &mut self.shaders,
            &self.forward,
            &self.shadow,
            self.blit_render_pass,
        ) {
            Ok(pipelines) => {
                let old = std::mem::replace(&mut self.pipelines, pipelines);
                for pipeline in [
                    old.voxel_colored.pipeline,
                    old.voxel_shadow.pipeline,
                    old.line.pipeline,
                    old.blit.pipeline,
                    old.depth_reduce.pipeline,
                    old.cull_ortho.pipeline,
                    old.cull_persp.pipeline,
                ] {
                    self.deletion_queue
                        .push(DeletedObject::Pipeline(pipeline), self.frame_counter);
                }
            }
            Err(err) => {
                // Old pipelines stay in place.
                warn!("pipeline rebuild failed: {err:#}");
            }
        }
    }

    pub fn wait_idle(&self) {
        unsafe { self.dev.device_wait_idle().unwrap() };
    }
}
