#![allow(clippy::collapsible_match)]
#![allow(clippy::single_match)]
#![allow(clippy::too_many_arguments)]

use crate::cli::Args;
use crate::config::Config;
use crate::console::{Console, ConsoleContext};
use crate::input::{InputState, Keymaps};
use crate::logger::{initialize_logger, initialize_panic_hook};
use crate::renderer::Renderer;
use crate::window::{create_window, set_relative_mouse};
use crate::world::World;
use log::debug;
use std::time::Instant;
use winit::event::{DeviceEvent, Event, StartCause, WindowEvent};
use winit::event_loop::ControlFlow;

pub mod assets;
pub mod camera;
pub mod cli;
pub mod config;
pub mod console;
pub mod debug_draw;
pub mod ecs;
pub mod input;
pub mod logger;
pub mod math;
pub mod renderer;
pub mod scene;
pub mod voxel;
pub mod window;
pub mod world;

pub fn main() {
    initialize_logger();
    initialize_panic_hook();
    let args = Args::parse();
    let config = Config::load("voxen.ini");
    let window = create_window(&args);
    let mut world = World::new();
    world.populate_demo();
    let mut renderer = Renderer::new(&window, &args, &config);
    let console = Console::new();
    let mut config = config;

    let mut keymaps = Keymaps::new();
    let mut input_state = InputState::new();
    let mut last_update = Instant::now();
    let mut old_size = window.window.inner_size();
    let mut cursor_grabbed = false;

    // Winit delivers batches of events and then AboutToWait; rendering
    // every AboutToWait is the right cadence for a game loop.
    #[allow(deprecated)]
    let loop_result = window.event_loop.run(|event, target| {
        match event {
            Event::NewEvents(StartCause::Init) => {
                target.set_control_flow(ControlFlow::Poll);
            }
            Event::WindowEvent { event, .. } => match event {
                WindowEvent::KeyboardInput { event, .. } => {
                    keymaps.apply_keyboard(&event, &mut input_state);
                }
                WindowEvent::Resized(new_size) => {
                    // Some compositors send a resize event on startup even
                    // when the size did not change.
                    if new_size != old_size {
                        debug!(
                            "window resized from {}x{} to {}x{}",
                            old_size.width, old_size.height, new_size.width, new_size.height
                        );
                        renderer.recreate_swapchain(new_size);
                        old_size = new_size;
                    }
                }
                WindowEvent::CloseRequested => {
                    target.exit();
                }
                _ => (),
            },
            Event::DeviceEvent { event, .. } => match event {
                DeviceEvent::MouseMotion { delta } => {
                    keymaps.apply_mouse(delta, &mut input_state);
                }
                _ => (),
            },
            Event::AboutToWait => {
                let now = Instant::now();
                let delta_time = (now - last_update).as_secs_f32();
                last_update = now;

                if input_state.camera_lock != cursor_grabbed {
                    set_relative_mouse(&window.window, input_state.camera_lock);
                    cursor_grabbed = input_state.camera_lock;
                }
                if input_state.quit_requested {
                    target.exit();
                    return;
                }

                let window_size = window.window.inner_size();
                world.update(
                    delta_time,
                    &input_state,
                    &config,
                    window_size.width,
                    window_size.height,
                );
                input_state.reset_after_frame();

                renderer.draw_frame(&mut world, &config, window_size);

                if renderer.frame_counter == renderer::FRAMES_IN_FLIGHT as u64 {
                    window.window.set_visible(true);
                }

                // Console input arrives through the platform layer; drain
                // whatever arrived since the last frame.
                for line in drain_console_input() {
                    let mut ctx = ConsoleContext {
                        config: &mut config,
                        world: &mut world,
                        fps: renderer.fps,
                    };
                    match console.execute(&line, &mut ctx) {
                        Ok(output) if !output.is_empty() => log::info!("{output}"),
                        Ok(_) => {}
                        Err(err) => log::warn!("{err:#}"),
                    }
                }
            }
            Event::LoopExiting => (),
            _ => (),
        }
    });
    renderer.wait_idle();
    renderer.destroy();
    loop_result.unwrap();
}

/// Console lines queued by the platform layer. The engine owns only the
/// command protocol; without a front-end attached there is nothing to
/// drain.
fn drain_console_input() -> Vec<String> {
    Vec::new()
}
