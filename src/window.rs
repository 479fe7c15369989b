use crate::cli::Args;
use log::warn;
use winit::dpi::PhysicalSize;
use winit::event_loop::EventLoop;
use winit::window::{CursorGrabMode, WindowBuilder};

const TITLE: &str = "voxen";

pub struct Window {
    pub event_loop: EventLoop<()>,
    pub window: winit::window::Window,
}

#[allow(deprecated)]
pub fn create_window(args: &Args) -> Window {
    let event_loop = EventLoop::new().unwrap();
    let window = WindowBuilder::new()
        .with_title(TITLE)
        .with_inner_size(PhysicalSize::new(args.width, args.height))
        .with_resizable(args.resizable)
        .with_visible(false)
        .build(&event_loop)
        .unwrap();
    Window { event_loop, window }
}

/// Relative mouse mode: the cursor is confined and hidden while the camera
/// owns it.
pub fn set_relative_mouse(window: &winit::window::Window, enabled: bool) {
    let grab = if enabled {
        window
            .set_cursor_grab(CursorGrabMode::Locked)
            .or_else(|_| window.set_cursor_grab(CursorGrabMode::Confined))
    } else {
        window.set_cursor_grab(CursorGrabMode::None)
    };
    if let Err(error) = grab {
        warn!("cursor grab failed: {error}");
    }
    window.set_cursor_visible(!enabled);
}
