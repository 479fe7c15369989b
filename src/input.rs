use crate::camera::{
    CAMERA_PRESSED_BACK, CAMERA_PRESSED_DOWN, CAMERA_PRESSED_FORWARD, CAMERA_PRESSED_LEFT,
    CAMERA_PRESSED_RIGHT, CAMERA_PRESSED_UP,
};
use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// An entry in the keymap stack. Events go to the topmost keymap only, so a
/// console or menu pushed on top swallows camera input until popped.
pub trait Keymap {
    fn key(&mut self, code: KeyCode, pressed: bool, state: &mut InputState);
    fn mouse(&mut self, xrel: f32, yrel: f32, state: &mut InputState);
}

/// Accumulated input for one frame: currently held camera movement flags
/// and mouse motion since the last reset.
pub struct InputState {
    pub movement_flags: u32,
    pub mouse_dx: f32,
    pub mouse_dy: f32,
    pub camera_lock: bool,
    pub quit_requested: bool,
}

impl InputState {
    pub fn new() -> InputState {
        InputState {
            movement_flags: 0,
            mouse_dx: 0.,
            mouse_dy: 0.,
            camera_lock: true,
            quit_requested: false,
        }
    }

    pub fn reset_after_frame(&mut self) {
        self.mouse_dx = 0.;
        self.mouse_dy = 0.;
    }
}

pub struct Keymaps {
    stack: Vec<Box<dyn Keymap>>,
}

impl Keymaps {
    pub fn new() -> Keymaps {
        Keymaps {
            stack: vec![Box::new(CameraKeymap)],
        }
    }

    pub fn push(&mut self, keymap: Box<dyn Keymap>) {
        self.stack.push(keymap);
    }

    pub fn pop(&mut self) {
        if self.stack.len() > 1 {
            self.stack.pop();
        }
    }

    pub fn apply_keyboard(&mut self, event: &KeyEvent, state: &mut InputState) {
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        let pressed = event.state == ElementState::Pressed;
        if let Some(top) = self.stack.last_mut() {
            top.key(code, pressed, state);
        }
    }

    pub fn apply_mouse(&mut self, delta: (f64, f64), state: &mut InputState) {
        if let Some(top) = self.stack.last_mut() {
            top.mouse(delta.0 as f32, delta.1 as f32, state);
        }
    }
}

/// Bottom-of-stack keymap: WASD + space/shift fly camera, escape toggles
/// the cursor grab.
struct CameraKeymap;

impl Keymap for CameraKeymap {
    fn key(&mut self, code: KeyCode, pressed: bool, state: &mut InputState) {
        let flag = match code {
            KeyCode::KeyW => CAMERA_PRESSED_FORWARD,
            KeyCode::KeyS => CAMERA_PRESSED_BACK,
            KeyCode::KeyA => CAMERA_PRESSED_LEFT,
            KeyCode::KeyD => CAMERA_PRESSED_RIGHT,
            KeyCode::Space => CAMERA_PRESSED_UP,
            KeyCode::ShiftLeft => CAMERA_PRESSED_DOWN,
            KeyCode::Escape => {
                if pressed {
                    state.camera_lock = !state.camera_lock;
                }
                return;
            }
            KeyCode::KeyQ => {
                if pressed {
                    state.quit_requested = true;
                }
                return;
            }
            _ => return,
        };
        if pressed {
            state.movement_flags |= flag;
        } else {
            state.movement_flags &= !flag;
        }
    }

    fn mouse(&mut self, xrel: f32, yrel: f32, state: &mut InputState) {
        if state.camera_lock {
            state.mouse_dx += xrel;
            state.mouse_dy += yrel;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn movement_flags_follow_key_state() {
        let mut state = InputState::new();
        let mut top = CameraKeymap;
        top.key(KeyCode::KeyW, true, &mut state);
        assert_eq!(state.movement_flags, CAMERA_PRESSED_FORWARD);
        top.key(KeyCode::KeyW, false, &mut state);
        assert_eq!(state.movement_flags, 0);
    }

    #[test]
    fn mouse_motion_accumulates_until_reset() {
        let mut state = InputState::new();
        let mut top = CameraKeymap;
        top.mouse(2., 3., &mut state);
        top.mouse(1., -1., &mut state);
        assert_eq!((state.mouse_dx, state.mouse_dy), (3., 2.));
        state.reset_after_frame();
        assert_eq!((state.mouse_dx, state.mouse_dy), (0., 0.));
    }

    #[test]
    fn escape_toggles_camera_lock() {
        let mut state = InputState::new();
        let mut top = CameraKeymap;
        assert!(state.camera_lock);
        top.key(KeyCode::Escape, true, &mut state);
        assert!(!state.camera_lock);
        top.mouse(5., 5., &mut state);
        assert_eq!(state.mouse_dx, 0.);
    }
}
