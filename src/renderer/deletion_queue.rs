use crate::renderer::device::Dev;
use ash::vk;
use log::warn;

/// GPU handles retired through here stay alive until both in-flight frames
/// have moved past the frame that submitted them, then get destroyed. The
/// ring is bounded; overflow logs and leaks the object for the lifetime of
/// the process.
pub struct DeletionQueue {
    entries: Vec<(DeletedObject, u64)>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DeletedObject {
    Buffer(vk::Buffer),
    Image(vk::Image),
    ImageView(vk::ImageView),
    Framebuffer(vk::Framebuffer),
    Pipeline(vk::Pipeline),
    Memory(vk::DeviceMemory),
}

const CAPACITY: usize = 32;

/// Both frames in flight must retire before a handle dies.
const FRAME_LAG: u64 = 2;

impl DeletionQueue {
    pub fn new() -> DeletionQueue {
        DeletionQueue {
            entries: Vec::with_capacity(CAPACITY),
        }
    }

    pub fn push(&mut self, object: DeletedObject, frame: u64) {
        if self.entries.len() == CAPACITY {
            warn!("deletion queue is out of space, leaking {object:?}");
            return;
        }
        self.entries.push((object, frame));
    }

    /// Entries whose submit frame is at least two frames old. Factored out
    /// of `update` so the retirement policy is testable without a device.
    fn take_ready(&mut self, current_frame: u64) -> Vec<DeletedObject> {
        let mut ready = Vec::new();
        self.entries.retain(|(object, frame)| {
            if frame + FRAME_LAG <= current_frame {
                ready.push(*object);
                false
            } else {
                true
            }
        });
        ready
    }

    /// Called once per frame.
    pub fn update(&mut self, current_frame: u64, dev: &Dev) {
        for object in self.take_ready(current_frame) {
            destroy(object, dev);
        }
    }

    /// Destroys everything immediately. Only valid after the device has
    /// gone idle.
    pub fn drain(&mut self, dev: &Dev) {
        for (object, _) in std::mem::take(&mut self.entries) {
            destroy(object, dev);
        }
    }
}

fn destroy(object: DeletedObject, dev: &Dev) {
    unsafe {
        match object {
            DeletedObject::Buffer(buffer) => dev.destroy_buffer(buffer, None),
            DeletedObject::Image(image) => dev.destroy_image(image, None),
            DeletedObject::ImageView(view) => dev.destroy_image_view(view, None),
            DeletedObject::Framebuffer(framebuffer) => dev.destroy_framebuffer(framebuffer, None),
            DeletedObject::Pipeline(pipeline) => dev.destroy_pipeline(pipeline, None),
            DeletedObject::Memory(memory) => dev.free_memory(memory, None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_ready_before_two_frames_pass() {
        let mut queue = DeletionQueue::new();
        queue.push(DeletedObject::Buffer(vk::Buffer::null()), 10);
        assert!(queue.take_ready(10).is_empty());
        assert!(queue.take_ready(11).is_empty());
        assert_eq!(queue.take_ready(12).len(), 1);
        assert!(queue.take_ready(100).is_empty());
    }

    #[test]
    fn retirement_is_per_entry() {
        let mut queue = DeletionQueue::new();
        queue.push(DeletedObject::Buffer(vk::Buffer::null()), 1);
        queue.push(DeletedObject::Pipeline(vk::Pipeline::null()), 5);
        let ready = queue.take_ready(3);
        assert_eq!(ready, vec![DeletedObject::Buffer(vk::Buffer::null())]);
        let ready = queue.take_ready(7);
        assert_eq!(ready, vec![DeletedObject::Pipeline(vk::Pipeline::null())]);
    }

    #[test]
    fn overflow_drops_the_enqueue() {
        let mut queue = DeletionQueue::new();
        for _ in 0..40 {
            queue.push(DeletedObject::Buffer(vk::Buffer::null()), 0);
        }
        assert_eq!(queue.take_ready(2).len(), 32);
    }
}
