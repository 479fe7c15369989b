use crate::renderer::deletion_queue::{DeletedObject, DeletionQueue};
use crate::renderer::device::Dev;
use ash::prelude::VkResult;
use ash::vk;
use log::{error, trace, warn};

/// One Vulkan device memory allocation used as a bump region. Buffers and
/// images are sub-bound at an alignment-rounded cursor; the region can be
/// reset (cursor back to zero) but never compacted.
pub struct VideoMemory {
    pub handle: vk::DeviceMemory,
    pub offset: vk::DeviceSize,
    pub size: vk::DeviceSize,
    pub memory_type: u32,
    pub mapped: *mut u8,
}

impl VideoMemory {
    pub fn null() -> VideoMemory {
        VideoMemory {
            handle: vk::DeviceMemory::null(),
            offset: 0,
            size: 0,
            memory_type: 0,
            mapped: std::ptr::null_mut(),
        }
    }

    pub fn allocate(
        dev: &Dev,
        size: vk::DeviceSize,
        flags: vk::MemoryPropertyFlags,
        memory_type_bits: u32,
        label: &str,
    ) -> VkResult<VideoMemory> {
        let mut best_type = None;
        for i in 0..dev.memory_properties.memory_type_count {
            let type_flags = dev.memory_properties.memory_types[i as usize].property_flags;
            if type_flags.contains(flags) && memory_type_bits & (1 << i) != 0 {
                best_type = Some(i);
                break;
            }
        }
        let Some(memory_type) = best_type else {
            error!("no memory type with flags {flags:?} among bits {memory_type_bits:#b}");
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        };
        let allocate_info = vk::MemoryAllocateInfo::default()
            .allocation_size(size)
            .memory_type_index(memory_type);
        let handle = unsafe { dev.allocate_memory(&allocate_info, None) }.inspect_err(|err| {
            error!("failed to allocate {size} bytes for {label} with error {err}")
        })?;
        let host_visible = dev.memory_properties.memory_types[memory_type as usize]
            .property_flags
            .contains(vk::MemoryPropertyFlags::HOST_VISIBLE);
        let mapped = if host_visible {
            unsafe { dev.map_memory(handle, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty()) }?
                as *mut u8
        } else {
            std::ptr::null_mut()
        };
        trace!("allocated {size} bytes of video memory for {label}");
        Ok(VideoMemory {
            handle,
            offset: 0,
            size,
            memory_type,
            mapped,
        })
    }

    /// Cursor back to zero. The underlying allocation stays.
    pub fn reset(&mut self) {
        self.offset = 0;
    }

    pub fn free(&mut self, dev: &Dev) {
        if self.handle != vk::DeviceMemory::null() {
            if !self.mapped.is_null() {
                unsafe { dev.unmap_memory(self.handle) };
            }
            unsafe { dev.free_memory(self.handle, None) };
            self.handle = vk::DeviceMemory::null();
            self.mapped = std::ptr::null_mut();
        }
    }

    fn provide(&mut self, requirements: &vk::MemoryRequirements) -> VkResult<()> {
        if (1 << self.memory_type) & requirements.memory_type_bits == 0 {
            error!(
                "resource cannot live in this region: needs type bits {:#b}, region is type {}",
                requirements.memory_type_bits, self.memory_type
            );
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        self.offset = align_to(self.offset, requirements.alignment);
        if self.offset + requirements.size > self.size {
            error!("out of video memory");
            return Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY);
        }
        Ok(())
    }

    /// Binds the buffer at the cursor and advances it. Returns the host
    /// pointer of the binding when the region is mapped.
    pub fn bind_buffer(
        &mut self,
        dev: &Dev,
        buffer: vk::Buffer,
        requirements: &vk::MemoryRequirements,
    ) -> VkResult<*mut u8> {
        self.provide(requirements)?;
        unsafe { dev.bind_buffer_memory(buffer, self.handle, self.offset) }?;
        let mapped = if self.mapped.is_null() {
            std::ptr::null_mut()
        } else {
            unsafe { self.mapped.add(self.offset as usize) }
        };
        self.offset += requirements.size;
        Ok(mapped)
    }

    pub fn bind_image(
        &mut self,
        dev: &Dev,
        image: vk::Image,
        requirements: &vk::MemoryRequirements,
    ) -> VkResult<()> {
        self.provide(requirements)?;
        unsafe { dev.bind_image_memory(image, self.handle, self.offset) }?;
        self.offset += requirements.size;
        Ok(())
    }

    /// Grows the region through the deletion queue: if the current
    /// allocation is absent or too small, the old handle is retired and a
    /// new region of the requested size allocated. Lets attachments and
    /// buffers grow on resize without stalling.
    pub fn reallocate_if_needed(
        &mut self,
        dev: &Dev,
        deletion_queue: &mut DeletionQueue,
        frame: u64,
        requirements: &vk::MemoryRequirements,
        flags: vk::MemoryPropertyFlags,
        label: &str,
    ) -> VkResult<()> {
        if self.handle != vk::DeviceMemory::null()
            && align_to(self.offset, requirements.alignment) + requirements.size <= self.size
        {
            return Ok(());
        }
        if self.handle != vk::DeviceMemory::null() {
            if !self.mapped.is_null() {
                unsafe { dev.unmap_memory(self.handle) };
            }
            deletion_queue.push(DeletedObject::Memory(self.handle), frame);
        }
        *self = VideoMemory::allocate(dev, requirements.size, flags, requirements.memory_type_bits, label)?;
        Ok(())
    }
}

pub fn align_to(offset: vk::DeviceSize, alignment: vk::DeviceSize) -> vk::DeviceSize {
    (offset + alignment - 1) & !(alignment - 1)
}

/// Combined requirements for binding several resources back to back into
/// one region.
pub fn merge_requirements(requirements: &[vk::MemoryRequirements]) -> vk::MemoryRequirements {
    let mut merged = requirements[0];
    for further in &requirements[1..] {
        merged.size = align_to(merged.size, further.alignment) + further.size;
        merged.memory_type_bits &= further.memory_type_bits;
        merged.alignment = merged.alignment.max(further.alignment);
    }
    merged
}

pub fn create_buffer(
    dev: &Dev,
    size: vk::DeviceSize,
    usage: vk::BufferUsageFlags,
    label: &str,
) -> VkResult<vk::Buffer> {
    let buffer_info = vk::BufferCreateInfo::default()
        .size(size)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE);
    let buffer = unsafe { dev.create_buffer(&buffer_info, None) }
        .inspect_err(|err| warn!("failed to create buffer {label} with error {err}"))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_to(0, 256), 0);
        assert_eq!(align_to(1, 256), 256);
        assert_eq!(align_to(256, 256), 256);
        assert_eq!(align_to(257, 64), 320);
    }

    #[test]
    fn merged_requirements_stack_resources() {
        let merged = merge_requirements(&[
            vk::MemoryRequirements {
                size: 100,
                alignment: 64,
                memory_type_bits: 0b0111,
            },
            vk::MemoryRequirements {
                size: 200,
                alignment: 256,
                memory_type_bits: 0b0110,
            },
        ]);
        assert_eq!(merged.size, 256 + 200);
        assert_eq!(merged.memory_type_bits, 0b0110);
        assert_eq!(merged.alignment, 256);
    }
}
