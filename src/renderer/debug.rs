use crate::renderer::device::Dev;
use ash::{vk, Entry, Instance};
use std::ffi::CStr;

pub fn create_debug_messenger(
    entry: &Entry,
    instance: &Instance,
) -> (
    ash::ext::debug_utils::Instance,
    vk::DebugUtilsMessengerEXT,
) {
    let debug_ext = ash::ext::debug_utils::Instance::new(entry, instance);
    // General and verbose levels produce too much noise related to physical
    // device selection.
    let severity_filter = vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
        | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING;
    let type_filter = vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE;
    let info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(severity_filter)
        .message_type(type_filter)
        .pfn_user_callback(Some(callback));
    let messenger = unsafe { debug_ext.create_debug_utils_messenger(&info, None) }.unwrap();
    (debug_ext, messenger)
}

unsafe extern "system" fn callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut std::os::raw::c_void,
) -> vk::Bool32 {
    let callback_data = *p_callback_data;
    assert!(!callback_data.p_message.is_null());
    let message = CStr::from_ptr(callback_data.p_message).to_string_lossy();
    let level = if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if message_severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else {
        log::Level::Trace
    };
    log::log!(level, "vulkan debug event: {message}");
    vk::FALSE
}

pub fn begin_label(buf: vk::CommandBuffer, name: &CStr, color: [u8; 3], dev: &Dev) {
    if let Some(debug_ext) = &dev.debug_utils_ext {
        let label = vk::DebugUtilsLabelEXT::default().label_name(name).color([
            color[0] as f32 / 255.,
            color[1] as f32 / 255.,
            color[2] as f32 / 255.,
            1.,
        ]);
        unsafe { debug_ext.cmd_begin_debug_utils_label(buf, &label) };
    }
}

pub fn end_label(buf: vk::CommandBuffer, dev: &Dev) {
    if let Some(debug_ext) = &dev.debug_utils_ext {
        unsafe { debug_ext.cmd_end_debug_utils_label(buf) };
    }
}
