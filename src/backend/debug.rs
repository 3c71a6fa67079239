// Validation layer messenger
//
// The driver calls back through a raw function pointer. We register a boxed
// handler object as user data and the trampoline forwards every message to it.
// Validation is observational: the trampoline never asks to abort the call.

use ash::{vk, Entry};
use std::ffi::{c_void, CStr};

use super::error::{BackendResult, VkResultExt};

/// Receives validation messages from the driver
pub trait ValidationHandler: Send + Sync {
    fn handle(
        &self,
        severity: vk::DebugUtilsMessageSeverityFlagsEXT,
        kind: vk::DebugUtilsMessageTypeFlagsEXT,
        message: &str,
    );
}

/// Default handler: forwards to the `log` facade
pub struct LogValidationHandler;

impl ValidationHandler for LogValidationHandler {
    fn handle(
        &self,
        severity: vk::DebugUtilsMessageSeverityFlagsEXT,
        kind: vk::DebugUtilsMessageTypeFlagsEXT,
        message: &str,
    ) {
        log::log!(target: "vulkan", level_for(severity), "[{:?}] {}", kind, message);
    }
}

/// Map a message severity onto a log level
pub fn level_for(severity: vk::DebugUtilsMessageSeverityFlagsEXT) -> log::Level {
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        log::Level::Error
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        log::Level::Warn
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        log::Level::Info
    } else {
        log::Level::Trace
    }
}

/// Fill in messenger create info pointing at `handler`.
///
/// The returned struct borrows `handler` through a raw pointer; the handler
/// must outlive every messenger created from it.
pub fn messenger_create_info(
    handler: &Box<dyn ValidationHandler>,
) -> vk::DebugUtilsMessengerCreateInfoEXT {
    vk::DebugUtilsMessengerCreateInfoEXT::builder()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback))
        .user_data(handler as *const Box<dyn ValidationHandler> as *mut c_void)
        .build()
}

/// Installed messenger plus the handler it points at
pub struct DebugMessenger {
    loader: ash::extensions::ext::DebugUtils,
    messenger: vk::DebugUtilsMessengerEXT,
    // Boxed twice so the user-data pointer stays stable when `Self` moves
    _handler: Box<Box<dyn ValidationHandler>>,
}

impl DebugMessenger {
    pub fn new(
        entry: &Entry,
        instance: &ash::Instance,
        handler: Box<Box<dyn ValidationHandler>>,
    ) -> BackendResult<Self> {
        let loader = ash::extensions::ext::DebugUtils::new(entry, instance);
        let create_info = messenger_create_info(&handler);

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .or_init_fail("debug messenger")?;

        log::info!("Validation messenger installed");
        Ok(Self {
            loader,
            messenger,
            _handler: handler,
        })
    }

    /// Must run before the instance is destroyed
    pub fn destroy(&mut self) {
        unsafe {
            self.loader
                .destroy_debug_utils_messenger(self.messenger, None);
        }
        self.messenger = vk::DebugUtilsMessengerEXT::null();
    }
}

unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    p_user_data: *mut c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || p_user_data.is_null() {
        return vk::FALSE;
    }

    let data = &*p_callback_data;
    let message = if data.p_message.is_null() {
        std::borrow::Cow::Borrowed("<no message>")
    } else {
        CStr::from_ptr(data.p_message).to_string_lossy()
    };

    let handler = &*(p_user_data as *const Box<dyn ValidationHandler>);
    handler.handle(message_severity, message_type, &message);

    vk::FALSE
}
