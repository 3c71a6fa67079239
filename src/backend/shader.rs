// Shader module loading
//
// Shaders are compiled to SPIR-V by build.rs and loaded from disk at startup.

use ash::vk;
use std::io::Cursor;
use std::path::Path;

use super::error::{BackendError, BackendResult, VkResultExt};

/// Decode SPIR-V bytes into words, checking size and magic number
pub fn spirv_words(bytes: &[u8]) -> BackendResult<Vec<u32>> {
    if bytes.len() % 4 != 0 {
        return Err(BackendError::Shader(format!(
            "SPIR-V size {} is not a multiple of 4",
            bytes.len()
        )));
    }

    // read_spv also handles byte-swapped modules
    ash::util::read_spv(&mut Cursor::new(bytes))
        .map_err(|e| BackendError::Shader(format!("invalid SPIR-V: {e}")))
}

/// Read a compiled shader from `path`
pub fn load_spirv(path: impl AsRef<Path>) -> BackendResult<Vec<u32>> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .map_err(|e| BackendError::Shader(format!("{}: {e}", path.display())))?;

    log::debug!("Loaded shader {} ({} bytes)", path.display(), bytes.len());
    spirv_words(&bytes)
}

pub fn create_shader_module(device: &ash::Device, code: &[u32]) -> BackendResult<vk::ShaderModule> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    unsafe { device.create_shader_module(&create_info, None) }.or_init_fail("shader module")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: u32 = 0x0723_0203;

    #[test]
    fn truncated_module_is_rejected() {
        let err = spirv_words(&[0x03, 0x02, 0x23, 0x07, 0x00]).unwrap_err();
        assert!(matches!(err, BackendError::Shader(_)));
    }

    #[test]
    fn words_are_decoded_little_endian() {
        let mut bytes = MAGIC.to_le_bytes().to_vec();
        bytes.extend_from_slice(&0x0001_0000u32.to_le_bytes());

        assert_eq!(spirv_words(&bytes).unwrap(), vec![MAGIC, 0x0001_0000]);
    }

    #[test]
    fn missing_file_is_a_shader_error() {
        let err = load_spirv("shaders/does-not-exist.spv").unwrap_err();
        assert!(err.to_string().contains("does-not-exist.spv"));
    }
}
