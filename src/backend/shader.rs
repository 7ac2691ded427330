// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. Modules are read from disk at
// startup and again on hot reload, so edits only need a recompile.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use super::{Owned, VulkanDevice};

/// Read a SPIR-V file and create a shader module from it
pub fn load_shader_module(
    device: &Arc<VulkanDevice>,
    path: &Path,
) -> Result<Owned<vk::ShaderModule>> {
    let code = read_spirv(path)?;
    create_shader_module(device, &code)
        .with_context(|| format!("Failed to create shader module from {:?}", path))
}

/// SPIR-V words from a file
pub fn read_spirv(path: &Path) -> Result<Vec<u32>> {
    let mut file = File::open(path).with_context(|| format!("Shader file not found: {:?}", path))?;

    // read_spv checks the magic number and handles alignment
    ash::util::read_spv(&mut file).with_context(|| format!("Invalid SPIR-V in {:?}", path))
}

pub fn create_shader_module(
    device: &Arc<VulkanDevice>,
    code: &[u32],
) -> Result<Owned<vk::ShaderModule>> {
    let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

    let module = unsafe { device.device.create_shader_module(&create_info, None) }
        .context("Failed to create shader module")?;
    Ok(Owned::new(device, module))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    #[test]
    fn missing_file_names_path() {
        let err = read_spirv(Path::new("shaders/does_not_exist.spv")).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("Shader file not found"));
        assert!(message.contains("does_not_exist.spv"));
    }

    #[test]
    fn reads_words_from_file() {
        let path = std::env::temp_dir().join(format!("vk-model-viewer-{}.spv", std::process::id()));
        {
            let mut file = File::create(&path).unwrap();
            for word in [SPIRV_MAGIC, 0x0001_0300, 0, 1, 0] {
                file.write_all(&word.to_le_bytes()).unwrap();
            }
        }

        let words = read_spirv(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let path =
            std::env::temp_dir().join(format!("vk-model-viewer-bad-{}.spv", std::process::id()));
        std::fs::write(&path, [0x03, 0x02, 0x23]).unwrap();

        let result = read_spirv(&path);
        std::fs::remove_file(&path).unwrap();

        assert!(result.is_err());
    }
}
