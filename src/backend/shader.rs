// Shader module loading
//
// Vulkan uses SPIR-V bytecode for shaders. The compiled .spv files are read
// at engine construction; modules only live until the pipelines are built.

use anyhow::{Context, Result};
use ash::vk;
use std::fs::File;
use std::path::Path;

use crate::error::VkResultExt;

/// Shader module destroyed when dropped
pub struct ShaderModule<'a> {
    pub module: vk::ShaderModule,
    device: &'a ash::Device,
}

impl<'a> ShaderModule<'a> {
    /// Create a module from SPIR-V words
    pub fn from_words(device: &'a ash::Device, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);

        let module = unsafe { device.create_shader_module(&create_info, None) }
            .creating("shader module")?;

        Ok(Self { module, device })
    }

    /// Load a compiled .spv file
    pub fn load(device: &'a ash::Device, path: &Path) -> Result<Self> {
        let mut file = File::open(path)
            .with_context(|| format!("Failed to open shader {:?}", path))?;

        // read_spv checks the magic number and handles alignment
        let code = ash::util::read_spv(&mut file)
            .with_context(|| format!("Invalid SPIR-V in {:?}", path))?;

        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Self::from_words(device, &code)
    }
}

impl Drop for ShaderModule<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_shader_module(self.module, None) };
    }
}
