// Build script to compile the scene shaders from GLSL to SPIR-V
//
// The renderer loads the .spv files at runtime (paths come from config.toml),
// so a missing glslc only produces a warning here.

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/scene.vert");
    println!("cargo:rerun-if-changed=shaders/scene.frag");

    // Compile shaders using glslc (part of Vulkan SDK)
    compile_shader("shaders/scene.vert", "shaders/scene.vert.spv");
    compile_shader("shaders/scene.frag", "shaders/scene.frag.spv");
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            panic!("Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}), {} was not compiled", e, input);
            println!("cargo:warning=compile it manually: glslc {} -o {}", input, output);
        }
    }
}
