// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.
// Output resolution and capture rate are read once per engine and never
// change afterwards.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub device: DeviceConfig,
    pub output: OutputConfig,
    pub capture: CaptureConfig,
    pub camera: CameraConfig,
    pub shaders: ShaderConfig,
    pub session: SessionConfig,
    pub demo: DemoConfig,
}

/// Instance and device settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub app_name: String,
    pub validation_layers: bool,
    /// Use a separate transfer queue family for uploads when the GPU has one
    pub use_transfer_queue: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            app_name: "offscreen-stream".to_string(),
            validation_layers: true,
            use_transfer_queue: true,
        }
    }
}

/// Render target size
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
        }
    }
}

/// When a rendered frame is copied back to the host
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CapturePolicy {
    /// Every frame once the refresh delay has elapsed
    Throttled,
    /// Like `Throttled`, but only when the transform changed since the last capture
    OnChange,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub fps: f32,
    pub policy: CapturePolicy,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            fps: 60.0,
            policy: CapturePolicy::Throttled,
        }
    }
}

impl CaptureConfig {
    /// Minimum wall-clock time between two captures
    pub fn refresh_delay(&self) -> Duration {
        delay_for_fps(self.fps).unwrap_or(Duration::MAX)
    }
}

/// Frame period for a rate, `None` when it does not fit a `Duration`
pub(crate) fn delay_for_fps(fps: f32) -> Option<Duration> {
    Duration::try_from_secs_f32(1.0 / fps).ok()
}

/// Fixed view and projection
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub eye: [f32; 3],
    pub center: [f32; 3],
    pub up: [f32; 3],
    pub fov_y_degrees: f32,
    pub near: f32,
    pub far: f32,
    /// Automatic model rotation around Z. Zero keeps captures deterministic.
    pub spin_degrees_per_second: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            eye: [2.0, 2.0, 2.0],
            center: [0.0, 0.0, 0.0],
            up: [0.0, 0.0, 1.0],
            fov_y_degrees: 45.0,
            near: 0.1,
            far: 256.0,
            spin_degrees_per_second: 0.0,
        }
    }
}

/// Compiled SPIR-V shader locations
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShaderConfig {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

impl Default for ShaderConfig {
    fn default() -> Self {
        let dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("shaders");
        Self {
            vertex: dir.join("scene.vert.spv"),
            fragment: dir.join("scene.frag.spv"),
        }
    }
}

/// Per-client render threads
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Give every session its own logical device instead of sharing one
    pub multi_instance: bool,
    /// Sleep between frames that produced no capture
    pub idle_backoff_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            multi_instance: true,
            idle_backoff_ms: 1,
        }
    }
}

impl SessionConfig {
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }
}

/// Settings for the standalone binary
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub duration_seconds: f32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self { duration_seconds: 5.0 }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the renderer cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.output.width == 0 || self.output.height == 0 {
            anyhow::bail!(
                "output resolution must be non-zero, got {}x{}",
                self.output.width,
                self.output.height
            );
        }
        if !(self.capture.fps.is_finite() && self.capture.fps > 0.0) {
            anyhow::bail!("capture fps must be positive, got {}", self.capture.fps);
        }
        if delay_for_fps(self.capture.fps).is_none() {
            anyhow::bail!(
                "capture fps {} gives an out-of-range refresh delay",
                self.capture.fps
            );
        }
        if !(self.camera.near > 0.0 && self.camera.far > self.camera.near) {
            anyhow::bail!(
                "camera clip range is invalid: near {} far {}",
                self.camera.near,
                self.camera.far
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.output.width, 800);
        assert_eq!(config.output.height, 600);
        assert_eq!(config.capture.policy, CapturePolicy::Throttled);
        assert!(config.session.multi_instance);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [output]
            width = 320

            [capture]
            fps = 30.0
            policy = "on_change"
            "#,
        )
        .unwrap();
        assert_eq!(config.output.width, 320);
        assert_eq!(config.output.height, 600);
        assert_eq!(config.capture.policy, CapturePolicy::OnChange);
        assert_eq!(config.camera.eye, [2.0, 2.0, 2.0]);
    }

    #[test]
    fn refresh_delay_is_reciprocal_of_fps() {
        let capture = CaptureConfig { fps: 60.0, policy: CapturePolicy::Throttled };
        let delay = capture.refresh_delay();
        assert!(delay > Duration::from_micros(16_600));
        assert!(delay < Duration::from_micros(16_700));
    }

    #[test]
    fn zero_resolution_is_rejected() {
        assert!(Config::parse("[output]\nheight = 0").is_err());
    }

    #[test]
    fn non_positive_fps_is_rejected() {
        assert!(Config::parse("[capture]\nfps = 0.0").is_err());
        assert!(Config::parse("[capture]\nfps = -5.0").is_err());
    }

    #[test]
    fn vanishing_fps_is_rejected() {
        let err = Config::parse("[capture]\nfps = 1e-20").err().unwrap();
        assert!(format!("{:#}", err).contains("out-of-range"));
    }

    #[test]
    fn refresh_delay_saturates_for_unvalidated_fps() {
        let capture = CaptureConfig { fps: 1e-20, policy: CapturePolicy::Throttled };
        assert_eq!(capture.refresh_delay(), Duration::MAX);
    }

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let config = Config::load_from_path("does/not/exist/config.toml").unwrap();
        assert_eq!(config.capture.fps, Config::default().capture.fps);
        assert_eq!(config.output.width, Config::default().output.width);
    }

    #[test]
    fn unknown_policy_fails_to_parse() {
        assert!(Config::parse("[capture]\npolicy = \"sometimes\"").is_err());
    }
}
