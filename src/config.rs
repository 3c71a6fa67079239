// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Settings come from config.toml, then command-line flags override them.
// Missing files and missing keys fall back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Frame Engine".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    /// "mailbox", "fifo", "fifo_relaxed", "immediate" or "auto"
    pub present_mode: String,
    pub clear_color: [f32; 4],
    /// Frames the CPU may run ahead of the GPU
    pub concurrent_frames: usize,
    /// 0 means unlimited
    pub target_fps: f32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "auto".to_string(),
            clear_color: [0.1, 0.2, 0.3, 1.0],
            concurrent_frames: 2,
            target_fps: 0.0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
    /// Present one frame, then wait for a step request (Space)
    pub single_frame: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "frame_engine.log".to_string(),
            show_fps: true,
            single_frame: false,
        }
    }
}

/// Command-line overrides
#[derive(clap::Parser, Debug, Default)]
#[command(version, about)]
pub struct CliArgs {
    /// Configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,
    /// Force validation layers on
    #[arg(long, conflicts_with = "no_validation")]
    pub validation: bool,
    /// Force validation layers off
    #[arg(long)]
    pub no_validation: bool,
    /// Concurrent frames in flight
    #[arg(short, long)]
    pub frames: Option<usize>,
    /// Target frame rate, 0 for unlimited
    #[arg(long)]
    pub fps: Option<f32>,
    /// Start in single-frame debug mode
    #[arg(long)]
    pub single_frame: bool,
}

impl Config {
    /// Load configuration from `path`. A missing file gives the defaults,
    /// an unreadable or malformed one is an error.
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

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_overrides(&mut self, args: &CliArgs) {
        if args.validation {
            self.debug.validation_layers = true;
        }
        if args.no_validation {
            self.debug.validation_layers = false;
        }
        if let Some(frames) = args.frames {
            self.graphics.concurrent_frames = frames;
        }
        if let Some(fps) = args.fps {
            self.graphics.target_fps = fps;
        }
        if args.single_frame {
            self.debug.single_frame = true;
        }
    }

    /// Reject settings the frame loop cannot run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.graphics.concurrent_frames >= 1,
            "graphics.concurrent_frames must be at least 1 (got {})",
            self.graphics.concurrent_frames
        );
        anyhow::ensure!(
            self.graphics.target_fps.is_finite() && self.graphics.target_fps >= 0.0,
            "graphics.target_fps must be a non-negative number (got {})",
            self.graphics.target_fps
        );
        Ok(())
    }

    /// Preferred present mode, or `None` to let the swapchain pick
    pub fn present_mode(&self) -> Option<vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => Some(vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(vk::PresentModeKHR::FIFO_RELAXED),
            "auto" | "" => None,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', choosing automatically",
                    self.graphics.present_mode
                );
                None
            }
        }
    }
}
