// =============================================================================
// FRAME ENGINE - Vulkan frame lifecycle and resource binding
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  App (winit window, input, frame pacing)                        │
// │    └── FrameScheduler (loop state: counter, recreation, pause)  │
// │          └── VulkanRenderer (implements FrameLoop)              │
// │                ├── DeviceContext + DeviceAllocator              │
// │                ├── SwapchainManager                             │
// │                └── Frames (sync, command buffer, descriptors)   │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Wait for the fence of slot `frame_counter mod N`
// 2. Acquire swapchain image (recreate and retry if out of date)
// 3. Re-record the slot's command buffer
// 4. Submit, present
// 5. Advance the frame counter
//
// =============================================================================

mod backend;
mod config;
mod renderer;
mod scene;
mod scheduler;

use anyhow::{Context, Result};
use clap::Parser;
use config::{CliArgs, Config};
use renderer::VulkanRenderer;
use scheduler::{FrameScheduler, Iteration};
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, Instant};
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Logging is configured from this file, so a bad one is reported on stderr
    let mut config = Config::load_from_path(&args.config)?;
    config.apply_overrides(&args);

    init_logging(&config)?;
    config.validate().context("Invalid configuration")?;

    log::info!("Starting frame engine");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!(
        "Frames in flight: {}, target fps: {}",
        config.graphics.concurrent_frames,
        if config.graphics.target_fps > 0.0 {
            format!("{}", config.graphics.target_fps)
        } else {
            "unlimited".to_string()
        }
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    app.result
}

/// Initialize logging, optionally into a file
fn init_logging(config: &Config) -> Result<()> {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    if config.debug.log_to_file {
        let file = File::create(&config.debug.log_file)
            .with_context(|| format!("Failed to create log file {}", config.debug.log_file))?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.init();
    Ok(())
}

/// Time between frames for a target rate; `None` means unlimited
fn frame_interval(target_fps: f32) -> Option<Duration> {
    (target_fps > 0.0).then(|| Duration::from_secs_f32(1.0 / target_fps))
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

struct App {
    config: Config,

    window: Option<Arc<Window>>,
    renderer: Option<VulkanRenderer>,
    scheduler: FrameScheduler,

    is_fullscreen: bool,
    frame_interval: Option<Duration>,
    next_frame_at: Instant,
    last_title_update: Instant,

    /// First fatal error, returned from `main` after the loop exits
    result: Result<()>,
}

impl App {
    fn new(config: Config) -> Self {
        let scheduler =
            FrameScheduler::new(config.graphics.concurrent_frames, config.debug.single_frame);
        Self {
            is_fullscreen: config.window.fullscreen,
            frame_interval: frame_interval(config.graphics.target_fps),
            next_frame_at: Instant::now(),
            last_title_update: Instant::now(),
            config,
            window: None,
            renderer: None,
            scheduler,
            result: Ok(()),
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, err: anyhow::Error) {
        log::error!("{:#}", err);
        if self.result.is_ok() {
            self.result = Err(err);
        }
        event_loop.exit();
    }

    // =========================================================================
    // RENDERING
    // =========================================================================

    fn render_frame(&mut self, event_loop: &ActiveEventLoop) {
        let Some(renderer) = self.renderer.as_mut() else {
            return;
        };

        match self.scheduler.run_iteration(renderer) {
            Ok(Iteration::Presented) => self.update_title(),
            Ok(Iteration::Skipped | Iteration::Restarted) => {}
            Err(err) if err.is_recoverable() => {
                log::debug!("Recoverable frame error: {}", err);
                self.scheduler.request_recreation();
            }
            Err(err) => {
                if let Some(code) = err.code() {
                    log::error!("Native result code: {}", code);
                }
                let err = anyhow::Error::new(err).context("Frame failed");
                self.fail(event_loop, err);
            }
        }
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            self.scheduler.request_recreation();
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_title(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(ref window) = self.window else {
            return;
        };

        // Once per second, or every frame when stepping
        let now = Instant::now();
        if !self.scheduler.is_single_frame()
            && now.duration_since(self.last_title_update) < Duration::from_secs(1)
        {
            return;
        }
        self.last_title_update = now;

        let stats = self.scheduler.stats();
        let mut title = format!(
            "{} - {:.0} FPS | frame {} | {}s",
            self.config.window.title,
            stats.fps(),
            self.scheduler.frame_counter(),
            stats.running_for(now).as_secs()
        );
        if self.scheduler.is_paused() {
            title.push_str(" [paused]");
        }
        if self.scheduler.is_single_frame() {
            title.push_str(" [single frame: Space to step]");
        }
        window.set_title(&title);
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    /// Called when the application is ready to create windows.
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        match VulkanRenderer::new(window.clone(), &self.config) {
            Ok(renderer) => self.renderer = Some(renderer),
            Err(e) => {
                self.fail(event_loop, e.context("Failed to initialize Vulkan"));
                return;
            }
        }

        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                // Only the first resize of a drag is worth a log line
                if !self.scheduler.needs_recreation() {
                    log::debug!("Window resized to {}x{}", size.width, size.height);
                }
                self.scheduler.request_recreation();
            }

            WindowEvent::RedrawRequested => self.render_frame(event_loop),

            WindowEvent::KeyboardInput { event, .. } if event.state.is_pressed() && !event.repeat => {
                if let PhysicalKey::Code(key) = event.physical_key {
                    match key {
                        KeyCode::Escape => {
                            log::info!("ESC pressed, exiting...");
                            event_loop.exit();
                        }
                        KeyCode::KeyP => self.scheduler.toggle_pause(),
                        KeyCode::Space => self.scheduler.request_step(),
                        KeyCode::F11 => self.toggle_fullscreen(),
                        _ => {}
                    }
                }
            }

            _ => {}
        }
    }

    /// Request the next frame, paced by the target frame rate
    fn about_to_wait(&mut self, event_loop: &ActiveEventLoop) {
        let Some(ref window) = self.window else {
            return;
        };

        if !self.scheduler.wants_frames() {
            event_loop.set_control_flow(ControlFlow::Wait);
            return;
        }

        match self.frame_interval {
            None => {
                window.request_redraw();
                event_loop.set_control_flow(ControlFlow::Poll);
            }
            Some(interval) => {
                let now = Instant::now();
                if now >= self.next_frame_at {
                    window.request_redraw();
                    // Don't try to catch up after a stall
                    self.next_frame_at = (self.next_frame_at + interval).max(now);
                }
                event_loop.set_control_flow(ControlFlow::WaitUntil(self.next_frame_at));
            }
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        let stats = self.scheduler.stats();
        log::info!(
            "Presented {} frames in {}s with {} frames in flight",
            stats.frames_presented(),
            stats.running_for(Instant::now()).as_secs(),
            self.scheduler.concurrent_frames()
        );

        // Renderer teardown waits for the GPU to go idle
        self.renderer = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unlimited_frame_rate_has_no_interval() {
        assert_eq!(frame_interval(0.0), None);
        assert_eq!(frame_interval(-5.0), None);
    }

    #[test]
    fn target_frame_rate_sets_interval() {
        let interval = frame_interval(50.0).unwrap();
        assert!((interval.as_secs_f64() - 0.02).abs() < 1e-6);
    }
}
