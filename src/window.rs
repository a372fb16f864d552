//! Window management and the event loop, using winit

use std::sync::Arc;
use winit::{
    dpi::PhysicalSize,
    event::{Event, WindowEvent},
    event_loop::{ControlFlow, EventLoop, EventLoopWindowTarget},
    window::{Window as WinitWindow, WindowBuilder},
};

use crate::backend::vulkan::VulkanBackend;
use crate::driver::{FrameLoopDriver, FrameOutcome};
use crate::error::{RendererError, RendererResult};
use crate::ui::VulkanEguiOverlay;
use crate::RendererConfig;

/// Wrapper around winit window with additional state
pub struct Window {
    window: Arc<WinitWindow>,
    width: u32,
    height: u32,
    resized: bool,
    close_requested: bool,
}

impl Window {
    /// Create a new window with the given title and dimensions
    pub fn new(event_loop: &EventLoop<()>, title: &str, width: u32, height: u32) -> RendererResult<Self> {
        let window = WindowBuilder::new()
            .with_title(title)
            .with_inner_size(PhysicalSize::new(width, height))
            .build(event_loop)
            .map_err(|e| RendererError::Window(e.to_string()))?;
        let size = window.inner_size();

        Ok(Self {
            window: Arc::new(window),
            width: size.width,
            height: size.height,
            resized: false,
            close_requested: false,
        })
    }

    pub fn window(&self) -> &WinitWindow {
        &self.window
    }

    pub fn window_arc(&self) -> Arc<WinitWindow> {
        Arc::clone(&self.window)
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Returns whether the window was resized since the last call, and clears the flag.
    pub fn take_resized(&mut self) -> bool {
        std::mem::take(&mut self.resized)
    }

    pub fn should_close(&self) -> bool {
        self.close_requested
    }

    /// Handle window events
    pub fn handle_event(&mut self, event: &WindowEvent) {
        match event {
            WindowEvent::Resized(size) => {
                self.width = size.width;
                self.height = size.height;
                self.resized = true;
            }
            WindowEvent::CloseRequested => {
                self.close_requested = true;
            }
            _ => {}
        }
    }

    pub fn request_redraw(&self) {
        self.window.request_redraw();
    }
}

type VulkanDriver = FrameLoopDriver<VulkanBackend, VulkanEguiOverlay>;

/// Open the window and render until it is closed, the frame limit is hit,
/// or a frame fails.
pub fn run(config: &RendererConfig) -> RendererResult<()> {
    let event_loop = EventLoop::new().map_err(|e| RendererError::Window(e.to_string()))?;
    let mut window = Window::new(&event_loop, &config.title, config.width, config.height)?;

    let backend = VulkanBackend::new(window.window(), config.vsync)?;
    let window_arc = window.window_arc();
    let depth = config.frames_in_flight;
    let mut driver: VulkanDriver = FrameLoopDriver::new(backend, config, |backend, scene| {
        VulkanEguiOverlay::new(backend, window_arc, scene.main_render_pass, depth)
    })?;

    let mut failure: Option<RendererError> = None;

    event_loop
        .run(|event, elwt: &EventLoopWindowTarget<()>| {
            elwt.set_control_flow(ControlFlow::Poll);

            match event {
                Event::WindowEvent { event, .. } => {
                    window.handle_event(&event);
                    driver.overlay_mut().on_window_event(&event);

                    match event {
                        WindowEvent::CursorMoved { position, .. } => {
                            driver.on_pointer_moved(position.x as f32, position.y as f32);
                        }
                        WindowEvent::CloseRequested => {
                            log::info!("Close requested");
                            elwt.exit();
                        }
                        _ => {}
                    }
                }
                Event::AboutToWait => {
                    if window.should_close() {
                        return;
                    }
                    if window.take_resized() {
                        let (width, height) = window.dimensions();
                        driver.notify_surface_resized(width, height);
                    }

                    match driver.draw_frame() {
                        Ok(FrameOutcome::Presented(_)) => {
                            if config
                                .max_frames
                                .is_some_and(|limit| driver.frame_count() >= limit)
                            {
                                log::info!("Frame limit of {} reached", driver.frame_count());
                                elwt.exit();
                            }
                        }
                        Ok(FrameOutcome::Skipped(reason)) => {
                            log::trace!("Frame skipped: {:?}", reason);
                        }
                        Err(e) => {
                            log::error!("Frame failed: {}", e);
                            failure = Some(e);
                            elwt.exit();
                        }
                    }
                    window.request_redraw();
                }
                _ => {}
            }
        })
        .map_err(|e| RendererError::Window(e.to_string()))?;

    let shutdown = driver.shutdown();
    match failure {
        Some(e) => Err(e),
        None => shutdown,
    }
}
