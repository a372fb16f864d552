//! egui on Vulkan through egui-ash-renderer
//!
//! The overlay draws into the main render pass, after the scene quad, so it
//! needs no framebuffer or render pass of its own.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use ash::vk;
use egui_ash_renderer::{Options, Renderer};
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use winit::event::WindowEvent;
use winit::window::Window;

use crate::backend::vulkan::VulkanBackend;
use crate::backend::{
    BackendError, BackendResult, CommandBufferHandle, Extent2d, GpuBackend, RenderPassHandle,
};
use crate::controls::{ControlState, PanelActions};

use super::{draw_panel, UiOverlay};

pub struct VulkanEguiOverlay {
    window: Arc<Window>,
    ctx: egui::Context,
    winit_state: egui_winit::State,
    /// Dropped before `allocator`
    renderer: Option<Renderer>,
    /// egui-ash-renderer wants a std mutex, so egui gets its own allocator
    /// on the backend's device. It must go before the device does.
    allocator: Option<Arc<Mutex<Allocator>>>,
    paint_jobs: Vec<egui::ClippedPrimitive>,
    textures_delta: egui::TexturesDelta,
    pixels_per_point: f32,
    /// Textures egui released, held until no frame in flight can use them.
    retired_textures: VecDeque<Vec<egui::TextureId>>,
    in_flight_frames: usize,
}

impl VulkanEguiOverlay {
    /// Create the overlay for `render_pass`, the pass it will be recorded in.
    pub fn new(
        backend: &VulkanBackend,
        window: Arc<Window>,
        render_pass: RenderPassHandle,
        in_flight_frames: usize,
    ) -> BackendResult<Self> {
        let raw_render_pass = backend
            .raw_render_pass(render_pass)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", render_pass)))?;

        let ctx = egui::Context::default();
        let winit_state = egui_winit::State::new(
            ctx.clone(),
            egui::ViewportId::ROOT,
            &window,
            Some(window.scale_factor() as f32),
            None,
        );

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: backend.instance().clone(),
            device: backend.device().clone(),
            physical_device: backend.physical_device(),
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| BackendError::InitializationFailed(format!("egui allocator: {}", e)))?;
        let allocator = Arc::new(Mutex::new(allocator));

        let renderer = Renderer::with_gpu_allocator(
            allocator.clone(),
            backend.device().clone(),
            raw_render_pass,
            Options {
                srgb_framebuffer: backend.swapchain_format().is_srgb(),
                in_flight_frames,
                ..Default::default()
            },
        )
        .map_err(|e| BackendError::InitializationFailed(format!("egui renderer: {}", e)))?;

        Ok(Self {
            window,
            ctx,
            winit_state,
            renderer: Some(renderer),
            allocator: Some(allocator),
            paint_jobs: Vec::new(),
            textures_delta: egui::TexturesDelta::default(),
            pixels_per_point: 1.0,
            retired_textures: VecDeque::new(),
            in_flight_frames,
        })
    }

    /// Feed a window event to egui. Returns true when egui consumed it.
    pub fn on_window_event(&mut self, event: &WindowEvent) -> bool {
        self.winit_state.on_window_event(&self.window, event).consumed
    }

    pub fn context(&self) -> &egui::Context {
        &self.ctx
    }

    pub fn wants_pointer_input(&self) -> bool {
        self.ctx.wants_pointer_input()
    }

    fn free_retired(&mut self, keep: usize) -> BackendResult<()> {
        while self.retired_textures.len() > keep {
            let Some(ids) = self.retired_textures.pop_front() else {
                break;
            };
            if let Some(renderer) = self.renderer.as_mut() {
                renderer
                    .free_textures(&ids)
                    .map_err(|e| BackendError::RecordingFailed(e.to_string()))?;
            }
        }
        Ok(())
    }
}

impl UiOverlay<VulkanBackend> for VulkanEguiOverlay {
    fn begin_frame(&mut self) {
        let raw_input = self.winit_state.take_egui_input(&self.window);
        self.ctx.begin_frame(raw_input);
    }

    fn build(&mut self, controls: &mut ControlState) -> PanelActions {
        draw_panel(&self.ctx, controls)
    }

    fn end_frame(&mut self) {
        let full_output = self.ctx.end_frame();
        self.winit_state
            .handle_platform_output(&self.window, full_output.platform_output);

        self.pixels_per_point = full_output.pixels_per_point;
        self.paint_jobs = self
            .ctx
            .tessellate(full_output.shapes, full_output.pixels_per_point);
        self.textures_delta.append(full_output.textures_delta);
    }

    fn record(
        &mut self,
        backend: &mut VulkanBackend,
        command_buffer: CommandBufferHandle,
        extent: Extent2d,
    ) -> BackendResult<()> {
        let cmd = backend
            .raw_command_buffer(command_buffer)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", command_buffer)))?;
        let Some(renderer) = self.renderer.as_mut() else {
            return Ok(());
        };

        if !self.textures_delta.set.is_empty() {
            renderer
                .set_textures(
                    backend.graphics_queue(),
                    backend.command_pool(),
                    &self.textures_delta.set,
                )
                .map_err(|e| BackendError::RecordingFailed(e.to_string()))?;
            self.textures_delta.set.clear();
        }

        renderer
            .cmd_draw(
                cmd,
                vk::Extent2D {
                    width: extent.width,
                    height: extent.height,
                },
                self.pixels_per_point,
                &self.paint_jobs,
            )
            .map_err(|e| BackendError::RecordingFailed(e.to_string()))?;

        let freed = std::mem::take(&mut self.textures_delta.free);
        self.retired_textures.push_back(freed);
        self.free_retired(self.in_flight_frames)
    }

    fn destroy(&mut self, backend: &mut VulkanBackend) {
        if let Err(e) = backend.wait_idle() {
            log::warn!("Device wait before egui teardown failed: {}", e);
        }
        if let Err(e) = self.free_retired(0) {
            log::warn!("Failed to free egui textures: {}", e);
        }
        self.renderer = None;
        self.allocator = None;
    }
}

impl Drop for VulkanEguiOverlay {
    fn drop(&mut self) {
        if self.renderer.is_some() || self.allocator.is_some() {
            log::warn!("VulkanEguiOverlay dropped without destroy(); GPU objects may outlive the device");
        }
    }
}
