//! The per-frame state machine.
//!
//! Every frame runs the same sequence: wait for the slot's fence, apply a
//! pending shadow map resize, acquire a swapchain image, build and upload
//! uniforms, record, submit, present and move to the next slot.

use std::time::Instant;

use crate::backend::{BackendError, Extent2d, GpuBackend, PresentStatus};
use crate::controls::{ControlState, PanelActions, RsmResolution};
use crate::error::{RendererError, RendererResult};
use crate::frame::{FrameResourceSet, MAX_FRAMES_IN_FLIGHT, MIN_FRAMES_IN_FLIGHT};
use crate::graph::{FramePlan, PassSequencer, RecordContext};
use crate::offscreen::{OffscreenTargetManager, ResizeRequest};
use crate::scene::SceneResources;
use crate::shader::ShaderSet;
use crate::texture::TextureData;
use crate::ui::UiOverlay;
use crate::uniforms::{self, FrameInputs, InputState};
use crate::RendererConfig;

/// What a presented frame did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub slot: usize,
    pub image_index: u32,
    pub shadow_pass: bool,
    /// The shadow map targets were recreated at the start of this frame.
    pub resize_applied: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The swapchain no longer matched the surface. Bindings were recreated.
    SurfaceOutdated,
    /// The window has no area to draw into.
    Minimized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented(FrameReport),
    Skipped(SkipReason),
}

/// Owns the backend, the overlay and every GPU object, and drives frames.
pub struct FrameLoopDriver<B: GpuBackend, U: UiOverlay<B>> {
    backend: B,
    overlay: U,
    controls: ControlState,
    input: InputState,
    scene: SceneResources,
    offscreen: OffscreenTargetManager,
    frames: FrameResourceSet,
    surface_size: Extent2d,
    swapchain_dirty: bool,
    frame_count: u64,
    start: Instant,
    shut_down: bool,
}

impl<B: GpuBackend, U: UiOverlay<B>> FrameLoopDriver<B, U> {
    /// Build every GPU object the renderer needs.
    ///
    /// The overlay is created last, once the main render pass exists.
    pub fn new<F>(mut backend: B, config: &RendererConfig, make_overlay: F) -> RendererResult<Self>
    where
        F: FnOnce(&mut B, &SceneResources) -> Result<U, BackendError>,
    {
        let depth = config.frames_in_flight;
        if !(MIN_FRAMES_IN_FLIGHT..=MAX_FRAMES_IN_FLIGHT).contains(&depth) {
            return Err(RendererError::Config(format!(
                "frames in flight must be between {} and {}, got {}",
                MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT, depth
            )));
        }

        log::info!(
            "Starting renderer on {} ({} frames in flight, {} swapchain images)",
            backend.name(),
            depth,
            backend.swapchain_image_count()
        );

        let shaders = ShaderSet::compile()?;
        let texture = TextureData::load_or_fallback(&config.texture_path);

        let offscreen = OffscreenTargetManager::new(&mut backend, config.rsm_size)?;
        let scene = SceneResources::new(&mut backend, offscreen.render_pass(), &shaders, &texture)?;
        let sources = scene.descriptor_sources(&offscreen)?;
        let frames = FrameResourceSet::new(&mut backend, depth, scene.main_render_pass, &sources)?;
        let overlay = make_overlay(&mut backend, &scene)?;

        let mut controls = ControlState::default();
        if let Some(resolution) = RsmResolution::from_size(offscreen.size()) {
            controls.rsm_resolution = resolution;
        }

        let surface_size = backend.swapchain_extent();
        Ok(Self {
            backend,
            overlay,
            controls,
            input: InputState::default(),
            scene,
            offscreen,
            frames,
            surface_size,
            swapchain_dirty: false,
            frame_count: 0,
            start: Instant::now(),
            shut_down: false,
        })
    }

    /// Run one iteration of the frame loop.
    pub fn draw_frame(&mut self) -> RendererResult<FrameOutcome> {
        if self.surface_size.width == 0 || self.surface_size.height == 0 {
            return Ok(FrameOutcome::Skipped(SkipReason::Minimized));
        }

        let slot = self.frames.acquire_slot(&mut self.backend)?;

        if self.swapchain_dirty {
            self.recreate_swapchain()?;
        }

        let had_pending = self.offscreen.pending().is_some();
        let resize_applied = {
            let frames = &mut self.frames;
            let scene = &self.scene;
            self.offscreen
                .apply_pending_resize(&mut self.backend, |backend, offscreen| {
                    frames.rebuild_descriptor_sets(backend, &scene.descriptor_sources(offscreen)?)
                })?
        };
        if had_pending {
            self.sync_rsm_resolution();
        }

        let image_index = match self.frames.bind_image(&mut self.backend, &slot) {
            Ok(index) => index,
            Err(BackendError::SurfaceOutdated) => {
                log::debug!("Swapchain out of date at acquire, skipping frame");
                self.recreate_swapchain()?;
                return Ok(FrameOutcome::Skipped(SkipReason::SurfaceOutdated));
            }
            Err(e) => return Err(e.into()),
        };

        let extent = self.backend.swapchain_extent();
        let inputs = FrameInputs {
            time: self.start.elapsed().as_secs_f32(),
            frame: self.frame_count as i32,
            extent,
            rsm_size: self.offscreen.size(),
        };
        let block = uniforms::build(&inputs, &mut self.controls, &self.input);
        self.frames
            .upload_uniforms(&mut self.backend, image_index, &block)?;

        let plan = FramePlan::new(block.rsm_enabled());
        let binding = *self.frames.binding(image_index).ok_or_else(|| {
            BackendError::InvalidHandle(format!("swapchain image {}", image_index))
        })?;
        let ctx = RecordContext {
            scene: &self.scene,
            offscreen: &self.offscreen,
            binding: &binding,
            extent,
        };
        let actions = PassSequencer::record(
            &mut self.backend,
            &plan,
            &ctx,
            &mut self.overlay,
            &mut self.controls,
        )?;

        self.backend
            .submit(
                binding.command_buffer,
                slot.image_available,
                slot.render_finished,
                slot.in_flight,
            )
            .map_err(RendererError::Submit)?;

        match self.backend.present(image_index, slot.render_finished) {
            Ok(PresentStatus::Optimal) => {}
            Ok(PresentStatus::Suboptimal) | Err(BackendError::SurfaceOutdated) => {
                log::debug!("Swapchain needs recreation after present");
                self.swapchain_dirty = true;
            }
            Err(e) => return Err(e.into()),
        }

        self.frames.advance();
        self.frame_count += 1;
        self.apply_actions(actions);

        let report = FrameReport {
            slot: slot.index,
            image_index,
            shadow_pass: plan.shadow_enabled(),
            resize_applied,
        };
        log::trace!("Frame {}: {:?}", self.frame_count, report);
        Ok(FrameOutcome::Presented(report))
    }

    /// Ask for shadow map targets of `size` at the start of the next frame.
    ///
    /// The panel's resolution follows the size that will actually be used.
    pub fn request_rsm_resize(&mut self, size: u32) -> ResizeRequest {
        let max = self.backend.max_image_dimension();
        let request = self.offscreen.request_resize(size, max);
        self.sync_rsm_resolution();
        request
    }

    fn sync_rsm_resolution(&mut self) {
        let size = self.offscreen.pending().unwrap_or(self.offscreen.size());
        if let Some(resolution) = RsmResolution::from_size(size) {
            self.controls.rsm_resolution = resolution;
        }
    }

    fn apply_actions(&mut self, actions: PanelActions) {
        if let Some(size) = actions.requested_rsm_size {
            self.request_rsm_resize(size);
        }
    }

    fn recreate_swapchain(&mut self) -> RendererResult<()> {
        let Extent2d { width, height } = self.surface_size;
        self.backend.recreate_swapchain(width, height)?;
        let sources = self.scene.descriptor_sources(&self.offscreen)?;
        self.frames
            .recreate_image_bindings(&mut self.backend, self.scene.main_render_pass, &sources)?;
        self.swapchain_dirty = false;
        Ok(())
    }

    pub fn on_pointer_moved(&mut self, x: f32, y: f32) {
        self.input.on_pointer_moved(x, y);
    }

    /// Record a new window size. The swapchain follows on the next frame.
    pub fn notify_surface_resized(&mut self, width: u32, height: u32) {
        let size = Extent2d::new(width, height);
        if size == self.surface_size && !self.swapchain_dirty {
            return;
        }
        self.surface_size = size;
        if width > 0 && height > 0 {
            self.swapchain_dirty = true;
        }
    }

    /// Wait for the device and release every GPU object. Safe to call twice.
    pub fn shutdown(&mut self) -> RendererResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;

        let idle = self.backend.wait_idle();
        self.overlay.destroy(&mut self.backend);
        self.frames.destroy(&mut self.backend);
        self.scene.destroy(&mut self.backend);
        self.offscreen.destroy(&mut self.backend);
        log::info!("Renderer shut down after {} frames", self.frame_count);
        idle.map_err(RendererError::from)
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn overlay(&self) -> &U {
        &self.overlay
    }

    pub fn overlay_mut(&mut self) -> &mut U {
        &mut self.overlay
    }

    pub fn controls(&self) -> &ControlState {
        &self.controls
    }

    pub fn controls_mut(&mut self) -> &mut ControlState {
        &mut self.controls
    }

    pub fn offscreen(&self) -> &OffscreenTargetManager {
        &self.offscreen
    }

    pub fn frames(&self) -> &FrameResourceSet {
        &self.frames
    }

    pub fn scene(&self) -> &SceneResources {
        &self.scene
    }

    /// Frames presented so far.
    pub fn frame_count(&self) -> u64 {
        self.frame_count
    }
}

impl<B: GpuBackend, U: UiOverlay<B>> Drop for FrameLoopDriver<B, U> {
    fn drop(&mut self) {
        if !self.shut_down {
            if let Err(e) = self.shutdown() {
                log::error!("Renderer teardown failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, DummyBackend};
    use crate::ui::HeadlessOverlay;
    use rstest::rstest;

    fn driver(size: Extent2d) -> FrameLoopDriver<DummyBackend, HeadlessOverlay> {
        let config = RendererConfig {
            texture_path: "does/not/exist.png".into(),
            ..RendererConfig::default()
        };
        FrameLoopDriver::new(DummyBackend::new(size, 3), &config, |_, _| {
            Ok(HeadlessOverlay::new())
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_bad_depth() {
        let config = RendererConfig {
            frames_in_flight: 0,
            ..RendererConfig::default()
        };
        let result = FrameLoopDriver::new(DummyBackend::new(Extent2d::new(64, 64), 2), &config, |_, _| {
            Ok(HeadlessOverlay::new())
        });
        assert!(matches!(result, Err(RendererError::Config(_))));
    }

    #[test]
    fn test_minimized_window_skips_without_waiting() {
        let mut driver = driver(Extent2d::new(320, 200));
        driver.backend_mut().take_events();
        driver.notify_surface_resized(0, 0);

        let outcome = driver.draw_frame().unwrap();
        assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::Minimized));
        assert!(driver.backend().events().is_empty());
    }

    #[test]
    fn test_surface_resize_recreates_on_next_frame() {
        let mut driver = driver(Extent2d::new(320, 200));
        driver.notify_surface_resized(640, 400);
        driver.draw_frame().unwrap();

        let recreated = driver
            .backend()
            .count_events(|e| matches!(e, BackendEvent::RecreateSwapchain(ext) if *ext == Extent2d::new(640, 400)));
        assert_eq!(recreated, 1);
        assert!(driver.backend().validation_errors().is_empty());
    }

    #[test]
    fn test_panel_request_resizes_next_frame() {
        let mut driver = driver(Extent2d::new(320, 200));
        driver.overlay_mut().queue_rsm_request(512);

        let FrameOutcome::Presented(first) = driver.draw_frame().unwrap() else {
            panic!("first frame skipped");
        };
        assert!(!first.resize_applied);
        assert_eq!(driver.offscreen().pending(), Some(512));

        let FrameOutcome::Presented(second) = driver.draw_frame().unwrap() else {
            panic!("second frame skipped");
        };
        assert!(second.resize_applied);
        assert_eq!(driver.offscreen().size(), 512);
    }

    #[rstest]
    #[case(1024)]
    #[case(2048)]
    fn test_clamped_request_updates_panel_resolution(#[case] initial: u32) {
        let config = RendererConfig {
            texture_path: "does/not/exist.png".into(),
            rsm_size: initial,
            ..RendererConfig::default()
        };
        let backend = DummyBackend::new(Extent2d::new(320, 200), 3).with_max_image_dimension(2048);
        let mut driver = FrameLoopDriver::new(backend, &config, |_, _| Ok(HeadlessOverlay::new())).unwrap();

        // The panel shows what the user picked before the renderer clamps it.
        driver.controls_mut().rsm_resolution = RsmResolution::R4096;
        driver.overlay_mut().queue_rsm_request(4096);
        driver.draw_frame().unwrap();
        assert_eq!(driver.controls().rsm_resolution, RsmResolution::R2048);

        driver.draw_frame().unwrap();
        assert_eq!(driver.offscreen().size(), 2048);
        assert_eq!(driver.controls().rsm_resolution, RsmResolution::R2048);
    }

    #[test]
    fn test_shutdown_releases_everything() {
        let mut driver = driver(Extent2d::new(320, 200));
        for _ in 0..3 {
            driver.draw_frame().unwrap();
        }
        driver.shutdown().unwrap();
        driver.shutdown().unwrap();
        assert_eq!(driver.backend().live_object_count(), 0);
    }
}
