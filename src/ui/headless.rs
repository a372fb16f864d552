//! Control panel without a display.

use std::collections::VecDeque;

use crate::backend::{BackendResult, CommandBufferHandle, Extent2d, GpuBackend};
use crate::controls::{ControlState, PanelActions};

use super::{draw_panel, UiOverlay};

/// Runs the panel against a blank egui input every frame and records no
/// commands. Resize requests can be queued to stand in for a user picking a
/// resolution.
pub struct HeadlessOverlay {
    ctx: egui::Context,
    screen: egui::Rect,
    queued_rsm_sizes: VecDeque<u32>,
    frames: u64,
}

impl HeadlessOverlay {
    pub fn new() -> Self {
        Self {
            ctx: egui::Context::default(),
            screen: egui::Rect::from_min_size(egui::Pos2::ZERO, egui::vec2(1280.0, 720.0)),
            queued_rsm_sizes: VecDeque::new(),
            frames: 0,
        }
    }

    /// Return `size` as the panel's resolution request on the next frame.
    pub fn queue_rsm_request(&mut self, size: u32) {
        self.queued_rsm_sizes.push_back(size);
    }

    /// Number of completed panel frames.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn context(&self) -> &egui::Context {
        &self.ctx
    }
}

impl Default for HeadlessOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: GpuBackend> UiOverlay<B> for HeadlessOverlay {
    fn begin_frame(&mut self) {
        self.ctx.begin_frame(egui::RawInput {
            screen_rect: Some(self.screen),
            ..Default::default()
        });
    }

    fn build(&mut self, controls: &mut ControlState) -> PanelActions {
        let mut actions = draw_panel(&self.ctx, controls);
        if let Some(size) = self.queued_rsm_sizes.pop_front() {
            actions.merge(PanelActions {
                requested_rsm_size: Some(size),
            });
        }
        actions
    }

    fn end_frame(&mut self) {
        let _ = self.ctx.end_frame();
        self.frames += 1;
    }

    fn record(
        &mut self,
        _backend: &mut B,
        _command_buffer: CommandBufferHandle,
        _extent: Extent2d,
    ) -> BackendResult<()> {
        Ok(())
    }

    fn destroy(&mut self, _backend: &mut B) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DummyBackend;

    fn run_frame(overlay: &mut HeadlessOverlay, controls: &mut ControlState) -> PanelActions {
        let overlay: &mut dyn UiOverlay<DummyBackend> = overlay;
        overlay.begin_frame();
        let actions = overlay.build(controls);
        overlay.end_frame();
        actions
    }

    #[test]
    fn test_queued_request_delivered_once() {
        let mut overlay = HeadlessOverlay::new();
        let mut controls = ControlState::default();
        overlay.queue_rsm_request(2048);

        assert_eq!(run_frame(&mut overlay, &mut controls).requested_rsm_size, Some(2048));
        assert_eq!(run_frame(&mut overlay, &mut controls).requested_rsm_size, None);
        assert_eq!(overlay.frames(), 2);
    }
}
