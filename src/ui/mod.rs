//! Immediate-mode control panel.
//!
//! The panel itself is plain egui code in [`panel`]. How its output reaches
//! the screen depends on the backend, behind the [`UiOverlay`] trait:
//! [`VulkanEguiOverlay`] draws into the main render pass, [`HeadlessOverlay`]
//! runs the same widgets without drawing anything.

mod headless;
pub mod panel;
mod vulkan;

pub use headless::HeadlessOverlay;
pub use panel::draw_panel;
pub use vulkan::VulkanEguiOverlay;

use crate::backend::{BackendResult, CommandBufferHandle, Extent2d, GpuBackend};
use crate::controls::{ControlState, PanelActions};

/// A UI layer recorded inside the main render pass.
///
/// Called once per frame in order: `begin_frame`, `build`, `end_frame`,
/// `record`.
pub trait UiOverlay<B: GpuBackend> {
    fn begin_frame(&mut self);

    /// Run the widgets. They write `controls` directly; requests that need
    /// the renderer's cooperation come back as [`PanelActions`].
    fn build(&mut self, controls: &mut ControlState) -> PanelActions;

    fn end_frame(&mut self);

    /// Record draw commands into the active render pass.
    fn record(
        &mut self,
        backend: &mut B,
        command_buffer: CommandBufferHandle,
        extent: Extent2d,
    ) -> BackendResult<()>;

    /// Release GPU resources. The device must be idle.
    fn destroy(&mut self, backend: &mut B);
}
