//! SDF Renderer - real-time signed distance field ray marching on Vulkan
//!
//! A full-screen fragment shader ray-marches a Cornell-box style scene. Each
//! frame can first render a reflective shadow map from the key light
//! (position, normal and flux targets), which the main pass gathers for one
//! bounce of indirect light.
//!
//! # Layout
//! - [`backend`]: the [`backend::GpuBackend`] trait, an ash implementation and
//!   a recording dummy used by the tests
//! - [`frame`]: per-slot synchronization and per-swapchain-image bindings
//! - [`offscreen`]: the shadow map targets and their deferred resize
//! - [`graph`]: which passes run this frame and how they are recorded
//! - [`uniforms`]: the uniform block built from [`controls::ControlState`]
//! - [`driver`]: the frame loop tying it together
//! - [`ui`]: the egui control panel

use std::path::PathBuf;

pub mod backend;
pub mod controls;
pub mod driver;
pub mod error;
pub mod frame;
pub mod graph;
pub mod offscreen;
pub mod scene;
pub mod shader;
pub mod texture;
pub mod ui;
pub mod uniforms;
pub mod window;

pub use controls::{ControlState, PanelActions, RsmResolution};
pub use driver::{FrameLoopDriver, FrameOutcome, FrameReport, SkipReason};
pub use error::{RendererError, RendererResult};
pub use window::{run, Window};

/// Renderer start-up options.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Window title
    pub title: String,
    /// Initial window width
    pub width: u32,
    /// Initial window height
    pub height: u32,
    /// Enable vsync
    pub vsync: bool,
    /// Frames the CPU may record ahead of the GPU
    pub frames_in_flight: usize,
    /// Initial shadow map edge length in texels
    pub rsm_size: u32,
    /// Image applied to the textured sphere
    pub texture_path: PathBuf,
    /// Close after this many presented frames
    pub max_frames: Option<u64>,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            title: "SDF Renderer".to_string(),
            width: 1280,
            height: 720,
            vsync: true,
            frames_in_flight: 3,
            rsm_size: 1024,
            texture_path: PathBuf::from("assets/flower.png"),
            max_frames: None,
        }
    }
}
