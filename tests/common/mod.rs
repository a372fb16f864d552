//! Shared setup for the frame loop integration tests.
//!
//! Every test drives a [`FrameLoopDriver`] over the recording
//! [`DummyBackend`] with a [`HeadlessOverlay`], so no window or GPU is
//! needed.

#![allow(dead_code)]

use sdf_renderer::backend::{BackendEvent, DummyBackend, Extent2d};
use sdf_renderer::ui::HeadlessOverlay;
use sdf_renderer::uniforms::UniformBlock;
use sdf_renderer::{FrameLoopDriver, FrameOutcome, FrameReport, RendererConfig};

pub type TestDriver = FrameLoopDriver<DummyBackend, HeadlessOverlay>;

pub const SURFACE: Extent2d = Extent2d {
    width: 640,
    height: 360,
};

/// A config that never touches the file system for textures.
pub fn config(frames_in_flight: usize, rsm_size: u32) -> RendererConfig {
    RendererConfig {
        frames_in_flight,
        rsm_size,
        texture_path: "tests/missing/texture.png".into(),
        ..RendererConfig::default()
    }
}

/// Build a driver and drop the setup events, so tests only see frame work.
pub fn driver(frames_in_flight: usize, image_count: u32, rsm_size: u32) -> TestDriver {
    let backend = DummyBackend::new(SURFACE, image_count);
    let mut driver = FrameLoopDriver::new(backend, &config(frames_in_flight, rsm_size), |_, _| {
        Ok(HeadlessOverlay::new())
    })
    .expect("driver setup failed");
    driver.backend_mut().take_events();
    driver
}

/// Build a driver with the shadow pass switched on.
pub fn shadowed_driver(frames_in_flight: usize, image_count: u32, rsm_size: u32) -> TestDriver {
    let mut driver = driver(frames_in_flight, image_count, rsm_size);
    driver.controls_mut().enable_rsm = true;
    driver
}

/// Draw a frame that must be presented.
pub fn present(driver: &mut TestDriver) -> FrameReport {
    match driver.draw_frame().expect("frame failed") {
        FrameOutcome::Presented(report) => report,
        FrameOutcome::Skipped(reason) => panic!("frame skipped: {:?}", reason),
    }
}

/// The uniform block the driver uploaded for the frame in `report`.
pub fn uploaded_block(driver: &TestDriver, report: &FrameReport) -> UniformBlock {
    let binding = driver
        .frames()
        .binding(report.image_index)
        .expect("no binding for presented image");
    let bytes = driver
        .backend()
        .buffer_contents(binding.uniform_buffer)
        .expect("uniform buffer destroyed");
    bytemuck::pod_read_unaligned(bytes)
}

pub fn count(driver: &TestDriver, predicate: impl Fn(&BackendEvent) -> bool) -> usize {
    driver.backend().count_events(predicate)
}

/// Assert the dummy backend saw no misuse.
pub fn assert_clean(driver: &TestDriver) {
    let errors = driver.backend().validation_errors();
    assert!(errors.is_empty(), "validation errors: {:#?}", errors);
}
