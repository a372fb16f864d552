//! Frame loop integration tests.
//!
//! These run whole frames through the driver and check the command stream
//! the dummy backend recorded: slot rotation, shadow map resizing, the
//! disabled shadow path and swapchain recovery.

mod common;

use rstest::rstest;

use common::{assert_clean, count, driver, present, shadowed_driver, uploaded_block, SURFACE};
use sdf_renderer::backend::{AcquireScript, BackendEvent, Extent2d, ImageLayout, PresentScript};
use sdf_renderer::offscreen::ResizeRequest;
use sdf_renderer::uniforms::UniformBlock;
use sdf_renderer::{FrameOutcome, RendererError, SkipReason};

// ============================================================================
// Slot Rotation
// ============================================================================

#[test]
fn test_ten_frames_with_shadow_pass() {
    let mut driver = shadowed_driver(3, 3, 1024);

    let slots: Vec<usize> = (0..10)
        .map(|_| {
            let report = present(&mut driver);
            assert!(report.shadow_pass);
            assert!(uploaded_block(&driver, &report).rsm_enabled());
            report.slot
        })
        .collect();
    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0, 1, 2, 0]);

    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::WaitFence(_))), 10);
    assert_eq!(
        count(&driver, |e| matches!(e, BackendEvent::WriteBuffer { len, .. } if *len as u64 == UniformBlock::SIZE)),
        10
    );
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::BeginCommandBuffer(_))), 10);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::Submit { .. })), 10);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::Present { .. })), 10);

    let rsm_pass = driver.offscreen().render_pass();
    assert_eq!(
        count(&driver, |e| matches!(e, BackendEvent::BeginRenderPass { render_pass, .. } if *render_pass == rsm_pass)),
        10
    );
    assert_eq!(driver.frame_count(), 10);
    assert_clean(&driver);
}

#[test]
fn test_uniforms_go_to_the_acquired_image() {
    let mut driver = driver(2, 3, 256);

    for _ in 0..6 {
        let report = present(&mut driver);
        let expected = driver.frames().binding(report.image_index).unwrap().uniform_buffer;
        let written = driver
            .backend_mut()
            .take_events()
            .into_iter()
            .filter_map(|e| match e {
                BackendEvent::WriteBuffer { buffer, .. } => Some(buffer),
                _ => None,
            })
            .collect::<Vec<_>>();
        assert_eq!(written, vec![expected]);
    }
}

#[rstest]
#[case(1)]
#[case(2)]
#[case(3)]
#[case(4)]
fn test_slot_follows_frame_number(#[case] depth: usize) {
    let mut driver = driver(depth, 3, 256);
    // Images come back out of order; slots must not care.
    for index in [2, 0, 1, 1, 2, 0, 0, 2, 1, 2, 0, 1] {
        driver.backend_mut().script_acquire(AcquireScript::Image(index));
    }

    for frame in 0..12 {
        let report = present(&mut driver);
        assert_eq!(report.slot, frame % depth, "frame {}", frame);
    }
    assert_clean(&driver);
}

#[test]
fn test_submit_signals_the_slot_fence() {
    let mut driver = driver(2, 3, 256);
    let report = present(&mut driver);
    let fence = driver.frames().slot(report.slot).unwrap().in_flight;

    let submitted = driver
        .backend()
        .events()
        .iter()
        .find_map(|e| match e {
            BackendEvent::Submit { fence, .. } => Some(*fence),
            _ => None,
        })
        .unwrap();
    assert_eq!(submitted, fence);
    assert!(driver.backend().is_fence_signaled(fence));
}

// ============================================================================
// Shadow Map Resize
// ============================================================================

#[test]
fn test_resize_recreates_targets_and_descriptor_sets() {
    let mut driver = driver(3, 3, 1024);
    present(&mut driver);
    let old_images = driver.offscreen().images().unwrap();
    driver.backend_mut().take_events();

    assert_eq!(driver.request_rsm_resize(2048), ResizeRequest::Scheduled(2048));
    // Nothing happens until the next frame starts.
    assert!(driver.backend().events().is_empty());
    assert_eq!(driver.offscreen().size(), 1024);

    let report = present(&mut driver);
    assert!(report.resize_applied);
    assert_eq!(driver.offscreen().size(), 2048);

    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::WaitIdle)), 1);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::DestroyImage(_))), 3);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::DestroyFramebuffer(_))), 1);

    let big = Extent2d::new(2048, 2048);
    assert_eq!(
        count(&driver, |e| matches!(e, BackendEvent::CreateImage { extent, .. } if *extent == big)),
        3
    );
    assert_eq!(
        count(&driver, |e| matches!(e, BackendEvent::CreateFramebuffer { extent, .. } if *extent == big)),
        1
    );

    let image_count = driver.frames().image_count();
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::DestroyDescriptorSet(_))), image_count);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::CreateDescriptorSet { .. })), image_count);

    for image in old_images {
        assert!(!driver.backend().is_image_alive(image));
    }
    for binding in driver.frames().bindings() {
        let images = driver.backend().descriptor_set_images(binding.descriptor_set).unwrap();
        for image in images {
            assert!(driver.backend().is_image_alive(*image), "{:?} is stale", image);
        }
        for image in driver.offscreen().images().unwrap() {
            assert!(images.contains(&image));
        }
    }
    assert_clean(&driver);
}

#[test]
fn test_requests_while_pending_coalesce() {
    let mut driver = driver(2, 3, 1024);
    present(&mut driver);
    driver.backend_mut().take_events();

    driver.request_rsm_resize(2048);
    assert_eq!(driver.request_rsm_resize(512), ResizeRequest::Scheduled(512));
    present(&mut driver);

    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::WaitIdle)), 1);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::CreateFramebuffer { .. })), 1);
    assert_eq!(driver.offscreen().size(), 512);
}

#[test]
fn test_same_request_twice_recreates_once() {
    let mut driver = driver(2, 3, 1024);
    present(&mut driver);
    driver.backend_mut().take_events();

    assert_eq!(driver.request_rsm_resize(2048), ResizeRequest::Scheduled(2048));
    assert_eq!(driver.request_rsm_resize(2048), ResizeRequest::Scheduled(2048));
    assert!(present(&mut driver).resize_applied);
    assert!(!present(&mut driver).resize_applied);

    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::WaitIdle)), 1);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::CreateFramebuffer { .. })), 1);
    assert_eq!(driver.offscreen().size(), 2048);
}

#[test]
fn test_request_for_current_size_cancels_pending() {
    let mut driver = driver(2, 3, 1024);
    driver.request_rsm_resize(2048);
    assert_eq!(driver.request_rsm_resize(1024), ResizeRequest::Cancelled);

    let report = present(&mut driver);
    assert!(!report.resize_applied);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::WaitIdle)), 0);
}

#[rstest]
#[case(1, 64)]
#[case(100_000, 4096)]
fn test_resize_is_clamped(#[case] requested: u32, #[case] expected: u32) {
    let backend = sdf_renderer::backend::DummyBackend::new(SURFACE, 3).with_max_image_dimension(4096);
    let mut driver = sdf_renderer::FrameLoopDriver::new(backend, &common::config(2, 1024), |_, _| {
        Ok(sdf_renderer::ui::HeadlessOverlay::new())
    })
    .unwrap();

    driver.request_rsm_resize(requested);
    present(&mut driver);
    assert_eq!(driver.offscreen().size(), expected);
}

// ============================================================================
// Shadow Pass Disabled
// ============================================================================

#[test]
fn test_disabled_shadow_pass_only_transitions() {
    let mut driver = driver(2, 3, 256);
    // Off until the panel turns it on.
    assert!(!driver.controls().enable_rsm);

    let report = present(&mut driver);
    assert!(!report.shadow_pass);
    let block = uploaded_block(&driver, &report);
    assert_eq!(block.rsm_params[3], 0.0);

    let rsm_pass = driver.offscreen().render_pass();
    assert_eq!(
        count(&driver, |e| matches!(e, BackendEvent::BeginRenderPass { render_pass, .. } if *render_pass == rsm_pass)),
        0
    );
    assert_eq!(
        count(&driver, |e| matches!(
            e,
            BackendEvent::TransitionImage { new_layout: ImageLayout::ShaderReadOnly, .. }
        )),
        3
    );

    let draws: Vec<_> = driver
        .backend()
        .events()
        .iter()
        .filter_map(|e| match e {
            BackendEvent::Draw { sampled_layouts, .. } => Some(sampled_layouts.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(draws.len(), 1);
    for (image, layout) in &draws[0] {
        assert_eq!(*layout, ImageLayout::ShaderReadOnly, "{:?}", image);
    }
    assert_clean(&driver);
}

#[test]
fn test_shadow_pass_toggles_per_frame() {
    let mut driver = driver(2, 3, 256);
    let rsm_pass = driver.offscreen().render_pass();

    for enabled in [true, false, false, true, false, true, true] {
        driver.controls_mut().enable_rsm = enabled;
        driver.backend_mut().take_events();

        let report = present(&mut driver);
        let block = uploaded_block(&driver, &report);
        let shadow_passes = count(&driver, |e| {
            matches!(e, BackendEvent::BeginRenderPass { render_pass, .. } if *render_pass == rsm_pass)
        });
        let transitions = count(&driver, |e| matches!(e, BackendEvent::TransitionImage { .. }));

        assert_eq!(report.shadow_pass, enabled);
        assert_eq!(block.rsm_params[3], if enabled { 1.0 } else { 0.0 });
        assert_eq!(shadow_passes, usize::from(enabled));
        assert_eq!(transitions, if enabled { 0 } else { 3 });
    }
    assert_clean(&driver);
}

// ============================================================================
// Errors and Swapchain Recovery
// ============================================================================

#[test]
fn test_submit_failure_is_reported() {
    let mut driver = driver(2, 3, 256);
    driver.backend_mut().fail_next_submit();

    let result = driver.draw_frame();
    assert!(matches!(result, Err(RendererError::Submit(_))), "{:?}", result);
    assert_eq!(driver.frame_count(), 0);
}

#[test]
fn test_out_of_date_acquire_skips_and_recovers() {
    let mut driver = driver(2, 3, 256);
    present(&mut driver);
    driver.backend_mut().take_events();

    driver.backend_mut().set_next_image_count(4);
    driver.backend_mut().script_acquire(AcquireScript::OutOfDate);

    let outcome = driver.draw_frame().unwrap();
    assert_eq!(outcome, FrameOutcome::Skipped(SkipReason::SurfaceOutdated));
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::RecreateSwapchain(_))), 1);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::Submit { .. })), 0);
    assert_eq!(driver.frames().image_count(), 4);

    // The skipped slot keeps its signaled fence and runs again next frame.
    let slot = driver.frames().slot(1).unwrap().in_flight;
    assert!(driver.backend().is_fence_signaled(slot));
    assert_eq!(present(&mut driver).slot, 1);
    assert_eq!(driver.frame_count(), 2);
    assert_clean(&driver);
}

#[rstest]
#[case(PresentScript::Suboptimal)]
#[case(PresentScript::OutOfDate)]
fn test_present_status_recreates_next_frame(#[case] script: PresentScript) {
    let mut driver = driver(2, 3, 256);
    driver.backend_mut().script_present(script);

    present(&mut driver);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::RecreateSwapchain(_))), 0);

    present(&mut driver);
    assert_eq!(
        count(&driver, |e| matches!(e, BackendEvent::RecreateSwapchain(ext) if *ext == SURFACE)),
        1
    );

    present(&mut driver);
    assert_eq!(count(&driver, |e| matches!(e, BackendEvent::RecreateSwapchain(_))), 1);
    assert_clean(&driver);
}

#[test]
fn test_minimize_then_restore() {
    let mut driver = driver(2, 3, 256);
    present(&mut driver);

    driver.notify_surface_resized(0, 0);
    for _ in 0..3 {
        assert_eq!(
            driver.draw_frame().unwrap(),
            FrameOutcome::Skipped(SkipReason::Minimized)
        );
    }

    driver.notify_surface_resized(800, 600);
    present(&mut driver);
    assert_eq!(
        count(&driver, |e| matches!(e, BackendEvent::RecreateSwapchain(ext) if *ext == Extent2d::new(800, 600))),
        1
    );
    assert_eq!(driver.frame_count(), 2);
}

#[test]
fn test_drop_releases_every_object() {
    let mut driver = driver(3, 3, 256);
    for _ in 0..4 {
        present(&mut driver);
    }
    driver.request_rsm_resize(512);
    present(&mut driver);

    driver.shutdown().unwrap();
    assert_eq!(driver.backend().live_object_count(), 0);
    assert_clean(&driver);
}
