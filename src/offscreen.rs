//! Reflective shadow map render targets.
//!
//! Three `Rgba16Float` images (world position, normal, reflected flux) are
//! written by the shadow pass and sampled by the main pass. Resizing is
//! deferred: [`OffscreenTargetManager::request_resize`] only records the new
//! size, and [`OffscreenTargetManager::apply_pending_resize`] swaps the whole
//! group at the start of a frame, after a device idle wait.

use crate::backend::{
    AttachmentDescriptor, BackendError, BackendResult, Extent2d, FramebufferAttachment, FramebufferDescriptor,
    FramebufferHandle, GpuBackend, ImageDescriptor, ImageHandle, ImageLayout, ImageUsage,
    RenderPassDescriptor, RenderPassHandle, SamplerDescriptor, SamplerHandle, TextureFormat,
};

/// Smallest shadow map edge accepted by [`OffscreenTargetManager::request_resize`].
pub const MIN_TARGET_SIZE: u32 = 64;

pub const TARGET_FORMAT: TextureFormat = TextureFormat::Rgba16Float;

const TARGET_LABELS: [&str; 3] = ["RSM Position", "RSM Normal", "RSM Flux"];

/// Outcome of a resize request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeRequest {
    /// A new size is pending.
    Scheduled(u32),
    /// The request matched the current size and dropped a pending resize.
    Cancelled,
    /// Nothing to do.
    Unchanged,
}

#[derive(Debug, Clone, Copy)]
struct TargetGroup {
    images: [ImageHandle; 3],
    framebuffer: FramebufferHandle,
}

pub struct OffscreenTargetManager {
    size: u32,
    pending: Option<u32>,
    render_pass: RenderPassHandle,
    sampler: SamplerHandle,
    targets: Option<TargetGroup>,
}

impl OffscreenTargetManager {
    /// Create the render pass, sampler and a first set of targets.
    pub fn new<B: GpuBackend>(backend: &mut B, size: u32) -> BackendResult<Self> {
        let size = clamp_size(size, backend.max_image_dimension());

        let attachment = AttachmentDescriptor {
            format: TARGET_FORMAT,
            initial_layout: ImageLayout::Undefined,
            final_layout: ImageLayout::ShaderReadOnly,
        };
        let render_pass = backend.create_render_pass(&RenderPassDescriptor {
            label: Some("RSM Pass".into()),
            color_attachments: vec![attachment.clone(), attachment.clone(), attachment],
        })?;
        let sampler = match backend.create_sampler(&SamplerDescriptor {
            label: Some("RSM Sampler".into()),
            ..Default::default()
        }) {
            Ok(sampler) => sampler,
            Err(e) => {
                backend.destroy_render_pass(render_pass);
                return Err(e);
            }
        };

        let mut manager = Self {
            size,
            pending: None,
            render_pass,
            sampler,
            targets: None,
        };
        if let Err(e) = manager.create_targets(backend, size) {
            manager.destroy(backend);
            return Err(e);
        }
        Ok(manager)
    }

    /// Create the three images and the framebuffer binding them.
    pub fn create_targets<B: GpuBackend>(&mut self, backend: &mut B, size: u32) -> BackendResult<()> {
        let extent = Extent2d::square(size);

        let mut images = Vec::with_capacity(TARGET_LABELS.len());
        for label in TARGET_LABELS {
            match backend.create_image(&ImageDescriptor {
                label: Some(label.into()),
                extent,
                format: TARGET_FORMAT,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
            }) {
                Ok(image) => images.push(image),
                Err(e) => {
                    for image in images {
                        backend.destroy_image(image);
                    }
                    return Err(e);
                }
            }
        }
        let images = [images[0], images[1], images[2]];

        let framebuffer = match backend.create_framebuffer(&FramebufferDescriptor {
            label: Some("RSM Framebuffer".into()),
            render_pass: self.render_pass,
            attachments: images.iter().map(|&i| FramebufferAttachment::Image(i)).collect(),
            extent,
        }) {
            Ok(fb) => fb,
            Err(e) => {
                for image in images {
                    backend.destroy_image(image);
                }
                return Err(e);
            }
        };

        self.targets = Some(TargetGroup { images, framebuffer });
        self.size = size;
        log::debug!("Created RSM targets at {}x{}", size, size);
        Ok(())
    }

    /// Record a new target size to apply at the start of the next frame.
    ///
    /// Sizes outside `[MIN_TARGET_SIZE, max_dimension]` are clamped with a
    /// warning. Requests while a resize is pending replace it.
    pub fn request_resize(&mut self, requested: u32, max_dimension: u32) -> ResizeRequest {
        let size = clamp_size(requested, max_dimension);

        if size == self.size {
            return match self.pending.take() {
                Some(dropped) => {
                    log::debug!("RSM resize to {} cancelled", dropped);
                    ResizeRequest::Cancelled
                }
                None => ResizeRequest::Unchanged,
            };
        }

        if self.pending != Some(size) {
            log::info!("RSM resize requested: {} -> {}", self.size, size);
        }
        self.pending = Some(size);
        ResizeRequest::Scheduled(size)
    }

    /// Swap in targets at the pending size, if any.
    ///
    /// Waits for the device to go idle, destroys the framebuffer and images,
    /// creates them again and hands the manager to `rebuild` so every
    /// descriptor set that sampled the old images can be rewritten. Returns
    /// whether a resize happened.
    ///
    /// If the new targets cannot be created, targets at the previous size are
    /// created instead and `Ok(false)` is returned. An error means not even
    /// those could be made, and the manager holds no targets.
    pub fn apply_pending_resize<B, F>(&mut self, backend: &mut B, rebuild: F) -> BackendResult<bool>
    where
        B: GpuBackend,
        F: FnOnce(&mut B, &Self) -> BackendResult<()>,
    {
        let Some(size) = self.pending.take() else {
            return Ok(false);
        };

        backend.wait_idle()?;
        let old_size = self.size;
        self.destroy_targets(backend);
        let resized = match self.create_targets(backend, size) {
            Ok(()) => true,
            Err(e) => {
                log::warn!(
                    "RSM targets at {} failed ({}), keeping {}",
                    size,
                    e,
                    old_size
                );
                self.create_targets(backend, old_size)?;
                false
            }
        };
        rebuild(backend, self)?;

        if resized {
            log::info!("RSM targets resized: {} -> {}", old_size, size);
        }
        Ok(resized)
    }

    fn destroy_targets<B: GpuBackend>(&mut self, backend: &mut B) {
        if let Some(group) = self.targets.take() {
            backend.destroy_framebuffer(group.framebuffer);
            for image in group.images {
                backend.destroy_image(image);
            }
        }
    }

    /// Release every object. The device must be idle.
    pub fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        self.destroy_targets(backend);
        backend.destroy_sampler(self.sampler);
        backend.destroy_render_pass(self.render_pass);
        self.pending = None;
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn extent(&self) -> Extent2d {
        Extent2d::square(self.size)
    }

    pub fn pending(&self) -> Option<u32> {
        self.pending
    }

    pub fn render_pass(&self) -> RenderPassHandle {
        self.render_pass
    }

    pub fn sampler(&self) -> SamplerHandle {
        self.sampler
    }

    /// Position, normal and flux images.
    pub fn images(&self) -> BackendResult<[ImageHandle; 3]> {
        self.group().map(|g| g.images)
    }

    pub fn framebuffer(&self) -> BackendResult<FramebufferHandle> {
        self.group().map(|g| g.framebuffer)
    }

    fn group(&self) -> BackendResult<&TargetGroup> {
        self.targets
            .as_ref()
            .ok_or_else(|| BackendError::InvalidHandle("RSM targets are not allocated".into()))
    }
}

fn clamp_size(requested: u32, max_dimension: u32) -> u32 {
    let max = max_dimension.max(MIN_TARGET_SIZE);
    let size = requested.clamp(MIN_TARGET_SIZE, max);
    if size != requested {
        log::warn!(
            "RSM size {} outside [{}, {}], using {}",
            requested,
            MIN_TARGET_SIZE,
            max,
            size
        );
    }
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, DummyBackend};
    use rstest::rstest;

    fn manager(size: u32) -> (DummyBackend, OffscreenTargetManager) {
        let mut backend = DummyBackend::new(Extent2d::new(800, 600), 3).with_max_image_dimension(8192);
        let manager = OffscreenTargetManager::new(&mut backend, size).unwrap();
        (backend, manager)
    }

    #[test]
    fn test_create_targets() {
        let (backend, manager) = manager(1024);
        assert_eq!(manager.size(), 1024);
        for image in manager.images().unwrap() {
            assert_eq!(backend.image_extent(image), Some(Extent2d::square(1024)));
        }
        assert_eq!(
            backend.count_events(|e| matches!(
                e,
                BackendEvent::CreateImage {
                    format: TextureFormat::Rgba16Float,
                    ..
                }
            )),
            3
        );
    }

    #[test]
    fn test_resize_same_size_is_noop() {
        let (_, mut manager) = manager(1024);
        assert_eq!(manager.request_resize(1024, 8192), ResizeRequest::Unchanged);
        assert_eq!(manager.pending(), None);
    }

    #[test]
    fn test_resize_back_to_current_cancels() {
        let (_, mut manager) = manager(1024);
        manager.request_resize(2048, 8192);
        assert_eq!(manager.request_resize(1024, 8192), ResizeRequest::Cancelled);
        assert_eq!(manager.pending(), None);
    }

    #[test]
    fn test_repeated_requests_keep_last() {
        let (mut backend, mut manager) = manager(1024);
        manager.request_resize(2048, 8192);
        manager.request_resize(4096, 8192);
        backend.take_events();

        let mut rebuilds = 0;
        let applied = manager
            .apply_pending_resize(&mut backend, |_, _| {
                rebuilds += 1;
                Ok(())
            })
            .unwrap();

        assert!(applied);
        assert_eq!(rebuilds, 1);
        assert_eq!(manager.size(), 4096);
        assert_eq!(backend.count_events(|e| matches!(e, BackendEvent::WaitIdle)), 1);
        assert_eq!(backend.count_events(|e| matches!(e, BackendEvent::CreateImage { .. })), 3);

        let again = manager.apply_pending_resize(&mut backend, |_, _| Ok(())).unwrap();
        assert!(!again);
    }

    #[test]
    fn test_apply_replaces_whole_group() {
        let (mut backend, mut manager) = manager(1024);
        let old_images = manager.images().unwrap();
        let old_framebuffer = manager.framebuffer().unwrap();
        manager.request_resize(2048, 8192);
        backend.take_events();

        manager
            .apply_pending_resize(&mut backend, |backend, m| {
                for image in m.images().unwrap() {
                    assert!(backend.is_image_alive(image));
                }
                Ok(())
            })
            .unwrap();

        let events = backend.take_events();
        assert_eq!(events[0], BackendEvent::WaitIdle);
        assert!(events.contains(&BackendEvent::DestroyFramebuffer(old_framebuffer)));
        for image in old_images {
            assert!(events.contains(&BackendEvent::DestroyImage(image)));
            assert!(!backend.is_image_alive(image));
        }
        for image in manager.images().unwrap() {
            assert_eq!(backend.image_extent(image), Some(Extent2d::square(2048)));
        }
    }

    #[rstest]
    #[case(16, MIN_TARGET_SIZE)]
    #[case(0, MIN_TARGET_SIZE)]
    #[case(100_000, 8192)]
    #[case(512, 512)]
    fn test_requests_are_clamped(#[case] requested: u32, #[case] expected: u32) {
        let (_, mut manager) = manager(1024);
        manager.request_resize(requested, 8192);
        assert_eq!(manager.pending(), Some(expected));
    }

    #[test]
    fn test_initial_size_is_clamped_to_device() {
        let mut backend = DummyBackend::new(Extent2d::new(800, 600), 3).with_max_image_dimension(2048);
        let manager = OffscreenTargetManager::new(&mut backend, 4096).unwrap();
        assert_eq!(manager.size(), 2048);
    }

    #[test]
    fn test_failed_resize_falls_back_to_previous_size() {
        let mut backend = DummyBackend::new(Extent2d::new(800, 600), 3).with_max_image_dimension(2048);
        let mut manager = OffscreenTargetManager::new(&mut backend, 1024).unwrap();
        // A stale limit lets the request through; the device refuses it.
        assert_eq!(manager.request_resize(4096, 8192), ResizeRequest::Scheduled(4096));

        let mut rebuilt_with = Vec::new();
        let applied = manager
            .apply_pending_resize(&mut backend, |backend, m| {
                let images = m.images()?;
                for image in images {
                    assert!(backend.is_image_alive(image));
                }
                rebuilt_with.push(images);
                Ok(())
            })
            .unwrap();

        assert!(!applied);
        assert_eq!(manager.size(), 1024);
        assert_eq!(manager.pending(), None);
        assert_eq!(rebuilt_with, vec![manager.images().unwrap()]);
        assert_eq!(backend.live_image_count(), 3);
        for image in manager.images().unwrap() {
            assert_eq!(backend.image_extent(image), Some(Extent2d::square(1024)));
        }
    }

    #[test]
    fn test_failed_creation_releases_partial_objects() {
        let mut backend = DummyBackend::new(Extent2d::new(800, 600), 3).with_max_image_dimension(32);
        let result = OffscreenTargetManager::new(&mut backend, 512);
        assert!(matches!(result, Err(BackendError::ImageCreationFailed(_))));
        assert_eq!(backend.live_object_count(), 0);
    }

    #[test]
    fn test_targets_after_destroy_are_an_error() {
        let (mut backend, mut manager) = manager(512);
        manager.destroy(&mut backend);
        assert!(matches!(manager.images(), Err(BackendError::InvalidHandle(_))));
        assert!(matches!(manager.framebuffer(), Err(BackendError::InvalidHandle(_))));
    }

    #[test]
    fn test_destroy_releases_everything() {
        let mut backend = DummyBackend::new(Extent2d::new(800, 600), 3);
        let mut manager = OffscreenTargetManager::new(&mut backend, 512).unwrap();
        manager.destroy(&mut backend);
        assert_eq!(backend.live_object_count(), 0);
    }
}
