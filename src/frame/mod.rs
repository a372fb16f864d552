//! Frame resource set.
//!
//! Two differently sized groups of GPU objects live here:
//!
//! - **Slots** (`N` = pipeline depth): a fence and two semaphores each. The
//!   slot index advances by one per submitted frame, independent of which
//!   swapchain image was acquired.
//! - **Image bindings** (one per swapchain image): command buffer,
//!   framebuffer, uniform buffer and descriptor set, indexed by the acquired
//!   image.
//!
//! The swapchain image count and `N` are unrelated and are never mixed. The
//! only link is the fence each image was last submitted with: an image that
//! comes back before its previous frame finished waits for that fence, since
//! its command buffer and uniform buffer are about to be reused.

mod binding;
mod slot;

pub use binding::{slots, DescriptorSources, ImageBinding};
pub use slot::FrameSlot;

use crate::backend::{BackendError, BackendResult, FenceHandle, GpuBackend, RenderPassHandle};
use crate::uniforms::UniformBlock;

/// Smallest supported pipeline depth.
pub const MIN_FRAMES_IN_FLIGHT: usize = 1;
/// Largest supported pipeline depth.
pub const MAX_FRAMES_IN_FLIGHT: usize = 4;

pub struct FrameResourceSet {
    slots: Vec<FrameSlot>,
    bindings: Vec<ImageBinding>,
    /// Fence of the slot that last used each image.
    images_in_flight: Vec<Option<FenceHandle>>,
    current: usize,
}

impl FrameResourceSet {
    /// Create `depth` slots and one binding per swapchain image.
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        depth: usize,
        main_render_pass: RenderPassHandle,
        sources: &DescriptorSources,
    ) -> BackendResult<Self> {
        if !(MIN_FRAMES_IN_FLIGHT..=MAX_FRAMES_IN_FLIGHT).contains(&depth) {
            return Err(BackendError::InitializationFailed(format!(
                "frames in flight must be in {}..={}, got {}",
                MIN_FRAMES_IN_FLIGHT, MAX_FRAMES_IN_FLIGHT, depth
            )));
        }

        let slots = (0..depth)
            .map(|index| FrameSlot::create(backend, index))
            .collect::<BackendResult<Vec<_>>>()?;

        let mut set = Self {
            slots,
            bindings: Vec::new(),
            images_in_flight: Vec::new(),
            current: 0,
        };
        set.create_image_bindings(backend, main_render_pass, sources)?;

        log::info!(
            "Frame resources: {} slots, {} swapchain images",
            set.depth(),
            set.image_count()
        );
        Ok(set)
    }

    fn create_image_bindings<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        main_render_pass: RenderPassHandle,
        sources: &DescriptorSources,
    ) -> BackendResult<()> {
        let extent = backend.swapchain_extent();
        for image_index in 0..backend.swapchain_image_count() {
            let binding = ImageBinding::create(backend, image_index, main_render_pass, extent, sources)?;
            self.bindings.push(binding);
        }
        self.images_in_flight = vec![None; self.bindings.len()];
        Ok(())
    }

    /// Pipeline depth `N`.
    pub fn depth(&self) -> usize {
        self.slots.len()
    }

    pub fn image_count(&self) -> usize {
        self.bindings.len()
    }

    pub fn current_slot_index(&self) -> usize {
        self.current
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot> {
        self.slots.get(index)
    }

    pub fn binding(&self, image_index: u32) -> Option<&ImageBinding> {
        self.bindings.get(image_index as usize)
    }

    pub fn bindings(&self) -> &[ImageBinding] {
        &self.bindings
    }

    /// Wait until the GPU is done with the current slot's previous frame.
    pub fn acquire_slot<B: GpuBackend>(&self, backend: &mut B) -> BackendResult<FrameSlot> {
        let slot = self.slots[self.current];
        backend.wait_for_fence(slot.in_flight)?;
        Ok(slot)
    }

    /// Acquire the next swapchain image, then reset the slot's fence.
    ///
    /// The fence stays signaled when the acquire fails, so the next wait on
    /// this slot does not block forever. If another slot still owns the image,
    /// its fence is waited on first.
    pub fn bind_image<B: GpuBackend>(&mut self, backend: &mut B, slot: &FrameSlot) -> BackendResult<u32> {
        let image_index = backend.acquire_next_image(slot.image_available)?;
        let Some(owner) = self.images_in_flight.get_mut(image_index as usize) else {
            return Err(BackendError::AcquireImageFailed(format!(
                "acquired image {} but only {} bindings exist",
                image_index,
                self.bindings.len()
            )));
        };
        if let Some(fence) = *owner {
            if fence != slot.in_flight {
                backend.wait_for_fence(fence)?;
            }
        }
        *owner = Some(slot.in_flight);
        backend.reset_fence(slot.in_flight)?;
        Ok(image_index)
    }

    pub fn upload_uniforms<B: GpuBackend>(
        &self,
        backend: &mut B,
        image_index: u32,
        block: &UniformBlock,
    ) -> BackendResult<()> {
        let binding = self
            .binding(image_index)
            .ok_or_else(|| BackendError::InvalidHandle(format!("swapchain image {}", image_index)))?;
        binding.upload_uniforms(backend, block)
    }

    /// Move to the next slot. Called after every submission.
    pub fn advance(&mut self) {
        self.current = (self.current + 1) % self.slots.len();
    }

    /// Point every descriptor set at the current offscreen targets.
    pub fn rebuild_descriptor_sets<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        sources: &DescriptorSources,
    ) -> BackendResult<()> {
        for binding in &mut self.bindings {
            binding.rebuild_descriptor_set(backend, sources)?;
        }
        log::debug!("Rebuilt {} descriptor sets", self.bindings.len());
        Ok(())
    }

    /// Rebuild the per-image resources after the swapchain changed.
    ///
    /// Slots are left alone.
    pub fn recreate_image_bindings<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        main_render_pass: RenderPassHandle,
        sources: &DescriptorSources,
    ) -> BackendResult<()> {
        backend.wait_idle()?;
        for binding in self.bindings.drain(..) {
            binding.destroy(backend);
        }
        self.create_image_bindings(backend, main_render_pass, sources)?;
        log::info!(
            "Recreated bindings for {} swapchain images at {:?}",
            self.bindings.len(),
            backend.swapchain_extent()
        );
        Ok(())
    }

    /// Release everything. The device must be idle.
    pub fn destroy<B: GpuBackend>(&mut self, backend: &mut B) {
        for binding in self.bindings.drain(..) {
            binding.destroy(backend);
        }
        self.images_in_flight.clear();
        for slot in self.slots.drain(..) {
            slot.destroy(backend);
        }
    }
}
