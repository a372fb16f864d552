//! In-flight synchronization slot.

use crate::backend::{BackendResult, FenceHandle, GpuBackend, SemaphoreHandle};

/// One stage of the CPU/GPU pipeline.
///
/// The fence is created signaled so the first wait on every slot returns
/// immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSlot {
    pub index: usize,
    pub in_flight: FenceHandle,
    pub image_available: SemaphoreHandle,
    pub render_finished: SemaphoreHandle,
}

impl FrameSlot {
    pub(crate) fn create<B: GpuBackend>(backend: &mut B, index: usize) -> BackendResult<Self> {
        let in_flight = backend.create_fence(true)?;
        let image_available = match backend.create_semaphore() {
            Ok(s) => s,
            Err(e) => {
                backend.destroy_fence(in_flight);
                return Err(e);
            }
        };
        let render_finished = match backend.create_semaphore() {
            Ok(s) => s,
            Err(e) => {
                backend.destroy_semaphore(image_available);
                backend.destroy_fence(in_flight);
                return Err(e);
            }
        };

        Ok(Self {
            index,
            in_flight,
            image_available,
            render_finished,
        })
    }

    pub(crate) fn destroy<B: GpuBackend>(&self, backend: &mut B) {
        backend.destroy_semaphore(self.render_finished);
        backend.destroy_semaphore(self.image_available);
        backend.destroy_fence(self.in_flight);
    }
}
