//! Core backend abstraction traits
//!
//! [`GpuBackend`] is the contract the renderer uses to reach the GPU. The Vulkan
//! backend implements it for real hardware, the dummy backend records every call
//! so frame orchestration can be tested without a device.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create surface: {0}")]
    SurfaceCreationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create swapchain: {0}")]
    SwapchainCreationFailed(String),
    #[error("Failed to acquire next image: {0}")]
    AcquireImageFailed(String),
    #[error("Failed to submit command buffer: {0}")]
    SubmitFailed(String),
    #[error("Failed to present: {0}")]
    PresentFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create image: {0}")]
    ImageCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create descriptor set: {0}")]
    DescriptorCreationFailed(String),
    #[error("Synchronization failed: {0}")]
    SyncFailed(String),
    #[error("Command recording failed: {0}")]
    RecordingFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Surface is out of date")]
    SurfaceOutdated,
    #[error("Out of memory")]
    OutOfMemory,
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU image together with its default view and memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHandle(pub(crate) u64);

/// Handle to a sampler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SamplerHandle(pub(crate) u64);

/// Handle to a render pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RenderPassHandle(pub(crate) u64);

/// Handle to a framebuffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FramebufferHandle(pub(crate) u64);

/// Handle to a descriptor set layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetLayoutHandle(pub(crate) u64);

/// Handle to a descriptor set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DescriptorSetHandle(pub(crate) u64);

/// Handle to a graphics pipeline and its layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineHandle(pub(crate) u64);

/// Handle to a primary command buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandBufferHandle(pub(crate) u64);

/// Handle to a CPU-GPU fence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FenceHandle(pub(crate) u64);

/// Handle to a GPU-GPU semaphore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SemaphoreHandle(pub(crate) u64);

/// Main graphics backend trait
///
/// Command recording methods take the command buffer explicitly; one buffer is
/// recorded at a time from a single thread.
pub trait GpuBackend {
    /// Get the backend name.
    fn name(&self) -> &'static str;

    // Swapchain queries

    /// Number of presentable images in the current swapchain.
    fn swapchain_image_count(&self) -> u32;

    /// Size of the presentable images.
    fn swapchain_extent(&self) -> Extent2d;

    /// Format of the presentable images.
    fn swapchain_format(&self) -> TextureFormat;

    /// Largest 2D image dimension the device supports.
    fn max_image_dimension(&self) -> u32;

    // Resource creation

    /// Create a host-visible buffer.
    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle>;

    /// Write data into a buffer through its persistent mapping.
    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8])
        -> BackendResult<()>;

    /// Create an image and its view.
    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle>;

    /// Upload tightly packed pixel data and leave the image shader-readable.
    fn upload_image(&mut self, image: ImageHandle, data: &[u8]) -> BackendResult<()>;

    /// Create a sampler
    fn create_sampler(&mut self, desc: &SamplerDescriptor) -> BackendResult<SamplerHandle>;

    /// Create a render pass
    fn create_render_pass(&mut self, desc: &RenderPassDescriptor)
        -> BackendResult<RenderPassHandle>;

    /// Create a framebuffer
    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle>;

    /// Create a descriptor set layout
    fn create_descriptor_set_layout(
        &mut self,
        bindings: &[DescriptorBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle>;

    /// Allocate a descriptor set and write every binding.
    fn create_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<DescriptorSetHandle>;

    /// Create a graphics pipeline
    fn create_pipeline(&mut self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle>;

    /// Allocate a resettable primary command buffer.
    fn allocate_command_buffer(&mut self) -> BackendResult<CommandBufferHandle>;

    /// Create a fence, optionally already signaled.
    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle>;

    /// Create a binary semaphore.
    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle>;

    // Resource cleanup

    fn destroy_buffer(&mut self, buffer: BufferHandle);
    fn destroy_image(&mut self, image: ImageHandle);
    fn destroy_sampler(&mut self, sampler: SamplerHandle);
    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle);
    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle);
    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle);
    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle);
    fn destroy_pipeline(&mut self, pipeline: PipelineHandle);
    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle);
    fn destroy_fence(&mut self, fence: FenceHandle);
    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle);

    // Frame operations

    /// Block until the fence is signaled.
    fn wait_for_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    /// Return the fence to the unsignaled state.
    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()>;

    /// Acquire the next presentable image, signalling `signal` when it is ready.
    ///
    /// Returns [`BackendError::SurfaceOutdated`] when the swapchain must be
    /// recreated before anything can be presented.
    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<u32>;

    /// Submit a recorded command buffer to the graphics queue.
    fn submit(
        &mut self,
        command_buffer: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()>;

    /// Queue an acquired image for presentation.
    fn present(&mut self, image_index: u32, wait: SemaphoreHandle)
        -> BackendResult<PresentStatus>;

    /// Block until the device has finished all submitted work.
    fn wait_idle(&mut self) -> BackendResult<()>;

    /// Rebuild the swapchain for the given surface size.
    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()>;

    // Command recording

    /// Reset the command buffer and begin recording.
    fn cmd_begin(&mut self, command_buffer: CommandBufferHandle) -> BackendResult<()>;

    /// Finish recording.
    fn cmd_end(&mut self, command_buffer: CommandBufferHandle) -> BackendResult<()>;

    /// Begin a render pass instance, clearing each color attachment.
    fn cmd_begin_render_pass(
        &mut self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        clear_colors: &[[f32; 4]],
    );

    fn cmd_end_render_pass(&mut self, command_buffer: CommandBufferHandle);

    fn cmd_bind_pipeline(&mut self, command_buffer: CommandBufferHandle, pipeline: PipelineHandle);

    /// Set viewport and scissor to cover the whole extent.
    fn cmd_set_viewport_scissor(&mut self, command_buffer: CommandBufferHandle, extent: Extent2d);

    fn cmd_bind_descriptor_set(
        &mut self,
        command_buffer: CommandBufferHandle,
        pipeline: PipelineHandle,
        set: DescriptorSetHandle,
    );

    fn cmd_bind_vertex_buffer(&mut self, command_buffer: CommandBufferHandle, buffer: BufferHandle);

    fn cmd_draw(&mut self, command_buffer: CommandBufferHandle, vertex_count: u32, instance_count: u32);

    /// Record an explicit layout transition barrier for a color image.
    fn cmd_transition_image(
        &mut self,
        command_buffer: CommandBufferHandle,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    );
}
