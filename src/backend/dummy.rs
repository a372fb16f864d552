//! Dummy GPU backend for testing and headless runs.
//!
//! This backend doesn't perform actual GPU operations. It records every call as
//! a [`BackendEvent`], tracks image layouts the way the driver would see them
//! and simulates fences, so frame orchestration can be checked call by call.
//! Misuse that a validation layer would report (binding destroyed images,
//! waiting on a fence nothing will signal) is collected in
//! [`DummyBackend::validation_errors`].

use std::collections::{HashMap, HashSet, VecDeque};

use super::traits::*;
use super::types::*;

/// One recorded backend call.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    CreateBuffer(BufferHandle),
    WriteBuffer {
        buffer: BufferHandle,
        len: usize,
    },
    DestroyBuffer(BufferHandle),
    CreateImage {
        image: ImageHandle,
        extent: Extent2d,
        format: TextureFormat,
    },
    UploadImage(ImageHandle),
    DestroyImage(ImageHandle),
    CreateSampler(SamplerHandle),
    DestroySampler(SamplerHandle),
    CreateRenderPass(RenderPassHandle),
    DestroyRenderPass(RenderPassHandle),
    CreateFramebuffer {
        framebuffer: FramebufferHandle,
        attachments: Vec<FramebufferAttachment>,
        extent: Extent2d,
    },
    DestroyFramebuffer(FramebufferHandle),
    CreateDescriptorSet {
        set: DescriptorSetHandle,
        images: Vec<ImageHandle>,
    },
    DestroyDescriptorSet(DescriptorSetHandle),
    CreatePipeline(PipelineHandle),
    DestroyPipeline(PipelineHandle),
    AllocateCommandBuffer(CommandBufferHandle),
    FreeCommandBuffer(CommandBufferHandle),
    CreateFence(FenceHandle),
    DestroyFence(FenceHandle),
    CreateSemaphore(SemaphoreHandle),
    DestroySemaphore(SemaphoreHandle),
    WaitFence(FenceHandle),
    ResetFence(FenceHandle),
    AcquireImage {
        index: u32,
        signal: SemaphoreHandle,
    },
    AcquireOutOfDate,
    Submit {
        command_buffer: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    },
    Present {
        index: u32,
        wait: SemaphoreHandle,
    },
    WaitIdle,
    RecreateSwapchain(Extent2d),
    BeginCommandBuffer(CommandBufferHandle),
    EndCommandBuffer(CommandBufferHandle),
    BeginRenderPass {
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        clear_colors: Vec<[f32; 4]>,
    },
    EndRenderPass,
    BindPipeline(PipelineHandle),
    SetViewportScissor(Extent2d),
    BindDescriptorSet(DescriptorSetHandle),
    BindVertexBuffer(BufferHandle),
    Draw {
        vertex_count: u32,
        instance_count: u32,
        /// Layout of every image the bound descriptor set samples, at draw time.
        sampled_layouts: Vec<(ImageHandle, ImageLayout)>,
    },
    TransitionImage {
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    },
}

/// Scripted result for the next acquire call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireScript {
    Image(u32),
    OutOfDate,
}

/// Scripted result for the next present call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentScript {
    Suboptimal,
    OutOfDate,
}

#[derive(Debug)]
struct DummyImage {
    extent: Extent2d,
    layout: ImageLayout,
}

#[derive(Debug, Default)]
struct DummyFence {
    signaled: bool,
}

#[derive(Debug)]
struct DummyFramebuffer {
    render_pass: RenderPassHandle,
    attachments: Vec<FramebufferAttachment>,
}

#[derive(Debug, Default)]
struct DummyCommandBuffer {
    recording: bool,
    bound_set: Option<DescriptorSetHandle>,
    active_framebuffer: Option<FramebufferHandle>,
}

/// Dummy GPU backend.
#[derive(Debug)]
pub struct DummyBackend {
    extent: Extent2d,
    image_count: u32,
    format: TextureFormat,
    max_image_dimension: u32,

    events: Vec<BackendEvent>,
    validation_errors: Vec<String>,

    images: HashMap<u64, DummyImage>,
    destroyed_images: HashSet<u64>,
    /// Contents of every live buffer.
    buffers: HashMap<u64, Vec<u8>>,
    samplers: HashSet<u64>,
    render_passes: HashMap<u64, Vec<AttachmentDescriptor>>,
    framebuffers: HashMap<u64, DummyFramebuffer>,
    layouts: HashSet<u64>,
    descriptor_sets: HashMap<u64, Vec<ImageHandle>>,
    pipelines: HashSet<u64>,
    command_buffers: HashMap<u64, DummyCommandBuffer>,
    fences: HashMap<u64, DummyFence>,
    semaphores: HashSet<u64>,

    acquire_script: VecDeque<AcquireScript>,
    present_script: VecDeque<PresentScript>,
    fail_next_submit: bool,
    next_image_index: u32,
    next_id: u64,
}

impl DummyBackend {
    /// Create a dummy backend with a swapchain of `image_count` images.
    pub fn new(extent: Extent2d, image_count: u32) -> Self {
        assert!(image_count > 0, "swapchain must have at least one image");

        Self {
            extent,
            image_count,
            format: TextureFormat::Bgra8UnormSrgb,
            max_image_dimension: 16384,
            events: Vec::new(),
            validation_errors: Vec::new(),
            images: HashMap::new(),
            destroyed_images: HashSet::new(),
            buffers: HashMap::new(),
            samplers: HashSet::new(),
            render_passes: HashMap::new(),
            framebuffers: HashMap::new(),
            layouts: HashSet::new(),
            descriptor_sets: HashMap::new(),
            pipelines: HashSet::new(),
            command_buffers: HashMap::new(),
            fences: HashMap::new(),
            semaphores: HashSet::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            fail_next_submit: false,
            next_image_index: 0,
            next_id: 1,
        }
    }

    /// Override the device image dimension limit.
    pub fn with_max_image_dimension(mut self, max: u32) -> Self {
        self.max_image_dimension = max;
        self
    }

    /// All recorded events, oldest first.
    pub fn events(&self) -> &[BackendEvent] {
        &self.events
    }

    /// Drain the recorded events.
    pub fn take_events(&mut self) -> Vec<BackendEvent> {
        std::mem::take(&mut self.events)
    }

    /// Count recorded events matching a predicate.
    pub fn count_events(&self, predicate: impl Fn(&BackendEvent) -> bool) -> usize {
        self.events.iter().filter(|e| predicate(e)).count()
    }

    /// Misuse detected so far. Empty for a correct caller.
    pub fn validation_errors(&self) -> &[String] {
        &self.validation_errors
    }

    /// Current layout of a live image.
    pub fn image_layout(&self, image: ImageHandle) -> Option<ImageLayout> {
        self.images.get(&image.0).map(|i| i.layout)
    }

    /// Size of a live image.
    pub fn image_extent(&self, image: ImageHandle) -> Option<Extent2d> {
        self.images.get(&image.0).map(|i| i.extent)
    }

    pub fn is_image_alive(&self, image: ImageHandle) -> bool {
        self.images.contains_key(&image.0)
    }

    pub fn live_image_count(&self) -> usize {
        self.images.len()
    }

    /// Images written into a live descriptor set.
    pub fn descriptor_set_images(&self, set: DescriptorSetHandle) -> Option<&[ImageHandle]> {
        self.descriptor_sets.get(&set.0).map(Vec::as_slice)
    }

    /// Bytes last written to a live buffer.
    pub fn buffer_contents(&self, buffer: BufferHandle) -> Option<&[u8]> {
        self.buffers.get(&buffer.0).map(Vec::as_slice)
    }

    pub fn is_fence_signaled(&self, fence: FenceHandle) -> bool {
        self.fences.get(&fence.0).is_some_and(|f| f.signaled)
    }

    /// Number of objects of any kind still alive.
    pub fn live_object_count(&self) -> usize {
        self.images.len()
            + self.buffers.len()
            + self.samplers.len()
            + self.render_passes.len()
            + self.framebuffers.len()
            + self.layouts.len()
            + self.descriptor_sets.len()
            + self.pipelines.len()
            + self.command_buffers.len()
            + self.fences.len()
            + self.semaphores.len()
    }

    /// Make the next acquire return the given outcome instead of round-robin.
    pub fn script_acquire(&mut self, outcome: AcquireScript) {
        self.acquire_script.push_back(outcome);
    }

    /// Make the next present return the given outcome.
    pub fn script_present(&mut self, outcome: PresentScript) {
        self.present_script.push_back(outcome);
    }

    /// Make the next submit fail.
    pub fn fail_next_submit(&mut self) {
        self.fail_next_submit = true;
    }

    /// Change the number of images the next recreated swapchain will have.
    pub fn set_next_image_count(&mut self, count: u32) {
        assert!(count > 0, "swapchain must have at least one image");
        self.image_count = count;
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn record(&mut self, event: BackendEvent) {
        log::trace!("DummyBackend: {:?}", event);
        self.events.push(event);
    }

    fn violation(&mut self, message: String) {
        log::trace!("DummyBackend: validation error: {}", message);
        self.validation_errors.push(message);
    }

    fn check_recording(&mut self, command_buffer: CommandBufferHandle, what: &str) {
        let recording = self
            .command_buffers
            .get(&command_buffer.0)
            .is_some_and(|c| c.recording);
        if !recording {
            self.violation(format!(
                "{} recorded into {:?} which is not recording",
                what, command_buffer
            ));
        }
    }

    fn set_attachment_layouts(&mut self, framebuffer: FramebufferHandle, final_layouts: bool) {
        let Some(fb) = self.framebuffers.get(&framebuffer.0) else {
            return;
        };
        let finals = self
            .render_passes
            .get(&fb.render_pass.0)
            .cloned()
            .unwrap_or_default();
        let attachments = fb.attachments.clone();

        for (i, attachment) in attachments.iter().enumerate() {
            if let FramebufferAttachment::Image(image) = attachment {
                let layout = if final_layouts {
                    finals
                        .get(i)
                        .map(|a| a.final_layout)
                        .unwrap_or(ImageLayout::ColorAttachment)
                } else {
                    ImageLayout::ColorAttachment
                };
                if let Some(img) = self.images.get_mut(&image.0) {
                    img.layout = layout;
                }
            }
        }
    }
}

impl GpuBackend for DummyBackend {
    fn name(&self) -> &'static str {
        "Dummy Backend"
    }

    fn swapchain_image_count(&self) -> u32 {
        self.image_count
    }

    fn swapchain_extent(&self) -> Extent2d {
        self.extent
    }

    fn swapchain_format(&self) -> TextureFormat {
        self.format
    }

    fn max_image_dimension(&self) -> u32 {
        self.max_image_dimension
    }

    fn create_buffer(&mut self, desc: &BufferDescriptor) -> BackendResult<BufferHandle> {
        let id = self.alloc_id();
        self.buffers.insert(id, vec![0; desc.size as usize]);
        self.record(BackendEvent::CreateBuffer(BufferHandle(id)));
        Ok(BufferHandle(id))
    }

    fn write_buffer(
        &mut self,
        buffer: BufferHandle,
        offset: u64,
        data: &[u8],
    ) -> BackendResult<()> {
        let contents = self
            .buffers
            .get_mut(&buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", buffer)))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(BackendError::BufferCreationFailed(format!(
                "write of {} bytes at {} overflows buffer of {} bytes",
                data.len(),
                offset,
                contents.len()
            )));
        }
        contents[start..end].copy_from_slice(data);
        self.record(BackendEvent::WriteBuffer {
            buffer,
            len: data.len(),
        });
        Ok(())
    }

    fn create_image(&mut self, desc: &ImageDescriptor) -> BackendResult<ImageHandle> {
        let max = self.max_image_dimension;
        if desc.extent.width > max || desc.extent.height > max {
            return Err(BackendError::ImageCreationFailed(format!(
                "{}x{} exceeds device limit {}",
                desc.extent.width, desc.extent.height, max
            )));
        }

        let id = self.alloc_id();
        self.images.insert(
            id,
            DummyImage {
                extent: desc.extent,
                layout: ImageLayout::Undefined,
            },
        );
        self.record(BackendEvent::CreateImage {
            image: ImageHandle(id),
            extent: desc.extent,
            format: desc.format,
        });
        Ok(ImageHandle(id))
    }

    fn upload_image(&mut self, image: ImageHandle, _data: &[u8]) -> BackendResult<()> {
        let img = self
            .images
            .get_mut(&image.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", image)))?;
        img.layout = ImageLayout::ShaderReadOnly;
        self.record(BackendEvent::UploadImage(image));
        Ok(())
    }

    fn create_sampler(&mut self, _desc: &SamplerDescriptor) -> BackendResult<SamplerHandle> {
        let id = self.alloc_id();
        self.samplers.insert(id);
        self.record(BackendEvent::CreateSampler(SamplerHandle(id)));
        Ok(SamplerHandle(id))
    }

    fn create_render_pass(
        &mut self,
        desc: &RenderPassDescriptor,
    ) -> BackendResult<RenderPassHandle> {
        let id = self.alloc_id();
        self.render_passes.insert(id, desc.color_attachments.clone());
        self.record(BackendEvent::CreateRenderPass(RenderPassHandle(id)));
        Ok(RenderPassHandle(id))
    }

    fn create_framebuffer(
        &mut self,
        desc: &FramebufferDescriptor,
    ) -> BackendResult<FramebufferHandle> {
        for attachment in &desc.attachments {
            match attachment {
                FramebufferAttachment::Image(image) if !self.images.contains_key(&image.0) => {
                    self.violation(format!("framebuffer references dead image {:?}", image));
                }
                FramebufferAttachment::SwapchainImage(index) if *index >= self.image_count => {
                    self.violation(format!("swapchain image {} out of range", index));
                }
                _ => {}
            }
        }

        let id = self.alloc_id();
        self.framebuffers.insert(
            id,
            DummyFramebuffer {
                render_pass: desc.render_pass,
                attachments: desc.attachments.clone(),
            },
        );
        self.record(BackendEvent::CreateFramebuffer {
            framebuffer: FramebufferHandle(id),
            attachments: desc.attachments.clone(),
            extent: desc.extent,
        });
        Ok(FramebufferHandle(id))
    }

    fn create_descriptor_set_layout(
        &mut self,
        _bindings: &[DescriptorBinding],
    ) -> BackendResult<DescriptorSetLayoutHandle> {
        let id = self.alloc_id();
        self.layouts.insert(id);
        Ok(DescriptorSetLayoutHandle(id))
    }

    fn create_descriptor_set(
        &mut self,
        layout: DescriptorSetLayoutHandle,
        writes: &[DescriptorWrite],
    ) -> BackendResult<DescriptorSetHandle> {
        if !self.layouts.contains(&layout.0) {
            return Err(BackendError::InvalidHandle(format!("{:?}", layout)));
        }

        let images: Vec<ImageHandle> = writes
            .iter()
            .filter_map(|w| match w.resource {
                DescriptorResource::SampledImage(image) => Some(image),
                _ => None,
            })
            .collect();

        for image in &images {
            if !self.images.contains_key(&image.0) {
                self.violation(format!("descriptor set written with dead image {:?}", image));
            }
        }

        let id = self.alloc_id();
        self.descriptor_sets.insert(id, images.clone());
        self.record(BackendEvent::CreateDescriptorSet {
            set: DescriptorSetHandle(id),
            images,
        });
        Ok(DescriptorSetHandle(id))
    }

    fn create_pipeline(&mut self, desc: &PipelineDescriptor) -> BackendResult<PipelineHandle> {
        if desc.vertex.spirv.is_empty() || desc.fragment.spirv.is_empty() {
            return Err(BackendError::PipelineCreationFailed(
                "empty shader module".into(),
            ));
        }
        if !self.render_passes.contains_key(&desc.render_pass.0) {
            return Err(BackendError::InvalidHandle(format!("{:?}", desc.render_pass)));
        }

        let id = self.alloc_id();
        self.pipelines.insert(id);
        self.record(BackendEvent::CreatePipeline(PipelineHandle(id)));
        Ok(PipelineHandle(id))
    }

    fn allocate_command_buffer(&mut self) -> BackendResult<CommandBufferHandle> {
        let id = self.alloc_id();
        self.command_buffers.insert(id, DummyCommandBuffer::default());
        self.record(BackendEvent::AllocateCommandBuffer(CommandBufferHandle(id)));
        Ok(CommandBufferHandle(id))
    }

    fn create_fence(&mut self, signaled: bool) -> BackendResult<FenceHandle> {
        let id = self.alloc_id();
        self.fences.insert(id, DummyFence { signaled });
        self.record(BackendEvent::CreateFence(FenceHandle(id)));
        Ok(FenceHandle(id))
    }

    fn create_semaphore(&mut self) -> BackendResult<SemaphoreHandle> {
        let id = self.alloc_id();
        self.semaphores.insert(id);
        self.record(BackendEvent::CreateSemaphore(SemaphoreHandle(id)));
        Ok(SemaphoreHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if self.buffers.remove(&buffer.0).is_some() {
            self.record(BackendEvent::DestroyBuffer(buffer));
        }
    }

    fn destroy_image(&mut self, image: ImageHandle) {
        if self.images.remove(&image.0).is_some() {
            self.destroyed_images.insert(image.0);
            self.record(BackendEvent::DestroyImage(image));
        }
    }

    fn destroy_sampler(&mut self, sampler: SamplerHandle) {
        if self.samplers.remove(&sampler.0) {
            self.record(BackendEvent::DestroySampler(sampler));
        }
    }

    fn destroy_render_pass(&mut self, render_pass: RenderPassHandle) {
        if self.render_passes.remove(&render_pass.0).is_some() {
            self.record(BackendEvent::DestroyRenderPass(render_pass));
        }
    }

    fn destroy_framebuffer(&mut self, framebuffer: FramebufferHandle) {
        if self.framebuffers.remove(&framebuffer.0).is_some() {
            self.record(BackendEvent::DestroyFramebuffer(framebuffer));
        }
    }

    fn destroy_descriptor_set_layout(&mut self, layout: DescriptorSetLayoutHandle) {
        self.layouts.remove(&layout.0);
    }

    fn destroy_descriptor_set(&mut self, set: DescriptorSetHandle) {
        if self.descriptor_sets.remove(&set.0).is_some() {
            self.record(BackendEvent::DestroyDescriptorSet(set));
        }
    }

    fn destroy_pipeline(&mut self, pipeline: PipelineHandle) {
        if self.pipelines.remove(&pipeline.0) {
            self.record(BackendEvent::DestroyPipeline(pipeline));
        }
    }

    fn free_command_buffer(&mut self, command_buffer: CommandBufferHandle) {
        if self.command_buffers.remove(&command_buffer.0).is_some() {
            self.record(BackendEvent::FreeCommandBuffer(command_buffer));
        }
    }

    fn destroy_fence(&mut self, fence: FenceHandle) {
        if self.fences.remove(&fence.0).is_some() {
            self.record(BackendEvent::DestroyFence(fence));
        }
    }

    fn destroy_semaphore(&mut self, semaphore: SemaphoreHandle) {
        if self.semaphores.remove(&semaphore.0) {
            self.record(BackendEvent::DestroySemaphore(semaphore));
        }
    }

    fn wait_for_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let signaled = self
            .fences
            .get(&fence.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", fence)))?
            .signaled;
        self.record(BackendEvent::WaitFence(fence));

        if !signaled {
            // Work is completed at submit time, so an unsignaled fence here
            // has nothing pending that could ever signal it.
            self.violation(format!("wait on {:?} would never return", fence));
            return Err(BackendError::SyncFailed(format!(
                "{:?} is unsignaled with no pending submission",
                fence
            )));
        }
        Ok(())
    }

    fn reset_fence(&mut self, fence: FenceHandle) -> BackendResult<()> {
        let f = self
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", fence)))?;
        f.signaled = false;
        self.record(BackendEvent::ResetFence(fence));
        Ok(())
    }

    fn acquire_next_image(&mut self, signal: SemaphoreHandle) -> BackendResult<u32> {
        let index = match self.acquire_script.pop_front() {
            Some(AcquireScript::OutOfDate) => {
                self.record(BackendEvent::AcquireOutOfDate);
                return Err(BackendError::SurfaceOutdated);
            }
            Some(AcquireScript::Image(index)) => index,
            None => self.next_image_index,
        };

        if index >= self.image_count {
            return Err(BackendError::AcquireImageFailed(format!(
                "image index {} out of range",
                index
            )));
        }
        self.next_image_index = (index + 1) % self.image_count;
        self.record(BackendEvent::AcquireImage { index, signal });
        Ok(index)
    }

    fn submit(
        &mut self,
        command_buffer: CommandBufferHandle,
        wait: SemaphoreHandle,
        signal: SemaphoreHandle,
        fence: FenceHandle,
    ) -> BackendResult<()> {
        if std::mem::take(&mut self.fail_next_submit) {
            return Err(BackendError::SubmitFailed("injected failure".into()));
        }

        if self
            .command_buffers
            .get(&command_buffer.0)
            .is_some_and(|c| c.recording)
        {
            self.violation(format!("{:?} submitted while recording", command_buffer));
        }

        let f = self
            .fences
            .get_mut(&fence.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", fence)))?;
        if f.signaled {
            self.violation(format!("{:?} submitted while still signaled", fence));
        }
        // Work completes instantly.
        if let Some(f) = self.fences.get_mut(&fence.0) {
            f.signaled = true;
        }

        self.record(BackendEvent::Submit {
            command_buffer,
            wait,
            signal,
            fence,
        });
        Ok(())
    }

    fn present(&mut self, image_index: u32, wait: SemaphoreHandle) -> BackendResult<PresentStatus> {
        match self.present_script.pop_front() {
            Some(PresentScript::OutOfDate) => Err(BackendError::SurfaceOutdated),
            scripted => {
                self.record(BackendEvent::Present {
                    index: image_index,
                    wait,
                });
                Ok(match scripted {
                    Some(PresentScript::Suboptimal) => PresentStatus::Suboptimal,
                    _ => PresentStatus::Optimal,
                })
            }
        }
    }

    fn wait_idle(&mut self) -> BackendResult<()> {
        self.record(BackendEvent::WaitIdle);
        Ok(())
    }

    fn recreate_swapchain(&mut self, width: u32, height: u32) -> BackendResult<()> {
        self.extent = Extent2d::new(width.max(1), height.max(1));
        self.next_image_index = 0;
        self.record(BackendEvent::RecreateSwapchain(self.extent));
        Ok(())
    }

    fn cmd_begin(&mut self, command_buffer: CommandBufferHandle) -> BackendResult<()> {
        let cb = self
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", command_buffer)))?;
        *cb = DummyCommandBuffer {
            recording: true,
            ..Default::default()
        };
        self.record(BackendEvent::BeginCommandBuffer(command_buffer));
        Ok(())
    }

    fn cmd_end(&mut self, command_buffer: CommandBufferHandle) -> BackendResult<()> {
        let cb = self
            .command_buffers
            .get_mut(&command_buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", command_buffer)))?;
        if !cb.recording {
            return Err(BackendError::RecordingFailed(format!(
                "{:?} is not recording",
                command_buffer
            )));
        }
        if cb.active_framebuffer.is_some() {
            return Err(BackendError::RecordingFailed(
                "render pass still active".into(),
            ));
        }
        cb.recording = false;
        self.record(BackendEvent::EndCommandBuffer(command_buffer));
        Ok(())
    }

    fn cmd_begin_render_pass(
        &mut self,
        command_buffer: CommandBufferHandle,
        render_pass: RenderPassHandle,
        framebuffer: FramebufferHandle,
        extent: Extent2d,
        clear_colors: &[[f32; 4]],
    ) {
        self.check_recording(command_buffer, "begin render pass");
        if !self.framebuffers.contains_key(&framebuffer.0) {
            self.violation(format!("render pass begun on dead {:?}", framebuffer));
        }
        if let Some(cb) = self.command_buffers.get_mut(&command_buffer.0) {
            cb.active_framebuffer = Some(framebuffer);
        }
        self.set_attachment_layouts(framebuffer, false);
        self.record(BackendEvent::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_colors: clear_colors.to_vec(),
        });
    }

    fn cmd_end_render_pass(&mut self, command_buffer: CommandBufferHandle) {
        self.check_recording(command_buffer, "end render pass");
        let framebuffer = self
            .command_buffers
            .get_mut(&command_buffer.0)
            .and_then(|cb| cb.active_framebuffer.take());
        if let Some(framebuffer) = framebuffer {
            self.set_attachment_layouts(framebuffer, true);
        }
        self.record(BackendEvent::EndRenderPass);
    }

    fn cmd_bind_pipeline(&mut self, command_buffer: CommandBufferHandle, pipeline: PipelineHandle) {
        self.check_recording(command_buffer, "bind pipeline");
        if !self.pipelines.contains(&pipeline.0) {
            self.violation(format!("bound dead {:?}", pipeline));
        }
        self.record(BackendEvent::BindPipeline(pipeline));
    }

    fn cmd_set_viewport_scissor(&mut self, command_buffer: CommandBufferHandle, extent: Extent2d) {
        self.check_recording(command_buffer, "set viewport");
        self.record(BackendEvent::SetViewportScissor(extent));
    }

    fn cmd_bind_descriptor_set(
        &mut self,
        command_buffer: CommandBufferHandle,
        _pipeline: PipelineHandle,
        set: DescriptorSetHandle,
    ) {
        self.check_recording(command_buffer, "bind descriptor set");
        let dead: Option<Vec<ImageHandle>> = self.descriptor_sets.get(&set.0).map(|images| {
            images
                .iter()
                .filter(|i| self.destroyed_images.contains(&i.0))
                .copied()
                .collect()
        });
        match dead {
            Some(dead) if !dead.is_empty() => {
                self.violation(format!("{:?} references destroyed images {:?}", set, dead));
            }
            Some(_) => {}
            None => self.violation(format!("bound dead {:?}", set)),
        }
        if let Some(cb) = self.command_buffers.get_mut(&command_buffer.0) {
            cb.bound_set = Some(set);
        }
        self.record(BackendEvent::BindDescriptorSet(set));
    }

    fn cmd_bind_vertex_buffer(&mut self, command_buffer: CommandBufferHandle, buffer: BufferHandle) {
        self.check_recording(command_buffer, "bind vertex buffer");
        if !self.buffers.contains_key(&buffer.0) {
            self.violation(format!("bound dead {:?}", buffer));
        }
        self.record(BackendEvent::BindVertexBuffer(buffer));
    }

    fn cmd_draw(&mut self, command_buffer: CommandBufferHandle, vertex_count: u32, instance_count: u32) {
        self.check_recording(command_buffer, "draw");
        let sampled_layouts = self
            .command_buffers
            .get(&command_buffer.0)
            .and_then(|cb| cb.bound_set)
            .and_then(|set| self.descriptor_sets.get(&set.0))
            .map(|images| {
                images
                    .iter()
                    .map(|image| {
                        let layout = self
                            .images
                            .get(&image.0)
                            .map(|i| i.layout)
                            .unwrap_or(ImageLayout::Undefined);
                        (*image, layout)
                    })
                    .collect()
            })
            .unwrap_or_default();

        self.record(BackendEvent::Draw {
            vertex_count,
            instance_count,
            sampled_layouts,
        });
    }

    fn cmd_transition_image(
        &mut self,
        command_buffer: CommandBufferHandle,
        image: ImageHandle,
        old_layout: ImageLayout,
        new_layout: ImageLayout,
    ) {
        self.check_recording(command_buffer, "transition image");
        match self.images.get_mut(&image.0) {
            Some(img) => img.layout = new_layout,
            None => self.violation(format!("transition of dead {:?}", image)),
        }
        self.record(BackendEvent::TransitionImage {
            image,
            old_layout,
            new_layout,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> DummyBackend {
        DummyBackend::new(Extent2d::new(800, 600), 3)
    }

    #[test]
    fn test_acquire_round_robin() {
        let mut backend = backend();
        let sem = backend.create_semaphore().unwrap();
        let indices: Vec<u32> = (0..5)
            .map(|_| backend.acquire_next_image(sem).unwrap())
            .collect();
        assert_eq!(indices, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn test_scripted_acquire() {
        let mut backend = backend();
        let sem = backend.create_semaphore().unwrap();
        backend.script_acquire(AcquireScript::Image(2));
        backend.script_acquire(AcquireScript::OutOfDate);
        assert_eq!(backend.acquire_next_image(sem).unwrap(), 2);
        assert!(matches!(
            backend.acquire_next_image(sem),
            Err(BackendError::SurfaceOutdated)
        ));
        assert_eq!(backend.acquire_next_image(sem).unwrap(), 0);
    }

    #[test]
    fn test_fence_signaled_by_submit() {
        let mut backend = backend();
        let fence = backend.create_fence(true).unwrap();
        let sem = backend.create_semaphore().unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();

        backend.wait_for_fence(fence).unwrap();
        backend.reset_fence(fence).unwrap();
        assert!(!backend.is_fence_signaled(fence));

        backend.cmd_begin(cmd).unwrap();
        backend.cmd_end(cmd).unwrap();
        backend.submit(cmd, sem, sem, fence).unwrap();
        assert!(backend.is_fence_signaled(fence));
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_wait_on_reset_fence_is_reported() {
        let mut backend = backend();
        let fence = backend.create_fence(true).unwrap();
        backend.reset_fence(fence).unwrap();
        assert!(backend.wait_for_fence(fence).is_err());
        assert_eq!(backend.validation_errors().len(), 1);
    }

    #[test]
    fn test_render_pass_final_layouts_applied() {
        let mut backend = backend();
        let image = backend
            .create_image(&ImageDescriptor {
                label: None,
                extent: Extent2d::square(64),
                format: TextureFormat::Rgba16Float,
                usage: ImageUsage::COLOR_ATTACHMENT | ImageUsage::SAMPLED,
            })
            .unwrap();
        let pass = backend
            .create_render_pass(&RenderPassDescriptor {
                label: None,
                color_attachments: vec![AttachmentDescriptor {
                    format: TextureFormat::Rgba16Float,
                    initial_layout: ImageLayout::Undefined,
                    final_layout: ImageLayout::ShaderReadOnly,
                }],
            })
            .unwrap();
        let fb = backend
            .create_framebuffer(&FramebufferDescriptor {
                label: None,
                render_pass: pass,
                attachments: vec![FramebufferAttachment::Image(image)],
                extent: Extent2d::square(64),
            })
            .unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();

        backend.cmd_begin(cmd).unwrap();
        backend.cmd_begin_render_pass(cmd, pass, fb, Extent2d::square(64), &[[0.0; 4]]);
        assert_eq!(backend.image_layout(image), Some(ImageLayout::ColorAttachment));
        backend.cmd_end_render_pass(cmd);
        backend.cmd_end(cmd).unwrap();

        assert_eq!(backend.image_layout(image), Some(ImageLayout::ShaderReadOnly));
        assert!(backend.validation_errors().is_empty());
    }

    #[test]
    fn test_binding_set_with_destroyed_image_is_reported() {
        let mut backend = backend();
        let image = backend
            .create_image(&ImageDescriptor {
                label: None,
                extent: Extent2d::square(8),
                format: TextureFormat::Rgba8Unorm,
                usage: ImageUsage::SAMPLED,
            })
            .unwrap();
        let layout = backend
            .create_descriptor_set_layout(&[DescriptorBinding {
                binding: 0,
                ty: DescriptorType::SampledImage,
                visibility: ShaderStageFlags::FRAGMENT,
            }])
            .unwrap();
        let set = backend
            .create_descriptor_set(layout, &[DescriptorWrite::image(0, image)])
            .unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();

        backend.destroy_image(image);
        backend.cmd_begin(cmd).unwrap();
        backend.cmd_bind_descriptor_set(cmd, PipelineHandle(0), set);

        assert_eq!(backend.validation_errors().len(), 1);
    }

    #[test]
    fn test_buffer_keeps_written_bytes() {
        let mut backend = backend();
        let buffer = backend
            .create_buffer(&BufferDescriptor {
                label: None,
                size: 8,
                usage: BufferUsage::UNIFORM,
            })
            .unwrap();
        backend.write_buffer(buffer, 2, &[7, 8, 9]).unwrap();
        assert_eq!(backend.buffer_contents(buffer), Some(&[0, 0, 7, 8, 9, 0, 0, 0][..]));

        assert!(backend.write_buffer(buffer, 6, &[1, 2, 3]).is_err());
        backend.destroy_buffer(buffer);
        assert_eq!(backend.buffer_contents(buffer), None);
    }

    #[test]
    fn test_image_over_limit_rejected() {
        let mut backend = backend().with_max_image_dimension(1024);
        let result = backend.create_image(&ImageDescriptor {
            label: None,
            extent: Extent2d::square(2048),
            format: TextureFormat::Rgba16Float,
            usage: ImageUsage::SAMPLED,
        });
        assert!(result.is_err());
    }

    #[test]
    fn test_injected_submit_failure() {
        let mut backend = backend();
        let fence = backend.create_fence(false).unwrap();
        let sem = backend.create_semaphore().unwrap();
        let cmd = backend.allocate_command_buffer().unwrap();
        backend.fail_next_submit();
        assert!(matches!(
            backend.submit(cmd, sem, sem, fence),
            Err(BackendError::SubmitFailed(_))
        ));
        assert!(!backend.is_fence_signaled(fence));
    }
}
