//! Per swapchain image resources.

use crate::backend::{
    BackendResult, BufferDescriptor, BufferHandle, BufferUsage, CommandBufferHandle,
    DescriptorSetHandle, DescriptorSetLayoutHandle, DescriptorWrite, Extent2d,
    FramebufferAttachment, FramebufferDescriptor, FramebufferHandle, GpuBackend, ImageHandle,
    RenderPassHandle, SamplerHandle,
};
use crate::uniforms::UniformBlock;

/// Binding slots of the shared descriptor set layout.
pub mod slots {
    pub const UNIFORMS: u32 = 0;
    pub const RSM_POSITION: u32 = 1;
    pub const RSM_NORMAL: u32 = 2;
    pub const RSM_FLUX: u32 = 3;
    pub const RSM_SAMPLER: u32 = 4;
    pub const MATERIAL_TEXTURE: u32 = 5;
    pub const MATERIAL_SAMPLER: u32 = 6;
}

/// Everything a descriptor set points at besides its own uniform buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSources {
    pub layout: DescriptorSetLayoutHandle,
    /// Position, normal and flux targets, in binding order.
    pub rsm_images: [ImageHandle; 3],
    pub rsm_sampler: SamplerHandle,
    pub material_image: ImageHandle,
    pub material_sampler: SamplerHandle,
}

impl DescriptorSources {
    fn writes(&self, uniform_buffer: BufferHandle) -> [DescriptorWrite; 7] {
        [
            DescriptorWrite::uniform(slots::UNIFORMS, uniform_buffer, UniformBlock::SIZE),
            DescriptorWrite::image(slots::RSM_POSITION, self.rsm_images[0]),
            DescriptorWrite::image(slots::RSM_NORMAL, self.rsm_images[1]),
            DescriptorWrite::image(slots::RSM_FLUX, self.rsm_images[2]),
            DescriptorWrite::sampler(slots::RSM_SAMPLER, self.rsm_sampler),
            DescriptorWrite::image(slots::MATERIAL_TEXTURE, self.material_image),
            DescriptorWrite::sampler(slots::MATERIAL_SAMPLER, self.material_sampler),
        ]
    }
}

/// Command buffer, framebuffer, uniform buffer and descriptor set of one
/// swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBinding {
    pub image_index: u32,
    pub command_buffer: CommandBufferHandle,
    pub framebuffer: FramebufferHandle,
    pub uniform_buffer: BufferHandle,
    pub descriptor_set: DescriptorSetHandle,
}

impl ImageBinding {
    pub(crate) fn create<B: GpuBackend>(
        backend: &mut B,
        image_index: u32,
        main_render_pass: RenderPassHandle,
        extent: Extent2d,
        sources: &DescriptorSources,
    ) -> BackendResult<Self> {
        let command_buffer = backend.allocate_command_buffer()?;
        let framebuffer = backend.create_framebuffer(&FramebufferDescriptor {
            label: Some(format!("Main Framebuffer {}", image_index)),
            render_pass: main_render_pass,
            attachments: vec![FramebufferAttachment::SwapchainImage(image_index)],
            extent,
        })?;
        let uniform_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some(format!("Uniforms {}", image_index)),
            size: UniformBlock::SIZE,
            usage: BufferUsage::UNIFORM,
        })?;
        let descriptor_set = backend.create_descriptor_set(sources.layout, &sources.writes(uniform_buffer))?;

        log::debug!("Created bindings for swapchain image {}", image_index);

        Ok(Self {
            image_index,
            command_buffer,
            framebuffer,
            uniform_buffer,
            descriptor_set,
        })
    }

    /// Replace the descriptor set with one pointing at the current sources.
    pub(crate) fn rebuild_descriptor_set<B: GpuBackend>(
        &mut self,
        backend: &mut B,
        sources: &DescriptorSources,
    ) -> BackendResult<()> {
        let set = backend.create_descriptor_set(sources.layout, &sources.writes(self.uniform_buffer))?;
        backend.destroy_descriptor_set(self.descriptor_set);
        self.descriptor_set = set;
        Ok(())
    }

    pub(crate) fn upload_uniforms<B: GpuBackend>(
        &self,
        backend: &mut B,
        block: &UniformBlock,
    ) -> BackendResult<()> {
        backend.write_buffer(self.uniform_buffer, 0, block.as_bytes())
    }

    pub(crate) fn destroy<B: GpuBackend>(&self, backend: &mut B) {
        backend.destroy_descriptor_set(self.descriptor_set);
        backend.destroy_buffer(self.uniform_buffer);
        backend.destroy_framebuffer(self.framebuffer);
        backend.free_command_buffer(self.command_buffer);
    }
}
