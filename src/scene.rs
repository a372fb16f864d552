//! GPU objects shared by every frame: the main render pass, the descriptor
//! set layout, both pipelines, the full-screen quad and the material texture.

use crate::backend::{
    AddressMode, AttachmentDescriptor, BackendResult, BufferDescriptor, BufferHandle, BufferUsage,
    DescriptorBinding, DescriptorSetLayoutHandle, DescriptorType, GpuBackend, ImageHandle,
    ImageLayout, PipelineDescriptor, PipelineHandle, PrimitiveTopology, QuadVertex,
    RenderPassDescriptor, RenderPassHandle, SamplerDescriptor, SamplerHandle, ShaderStageFlags,
    FULLSCREEN_QUAD,
};
use crate::frame::{slots, DescriptorSources};
use crate::offscreen::OffscreenTargetManager;
use crate::shader::{ShaderProgram, ShaderSet};
use crate::texture::TextureData;

/// Vertices in [`FULLSCREEN_QUAD`].
pub const QUAD_VERTEX_COUNT: u32 = FULLSCREEN_QUAD.len() as u32;

fn layout_bindings() -> Vec<DescriptorBinding> {
    let fragment = |binding, ty| DescriptorBinding {
        binding,
        ty,
        visibility: ShaderStageFlags::FRAGMENT,
    };
    vec![
        DescriptorBinding {
            binding: slots::UNIFORMS,
            ty: DescriptorType::UniformBuffer,
            visibility: ShaderStageFlags::VERTEX_FRAGMENT,
        },
        fragment(slots::RSM_POSITION, DescriptorType::SampledImage),
        fragment(slots::RSM_NORMAL, DescriptorType::SampledImage),
        fragment(slots::RSM_FLUX, DescriptorType::SampledImage),
        fragment(slots::RSM_SAMPLER, DescriptorType::Sampler),
        fragment(slots::MATERIAL_TEXTURE, DescriptorType::SampledImage),
        fragment(slots::MATERIAL_SAMPLER, DescriptorType::Sampler),
    ]
}

pub struct SceneResources {
    pub main_render_pass: RenderPassHandle,
    pub descriptor_set_layout: DescriptorSetLayoutHandle,
    pub main_pipeline: PipelineHandle,
    pub rsm_pipeline: PipelineHandle,
    pub quad_buffer: BufferHandle,
    pub material_image: ImageHandle,
    pub material_sampler: SamplerHandle,
}

impl SceneResources {
    pub fn new<B: GpuBackend>(
        backend: &mut B,
        rsm_render_pass: RenderPassHandle,
        shaders: &ShaderSet,
        texture: &TextureData,
    ) -> BackendResult<Self> {
        let main_render_pass = backend.create_render_pass(&RenderPassDescriptor {
            label: Some("Main Pass".into()),
            color_attachments: vec![AttachmentDescriptor {
                format: backend.swapchain_format(),
                initial_layout: ImageLayout::Undefined,
                final_layout: ImageLayout::PresentSrc,
            }],
        })?;

        let descriptor_set_layout = backend.create_descriptor_set_layout(&layout_bindings())?;

        let main_pipeline = create_pipeline(
            backend,
            "Main Pipeline",
            &shaders.main,
            descriptor_set_layout,
            main_render_pass,
            1,
        )?;
        let rsm_pipeline = create_pipeline(
            backend,
            "RSM Pipeline",
            &shaders.rsm,
            descriptor_set_layout,
            rsm_render_pass,
            3,
        )?;

        let quad_bytes: &[u8] = bytemuck::cast_slice(&FULLSCREEN_QUAD);
        let quad_buffer = backend.create_buffer(&BufferDescriptor {
            label: Some("Fullscreen Quad".into()),
            size: quad_bytes.len() as u64,
            usage: BufferUsage::VERTEX,
        })?;
        backend.write_buffer(quad_buffer, 0, quad_bytes)?;

        let material_image = texture.upload(backend)?;
        let material_sampler = backend.create_sampler(&SamplerDescriptor {
            label: Some("Material Sampler".into()),
            address_mode: AddressMode::Repeat,
            ..Default::default()
        })?;

        log::info!(
            "Scene resources ready ({} texture {}x{})",
            texture.name,
            texture.width,
            texture.height
        );

        Ok(Self {
            main_render_pass,
            descriptor_set_layout,
            main_pipeline,
            rsm_pipeline,
            quad_buffer,
            material_image,
            material_sampler,
        })
    }

    /// What each frame's descriptor set should point at right now.
    pub fn descriptor_sources(&self, offscreen: &OffscreenTargetManager) -> BackendResult<DescriptorSources> {
        Ok(DescriptorSources {
            layout: self.descriptor_set_layout,
            rsm_images: offscreen.images()?,
            rsm_sampler: offscreen.sampler(),
            material_image: self.material_image,
            material_sampler: self.material_sampler,
        })
    }

    pub fn destroy<B: GpuBackend>(&self, backend: &mut B) {
        backend.destroy_sampler(self.material_sampler);
        backend.destroy_image(self.material_image);
        backend.destroy_buffer(self.quad_buffer);
        backend.destroy_pipeline(self.rsm_pipeline);
        backend.destroy_pipeline(self.main_pipeline);
        backend.destroy_descriptor_set_layout(self.descriptor_set_layout);
        backend.destroy_render_pass(self.main_render_pass);
    }
}

fn create_pipeline<B: GpuBackend>(
    backend: &mut B,
    label: &str,
    program: &ShaderProgram,
    descriptor_set_layout: DescriptorSetLayoutHandle,
    render_pass: RenderPassHandle,
    color_target_count: u32,
) -> BackendResult<PipelineHandle> {
    backend.create_pipeline(&PipelineDescriptor {
        label: Some(label.into()),
        vertex: program.vertex.clone(),
        fragment: program.fragment.clone(),
        vertex_layout: QuadVertex::layout(),
        descriptor_set_layout,
        render_pass,
        color_target_count,
        topology: PrimitiveTopology::TriangleStrip,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendEvent, DummyBackend, Extent2d};

    #[test]
    fn test_layout_covers_every_shader_binding() {
        let bindings = layout_bindings();
        let numbers: Vec<u32> = bindings.iter().map(|b| b.binding).collect();
        assert_eq!(numbers, (0..7).collect::<Vec<_>>());
        assert_eq!(bindings[0].visibility, ShaderStageFlags::VERTEX_FRAGMENT);
    }

    #[test]
    fn test_scene_resources_lifecycle() {
        let mut backend = DummyBackend::new(Extent2d::new(640, 480), 3);
        let mut offscreen = OffscreenTargetManager::new(&mut backend, 256).unwrap();
        let shaders = ShaderSet::compile().unwrap();
        let texture = TextureData::checkerboard(16, 4, [255; 4], [0, 0, 0, 255]);

        let scene = SceneResources::new(&mut backend, offscreen.render_pass(), &shaders, &texture).unwrap();
        assert_eq!(backend.count_events(|e| matches!(e, BackendEvent::CreatePipeline(_))), 2);
        assert!(backend.count_events(|e| matches!(e, BackendEvent::WriteBuffer { len: 64, .. })) == 1);

        let sources = scene.descriptor_sources(&offscreen).unwrap();
        assert_eq!(sources.rsm_images, offscreen.images().unwrap());
        assert_eq!(sources.material_image, scene.material_image);

        scene.destroy(&mut backend);
        offscreen.destroy(&mut backend);
        assert_eq!(backend.live_object_count(), 0);
    }
}
